//! Session facade
//!
//! A [`Provider`] composes the connection, dispatcher, sender, document
//! syncer and awareness controller for one (project, page, user). The
//! replica changes only when the server broadcasts a committed operation;
//! mutation calls never write it optimistically.

use crate::config::ProviderConfig;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_core::{
    Awareness, AwarenessController, DocumentSyncer, Element, ElementOperation, Page,
    PageOperation, PresenceSnapshot, PresenceUpdate,
};
use trellis_protocol::{
    DeleteElementPayload, ElementPayload, Envelope, MessageType, MoveElementPayload,
    OperationType, PagePayload, PresencePayload, ProtocolResult, SyncPagePayload,
    SyncRequestPayload, UserLeavePayload,
};
use trellis_transport::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, MessageDispatcher,
    MessageSender, RequestError, TokenProvider,
};

#[cfg(feature = "metrics")]
use trellis_transport::Metrics;

/// Session status as shown to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Outcome of a confirmed element mutation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationAck {
    pub operation_type: OperationType,
    pub element_id: String,
    pub request_id: String,
    /// Payload of the server's reply
    pub payload: Value,
}

pub type PresenceCallback = Arc<dyn Fn(&PresenceUpdate) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProviderCallbacks {
    /// Called for every accepted remote presence broadcast
    pub on_presence: Option<PresenceCallback>,
    /// Called for server `error` envelopes that no request was waiting for
    pub on_error: Option<ErrorCallback>,
}

impl ProviderCallbacks {
    pub fn on_presence(mut self, f: impl Fn(&PresenceUpdate) + Send + Sync + 'static) -> Self {
        self.on_presence = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Presence stream that yields the current snapshot first
pub struct PresenceSubscription {
    current: Option<PresenceSnapshot>,
    rx: broadcast::Receiver<PresenceSnapshot>,
}

impl PresenceSubscription {
    /// Next snapshot. `None` once the provider is gone.
    pub async fn recv(&mut self) -> Option<PresenceSnapshot> {
        if let Some(snapshot) = self.current.take() {
            return Some(snapshot);
        }
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Presence subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct ProviderInner {
    config: ProviderConfig,
    connection: ConnectionManager,
    dispatcher: Arc<MessageDispatcher>,
    sender: MessageSender,
    syncer: DocumentSyncer,
    awareness: AwarenessController,
    status: watch::Sender<ProviderStatus>,
    synced: AtomicBool,
    synced_tx: broadcast::Sender<()>,
    callbacks: ProviderCallbacks,
    destroyed: AtomicBool,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

/// One collaborative editing session
pub struct Provider {
    inner: Arc<ProviderInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Provider {
    /// Build the session and start connecting.
    ///
    /// `doc` hosts the replica. Must be called inside a tokio runtime.
    pub fn new(
        config: ProviderConfig,
        doc: yrs::Doc,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        callbacks: ProviderCallbacks,
    ) -> Self {
        let (connection, events) =
            ConnectionManager::new(config.connection_config(), connector, tokens);
        let dispatcher = Arc::new(MessageDispatcher::new(
            &config.project_id,
            &config.page_id,
            &config.user_id,
            config.dispatcher_config(),
        ));
        let sender = MessageSender::new(connection.clone(), dispatcher.clone());

        let awareness = AwarenessController::new(
            Arc::new(Awareness::for_doc(&doc)),
            config.identity(),
            config.awareness_config(),
        );
        let syncer = DocumentSyncer::new(doc);

        #[cfg(feature = "metrics")]
        let metrics = match trellis_transport::Metrics::new() {
            Ok(m) => {
                let m = Arc::new(m);
                connection.set_metrics(m.clone());
                dispatcher.set_metrics(m.clone());
                Some(m)
            }
            Err(e) => {
                warn!(error = %e, "Metrics disabled");
                None
            }
        };

        let (status, _) = watch::channel(ProviderStatus::Connecting);
        let (synced_tx, _) = broadcast::channel(16);

        let inner = Arc::new(ProviderInner {
            config,
            connection,
            dispatcher,
            sender,
            syncer,
            awareness,
            status,
            synced: AtomicBool::new(false),
            synced_tx,
            callbacks,
            destroyed: AtomicBool::new(false),
            #[cfg(feature = "metrics")]
            metrics,
        });

        info!(
            project = %inner.config.project_id,
            page = %inner.config.page_id,
            user = %inner.config.user_id,
            "Starting provider"
        );

        let tasks = vec![
            tokio::spawn(inner.clone().route(events)),
            tokio::spawn(inner.clone().connect()),
            tokio::spawn(inner.clone().prune_presence()),
            inner.awareness.spawn_awareness_listener(),
        ];

        Self {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ProviderStatus {
        *self.inner.status.borrow()
    }

    /// Status updates; the receiver starts at the current status
    pub fn subscribe_status(&self) -> watch::Receiver<ProviderStatus> {
        self.inner.status.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }

    /// Fires after each applied `sync:page` snapshot
    pub fn subscribe_synced(&self) -> broadcast::Receiver<()> {
        self.inner.synced_tx.subscribe()
    }

    /// Presence snapshots, starting with the current one
    pub fn on_presence_change(&self) -> PresenceSubscription {
        let rx = self.inner.awareness.subscribe();
        PresenceSubscription {
            current: Some(self.inner.awareness.snapshot()),
            rx,
        }
    }

    pub fn syncer(&self) -> &DocumentSyncer {
        &self.inner.syncer
    }

    pub fn awareness(&self) -> &AwarenessController {
        &self.inner.awareness
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.dispatcher.queue_len()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.inner.metrics.as_ref()
    }

    pub async fn create_element(&self, element: Element) -> Result<OperationAck, RequestError> {
        let element_id = element.id.clone();
        self.inner
            .mutate(OperationType::Create, element_id, ElementPayload { element })
            .await
    }

    pub async fn update_element(&self, element: Element) -> Result<OperationAck, RequestError> {
        let element_id = element.id.clone();
        self.inner
            .mutate(OperationType::Update, element_id, ElementPayload { element })
            .await
    }

    /// `deleted_children` lists descendants the server should cascade
    pub async fn delete_element(
        &self,
        element_id: impl Into<String>,
        deleted_children: Vec<String>,
    ) -> Result<OperationAck, RequestError> {
        let element_id = element_id.into();
        let payload = DeleteElementPayload {
            element_id: element_id.clone(),
            deleted_children,
        };
        self.inner
            .mutate(OperationType::Delete, element_id, payload)
            .await
    }

    pub async fn move_element(
        &self,
        element_id: impl Into<String>,
        new_parent_id: Option<String>,
        new_order: i64,
    ) -> Result<OperationAck, RequestError> {
        let element_id = element_id.into();
        let payload = MoveElementPayload {
            element_id: element_id.clone(),
            new_parent_id,
            new_order,
        };
        self.inner
            .mutate(OperationType::Move, element_id, payload)
            .await
    }

    // Page mutations belong to the REST API; inbound page broadcasts are
    // still applied to the replica.

    pub async fn create_page(&self, page: Page) -> Result<OperationAck, RequestError> {
        Err(page_unsupported("create", &page.id))
    }

    pub async fn update_page(&self, page: Page) -> Result<OperationAck, RequestError> {
        Err(page_unsupported("update", &page.id))
    }

    pub async fn delete_page(&self, page_id: &str) -> Result<OperationAck, RequestError> {
        Err(page_unsupported("delete", page_id))
    }

    /// Update local presence and send it fire-and-forget.
    ///
    /// Returns true when it went out immediately. Presence is never tracked
    /// and only passes the rate limiter when `rate_limit_presence` is set.
    pub fn send_presence(&self, x: f64, y: f64, element_id: Option<String>) -> bool {
        self.inner.send_presence(x, y, element_id)
    }

    /// Ask the server for a full `sync:page` snapshot
    pub fn request_sync(&self) -> bool {
        self.inner.request_sync()
    }

    /// Tear the session down. Safe to call more than once.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.connection.disconnect();
        let rejected = self
            .inner
            .dispatcher
            .reject_all_pending_requests(RequestError::ConnectionClosed("Provider destroyed".into()));
        self.inner.dispatcher.clear_queue();
        self.inner.awareness.destroy();
        self.inner.synced.store(false, Ordering::SeqCst);
        self.inner.status.send_replace(ProviderStatus::Disconnected);
        info!(project = %self.inner.config.project_id, rejected, "Provider destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn page_unsupported(action: &str, page_id: &str) -> RequestError {
    warn!(page = %page_id, action, "Page mutations are not available over the socket");
    RequestError::Unsupported(format!("page {action} is handled by the REST API"))
}

fn element_operation(envelope: &Envelope<Value>) -> ProtocolResult<Option<ElementOperation>> {
    let op = match envelope.kind {
        MessageType::ElementCreate | MessageType::ElementUpdate => {
            let p: ElementPayload = envelope.payload_as()?;
            ElementOperation::Upsert(p.element)
        }
        MessageType::ElementDelete => {
            let p: DeleteElementPayload = envelope.payload_as()?;
            ElementOperation::Delete {
                element_id: p.element_id,
                deleted_children: p.deleted_children,
            }
        }
        MessageType::ElementMove => {
            let p: MoveElementPayload = envelope.payload_as()?;
            ElementOperation::Move {
                element_id: p.element_id,
                new_parent_id: p.new_parent_id,
                new_order: p.new_order,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(op))
}

fn page_operation(envelope: &Envelope<Value>) -> ProtocolResult<Option<PageOperation>> {
    let p: PagePayload = envelope.payload_as()?;
    let op = match (&envelope.kind, p.page, p.page_id) {
        (MessageType::PageCreate | MessageType::PageUpdate, Some(page), _) => {
            PageOperation::Upsert(page)
        }
        (MessageType::PageDelete, Some(page), None) => PageOperation::Delete { page_id: page.id },
        (MessageType::PageDelete, _, Some(page_id)) => PageOperation::Delete { page_id },
        _ => return Ok(None),
    };
    Ok(Some(op))
}

impl ProviderInner {
    fn set_status(&self, status: ProviderStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    async fn connect(self: Arc<Self>) {
        if let Err(e) = self.connection.connect().await {
            warn!(project = %self.config.project_id, error = %e, "Initial connection failed, retrying in background");
        }
    }

    async fn route(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_connection_event(event);
        }
    }

    async fn prune_presence(self: Arc<Self>) {
        let period = self.config.prune_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            let stale_after = self.awareness.config().stale_after;
            self.awareness.prune_stale(stale_after);
        }
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        self.sender.handle_connection_event(&event);
        match event {
            ConnectionEvent::Open => {
                self.set_status(ProviderStatus::Connected);
                self.request_sync();
            }
            ConnectionEvent::Close { manual, .. } => {
                self.synced.store(false, Ordering::SeqCst);
                self.set_status(ProviderStatus::Disconnected);
                if !manual {
                    debug!(project = %self.config.project_id, "Waiting for reconnect");
                }
            }
            ConnectionEvent::Error(_) => self.set_status(ProviderStatus::Error),
            ConnectionEvent::Message(text) => self.handle_message(&text),
        }
    }

    fn handle_message(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };
        debug!(kind = %envelope.kind, request_id = ?envelope.request_id, "Received");
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.metrics {
            m.record_received(envelope.kind.as_str());
        }

        let resolved = match envelope.request_id.as_deref() {
            Some(request_id) => self.dispatcher.resolve_pending_request(
                request_id,
                envelope.is_success(),
                envelope.clone(),
            ),
            None => false,
        };

        match &envelope.kind {
            MessageType::SyncPage => self.apply_sync(&envelope),
            kind if kind.is_element_operation() => {
                if envelope.is_success() {
                    self.apply_element_operation(&envelope);
                }
            }
            MessageType::PageCreate | MessageType::PageUpdate | MessageType::PageDelete => {
                self.apply_page_operation(&envelope)
            }
            MessageType::Presence => self.apply_presence(&envelope),
            MessageType::UserLeave => match envelope.payload_as::<UserLeavePayload>() {
                Ok(p) => {
                    self.awareness.remove_user(&p.user_id);
                }
                Err(e) => warn!(error = %e, "Dropping user:leave"),
            },
            MessageType::Error => {
                if !resolved {
                    let message = envelope.error_message();
                    warn!(%message, "Server error");
                    if let Some(on_error) = &self.callbacks.on_error {
                        on_error(&message);
                    }
                }
            }
            other => debug!(kind = %other, "Ignoring message"),
        }
    }

    fn apply_sync(&self, envelope: &Envelope<Value>) {
        let payload: SyncPagePayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Dropping sync:page");
                return;
            }
        };

        if let Err(e) = self.syncer.apply_initial_sync(&payload.elements) {
            warn!(error = %e, "Failed to apply element snapshot");
        }
        if let Some(pages) = &payload.pages {
            if let Err(e) = self.syncer.apply_pages_sync(pages) {
                warn!(error = %e, "Failed to apply page snapshot");
            }
        }
        if let Some(users) = payload.users {
            self.awareness.handle_sync_users(users);
        }

        self.synced.store(true, Ordering::SeqCst);
        let _ = self.synced_tx.send(());
        info!(
            project = %self.config.project_id,
            elements = payload.elements.len(),
            "Synced"
        );
    }

    fn apply_element_operation(&self, envelope: &Envelope<Value>) {
        match element_operation(envelope) {
            Ok(Some(op)) => {
                if let Err(e) = self.syncer.handle_element_operation(op) {
                    warn!(kind = %envelope.kind, error = %e, "Failed to apply element operation");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Dropping element operation"),
        }
    }

    fn apply_page_operation(&self, envelope: &Envelope<Value>) {
        match page_operation(envelope) {
            Ok(Some(op)) => {
                if let Err(e) = self.syncer.handle_page_operation(op) {
                    warn!(kind = %envelope.kind, error = %e, "Failed to apply page operation");
                }
            }
            Ok(None) => debug!(kind = %envelope.kind, "Page broadcast without page"),
            Err(e) => warn!(error = %e, "Dropping page operation"),
        }
    }

    fn apply_presence(&self, envelope: &Envelope<Value>) {
        let payload: PresencePayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Dropping presence");
                return;
            }
        };
        let Some(update) = payload.into_update(envelope.user_id.as_deref()) else {
            debug!("Presence without sender");
            return;
        };
        if self.awareness.handle_remote_presence(update.clone()) {
            if let Some(on_presence) = &self.callbacks.on_presence {
                on_presence(&update);
            }
        }
    }

    async fn mutate<P: Serialize>(
        &self,
        operation_type: OperationType,
        element_id: String,
        payload: P,
    ) -> Result<OperationAck, RequestError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RequestError::ConnectionClosed("Provider destroyed".into()));
        }
        let payload =
            serde_json::to_value(payload).map_err(|e| RequestError::Serialization(e.to_string()))?;
        let request_id = self.dispatcher.generate_request_id();
        let envelope = self
            .dispatcher
            .create_envelope(operation_type.message_type(), payload);

        debug!(%request_id, kind = %envelope.kind, element = %element_id, "Sending mutation");
        let reply = self.sender.send_request(envelope, &request_id)?.await?;

        Ok(OperationAck {
            operation_type,
            element_id,
            request_id,
            payload: reply.payload,
        })
    }

    fn send_presence(&self, x: f64, y: f64, element_id: Option<String>) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.awareness.update_local_cursor(x, y);
        self.awareness.update_local_selection(element_id.clone());

        if self.config.rate_limit_presence && !self.dispatcher.check_rate_limit() {
            debug!("Presence dropped by rate limiter");
            return false;
        }

        let payload = PresencePayload {
            user_id: Some(self.config.user_id.clone()),
            user_name: self.config.user_name.clone(),
            cursor_x: x,
            cursor_y: y,
            element_id,
            meta: None,
        };
        self.send_untracked(MessageType::Presence, payload)
    }

    fn request_sync(&self) -> bool {
        debug!(project = %self.config.project_id, "Requesting sync");
        self.send_untracked(MessageType::SyncPage, SyncRequestPayload::default())
    }

    fn send_untracked<P: Serialize>(&self, kind: MessageType, payload: P) -> bool {
        match serde_json::to_value(payload) {
            Ok(payload) => self
                .sender
                .send_or_queue(self.dispatcher.create_envelope(kind, payload)),
            Err(e) => {
                warn!(%kind, error = %e, "Failed to encode payload");
                false
            }
        }
    }
}
