//! Send-or-queue glue between the dispatcher and the connection

use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::dispatcher::{MessageDispatcher, PendingResponse};
use crate::error::RequestError;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use trellis_protocol::Envelope;

/// Reason given to requests still pending when the socket closes
pub const CONNECTION_CLOSED: &str = "Connection closed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    Connected,
    Disconnected { reason: String },
    Error(String),
    /// Some queued envelopes could not be sent and were put back
    FlushPartial { sent: usize, requeued: usize },
    FlushComplete { sent: usize },
}

pub struct MessageSender {
    connection: ConnectionManager,
    dispatcher: Arc<MessageDispatcher>,
    events: broadcast::Sender<SenderEvent>,
}

impl MessageSender {
    pub fn new(connection: ConnectionManager, dispatcher: Arc<MessageDispatcher>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connection,
            dispatcher,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SenderEvent> {
        self.events.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    fn emit(&self, event: SenderEvent) {
        let _ = self.events.send(event);
    }

    /// Write one envelope now, without queueing on failure
    fn try_send(&self, envelope: &Envelope<Value>) -> bool {
        match envelope.encode() {
            Ok(text) => self.connection.send(&text),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
                false
            }
        }
    }

    /// Send immediately, or fall back to the offline queue.
    ///
    /// Returns true when the envelope went out now.
    pub fn send_or_queue(&self, envelope: Envelope<Value>) -> bool {
        if self.try_send(&envelope) {
            return true;
        }
        debug!(kind = %envelope.kind, "Not connected, queueing message");
        self.dispatcher.enqueue_message(envelope);
        false
    }

    /// Send a tracked request.
    ///
    /// Rejects immediately with [`RequestError::RateLimited`] when the
    /// bucket is empty; nothing is sent or queued in that case.
    pub fn send_request(
        &self,
        envelope: Envelope<Value>,
        request_id: &str,
    ) -> Result<PendingResponse, RequestError> {
        if !self.dispatcher.check_rate_limit() {
            return Err(RequestError::RateLimited);
        }
        let pending = self.dispatcher.create_pending_request(request_id, None);
        self.send_or_queue(envelope.with_request_id(request_id));
        Ok(pending)
    }

    /// Drain the offline queue in order. Envelopes that fail to send are put
    /// back at the head, keeping their relative order. No-op while
    /// disconnected.
    pub fn flush_queue(&self) {
        if !self.connection.is_connected() {
            return;
        }
        let queued = self.dispatcher.consume_queue();
        if queued.is_empty() {
            return;
        }

        let total = queued.len();
        let failed: Vec<Envelope<Value>> = queued
            .into_iter()
            .filter(|envelope| !self.try_send(envelope))
            .collect();

        let sent = total - failed.len();
        if failed.is_empty() {
            info!(sent, "Offline queue flushed");
            self.emit(SenderEvent::FlushComplete { sent });
        } else {
            let requeued = failed.len();
            warn!(sent, requeued, "Offline queue partially flushed");
            self.dispatcher.requeue_front(failed);
            self.emit(SenderEvent::FlushPartial { sent, requeued });
        }
    }

    /// React to a connection lifecycle event
    pub fn handle_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {
                self.flush_queue();
                self.emit(SenderEvent::Connected);
            }
            ConnectionEvent::Close { reason, .. } => {
                self.dispatcher.reject_all_pending_requests(RequestError::ConnectionClosed(
                    CONNECTION_CLOSED.into(),
                ));
                self.emit(SenderEvent::Disconnected {
                    reason: reason.clone(),
                });
            }
            ConnectionEvent::Error(message) => self.emit(SenderEvent::Error(message.clone())),
            ConnectionEvent::Message(_) => {}
        }
    }
}
