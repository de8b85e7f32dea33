//! Envelope construction, request correlation and the offline queue

use crate::error::RequestError;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trellis_protocol::{now_millis, Envelope, MessageType};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            queue_capacity: 1000,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

type Reply = Result<Envelope<Value>, RequestError>;

struct PendingRequest {
    tx: oneshot::Sender<Reply>,
    timer: Option<JoinHandle<()>>,
}

type PendingMap = Arc<DashMap<String, PendingRequest>>;

/// Resolves with the correlated reply envelope
#[derive(Debug)]
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingResponse {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let settled = ready!(Pin::new(&mut self.rx).poll(cx));
        Poll::Ready(settled.unwrap_or_else(|_| {
            Err(RequestError::ConnectionClosed("Request abandoned".into()))
        }))
    }
}

/// Builds envelopes and tracks in-flight requests for one session
pub struct MessageDispatcher {
    project_id: String,
    page_id: String,
    user_id: String,
    config: DispatcherConfig,
    limiter: RateLimiter,
    counter: AtomicU64,
    pending: PendingMap,
    queue: Mutex<VecDeque<Envelope<Value>>>,
    #[cfg(feature = "metrics")]
    metrics: OnceLock<Arc<Metrics>>,
}

impl MessageDispatcher {
    pub fn new(
        project_id: impl Into<String>,
        page_id: impl Into<String>,
        user_id: impl Into<String>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            page_id: page_id.into(),
            user_id: user_id.into(),
            limiter: RateLimiter::new(config.rate_limit),
            config,
            counter: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            #[cfg(feature = "metrics")]
            metrics: OnceLock::new(),
        }
    }

    #[cfg(feature = "metrics")]
    pub fn set_metrics(&self, metrics: Arc<Metrics>) {
        let _ = self.metrics.set(metrics);
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.get()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Envelope for this session, stamped now. No request id is attached.
    pub fn create_envelope<T>(&self, kind: MessageType, payload: T) -> Envelope<T> {
        Envelope::new(kind, &self.project_id, &self.page_id, payload).with_user(&self.user_id)
    }

    /// `req-<now>-<counter>`, unique within this session
    pub fn generate_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("req-{}-{}", now_millis(), n)
    }

    /// Admission gate for tracked requests; consumes a token when it admits
    pub fn check_rate_limit(&self) -> bool {
        if self.limiter.try_acquire() {
            return true;
        }
        warn!(project = %self.project_id, "Rate limit exceeded");
        #[cfg(feature = "metrics")]
        if let Some(m) = self.metrics() {
            m.rate_limited_requests.inc();
        }
        false
    }

    pub fn available_tokens(&self) -> u32 {
        self.limiter.available_tokens()
    }

    /// Register a request and start its timeout.
    ///
    /// The entry exists as soon as this returns, so a reply may be resolved
    /// before the returned future is first polled. Must be called inside a
    /// tokio runtime.
    pub fn create_pending_request(
        &self,
        request_id: &str,
        timeout: Option<Duration>,
    ) -> PendingResponse {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(request_id.to_string(), PendingRequest { tx, timer: None });

        let pending = self.pending.clone();
        let id = request_id.to_string();
        #[cfg(feature = "metrics")]
        let metrics = self.metrics().cloned();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, request)) = pending.remove(&id) {
                warn!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                #[cfg(feature = "metrics")]
                if let Some(m) = metrics {
                    m.request_timeouts.inc();
                    m.requests_in_flight.dec();
                }
                let _ = request.tx.send(Err(RequestError::Timeout {
                    request_id: id,
                    timeout_ms: timeout.as_millis() as u64,
                }));
            }
        });

        // The timer may already have fired and removed the entry
        match self.pending.get_mut(request_id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => drop(timer),
        }
        #[cfg(feature = "metrics")]
        if let Some(m) = self.metrics() {
            m.requests_in_flight.inc();
        }

        PendingResponse {
            request_id: request_id.to_string(),
            rx,
        }
    }

    /// Settle a pending request from its reply.
    ///
    /// Returns false when no such request is pending (unknown, already
    /// settled, or timed out).
    pub fn resolve_pending_request(
        &self,
        request_id: &str,
        success: bool,
        reply: Envelope<Value>,
    ) -> bool {
        let Some((_, request)) = self.pending.remove(request_id) else {
            return false;
        };
        if let Some(timer) = request.timer {
            timer.abort();
        }
        #[cfg(feature = "metrics")]
        if let Some(m) = self.metrics() {
            m.requests_in_flight.dec();
        }

        let result = if success {
            Ok(reply)
        } else {
            let message = reply.error_message();
            debug!(request_id, %message, "Request rejected by server");
            Err(RequestError::Rejected(message))
        };
        let _ = request.tx.send(result);
        true
    }

    /// Settle every pending request with `reason`. Returns how many there were.
    pub fn reject_all_pending_requests(&self, reason: RequestError) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                if let Some(timer) = request.timer {
                    timer.abort();
                }
                let _ = request.tx.send(Err(reason.clone()));
                rejected += 1;
            }
        }
        #[cfg(feature = "metrics")]
        if let Some(m) = self.metrics() {
            m.requests_in_flight.sub(rejected as i64);
        }
        if rejected > 0 {
            debug!(count = rejected, %reason, "Rejected pending requests");
        }
        rejected
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Append to the offline queue, evicting the oldest entry when full
    pub fn enqueue_message(&self, envelope: Envelope<Value>) {
        let mut queue = self.queue.lock();
        while queue.len() >= self.config.queue_capacity.max(1) {
            if let Some(evicted) = queue.pop_front() {
                warn!(kind = %evicted.kind, "Offline queue full, dropping oldest message");
                #[cfg(feature = "metrics")]
                if let Some(m) = self.metrics() {
                    m.queue_evictions.inc();
                }
            }
        }
        queue.push_back(envelope);
        #[cfg(feature = "metrics")]
        if let Some(m) = self.metrics() {
            m.frames_queued.inc();
        }
    }

    /// Put envelopes back at the head of the queue, ahead of anything
    /// enqueued since they were consumed. Capacity is still enforced by
    /// evicting from the head.
    pub fn requeue_front(&self, envelopes: Vec<Envelope<Value>>) {
        let mut queue = self.queue.lock();
        for envelope in envelopes.into_iter().rev() {
            queue.push_front(envelope);
        }
        let capacity = self.config.queue_capacity.max(1);
        while queue.len() > capacity {
            if let Some(evicted) = queue.pop_front() {
                warn!(kind = %evicted.kind, "Offline queue full, dropping oldest message");
            }
        }
    }

    /// Take the whole queue in FIFO order, leaving it empty
    pub fn consume_queue(&self) -> Vec<Envelope<Value>> {
        std::mem::take(&mut *self.queue.lock()).into()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn clear_queue(&self) {
        self.queue.lock().clear();
    }
}
