//! Prometheus metrics for the Trellis client
//!
//! Counters for the outbound pipeline and the connection lifecycle, exported
//! in Prometheus text format.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Trellis client metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Frame metrics
    pub frames_sent: IntCounter,
    pub frames_received: IntCounterVec,
    pub frames_queued: IntCounter,
    pub queue_evictions: IntCounter,

    // Request metrics
    pub rate_limited_requests: IntCounter,
    pub request_timeouts: IntCounter,
    pub requests_in_flight: IntGauge,

    // Connection metrics
    pub reconnect_attempts: IntCounter,
    pub connected: IntGauge,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let frames_sent = IntCounter::new("trellis_frames_sent_total", "Frames written to the socket")?;
        let frames_received = IntCounterVec::new(
            Opts::new("trellis_frames_received_total", "Frames received, by message type"),
            &["type"],
        )?;
        let frames_queued = IntCounter::new(
            "trellis_frames_queued_total",
            "Frames placed on the offline queue",
        )?;
        let queue_evictions = IntCounter::new(
            "trellis_queue_evictions_total",
            "Oldest frames dropped because the offline queue was full",
        )?;

        let rate_limited_requests = IntCounter::new(
            "trellis_rate_limited_requests_total",
            "Tracked requests rejected by the token bucket",
        )?;
        let request_timeouts = IntCounter::new(
            "trellis_request_timeouts_total",
            "Tracked requests that timed out waiting for a reply",
        )?;
        let requests_in_flight = IntGauge::new(
            "trellis_requests_in_flight",
            "Tracked requests awaiting a reply",
        )?;

        let reconnect_attempts = IntCounter::new(
            "trellis_reconnect_attempts_total",
            "Reconnect attempts scheduled after an unexpected close",
        )?;
        let connected = IntGauge::new("trellis_connected", "1 while the socket is open")?;

        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_queued.clone()))?;
        registry.register(Box::new(queue_evictions.clone()))?;
        registry.register(Box::new(rate_limited_requests.clone()))?;
        registry.register(Box::new(request_timeouts.clone()))?;
        registry.register(Box::new(requests_in_flight.clone()))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;
        registry.register(Box::new(connected.clone()))?;

        Ok(Self {
            registry,
            frames_sent,
            frames_received,
            frames_queued,
            queue_evictions,
            rate_limited_requests,
            request_timeouts,
            requests_in_flight,
            reconnect_attempts,
            connected,
        })
    }

    /// Record an inbound frame
    pub fn record_received(&self, kind: &str) {
        self.frames_received.with_label_values(&[kind]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.frames_sent.inc();
        metrics.record_received("presence");

        let text = metrics.export();
        assert!(text.contains("trellis_frames_sent_total 1"));
        assert!(text.contains("trellis_frames_received_total{type=\"presence\"} 1"));
    }
}
