//! Process-wide Prometheus metrics.
//!
//! All streaming metrics are labeled by call_id; label sets are removed
//! when a call's stream ends so the registry does not grow without bound.

use prometheus::{GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Registry plus handles for every metric the engine maintains.
pub struct Metrics {
    pub registry: Registry,

    /// 1 while streaming playback is active for a call.
    pub streaming_active: IntGaugeVec,
    /// Bytes queued to streaming playback, pre-conversion.
    pub streaming_bytes_total: IntCounterVec,
    /// Current jitter buffer depth in chunks.
    pub streaming_jitter_buffer_depth: IntGaugeVec,
    /// Seconds since the last streaming chunk arrived.
    pub streaming_last_chunk_age_seconds: GaugeVec,
    /// Keepalive ticks observed while streaming.
    pub streaming_keepalives_sent_total: IntCounterVec,
    /// Keepalive-detected connection timeouts.
    pub streaming_keepalive_timeouts_total: IntCounterVec,
    /// Times streaming fell back to file playback.
    pub streaming_fallbacks_total: IntCounterVec,

    /// Calls currently tracked by the session store.
    pub active_calls: IntGaugeVec,
}

const CALL_LABEL: &[&str] = &["call_id"];

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGaugeVec {
    let vec = IntGaugeVec::new(Opts::new(name, help), CALL_LABEL).expect("valid metric");
    registry.register(Box::new(vec.clone())).expect("unique metric");
    vec
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), CALL_LABEL).expect("valid metric");
    registry.register(Box::new(vec.clone())).expect("unique metric");
    vec
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let streaming_active = gauge(
            &registry,
            "streaming_active",
            "Whether streaming playback is active for a call (1 = active)",
        );
        let streaming_bytes_total = counter(
            &registry,
            "streaming_bytes_total",
            "Total bytes queued to streaming playback (pre-conversion)",
        );
        let streaming_jitter_buffer_depth = gauge(
            &registry,
            "streaming_jitter_buffer_depth",
            "Current jitter buffer depth in queued chunks",
        );
        let streaming_last_chunk_age_seconds = GaugeVec::new(
            Opts::new(
                "streaming_last_chunk_age_seconds",
                "Seconds since the last streaming chunk was received",
            ),
            CALL_LABEL,
        )
        .expect("valid metric");
        registry
            .register(Box::new(streaming_last_chunk_age_seconds.clone()))
            .expect("unique metric");
        let streaming_keepalives_sent_total = counter(
            &registry,
            "streaming_keepalives_sent_total",
            "Count of keepalive ticks sent while streaming",
        );
        let streaming_keepalive_timeouts_total = counter(
            &registry,
            "streaming_keepalive_timeouts_total",
            "Count of keepalive-detected streaming timeouts",
        );
        let streaming_fallbacks_total = counter(
            &registry,
            "streaming_fallbacks_total",
            "Number of times streaming fell back to file playback",
        );
        let active_calls = gauge(&registry, "active_calls", "Calls currently tracked");

        Self {
            registry,
            streaming_active,
            streaming_bytes_total,
            streaming_jitter_buffer_depth,
            streaming_last_chunk_age_seconds,
            streaming_keepalives_sent_total,
            streaming_keepalive_timeouts_total,
            streaming_fallbacks_total,
            active_calls,
        }
    }

    /// Drops every per-call label set when a stream ends.
    pub fn remove_call(&self, call_id: &str) {
        let labels = &[call_id];
        let _ = self.streaming_active.remove_label_values(labels);
        let _ = self.streaming_bytes_total.remove_label_values(labels);
        let _ = self.streaming_jitter_buffer_depth.remove_label_values(labels);
        let _ = self
            .streaming_last_chunk_age_seconds
            .remove_label_values(labels);
        let _ = self
            .streaming_keepalives_sent_total
            .remove_label_values(labels);
        let _ = self
            .streaming_keepalive_timeouts_total
            .remove_label_values(labels);
        let _ = self.streaming_fallbacks_total.remove_label_values(labels);
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut out = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut out) {
            log::warn!("[Metrics] encode failed: {}", e);
        }
        String::from_utf8(out).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_metrics_track_and_render() {
        let metrics = Metrics::new();
        metrics.streaming_active.with_label_values(&["c1"]).set(1);
        metrics
            .streaming_bytes_total
            .with_label_values(&["c1"])
            .inc_by(320);

        let text = metrics.render();
        assert!(text.contains("streaming_active"));
        assert!(text.contains("c1"));

        metrics.remove_call("c1");
        let text = metrics.render();
        assert!(!text.contains("c1"));
    }
}
