//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every actix worker hold the same configuration and metrics
//! - **Cloning**: `AppState::clone()` copies pointers, never the data behind them
//!
//! ### parking_lot::RwLock
//! - **Purpose**: Many readers OR one writer
//! - **No poisoning**: a panicking handler cannot wedge the metrics for everyone
//!   else, so reads and writes need no `unwrap()`
//!
//! The conversation state itself lives in `VoiceRelay`, which has its own
//! locking. `AppState` only adds HTTP-level bookkeeping on top.

use crate::config::AppConfig;
use crate::relay::VoiceRelay;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed at startup
    pub config: Arc<AppConfig>,

    /// HTTP request metrics, updated by `MetricsMiddleware`
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Sessions, turn taking and the conversation pipeline
    pub relay: VoiceRelay,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and WebSocket connections.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Requests that ended with a 4xx/5xx status
    pub error_count: u64,

    /// Currently open `/ws/voice` connections
    pub websocket_connections: u32,

    /// Key: route pattern (e.g., "GET /api/v1/sessions/{id}")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint statistics.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, relay: VoiceRelay) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            relay,
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record one finished request against its route.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn websocket_connected(&self) {
        self.metrics.write().websocket_connections += 1;
    }

    /// Saturates at zero.
    pub fn websocket_disconnected(&self) {
        let mut metrics = self.metrics.write();
        metrics.websocket_connections = metrics.websocket_connections.saturating_sub(1);
    }

    /// Copy of the metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::providers::Providers;

    let config = AppConfig::default();
    let providers = Providers::from_config(&config.providers, config.turn.audio_format())
        .expect("loopback providers");
    let relay = VoiceRelay::from_config(&config, providers);
    AppState::new(config, relay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_websocket_counter_saturates() {
        let state = test_state();
        state.websocket_disconnected();
        state.websocket_connected();
        assert_eq!(state.get_metrics_snapshot().websocket_connections, 1);
        state.websocket_disconnected();
        state.websocket_disconnected();
        assert_eq!(state.get_metrics_snapshot().websocket_connections, 0);
    }

    #[test]
    fn test_request_counters() {
        let state = test_state();
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_rate(), 0.5);
    }
}
