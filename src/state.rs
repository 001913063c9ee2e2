//! Shared application state: configuration, the engine handle and request
//! metrics, cloned into every worker.

use crate::config::AppConfig;
use crate::engine::AsrEngine;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<dyn AsrEngine>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Transcription streams currently being produced
    pub active_transcriptions: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<dyn AsrEngine>) -> Self {
        Self {
            config,
            engine,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_transcriptions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_transcriptions += 1;
    }

    pub fn decrement_active_transcriptions(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // underflow guard
        if metrics.active_transcriptions > 0 {
            metrics.active_transcriptions -= 1;
        }
    }

    /// Consistent copy of the metrics, taken under the read lock so the
    /// response body never sees a half-updated endpoint entry.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_transcriptions: metrics.active_transcriptions,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::create_engine;

    fn state() -> AppState {
        let config = AppConfig::default();
        let engine = create_engine(&config).unwrap();
        AppState::new(config, engine)
    }

    #[test]
    fn counters_accumulate() {
        let state = state();
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();
        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
    }

    #[test]
    fn endpoint_metrics_track_averages() {
        let state = state();
        state.record_endpoint_request("POST /asr", 100, false);
        state.record_endpoint_request("POST /asr", 300, true);
        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /asr"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 200.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn active_transcriptions_never_underflow() {
        let state = state();
        state.decrement_active_transcriptions();
        state.increment_active_transcriptions();
        state.decrement_active_transcriptions();
        assert_eq!(state.get_metrics_snapshot().active_transcriptions, 0);
    }
}
