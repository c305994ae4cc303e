//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **Configuration**: loaded once at startup, never mutated afterwards
//! - **Session settings**: the system prompt and per-session knobs, built once
//! - **Service factory**: constructs fresh STT/TTS/LLM clients for each session
//! - **Metrics**: request counters, per-endpoint latency and session admission
//!
//! ## Rust Concepts:
//! - **Arc<RwLock<T>>**: metrics are written by every request, so they sit
//!   behind a reader-writer lock shared by all worker threads
//! - **Arc<T>** without a lock: configuration and settings are read-only
//! - **RAII guard**: [`SessionPermit`] gives its admission slot back when it
//!   is dropped, so a session can never leak a slot on an early return

use crate::config::AppConfig;
use crate::providers::{CartesiaStt, CartesiaTts, OpenAiChat, ProviderError};
use crate::session::{SessionServices, SessionSettings};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Builds the collaborator clients for one session.
pub type ServiceFactory = Arc<dyn Fn() -> Result<SessionServices, ProviderError> + Send + Sync>;

/// The main application state shared across all request handlers.
///
/// ## Thread Safety Pattern:
/// - `config` and `settings` are immutable after startup, plain `Arc` is enough
/// - `metrics` is mutated by every request, so it uses `Arc<RwLock<_>>`
/// - Cloning an `AppState` only bumps reference counts
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, fixed for the lifetime of the process
    pub config: Arc<AppConfig>,

    /// Settings every voice session starts from (includes the system prompt)
    pub settings: Arc<SessionSettings>,

    /// Performance and admission metrics (constantly updated)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    services: ServiceFactory,
}

/// Metrics collected across all HTTP requests and voice sessions.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: overall load and reliability
/// - **active_sessions**: current voice channels, bounded by `max_concurrent_sessions`
/// - **total_sessions / rejected_sessions**: capacity planning
/// - **endpoint_metrics**: per-endpoint latency
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub rejected_sessions: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// One admitted voice session. Dropping the permit frees its slot.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    /// Create state that talks to the real Cartesia and OpenAI services.
    ///
    /// ## What this does:
    /// 1. Freezes the config and builds the shared session settings
    /// 2. Installs a factory that builds fresh provider clients per session
    /// 3. Starts with empty metrics and records the start time
    pub fn new(config: AppConfig, system_prompt: impl Into<String>) -> Self {
        let factory_config = config.clone();
        let services: ServiceFactory = Arc::new(move || provider_services(&factory_config));
        Self::with_services(config, system_prompt, services)
    }

    /// Create state with a custom service factory (used by tests).
    pub fn with_services(
        config: AppConfig,
        system_prompt: impl Into<String>,
        services: ServiceFactory,
    ) -> Self {
        let settings = SessionSettings::from_config(&config, system_prompt);
        Self {
            config: Arc::new(config),
            settings: Arc::new(settings),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            services,
        }
    }

    pub fn get_config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    pub fn session_settings(&self) -> Arc<SessionSettings> {
        self.settings.clone()
    }

    /// Fresh collaborator clients for a new session.
    pub fn session_services(&self) -> Result<SessionServices, ProviderError> {
        (self.services)()
    }

    /// Admit a new voice session if capacity allows.
    ///
    /// The check and the increment happen under one write lock, so two
    /// concurrent upgrades can never both take the last slot.
    pub fn try_acquire_session(&self) -> Option<SessionPermit> {
        let limit = self.config.performance.max_concurrent_sessions;
        let mut metrics = self.metrics_mut();

        if metrics.active_sessions >= limit {
            metrics.rejected_sessions += 1;
            return None;
        }

        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        Some(SessionPermit { metrics: self.metrics.clone() })
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record latency and outcome for a specific endpoint.
    ///
    /// ## Rust Concepts:
    /// - **.entry().or_default()**: creates the metric the first time an endpoint is seen
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current metrics, so no lock is held while responding.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    // A panic while holding the lock leaves plain counters behind, which are
    // still safe to read and update.
    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn provider_services(config: &AppConfig) -> Result<SessionServices, ProviderError> {
    Ok(SessionServices {
        stt: Arc::new(CartesiaStt::new(config.stt.clone())),
        tts: Arc::new(CartesiaTts::new(config.tts.clone())),
        llm: Arc::new(OpenAiChat::new(&config.llm)?),
    })
}

impl AppMetrics {
    /// Errors divided by requests, 0.0 before the first request.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average = total duration ÷ number of requests.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 (no errors) and 1.0 (every request failed).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing;

    fn state_with_limit(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        AppState::with_services(
            config,
            "prompt",
            testing::service_factory(),
        )
    }

    #[test]
    fn test_session_admission_respects_limit() {
        let state = state_with_limit(2);

        let first = state.try_acquire_session().unwrap();
        let _second = state.try_acquire_session().unwrap();
        assert!(state.try_acquire_session().is_none());

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 2);
        assert_eq!(metrics.total_sessions, 2);
        assert_eq!(metrics.rejected_sessions, 1);

        drop(first);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
        assert!(state.try_acquire_session().is_some());
    }

    #[test]
    fn test_permit_released_once() {
        let state = state_with_limit(1);
        {
            let _permit = state.try_acquire_session().unwrap();
        }
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
        assert_eq!(state.get_metrics_snapshot().total_sessions, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state_with_limit(1);
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.error_rate(), 0.5);

        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_empty_metrics_have_zero_rates() {
        assert_eq!(AppMetrics::default().error_rate(), 0.0);
        assert_eq!(EndpointMetric::default().average_duration_ms(), 0.0);
    }

    #[test]
    fn test_settings_carry_system_prompt() {
        let state = state_with_limit(1);
        assert_eq!(state.session_settings().system_prompt, "prompt");
        assert!(state.session_services().is_ok());
    }

    #[test]
    fn test_provider_services_build_from_default_config() {
        let state = AppState::new(AppConfig::default(), "prompt");
        assert!(state.session_services().is_ok());
    }
}
