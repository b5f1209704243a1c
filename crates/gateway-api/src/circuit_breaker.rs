//! Circuit breaker guarding warehouse calls
//!
//! `Closed` lets calls through and counts failures inside a rolling window.
//! Reaching the threshold opens the breaker: calls fail immediately without
//! reaching the warehouse. After the cool-down one probe is admitted
//! (`HalfOpen`); its success closes the breaker, its failure reopens it and
//! restarts the cool-down. Requests arriving while the probe is in flight are
//! rejected.
//!
//! Timeouts count as failures. Classified "not found" and "invalid query"
//! answers do not, since the warehouse responded.
//!
//! ## Configuration
//!
//! - `DATAPRODUCT_CIRCUIT_BREAKER_THRESHOLD`: failures that open the breaker (default: 5)
//! - `DATAPRODUCT_CIRCUIT_BREAKER_WINDOW_SECS`: failure counting window (default: 60)
//! - `DATAPRODUCT_CIRCUIT_BREAKER_COOLDOWN_SECS`: time spent open before a probe (default: 30)
//! - `DATAPRODUCT_CIRCUIT_BREAKER_AUTH_FAILURES`: consecutive auth failures that
//!   invalidate the warehouse credential (default: 2)

use dataproduct_gateway_core::env::env_parse;
use dataproduct_gateway_warehouse::ConnectorError;
use parking_lot::Mutex;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_WINDOW_SECS: u64 = 60;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_AUTH_FAILURE_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
    pub auth_failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            auth_failure_threshold: DEFAULT_AUTH_FAILURE_THRESHOLD,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        Self {
            failure_threshold: env_parse(
                "DATAPRODUCT_CIRCUIT_BREAKER_THRESHOLD",
                DEFAULT_FAILURE_THRESHOLD,
            ),
            window: Duration::from_secs(env_parse(
                "DATAPRODUCT_CIRCUIT_BREAKER_WINDOW_SECS",
                DEFAULT_WINDOW_SECS,
            )),
            cooldown: Duration::from_secs(env_parse(
                "DATAPRODUCT_CIRCUIT_BREAKER_COOLDOWN_SECS",
                DEFAULT_COOLDOWN_SECS,
            )),
            auth_failure_threshold: env_parse(
                "DATAPRODUCT_CIRCUIT_BREAKER_AUTH_FAILURES",
                DEFAULT_AUTH_FAILURE_THRESHOLD,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("circuit breaker failure_threshold must be > 0".to_string());
        }
        if self.window.is_zero() {
            return Err("circuit breaker window must be > 0".to_string());
        }
        if self.auth_failure_threshold == 0 {
            return Err("circuit breaker auth_failure_threshold must be > 0".to_string());
        }
        Ok(())
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("circuit breaker is open")]
    Open,

    #[error("warehouse call timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub last_probe_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    failure_count: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_failure_at: Option<Instant>,
    last_probe_at: Option<Instant>,
}

pub struct CircuitBreaker {
    state: AtomicU8,
    inner: Mutex<Inner>,
    auth_failures: AtomicU32,
    config: CircuitBreakerConfig,
}

/// Admission to call the warehouse. Report the outcome with
/// [`Permit::success`], [`Permit::failure`] or [`Permit::settle`]; dropping an
/// unreported probe permit frees the probe slot without a state change.
///
/// `B` is a borrowed breaker for calls that finish inside one future and an
/// `Arc` for outcomes reported later, e.g. by a streamed response body.
pub struct Permit<B: Deref<Target = CircuitBreaker>> {
    breaker: B,
    probe: bool,
    reported: bool,
}

/// A permit that keeps its breaker alive.
pub type OwnedPermit = Permit<Arc<CircuitBreaker>>;

impl<B: Deref<Target = CircuitBreaker>> Permit<B> {
    fn new(breaker: B, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            reported: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.probe);
    }

    /// Report a finished call. Timeouts and health failures count against the
    /// breaker; classified warehouse answers count as success.
    pub fn settle<T>(self, result: &Result<T, CallError>) {
        match result {
            Ok(_) => self.success(),
            Err(CallError::Timeout(_)) => self.failure(),
            Err(CallError::Connector(e)) if e.is_health_failure() => self.failure(),
            Err(CallError::Connector(_)) => self.success(),
            Err(CallError::Open) => {}
        }
    }
}

impl<B: Deref<Target = CircuitBreaker>> Drop for Permit<B> {
    fn drop(&mut self) {
        if self.probe && !self.reported {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            inner: Mutex::new(Inner::default()),
            auth_failures: AtomicU32::new(0),
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: self.state(),
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
            last_probe_at: inner.last_probe_at,
        }
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::SeqCst);

        #[cfg(feature = "metrics")]
        crate::metrics::CIRCUIT_BREAKER_STATE.set(state as i64);
    }

    /// Ask to call the warehouse.
    pub fn acquire(&self) -> Result<Permit<&Self>, CallError> {
        let probe = self.admit()?;
        Ok(Permit::new(self, probe))
    }

    /// Like [`CircuitBreaker::acquire`], for outcomes known only after the
    /// caller has returned.
    pub fn acquire_owned(self: &Arc<Self>) -> Result<OwnedPermit, CallError> {
        let probe = self.admit()?;
        Ok(Permit::new(Arc::clone(self), probe))
    }

    /// Returns `true` when admitting the single half-open call.
    fn admit(&self) -> Result<bool, CallError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match self.state() {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |opened| now.duration_since(opened) >= self.config.cooldown);
                if !cooled {
                    return Err(CallError::Open);
                }
                info!("Circuit breaker half-open, admitting probe");
                self.set_state(CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                inner.last_probe_at = Some(now);
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(CallError::Open);
                }
                inner.probe_in_flight = true;
                inner.last_probe_at = Some(now);
                Ok(true)
            }
        }
    }

    /// Run `fut` under the breaker with a mandatory timeout.
    pub async fn call<T, Fut>(&self, timeout: Duration, fut: Fut) -> Result<T, CallError>
    where
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let permit = self.acquire()?;

        let result = match tokio::time::timeout(timeout, fut).await {
            Err(_) => Err(CallError::Timeout(timeout)),
            Ok(result) => result.map_err(CallError::Connector),
        };
        permit.settle(&result);
        result
    }

    /// Count an authentication failure. Returns `true` when the consecutive
    /// count reaches the threshold; the counter then starts over.
    pub fn record_auth_failure(&self) -> bool {
        let count = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.auth_failure_threshold {
            self.auth_failures.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn on_success(&self, probe: bool) {
        self.auth_failures.store(0, Ordering::SeqCst);
        if !probe {
            return;
        }
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        inner.failure_count = 0;
        inner.window_start = None;
        inner.opened_at = None;
        self.set_state(CircuitState::Closed);
        info!("Circuit breaker closed after successful probe");
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(now);

        if probe {
            inner.probe_in_flight = false;
            self.open(&mut inner, now);
            return;
        }

        // Late results from calls admitted before a transition are ignored.
        if self.state() != CircuitState::Closed {
            return;
        }

        let window_expired = inner
            .window_start
            .map_or(true, |start| now.duration_since(start) >= self.config.window);
        if window_expired {
            inner.window_start = Some(now);
            inner.failure_count = 0;
        }
        inner.failure_count += 1;

        if inner.failure_count >= self.config.failure_threshold {
            self.open(&mut inner, now);
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        warn!(
            failures = inner.failure_count,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Circuit breaker opened"
        );
        inner.opened_at = Some(now);
        inner.failure_count = 0;
        inner.window_start = None;
        self.set_state(CircuitState::Open);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("auth_failures", &self.auth_failures.load(Ordering::Relaxed))
            .finish()
    }
}
