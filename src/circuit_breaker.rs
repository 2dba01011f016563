/*!
 * Circuit breaker for outbound payment-provider calls.
 *
 * Guards a failing dependency behind a three-state machine so that a broken
 * gateway fails fast instead of tying up request handlers for the full
 * timeout, and gets probed again only after a cool-down.
 */

use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through
    Closed,
    /// Requests are rejected until the reset timeout elapses
    Open,
    /// A limited number of probe requests test recovery
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Successes needed in half-open to close the circuit
    pub success_threshold: u32,
    /// Hard timeout applied to each guarded call
    pub call_timeout: Duration,
    /// How long an open circuit rejects before allowing a probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
}

/// Per-dependency circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt: None,
            }),
        }
    }

    /// Runs `fut` under the breaker with the configured hard timeout.
    ///
    /// An open circuit rejects without polling the future at all. Timeouts
    /// count as failures.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            warn!(breaker = %self.name, "circuit open, rejecting call");
            return Err(CircuitBreakerError::CircuitOpen(self.name.clone()));
        }

        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure();
                Err(CircuitBreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Checks admission, transitioning Open -> HalfOpen when the cool-down
    /// has elapsed.
    fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = state
                    .next_attempt
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    debug!(breaker = %self.name, "cool-down elapsed, probing (half-open)");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        // Any success clears accumulated failures regardless of state.
        state.failure_count = 0;
        if state.state == CircuitState::HalfOpen {
            state.success_count += 1;
            if state.success_count >= self.config.success_threshold {
                debug!(breaker = %self.name, "recovered, closing circuit");
                state.state = CircuitState::Closed;
                state.success_count = 0;
                state.next_attempt = None;
            }
        }
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        state.failure_count += 1;
        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures = state.failure_count, "opening circuit");
                    state.state = CircuitState::Open;
                    state.next_attempt = Some(Instant::now() + self.config.reset_timeout);
                }
            }
            CircuitState::HalfOpen => {
                // A single failed probe re-opens and extends the cool-down.
                warn!(breaker = %self.name, "probe failed, re-opening circuit");
                state.state = CircuitState::Open;
                state.success_count = 0;
                state.next_attempt = Some(Instant::now() + self.config.reset_timeout);
            }
            CircuitState::Open => {
                state.next_attempt = Some(Instant::now() + self.config.reset_timeout);
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Registry handing out one breaker per named external dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
        }
    }

    /// Gets or creates the breaker for `name` with the registry's defaults.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }
}
