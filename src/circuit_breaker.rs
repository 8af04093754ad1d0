//! Per-subgraph circuit breakers
//!
//! A subgraph that keeps failing is cut off for `reset_timeout`: calls fail
//! fast with a `CircuitBreaker` error instead of piling up timeouts, and the
//! gateway keeps answering from the remaining subgraphs.
//!
//! ## States
//!
//! - **Closed**: calls reach the subgraph
//! - **Open**: calls are rejected without touching the subgraph
//! - **Half-Open**: a bounded number of probe calls decide recovery
//!
//! ## Transitions
//!
//! 1. A new breaker is **Closed**
//! 2. `failure_threshold` consecutive failures → **Open**
//! 3. Once `reset_timeout` has elapsed since the last failure, the next request
//!    moves the circuit to **Half-Open** and is let through
//! 4. While **Half-Open**, at most `half_open_max_calls` probes are admitted
//!    in total, concurrently or not; further calls are rejected until the
//!    probes settle. With `half_open_max_calls = 1` exactly one probe runs.
//! 5. After `half_open_max_calls` successful probes → Circuit **Closes**
//! 6. Any failed probe → Circuit **Opens** again
//!
//! ## Example
//!
//! ```rust
//! use graphql_federation_gateway::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new("users", CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     reset_timeout: Duration::from_secs(30),
//!     half_open_max_calls: 3,
//! });
//! assert!(breaker.allow_request().is_ok());
//! ```

use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - requests flow through
    Closed,
    /// Subgraph unhealthy - requests fail fast
    Open,
    /// Testing recovery - limited requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the Circuit Breaker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit admits a probe
    pub reset_timeout: Duration,
    /// Successful probes required in Half-Open before closing
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::validation("circuit breaker failure_threshold must be > 0"));
        }
        if self.reset_timeout.is_zero() {
            return Err(Error::validation("circuit breaker reset_timeout must be > 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(Error::validation("circuit breaker half_open_max_calls must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Probes admitted since entering half-open
    half_open_calls: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.last_state_change = Instant::now();
        self.success_count = 0;
        self.half_open_calls = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
    }
}

/// Point-in-time view of a breaker, for status endpoints and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub subgraph: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure
    pub last_failure_ms_ago: Option<u64>,
    /// Milliseconds since the last state transition
    pub last_state_change_ms_ago: u64,
}

/// Circuit breaker for a single subgraph
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    /// Subgraph id for logging
    subgraph: String,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a subgraph
    pub fn new(subgraph: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::new()),
            subgraph: subgraph.into(),
        }
    }

    /// Current circuit state. Does not admit or reject anything.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Check if a request should be allowed through
    ///
    /// Returns `Ok(())` if the request can proceed, `Err` if circuit is open.
    pub fn allow_request(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.last_failure_time.map(|t| t.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed < self.config.reset_timeout => {
                        tracing::debug!(
                            subgraph = %self.subgraph,
                            "Subgraph circuit open, rejecting call"
                        );
                        Err(self.open_error(Some(self.config.reset_timeout - elapsed)))
                    }
                    _ => {
                        inner.transition(CircuitState::HalfOpen);
                        inner.half_open_calls = 1;
                        tracing::info!(
                            subgraph = %self.subgraph,
                            "Reset timeout elapsed, subgraph circuit half-open"
                        );
                        Ok(())
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    tracing::debug!(
                        subgraph = %self.subgraph,
                        probe = inner.half_open_calls,
                        max = self.config.half_open_max_calls,
                        "Half-open circuit admitting probe"
                    );
                    Ok(())
                } else {
                    tracing::debug!(
                        subgraph = %self.subgraph,
                        "Half-open probe budget exhausted"
                    );
                    Err(self.open_error(None))
                }
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    inner.transition(CircuitState::Closed);
                    tracing::info!(
                        subgraph = %self.subgraph,
                        "Subgraph recovered, circuit closed"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    let failures = inner.failure_count;
                    inner.transition(CircuitState::Open);
                    inner.last_failure_time = Some(Instant::now());
                    tracing::warn!(
                        subgraph = %self.subgraph,
                        failures = failures,
                        "Subgraph circuit opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open);
                inner.last_failure_time = Some(Instant::now());
                tracing::warn!(
                    subgraph = %self.subgraph,
                    "Probe failed, subgraph circuit reopened"
                );
            }
            CircuitState::Open => {
                inner.last_failure_time = Some(Instant::now());
            }
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Fails fast with a circuit breaker error when the circuit rejects the
    /// request; `call` is not invoked in that case.
    pub async fn call<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow_request()?;
        match call().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Get the subgraph id
    pub fn subgraph(&self) -> &str {
        &self.subgraph
    }

    /// Get failure count
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            subgraph: self.subgraph.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_ms_ago: inner.last_failure_time.map(|t| t.elapsed().as_millis() as u64),
            last_state_change_ms_ago: inner.last_state_change.elapsed().as_millis() as u64,
        }
    }

    /// Force reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        inner.last_failure_time = None;
        tracing::info!(
            subgraph = %self.subgraph,
            "Subgraph circuit reset"
        );
    }

    fn open_error(&self, retry_after: Option<Duration>) -> Error {
        let err = Error::circuit_breaker(format!("circuit open for subgraph '{}'", self.subgraph))
            .with_context("subgraph", &self.subgraph);
        match retry_after {
            Some(retry) => err.with_context("retryAfterMs", retry.as_millis() as u64),
            None => err,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("subgraph", &self.subgraph)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

/// Registry of circuit breakers, one per subgraph id
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a new registry with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a circuit breaker for a subgraph
    pub fn get_or_create(&self, subgraph: &str) -> Arc<CircuitBreaker> {
        // Fast path: check if exists
        if let Some(breaker) = self.breakers.read().get(subgraph) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(subgraph.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(subgraph, self.config.clone())))
            .clone()
    }

    /// Get a circuit breaker for a subgraph (if exists)
    pub fn get(&self, subgraph: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(subgraph).cloned()
    }

    /// Get status of all circuit breakers
    pub fn status(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.state()))
            .collect()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.subgraph.cmp(&b.subgraph));
        snapshots
    }

    /// Reset all circuit breakers
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("subgraphs", &self.breakers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
