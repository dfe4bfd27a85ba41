//! Circuit breaker guarding calls to a single logical dependency.

use crate::breaker::{BreakerError, CircuitState};
use crate::config::CircuitBreakerConfig;
use crate::events::{EventBus, ResilienceEvent};
use crate::metrics::MetricsCollector;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of recent response times kept for latency reporting.
const RESPONSE_HISTORY: usize = 100;

/// Predicate deciding whether an operation error should be ignored.
type ErrorFilter = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Creation-time options for a circuit breaker.
#[derive(Clone, Default)]
pub struct CircuitBreakerOptions {
    config: CircuitBreakerConfig,
    ignored: Vec<ErrorFilter>,
}

impl CircuitBreakerOptions {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            ignored: Vec::new(),
        }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    /// Treat operation errors of type `E` matching `predicate` as expected.
    ///
    /// Ignored errors still count as requests and are returned to the
    /// caller, but never count toward the failure threshold.
    pub fn ignore_errors<E, P>(mut self, predicate: P) -> Self
    where
        E: 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.ignored.push(Arc::new(move |err: &dyn Any| {
            err.downcast_ref::<E>().is_some_and(&predicate)
        }));
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn is_ignored(&self, err: &dyn Any) -> bool {
        self.ignored.iter().any(|filter| filter(err))
    }
}

impl fmt::Debug for CircuitBreakerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerOptions")
            .field("config", &self.config)
            .field("ignored_filters", &self.ignored.len())
            .finish()
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_requests: u64,
    /// `failure_count / total_requests`, 0 before the first request.
    pub failure_rate: f64,
    pub average_response_time_ms: f64,
    /// Time spent in the current state.
    pub uptime_ms: u64,
    pub last_failure_ms_ago: Option<u64>,
    pub last_success_ms_ago: Option<u64>,
    /// Time until an open breaker admits a probe.
    pub next_attempt_in_ms: Option<u64>,
}

/// Circuit breaker.
///
/// All state lives behind one mutex; the admission check, the `Open` to
/// `HalfOpen` move and the claim of the single probe slot happen in one
/// critical section.
pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,
    metrics: Option<MetricsCollector>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    total_requests: u64,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    state_changed_at: Instant,
    next_attempt: Option<Instant>,
    response_times: VecDeque<Duration>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            last_failure: None,
            last_success: None,
            state_changed_at: now,
            next_attempt: None,
            response_times: VecDeque::with_capacity(RESPONSE_HISTORY),
            probe_in_flight: false,
        }
    }

    fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_HISTORY {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }

    /// Outcome-driven move; must follow [`CircuitState::can_transition_to`].
    fn advance(
        &mut self,
        to: CircuitState,
        now: Instant,
        recovery_timeout: Duration,
    ) -> Option<Transition> {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal breaker transition {} -> {}",
            self.state,
            to
        );
        self.transition(to, now, recovery_timeout)
    }

    /// Move to `to`, returning the transition if the state actually changed.
    ///
    /// Operator overrides call this directly.
    fn transition(
        &mut self,
        to: CircuitState,
        now: Instant,
        recovery_timeout: Duration,
    ) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        self.state_changed_at = now;
        self.probe_in_flight = false;

        match to {
            CircuitState::Open => self.next_attempt = Some(now + recovery_timeout),
            CircuitState::Closed => {
                self.failure_count = 0;
                self.next_attempt = None;
            }
            CircuitState::HalfOpen => self.next_attempt = None,
        }

        (from != to).then_some(Transition { from, to })
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

/// How a finished call is booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
    Timeout,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Ignored => "ignored",
            Outcome::Timeout => "timeout",
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given options.
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(BreakerInner::new(Instant::now())),
            events: None,
            metrics: None,
        }
    }

    /// Publish state transitions on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Report call outcomes and transitions to `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        metrics.set_breaker_state(&self.name, CircuitState::Closed);
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        self.options.config()
    }

    /// Current state. An elapsed open breaker still reports `Open` until a
    /// call is admitted as the probe.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// When the breaker is open and its recovery timeout has not elapsed the
    /// call fails with [`BreakerError::Open`] and `operation` is never invoked.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let permit = self.admit::<E>()?;
        let started = Instant::now();

        match operation().await {
            Ok(value) => {
                permit.complete(Outcome::Success, started.elapsed());
                Ok(value)
            }
            Err(err) => {
                let outcome = if self.options.is_ignored(&err) {
                    Outcome::Ignored
                } else {
                    Outcome::Failure
                };
                permit.complete(outcome, started.elapsed());
                Err(BreakerError::Operation(err))
            }
        }
    }

    /// Run `operation` through the breaker, failing it after `timeout`.
    ///
    /// A timeout is booked as a failure. The operation future is dropped, not
    /// otherwise cancelled.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        operation: F,
        timeout: Duration,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let permit = self.admit::<E>()?;
        let started = Instant::now();

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                permit.complete(Outcome::Success, started.elapsed());
                Ok(value)
            }
            Ok(Err(err)) => {
                let outcome = if self.options.is_ignored(&err) {
                    Outcome::Ignored
                } else {
                    Outcome::Failure
                };
                permit.complete(outcome, started.elapsed());
                Err(BreakerError::Operation(err))
            }
            Err(_) => {
                warn!(breaker = %self.name, timeout = ?timeout, "operation timed out");
                permit.complete(Outcome::Timeout, started.elapsed());
                Err(BreakerError::Timeout(timeout))
            }
        }
    }

    /// Run `operation` up to `max_retries` times with exponential backoff.
    ///
    /// Attempt `n` that fails is followed by a pause of
    /// `base_delay * 2^(n-1)`. An open breaker ends the loop immediately.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let attempts = max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.execute(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_open() || attempt >= attempts => return Err(err),
                Err(_) => {
                    let delay = backoff_delay(base_delay, attempt);
                    debug!(
                        breaker = %self.name,
                        attempt,
                        max_attempts = attempts,
                        delay = ?delay,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Snapshot of counters and timings.
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let inner = self.inner.lock();

        let failure_rate = if inner.total_requests == 0 {
            0.0
        } else {
            f64::from(inner.failure_count) / inner.total_requests as f64
        };

        let average_response_time_ms = if inner.response_times.is_empty() {
            0.0
        } else {
            let total: Duration = inner.response_times.iter().sum();
            total.as_secs_f64() * 1000.0 / inner.response_times.len() as f64
        };

        let ago = |at: Option<Instant>| at.map(|t| millis(now.saturating_duration_since(t)));

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            failure_rate,
            average_response_time_ms,
            uptime_ms: millis(now.saturating_duration_since(inner.state_changed_at)),
            last_failure_ms_ago: ago(inner.last_failure),
            last_success_ms_ago: ago(inner.last_success),
            next_attempt_in_ms: inner
                .next_attempt
                .map(|t| millis(t.saturating_duration_since(now))),
        }
    }

    /// Force `Closed` and clear every counter and the latency history.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            *inner = BreakerInner::new(Instant::now());
            (from != CircuitState::Closed).then_some(Transition {
                from,
                to: CircuitState::Closed,
            })
        };

        info!(breaker = %self.name, "circuit breaker reset");
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    /// Operator override of the current state.
    ///
    /// Forcing `Open` schedules the next probe one recovery timeout from now.
    pub fn force_state(&self, state: CircuitState) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.transition(state, Instant::now(), self.options.config.recovery_timeout)
        };

        warn!(breaker = %self.name, state = %state, "circuit breaker state forced");
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    /// Decide whether a call may proceed, claiming the probe slot if the
    /// breaker is (or is about to become) half-open.
    fn admit<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut transition = None;

        let admitted = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => match inner.next_attempt {
                    Some(at) if now < at => Err(at - now),
                    _ => {
                        transition = inner.advance(
                            CircuitState::HalfOpen,
                            now,
                            self.options.config.recovery_timeout,
                        );
                        inner.probe_in_flight = true;
                        Ok(true)
                    }
                },
                CircuitState::HalfOpen if inner.probe_in_flight => Err(Duration::ZERO),
                CircuitState::HalfOpen => {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }

        match admitted {
            Ok(probe) => Ok(Permit {
                breaker: self,
                probe,
                completed: false,
            }),
            Err(retry_after) => {
                debug!(breaker = %self.name, retry_after = ?retry_after, "call rejected");
                if let Some(metrics) = &self.metrics {
                    metrics.record_breaker_call(&self.name, "rejected");
                }
                Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                })
            }
        }
    }

    /// Book a finished call and apply any resulting transition.
    fn record(&self, outcome: Outcome, elapsed: Duration) {
        let now = Instant::now();
        let recovery_timeout = self.options.config.recovery_timeout;
        let threshold = self.options.config.failure_threshold;

        let transition = {
            let mut inner = self.inner.lock();
            inner.total_requests += 1;
            inner.record_response_time(elapsed);

            match outcome {
                Outcome::Success => {
                    inner.success_count += 1;
                    inner.last_success = Some(now);
                    if inner.state == CircuitState::HalfOpen {
                        inner.advance(CircuitState::Closed, now, recovery_timeout)
                    } else {
                        None
                    }
                }
                Outcome::Ignored => {
                    if inner.state == CircuitState::HalfOpen {
                        inner.probe_in_flight = false;
                    }
                    None
                }
                Outcome::Failure | Outcome::Timeout => {
                    inner.failure_count += 1;
                    inner.last_failure = Some(now);
                    match inner.state {
                        CircuitState::HalfOpen => {
                            inner.advance(CircuitState::Open, now, recovery_timeout)
                        }
                        CircuitState::Closed if inner.failure_count >= threshold => {
                            inner.advance(CircuitState::Open, now, recovery_timeout)
                        }
                        _ => None,
                    }
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_call(&self.name, outcome.as_str());
        }

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    /// Release a probe slot whose call never completed.
    fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Report a transition. Called with the state lock released.
    fn announce(&self, transition: Transition) {
        let Transition { from, to } = transition;

        match to {
            CircuitState::Open => {
                warn!(breaker = %self.name, from = %from, to = %to, "circuit breaker opened")
            }
            _ => info!(breaker = %self.name, from = %from, to = %to, "circuit breaker state changed"),
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(&self.name, from, to);
        }

        if let Some(events) = &self.events {
            events.publish(ResilienceEvent::BreakerStateChanged {
                breaker: self.name.clone(),
                from,
                to,
            });
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission ticket for one call. Dropping it without completing (the
/// caller's future was cancelled) frees the half-open probe slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    completed: bool,
}

impl Permit<'_> {
    fn complete(mut self, outcome: Outcome, elapsed: Duration) {
        self.completed = true;
        self.breaker.record(outcome, elapsed);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.completed {
            self.breaker.abandon_probe();
        }
    }
}

/// `base * 2^(attempt-1)`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
