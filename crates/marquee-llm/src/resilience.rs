use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use marquee_core::errors::{DefaultClassifier, ErrorClassifier, ServiceError};
use marquee_telemetry::MetricsRecorder;

/// Retry parameters for one class of external call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Multiply each delay by a random factor in [0.8, 1.2].
    pub jitter: bool,
    /// Wall-clock budget for all attempts and waits together.
    pub timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
            timeout_ms: Some(30_000),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Un-jittered delay before retry `retry` (1-based):
    /// `base * factor^(retry-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_factor.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_for(&self, retry: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.max_delay());
        }
        let delay = self.backoff_delay(retry);
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        delay.mul_f64(factor).min(self.max_delay())
    }
}

/// Circuit breaker thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Failure gate for one logical external service.
///
/// N consecutive failures → open → cooldown → half-open (one trial call)
/// → success closes, failure re-opens.
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    state: Mutex<CircuitState>,
    consecutive_failures: AtomicU32,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> BreakerState {
        match &*self.state.lock() {
            CircuitState::Closed => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Admit a call or reject it with `CircuitOpen`.
    fn try_acquire(&self) -> Result<Admission, ServiceError> {
        let mut state = self.state.lock();
        match &*state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.cooldown() {
                    info!(service = %self.service, "circuit breaker half-open, admitting trial call");
                    *state = CircuitState::HalfOpen { trial_in_flight: true };
                    Ok(Admission::Trial)
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen { trial_in_flight: true } => Err(self.open_error()),
            CircuitState::HalfOpen { trial_in_flight: false } => {
                *state = CircuitState::HalfOpen { trial_in_flight: true };
                Ok(Admission::Trial)
            }
        }
    }

    fn open_error(&self) -> ServiceError {
        ServiceError::CircuitOpen {
            service: self.service.clone(),
        }
    }

    /// Only the trial closes an open breaker. A call admitted while closed
    /// that finishes after the breaker opened is ignored.
    fn record_success(&self, admission: Admission) {
        let mut state = self.state.lock();
        match (admission, &*state) {
            (Admission::Trial, CircuitState::HalfOpen { .. }) => {
                info!(service = %self.service, "circuit breaker closed after successful trial");
                *state = CircuitState::Closed;
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            (_, CircuitState::Closed) => self.consecutive_failures.store(0, Ordering::Relaxed),
            _ => debug!(service = %self.service, "ignoring success of a call admitted before the breaker opened"),
        }
    }

    /// Returns true when this failure opened the breaker.
    fn record_failure(&self, admission: Admission) -> bool {
        let mut state = self.state.lock();
        let failures = match (admission, &*state) {
            (Admission::Trial, CircuitState::HalfOpen { .. }) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
            }
            (_, CircuitState::Closed) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures < self.config.failure_threshold {
                    return false;
                }
                failures
            }
            _ => return false,
        };
        warn!(
            service = %self.service,
            failures = failures,
            cooldown_ms = self.config.cooldown_ms,
            "circuit breaker opened"
        );
        *state = CircuitState::Open { since: Instant::now() };
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Run `op` behind the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let admission = self.try_acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let result = op().await;
        guard.armed = false;
        match &result {
            Ok(_) => self.record_success(admission),
            Err(_) => {
                self.record_failure(admission);
            }
        }
        result
    }
}

/// How a call got past the breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Closed,
    Trial,
}

/// Frees the half-open trial slot if the trial future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.breaker.state.lock();
            if *state == (CircuitState::HalfOpen { trial_in_flight: true }) {
                *state = CircuitState::HalfOpen { trial_in_flight: false };
            }
        }
    }
}

/// Retry + per-service circuit breaking for every external call.
pub struct Resilience {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_config: BreakerConfig,
    classifier: Arc<dyn ErrorClassifier>,
    metrics: Option<Arc<MetricsRecorder>>,
    total_retries: AtomicU64,
}

impl Resilience {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            breaker_config,
            classifier: Arc::new(DefaultClassifier::default()),
            metrics: None,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Breaker for `service`, created on first use.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.breaker_config.clone())));
        Arc::clone(entry.value())
    }

    pub fn breaker_state(&self, service: &str) -> BreakerState {
        self.breakers
            .get(service)
            .map_or(BreakerState::Closed, |b| b.state())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Breaker around retry: the breaker sees one outcome per logical call.
    pub async fn execute<T, F, Fut>(&self, service: &str, policy: &RetryPolicy, op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let started = Instant::now();
        let result = self
            .execute_with_circuit_breaker(service, || self.execute_with_retry(service, policy, op))
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.histogram_observe(
                "external_call_ms",
                &[("service", service)],
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        result
    }

    pub async fn execute_with_circuit_breaker<T, F, Fut>(&self, service: &str, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let breaker = self.breaker(service);
        let opened_before = breaker.times_opened();
        let result = breaker.call(op).await;
        if breaker.times_opened() > opened_before {
            self.count("circuit_breaker_open_total", &[("service", service)]);
        }
        result
    }

    /// Run `op` up to `policy.max_attempts` times. Non-retryable errors and
    /// the last error after exhaustion propagate unchanged.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        service: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let started = Instant::now();
        let budget = policy.timeout();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = match budget {
                Some(budget) => {
                    let remaining = budget.saturating_sub(started.elapsed());
                    match tokio::time::timeout(remaining, op()).await {
                        Ok(result) => result,
                        Err(_) => Err(ServiceError::Timeout(budget)),
                    }
                }
                None => op().await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(service, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let classified = self.classifier.classify(&error);
            self.count(
                "resilience_failures_total",
                &[("service", service), ("category", classified.category.as_str())],
            );

            if !classified.is_retryable {
                warn!(
                    service,
                    attempt,
                    category = classified.category.as_str(),
                    error = %error,
                    "non-retryable error"
                );
                return Err(error);
            }
            if attempt >= max_attempts {
                warn!(service, attempts = attempt, error = %error, "retries exhausted");
                return Err(error);
            }

            let delay = policy.delay_for(attempt, error.suggested_delay());
            if let Some(budget) = budget {
                if started.elapsed() + delay >= budget {
                    warn!(
                        service,
                        attempt,
                        budget_ms = budget.as_millis() as u64,
                        error = %error,
                        "retry budget exhausted"
                    );
                    return Err(error);
                }
            }

            warn!(
                service,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                category = classified.category.as_str(),
                error = %error,
                "retrying after error"
            );
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            self.count("resilience_retries_total", &[("service", service)]);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn count(&self, name: &str, labels: &[(&str, &str)]) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(name, labels, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 5,
            jitter: false,
            timeout_ms: None,
        }
    }

    fn server_error() -> ServiceError {
        ServiceError::Server {
            status: 500,
            body: "internal".into(),
        }
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let resilience = Resilience::with_defaults();
        let calls = AtomicUsize::new(0);
        let result = resilience
            .execute_with_retry("svc", &fast_policy(3), || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok::<_, ServiceError>(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(resilience.total_retries(), 0);
    }

    #[tokio::test]
    async fn retries_on_retryable_error() {
        let resilience = Resilience::with_defaults();
        let calls = AtomicUsize::new(0);
        let result = resilience
            .execute_with_retry("svc", &fast_policy(3), || async {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                if n < 2 {
                    Err(server_error())
                } else {
                    Ok("recovered")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(resilience.total_retries(), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_is_returned_immediately() {
        let resilience = Resilience::with_defaults();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = resilience
            .execute_with_retry("svc", &fast_policy(5), || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(ServiceError::Unauthorized("bad key".into()))
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(resilience.total_retries(), 0);
    }

    #[tokio::test]
    async fn max_attempts_exhausted_returns_last_error() {
        let resilience = Resilience::with_defaults();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = resilience
            .execute_with_retry("svc", &fast_policy(4), || async {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                Err(ServiceError::Network(format!("attempt {n}")))
            })
            .await;
        match result {
            Err(ServiceError::Network(msg)) => assert_eq!(msg, "attempt 3"),
            other => panic!("expected last network error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::Relaxed), 4);
        assert_eq!(resilience.total_retries(), 3);
    }

    #[tokio::test]
    async fn attempt_exceeding_budget_times_out() {
        let resilience = Resilience::with_defaults();
        let policy = RetryPolicy {
            timeout_ms: Some(20),
            ..fast_policy(1)
        };
        let result: Result<(), _> = resilience
            .execute_with_retry("svc", &policy, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Timeout(_))));
    }

    #[tokio::test]
    async fn retry_stops_when_delay_would_overrun_budget() {
        let resilience = Resilience::with_defaults();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: false,
            timeout_ms: Some(100),
        };
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = resilience
            .execute_with_retry("svc", &policy, || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(server_error())
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Server { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 1_000,
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            backoff_factor: 1.0,
            max_delay_ms: 10_000,
            jitter: true,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = policy.delay_for(1, None);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200), "{d:?}");
        }
    }

    #[test]
    fn suggested_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 2_000,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(60))), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1, Some(Duration::from_secs(1))), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn circuit_breaker_trips_after_threshold() {
        let resilience = Resilience::new(BreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 60_000,
        });
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let _: Result<(), _> = resilience
                .execute("radarr", &fast_policy(1), || async {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Err(server_error())
                })
                .await;
        }
        assert_eq!(resilience.breaker_state("radarr"), BreakerState::Open);

        let result: Result<(), _> = resilience
            .execute("radarr", &fast_policy(1), || async {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ServiceError::CircuitOpen { ref service }) if service == "radarr"));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn breakers_are_per_service() {
        let resilience = Resilience::new(BreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 60_000,
        });
        let _: Result<(), _> = resilience
            .execute("radarr", &fast_policy(1), || async { Err(server_error()) })
            .await;
        assert_eq!(resilience.breaker_state("radarr"), BreakerState::Open);
        assert_eq!(resilience.breaker_state("sonarr"), BreakerState::Closed);

        let ok = resilience
            .execute("sonarr", &fast_policy(1), || async { Ok::<_, ServiceError>(1) })
            .await;
        assert_eq!(ok.unwrap(), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_recovers_after_cooldown() {
        let resilience = Resilience::new(BreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 30,
        });
        for _ in 0..2 {
            let _: Result<(), _> = resilience
                .execute("svc", &fast_policy(1), || async { Err(server_error()) })
                .await;
        }
        assert_eq!(resilience.breaker_state("svc"), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = resilience
            .execute("svc", &fast_policy(1), || async { Ok::<_, ServiceError>("ok") })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(resilience.breaker_state("svc"), BreakerState::Closed);
        assert_eq!(resilience.breaker("svc").consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn failed_trial_reopens_breaker() {
        let breaker = CircuitBreaker::new(
            "svc",
            BreakerConfig {
                failure_threshold: 1,
                cooldown_ms: 10,
            },
        );
        let _: Result<(), _> = breaker.call(|| async { Err(server_error()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _: Result<(), _> = breaker.call(|| async { Err(server_error()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.times_opened(), 2);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new(
            "svc",
            BreakerConfig {
                failure_threshold: 1,
                cooldown_ms: 10,
            },
        ));
        let _: Result<(), _> = breaker.call(|| async { Err(server_error()) }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = Arc::clone(&breaker);
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async {
                    let _ = release_rx.await;
                    Ok::<_, ServiceError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let rejected: Result<(), _> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(ServiceError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn stale_calls_do_not_settle_half_open_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            "svc",
            BreakerConfig {
                failure_threshold: 1,
                cooldown_ms: 10,
            },
        ));

        // Two slow calls admitted while closed.
        let (slow_ok_tx, slow_ok_rx) = tokio::sync::oneshot::channel::<()>();
        let (slow_err_tx, slow_err_rx) = tokio::sync::oneshot::channel::<()>();
        let b = Arc::clone(&breaker);
        let slow_ok = tokio::spawn(async move {
            b.call(|| async {
                let _ = slow_ok_rx.await;
                Ok::<_, ServiceError>(())
            })
            .await
        });
        let b = Arc::clone(&breaker);
        let slow_err = tokio::spawn(async move {
            b.call(|| async {
                let _ = slow_err_rx.await;
                Err::<(), _>(server_error())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let _: Result<(), _> = breaker.call(|| async { Err(server_error()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Success of a pre-open call while open.
        slow_ok_tx.send(()).unwrap();
        slow_ok.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
        let b = Arc::clone(&breaker);
        let trial = tokio::spawn(async move {
            b.call(|| async {
                let _ = trial_rx.await;
                Ok::<_, ServiceError>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Failure of a pre-open call while the trial is in flight.
        slow_err_tx.send(()).unwrap();
        assert!(slow_err.await.unwrap().is_err());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.times_opened(), 1);
        let rejected: Result<(), _> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(ServiceError::CircuitOpen { .. })));

        trial_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn metrics_are_recorded() {
        let metrics = Arc::new(MetricsRecorder::new());
        let resilience = Resilience::new(BreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 60_000,
        })
        .with_metrics(Arc::clone(&metrics));

        let _: Result<(), _> = resilience
            .execute("svc", &fast_policy(2), || async { Err(server_error()) })
            .await;

        assert_eq!(metrics.counter_get("resilience_retries_total", &[("service", "svc")]), 1);
        assert_eq!(
            metrics.counter_get("resilience_failures_total", &[("service", "svc"), ("category", "server")]),
            2
        );
        assert_eq!(metrics.counter_get("circuit_breaker_open_total", &[("service", "svc")]), 1);
        assert_eq!(metrics.histogram_summary("external_call_ms", &[("service", "svc")]).count, 1);
    }

    #[test]
    fn policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
        assert_eq!(BreakerConfig::default().cooldown(), Duration::from_secs(30));
    }
}
