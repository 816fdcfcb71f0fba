//! Bounded retries with exponential backoff and an overall deadline.
//!
//! The supervisor only knows how to classify failures through [`Classify`];
//! it never inspects provider-specific errors directly. Time is read from the
//! tokio clock so schedules can be exercised under a paused runtime.

use std::{error::Error, fmt, future::Future, time::Duration};

use rand::Rng;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::DEFAULT_DEADLINE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The attempt succeeded.
    None,
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::None => "none",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Wait before the next attempt, given the scheduled backoff.
    fn next_wait(&self, scheduled: Duration) -> Duration {
        scheduled
    }

    /// Error recorded when an attempt is cut off by the overall deadline.
    fn deadline_exceeded(budget: Duration) -> Self
    where
        Self: Sized;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Fraction of each wait added as random jitter (0.0 disables).
    pub jitter: f64,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: 0.1,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Clamp nonsensical values: at least one attempt, a non-shrinking
    /// multiplier and a bounded deadline.
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            self.multiplier = 1.0;
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            self.jitter = 0.0;
        }
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        if self.deadline.is_zero() {
            self.deadline = DEFAULT_DEADLINE;
        }
        self
    }

    /// `base * multiplier^(attempt - 1)`, capped at `max_backoff`.
    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Waits between consecutive attempts when every attempt fails transiently.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|attempt| self.backoff(attempt)).collect()
    }

    fn with_jitter_applied(&self, wait: Duration) -> Duration {
        if self.jitter <= 0.0 || wait.is_zero() {
            return wait;
        }
        let spread = wait.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        wait + Duration::from_secs_f64(extra)
    }
}

/// Diagnostic record of a single attempt. Logged, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub attempt: u32,
    pub elapsed: Duration,
    pub class: ErrorClass,
    pub detail: Option<String>,
}

impl AttemptOutcome {
    fn success(attempt: u32, elapsed: Duration) -> Self {
        Self {
            attempt,
            elapsed,
            class: ErrorClass::None,
            detail: None,
        }
    }

    fn failure(attempt: u32, elapsed: Duration, class: ErrorClass, detail: String) -> Self {
        Self {
            attempt,
            elapsed,
            class,
            detail: Some(detail),
        }
    }
}

#[derive(Debug)]
pub struct Supervised<T> {
    pub value: T,
    pub attempts: Vec<AttemptOutcome>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    Attempts,
    Deadline,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustionReason::Attempts => f.write_str("retry budget exhausted"),
            ExhaustionReason::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

#[derive(Debug)]
pub struct ExhaustedError<E> {
    pub last_error: E,
    pub attempts: Vec<AttemptOutcome>,
    pub reason: ExhaustionReason,
    pub elapsed: Duration,
}

impl<E: fmt::Display> fmt::Display for ExhaustedError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.reason,
            self.attempts.len(),
            self.last_error
        )
    }
}

impl<E: Error + 'static> Error for ExhaustedError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.last_error)
    }
}

#[derive(Debug)]
pub enum SupervisorError<E> {
    /// A non-retryable failure, surfaced without further attempts.
    Permanent {
        error: E,
        attempts: Vec<AttemptOutcome>,
    },
    Exhausted(ExhaustedError<E>),
}

impl<E> SupervisorError<E> {
    pub fn error(&self) -> &E {
        match self {
            SupervisorError::Permanent { error, .. } => error,
            SupervisorError::Exhausted(exhausted) => &exhausted.last_error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            SupervisorError::Permanent { error, .. } => error,
            SupervisorError::Exhausted(exhausted) => exhausted.last_error,
        }
    }

    pub fn attempts(&self) -> &[AttemptOutcome] {
        match self {
            SupervisorError::Permanent { attempts, .. } => attempts,
            SupervisorError::Exhausted(exhausted) => &exhausted.attempts,
        }
    }

    pub fn exhaustion(&self) -> Option<ExhaustionReason> {
        match self {
            SupervisorError::Permanent { .. } => None,
            SupervisorError::Exhausted(exhausted) => Some(exhausted.reason),
        }
    }
}

impl<E: fmt::Display> fmt::Display for SupervisorError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Permanent { error, .. } => write!(f, "{error}"),
            SupervisorError::Exhausted(exhausted) => write!(f, "{exhausted}"),
        }
    }
}

impl<E: Error + 'static> Error for SupervisorError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.error())
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: policy.normalized(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails permanently, runs out of
    /// attempts or would overrun the deadline. The operation receives the
    /// 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        mut operation: F,
    ) -> Result<Supervised<T>, SupervisorError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let remaining = self.policy.deadline.saturating_sub(started.elapsed());
            let attempt_started = Instant::now();
            let result = match timeout(remaining, operation(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(E::deadline_exceeded(self.policy.deadline)),
            };
            let attempt_elapsed = attempt_started.elapsed();

            let error = match result {
                Ok(value) => {
                    attempts.push(AttemptOutcome::success(attempt, attempt_elapsed));
                    debug!(
                        attempt,
                        elapsed_ms = attempt_elapsed.as_millis() as u64,
                        "attempt succeeded"
                    );
                    return Ok(Supervised {
                        value,
                        attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Err(error) => error,
            };

            let class = error.class();
            attempts.push(AttemptOutcome::failure(
                attempt,
                attempt_elapsed,
                class,
                error.to_string(),
            ));

            if class != ErrorClass::Transient {
                warn!(attempt, error = %error, "attempt failed permanently");
                return Err(SupervisorError::Permanent { error, attempts });
            }

            if attempt >= self.policy.max_attempts {
                warn!(attempt, error = %error, "retry budget exhausted");
                return Err(SupervisorError::Exhausted(ExhaustedError {
                    last_error: error,
                    attempts,
                    reason: ExhaustionReason::Attempts,
                    elapsed: started.elapsed(),
                }));
            }

            // The cap bounds our own schedule; a provider's hint may exceed it.
            let scheduled = self
                .policy
                .with_jitter_applied(self.policy.backoff(attempt))
                .min(self.policy.max_backoff);
            let wait = error.next_wait(scheduled);
            if started.elapsed() + wait >= self.policy.deadline {
                warn!(attempt, error = %error, "deadline leaves no room for another attempt");
                return Err(SupervisorError::Exhausted(ExhaustedError {
                    last_error: error,
                    attempts,
                    reason: ExhaustionReason::Deadline,
                    elapsed: started.elapsed(),
                }));
            }

            warn!(
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum FakeError {
        Flaky,
        Throttled,
        RetryAfter(Duration),
        Fatal,
        Deadline,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Classify for FakeError {
        fn class(&self) -> ErrorClass {
            match self {
                FakeError::Flaky
                | FakeError::Throttled
                | FakeError::RetryAfter(_)
                | FakeError::Deadline => {
                    ErrorClass::Transient
                }
                FakeError::Fatal => ErrorClass::Permanent,
            }
        }

        fn next_wait(&self, scheduled: Duration) -> Duration {
            match self {
                FakeError::Throttled => scheduled * 2,
                FakeError::RetryAfter(hint) => (*hint).max(scheduled),
                _ => scheduled,
            }
        }

        fn deadline_exceeded(_budget: Duration) -> Self {
            FakeError::Deadline
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            jitter: 0.0,
            deadline: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let policy = policy(6);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
        assert_eq!(policy.schedule().len(), 5);
    }

    #[test]
    fn normalization_never_disables_the_deadline() {
        let policy = RetryPolicy::default()
            .with_max_attempts(0)
            .with_deadline(Duration::ZERO)
            .normalized();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.deadline, DEFAULT_DEADLINE);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_use_every_attempt_then_exhaust() {
        let supervisor = Supervisor::new(policy(4));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = supervisor
            .execute(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FakeError::Flaky)
                }
            })
            .await;

        let error = result.expect_err("every attempt fails");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(error.exhaustion(), Some(ExhaustionReason::Attempts));
        assert_eq!(error.attempts().len(), 4);
        assert_eq!(error.error(), &FakeError::Flaky);

        let expected: Duration = supervisor.policy().schedule().iter().sum();
        assert!(started.elapsed() >= expected);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_stops_after_one_attempt() {
        let supervisor = Supervisor::new(policy(5));
        let calls = Arc::new(AtomicU32::new(0));

        let error = supervisor
            .execute(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FakeError::Fatal)
                }
            })
            .await
            .expect_err("fatal error surfaces");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(error, SupervisorError::Permanent { .. }));
        assert_eq!(error.attempts()[0].class, ErrorClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_a_later_attempt_stops_retrying() {
        let supervisor = Supervisor::new(policy(5));
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = supervisor
            .execute(|attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(FakeError::Flaky)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(outcome.value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let classes = outcome
            .attempts
            .iter()
            .map(|attempt| attempt.class)
            .collect::<Vec<_>>();
        assert_eq!(
            classes,
            vec![ErrorClass::Transient, ErrorClass::Transient, ErrorClass::None]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_errors_wait_longer() {
        let supervisor = Supervisor::new(policy(2));
        let started = Instant::now();

        let _ = supervisor
            .execute(|_| async { Err::<(), _>(FakeError::Throttled) })
            .await;

        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_hints_may_exceed_the_backoff_cap() {
        let supervisor = Supervisor::new(policy(2));
        let hint = Duration::from_secs(5);
        let started = Instant::now();

        let error = supervisor
            .execute(|_| async move { Err::<(), _>(FakeError::RetryAfter(hint)) })
            .await
            .expect_err("both attempts are throttled");

        assert_eq!(error.exhaustion(), Some(ExhaustionReason::Attempts));
        assert_eq!(error.attempts().len(), 2);
        assert!(started.elapsed() >= hint);
        assert!(hint > supervisor.policy().max_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn hints_beyond_the_deadline_end_the_loop() {
        let supervisor = Supervisor::new(policy(5).with_deadline(Duration::from_secs(10)));

        let error = supervisor
            .execute(|_| async { Err::<(), _>(FakeError::RetryAfter(Duration::from_secs(120))) })
            .await
            .expect_err("the hint overruns the deadline");

        assert_eq!(error.exhaustion(), Some(ExhaustionReason::Deadline));
        assert_eq!(error.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_are_cut_off_by_the_deadline() {
        let supervisor = Supervisor::new(policy(10).with_deadline(Duration::from_secs(2)));

        let error = supervisor
            .execute(|_| async {
                sleep(Duration::from_secs(5)).await;
                Ok::<_, FakeError>(())
            })
            .await
            .expect_err("deadline should cut the attempt");

        assert_eq!(error.exhaustion(), Some(ExhaustionReason::Deadline));
        assert_eq!(error.error(), &FakeError::Deadline);
        assert_eq!(error.attempts().len(), 1);
    }
}
