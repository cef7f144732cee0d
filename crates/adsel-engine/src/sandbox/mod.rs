//! Script sandbox access.
//!
//! [`SandboxPool`] fronts a [`ScriptRunner`] with a concurrency bound and a
//! retry policy for sandbox availability failures. Script-level failures are
//! never retried: the same script with the same inputs fails the same way.
//!
//! [`ProcessScriptRunner`] is the bundled runner: it executes scripts in a
//! short-lived interpreter child process.

mod process;

use std::future::Future;
use std::sync::Arc;

use adsel_core::config::RetryConfig;
use adsel_core::{ScriptArgument, ScriptFailure, ScriptRunner};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::deadline::Deadline;

pub use self::process::{ProcessScriptRunner, RESULT_MARKER};

/// Bounded, retrying access to a script runner.
#[derive(Debug, Clone)]
pub struct SandboxPool {
    runner: Arc<dyn ScriptRunner>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
}

impl SandboxPool {
    /// Creates a pool allowing `max_concurrent` invocations at once.
    #[must_use]
    pub fn new(runner: Arc<dyn ScriptRunner>, max_concurrent: usize, retry: RetryConfig) -> Self {
        Self {
            runner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry,
        }
    }

    /// The wrapped runner.
    #[must_use]
    pub fn runner(&self) -> &Arc<dyn ScriptRunner> {
        &self.runner
    }

    /// Runs `entry_point` of `script` within what is left of `deadline`.
    ///
    /// Each attempt hands the runner the time remaining at its start.
    ///
    /// # Errors
    ///
    /// Returns the runner's failure once retries are exhausted, or
    /// immediately for non-retriable failures.
    pub async fn run(
        &self,
        script: &str,
        entry_point: &str,
        args: &[ScriptArgument],
        deadline: Deadline,
    ) -> Result<String, ScriptFailure> {
        self.with_retry(entry_point, || {
            self.runner
                .run_within(script, entry_point, args, deadline.remaining())
        })
        .await
    }

    /// Checks that `script` defines every function in `entry_points`.
    ///
    /// # Errors
    ///
    /// Returns a failure if the probe could not be executed.
    pub async fn validate(
        &self,
        script: &str,
        entry_points: &[&str],
    ) -> Result<bool, ScriptFailure> {
        self.with_retry("validate", || self.runner.validate(script, entry_points))
            .await
    }

    /// Probes the declared arity of `entry_point`.
    ///
    /// # Errors
    ///
    /// Returns a failure if the probe could not be executed.
    pub async fn arg_count(&self, script: &str, entry_point: &str) -> Result<i32, ScriptFailure> {
        self.with_retry("arg_count", || self.runner.arg_count(script, entry_point))
            .await
    }

    async fn with_retry<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, ScriptFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScriptFailure>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| ScriptFailure::unavailable("sandbox pool closed"))?;
                call().await
            };
            match result {
                Err(failure) if failure.is_retriable() && attempt < max_attempts => {
                    let delay = self.retry.backoff.delay_for_attempt(attempt);
                    warn!(
                        entry_point = label,
                        attempt,
                        ?delay,
                        error = %failure,
                        "sandbox unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(failure) => {
                    debug!(entry_point = label, kind = failure.kind(), "script failed");
                    return Err(failure);
                },
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use adsel_core::config::BackoffConfig;
    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Default)]
    struct FlakyRunner {
        failures_before_success: u32,
        calls: AtomicU32,
        failure: Option<ScriptFailure>,
    }

    #[async_trait]
    impl ScriptRunner for FlakyRunner {
        async fn run(
            &self,
            _script: &str,
            _entry_point: &str,
            _args: &[ScriptArgument],
        ) -> Result<String, ScriptFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(failure) = &self.failure {
                return Err(failure.clone());
            }
            if call < self.failures_before_success {
                Err(ScriptFailure::unavailable("warming up"))
            } else {
                Ok("1".to_string())
            }
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_millis(1),
            },
        }
    }

    #[tokio::test]
    async fn retries_unavailable_until_success() {
        let runner = Arc::new(FlakyRunner {
            failures_before_success: 2,
            ..FlakyRunner::default()
        });
        let pool = SandboxPool::new(runner.clone(), 2, retry(3));
        assert_eq!(pool.run("", "f", &[], deadline()).await.unwrap(), "1");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let runner = Arc::new(FlakyRunner {
            failures_before_success: 10,
            ..FlakyRunner::default()
        });
        let pool = SandboxPool::new(runner.clone(), 2, retry(2));
        let err = pool.run("", "f", &[], deadline()).await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn script_failures_are_not_retried() {
        let runner = Arc::new(FlakyRunner {
            failure: Some(ScriptFailure::reference("generateBid is not defined")),
            ..FlakyRunner::default()
        });
        let pool = SandboxPool::new(runner.clone(), 2, retry(5));
        let err = pool.run("", "f", &[], deadline()).await.unwrap_err();
        assert_eq!(err.kind(), "reference_error");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    /// Records the budget each call was given.
    #[derive(Debug, Default)]
    struct BudgetRunner {
        budgets: std::sync::Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl ScriptRunner for BudgetRunner {
        async fn run(
            &self,
            _script: &str,
            _entry_point: &str,
            _args: &[ScriptArgument],
        ) -> Result<String, ScriptFailure> {
            Ok("1".to_string())
        }

        async fn run_within(
            &self,
            script: &str,
            entry_point: &str,
            args: &[ScriptArgument],
            budget: Duration,
        ) -> Result<String, ScriptFailure> {
            self.budgets.lock().unwrap().push(budget);
            self.run(script, entry_point, args).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runner_gets_the_remaining_deadline() {
        let runner = Arc::new(BudgetRunner::default());
        let pool = SandboxPool::new(runner.clone(), 1, retry(1));
        let deadline = Deadline::after(Duration::from_secs(2));
        tokio::time::advance(Duration::from_millis(500)).await;

        pool.run("", "f", &[], deadline).await.unwrap();
        assert_eq!(
            *runner.budgets.lock().unwrap(),
            [Duration::from_millis(1500)]
        );
    }

    #[tokio::test]
    async fn arg_count_goes_through_the_runner() {
        let runner = Arc::new(FlakyRunner::default());
        let pool = SandboxPool::new(runner, 1, retry(1));
        assert_eq!(pool.arg_count("", "generateBid").await.unwrap(), 1);
    }
}
