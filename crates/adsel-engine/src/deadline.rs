//! Absolute deadlines.
//!
//! Stages derive child deadlines from their parent so a sub-call can never
//! outlive the stage, and a stage can never outlive the auction.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// An absolute point in (tokio) time by which work must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// The instant this deadline expires.
    #[must_use]
    pub const fn instant(&self) -> Instant {
        self.at
    }

    /// Time left, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// A deadline `timeout` from now, capped by this one.
    #[must_use]
    pub fn child(&self, timeout: Duration) -> Self {
        Self::after(timeout).min(*self)
    }

    /// Runs `future` until it completes or the deadline passes.
    ///
    /// Returns `None` on expiry; the future is dropped.
    pub async fn run<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::time::timeout_at(self.at, future).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn child_never_outlives_parent() {
        let parent = Deadline::after(Duration::from_secs(1));
        let child = parent.child(Duration::from_secs(10));
        assert_eq!(child, parent);

        let short = parent.child(Duration::from_millis(10));
        assert!(short < parent);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drops_work_past_the_deadline() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let finished = deadline
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(finished.is_none());
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);

        let fast = Deadline::after(Duration::from_secs(1));
        assert_eq!(fast.run(async { 7 }).await, Some(7));
    }
}
