//! Bounded convergence polling.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Polling interval and attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// Maximum number of attempts
    pub attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            attempts: 200,
        }
    }
}

impl PollPolicy {
    /// Create a policy.
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    /// Total wait budget.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// The attempt budget ran out before the condition held.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Condition not met after {attempts} attempts")]
pub struct Exhausted {
    /// Number of attempts made
    pub attempts: u32,
    /// Last error returned by the probe, if any
    pub last_error: Option<String>,
}

/// Repeat `probe` until `accept` holds for its outcome.
///
/// The accepted outcome is returned, which lets callers wait for a specific
/// error (e.g. "not found" after a delete) as well as a specific value.
///
/// # Errors
///
/// Returns [`Exhausted`] when the attempt budget runs out.
pub async fn until<T, E, F, Fut, P>(
    policy: &PollPolicy,
    mut probe: F,
    mut accept: P,
) -> Result<Result<T, E>, Exhausted>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&Result<T, E>) -> bool,
{
    let mut last_error = None;
    for attempt in 0..policy.attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.interval).await;
        }
        let outcome = probe().await;
        if accept(&outcome) {
            return Ok(outcome);
        }
        if let Err(ref e) = outcome {
            trace!("Poll attempt {} failed: {}", attempt + 1, e);
            last_error = Some(e.to_string());
        }
    }
    Err(Exhausted {
        attempts: policy.attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_until_succeeds_when_predicate_holds() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(Duration::from_millis(1), 10);
        let result = until(
            &policy,
            || async { Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst) + 1) },
            |r| matches!(r, Ok(n) if *n >= 3),
        )
        .await
        .unwrap();
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_until_can_wait_for_error() {
        let policy = PollPolicy::new(Duration::from_millis(1), 3);
        let result = until(&policy, || async { Err::<(), _>("gone") }, |r| r.is_err())
            .await
            .unwrap();
        assert_eq!(result.unwrap_err(), "gone");
    }

    #[tokio::test]
    async fn test_until_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let policy = PollPolicy::new(Duration::from_millis(1), 4);
        let err = until(
            &policy,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("busy")
            },
            |r| r.is_ok(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error.as_deref(), Some("busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_budget() {
        assert_eq!(PollPolicy::default().budget(), Duration::from_secs(20));
    }
}
