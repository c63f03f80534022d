//! Conflict retry for node mutations
//!
//! Read-modify-write node updates (labels, cordon state) race with the
//! kubelet and other controllers updating the same object. The cluster API
//! rejects stale writes with 409 Conflict; the standard client answer is to
//! re-read and re-apply with a short backoff until the write lands.

use std::time::Duration;

use tracing::debug;

/// Backoff schedule for optimistic-concurrency conflicts.
///
/// Defaults mirror the usual client-side retry: five attempts starting at
/// 10ms, doubling each round.
#[derive(Debug, Clone)]
pub struct ConflictRetry {
    /// Maximum attempts before the conflict surfaces
    pub steps: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub factor: f64,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// True when the error is an optimistic-concurrency conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// Run `operation` until it succeeds, fails terminally, or the schedule is
/// exhausted. Only 409 Conflict responses are retried; every other error
/// returns immediately.
pub async fn retry_on_conflict<F, Fut, T>(
    retry: &ConflictRetry,
    operation_name: &str,
    mut operation: F,
) -> kube::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = kube::Result<T>>,
{
    let mut delay = retry.initial_delay;
    let steps = retry.steps.max(1);

    for attempt in 1..=steps {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if is_conflict(&err) && attempt < steps => {
                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * retry.factor);
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("retry loop returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn conflict() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })
    }

    fn not_found() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "nodes \"gone\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    fn fast() -> ConflictRetry {
        ConflictRetry {
            steps: 4,
            initial_delay: Duration::from_millis(1),
            factor: 1.0,
        }
    }

    #[test]
    fn test_is_conflict() {
        assert!(is_conflict(&conflict()));
        assert!(!is_conflict(&not_found()));
    }

    #[tokio::test]
    async fn test_succeeds_after_conflicts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_on_conflict(&fast(), "label", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_conflict_is_terminal() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: kube::Result<()> = retry_on_conflict(&fast(), "label", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(not_found())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_schedule_surfaces_conflict() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: kube::Result<()> = retry_on_conflict(&fast(), "cordon", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        assert!(matches!(result, Err(ref e) if is_conflict(e)));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
