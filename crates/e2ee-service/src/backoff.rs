//! Exponential backoff sequence for retrying transient directory-call
//! failures (prekey upload, signed-prekey rotation) without blocking the
//! caller indefinitely.

use std::future::Future;
use std::time::Duration;

use crate::error::ServiceError;

const STEPS_SECS: [u64; 4] = [1, 2, 4, 8];
const CAP_SECS: u64 = 30;

/// 1s, 2s, 4s, 8s, then holds at a 30s cap.
pub fn retry_delays() -> impl Iterator<Item = Duration> {
    STEPS_SECS.into_iter().chain(std::iter::repeat(CAP_SECS)).map(Duration::from_secs)
}

/// Retry `f` up to `attempts` times on [`ServiceError::Transport`], sleeping
/// between attempts per [`retry_delays`]. Any other error returns
/// immediately without retrying.
pub async fn retry_transport<F, Fut, T>(attempts: usize, mut f: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut delays = retry_delays();
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match f().await {
            Ok(v) => return Ok(v),
            Err(ServiceError::TransportError(e)) => {
                last_err = Some(ServiceError::TransportError(e));
                if attempt + 1 < attempts {
                    tokio::time::sleep(delays.next().unwrap()).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.expect("attempts.max(1) guarantees at least one iteration"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_follow_the_spec_sequence_then_cap() {
        let first_six: Vec<_> = retry_delays().take(6).map(|d| d.as_secs()).collect();
        assert_eq!(first_six, vec![1, 2, 4, 8, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transport_gives_up_after_exhausting_attempts() {
        let mut calls = 0;
        let result: Result<(), ServiceError> = retry_transport(3, || {
            calls += 1;
            async { Err(ServiceError::TransportError("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::TransportError(_))));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_transport_succeeds_after_a_transient_failure() {
        let mut calls = 0;
        let result = retry_transport(3, || {
            calls += 1;
            async move {
                if calls < 2 {
                    Err(ServiceError::TransportError("down".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
