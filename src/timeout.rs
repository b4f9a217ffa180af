//! Deadline wrapper for identity provider calls

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, SessionError};

/// Races a single provider call against a timer.
///
/// When the timer wins the call's future is dropped, so a late answer can
/// never reach the reconciler.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    duration: Duration,
}

impl TimeoutGuard {
    pub fn new(duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(SessionError::config("timeout duration must be positive"));
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Result of `operation`, its error converted unchanged, or `Timeout`.
    pub async fn run<T, E, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        SessionError: From<E>,
    {
        match tokio::time::timeout(self.duration, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(SessionError::from(err)),
            Err(_) => Err(SessionError::Timeout(self.duration)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r3alm_auth::AuthError;

    fn guard() -> TimeoutGuard {
        TimeoutGuard::new(Duration::from_millis(10_000)).unwrap()
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert!(matches!(
            TimeoutGuard::new(Duration::ZERO),
            Err(SessionError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_value_when_call_is_fast() {
        let value = guard()
            .run(async {
                tokio::time::sleep(Duration::from_millis(9_999)).await;
                Ok::<_, AuthError>(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn propagates_operation_error() {
        let err = guard()
            .run(async { Err::<(), _>(AuthError::api(400, "Invalid login credentials")) })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Provider(AuthError::Api { status: 400, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_call_hangs() {
        let started = tokio::time::Instant::now();
        let err = guard()
            .run(std::future::pending::<std::result::Result<(), AuthError>>())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Timeout(d) if d == Duration::from_secs(10)));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_is_dropped() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let _ = guard()
            .run(async move {
                let _tx = tx;
                std::future::pending::<std::result::Result<(), AuthError>>().await
            })
            .await;

        // The sender lived inside the abandoned future.
        assert!(rx.await.is_err());
    }
}
