//! Cancellation shielding.
//!
//! Commit and abort must run to completion even when the caller stops
//! polling. [`shielded`] moves the work onto its own task: the work is no
//! longer owned by the caller (step one, non-cancellable from now on) and
//! the caller regains control only once the task has finished its cleanup
//! (step two). Dropping the caller's future detaches the task, it does not
//! stop it.

use crate::error::{CoreError, CoreResult};
use std::future::Future;

/// Runs `work` to completion regardless of what happens to the caller.
pub(crate) async fn shielded<F, T>(work: F) -> CoreResult<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| CoreError::internal(format!("shielded task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn returns_the_result() {
        assert_eq!(shielded(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn survives_caller_cancellation() {
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let caller = {
            let done = Arc::clone(&done);
            shielded(async move {
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                done.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            })
        };

        // Poll once, then drop the caller mid-flight.
        let _ = tokio::time::timeout(Duration::ZERO, caller).await;

        rx.await.unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let result = shielded::<_, ()>(async { panic!("boom") }).await;
        assert!(matches!(result, Err(CoreError::Internal { .. })));
    }
}
