//! Fault isolation around caller-supplied code
//!
//! Every callback runs on its own task so that a panic inside it is caught by
//! the runtime and surfaces here as an ordinary error. A callback that
//! overruns its deadline is abandoned: its task keeps running, its result is
//! ignored.

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::callbacks::CallbackError;

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(#[source] CallbackError),

    #[error("panicked: {0}")]
    Panicked(String),
}

/// Run `future` on its own task, racing completion against `timeout` and
/// `cancel`
pub async fn run_isolated<T, F>(
    label: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    future: F,
) -> Result<T, IsolationError>
where
    F: Future<Output = Result<T, CallbackError>> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(future);

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("{}: cancelled, abandoning callback", label);
            Err(IsolationError::Cancelled)
        }
        joined = &mut handle => match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(IsolationError::Failed(e)),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!("{}: callback panicked: {}", label, message);
                Err(IsolationError::Panicked(message))
            }
            Err(_) => Err(IsolationError::Cancelled),
        },
        () = deadline => {
            let limit = timeout.unwrap_or_default();
            warn!("{}: callback exceeded {:?}, abandoning it", label, limit);
            Err(IsolationError::Timeout(limit))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_through() {
        let cancel = CancellationToken::new();
        let value = run_isolated("test", None, &cancel, async { Ok(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_error_is_wrapped() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = run_isolated("test", None, &cancel, async {
            Err::<(), CallbackError>("denied by handler".into())
        })
        .await;

        match result {
            Err(IsolationError::Failed(e)) => assert_eq!(e.to_string(), "denied by handler"),
            other => panic!("Expected Failed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = run_isolated("test", None, &cancel, async {
            panic!("handler exploded");
        })
        .await;

        match result {
            Err(IsolationError::Panicked(message)) => assert_eq!(message, "handler exploded"),
            other => panic!("Expected Panicked, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_abandons_callback() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = run_isolated(
            "test",
            Some(Duration::from_millis(20)),
            &cancel,
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(IsolationError::Timeout(d)) if d == Duration::from_millis(20)
        ));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = run_isolated("test", None, &cancel, async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(IsolationError::Cancelled)));
    }
}
