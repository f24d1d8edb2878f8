//! Connection manager: opens a store session with bounded exponential
//! backoff and guarantees it is released on every exit path.
//!
//! No phase opens a raw connection itself; they all run inside
//! [`with_connection`].

use crate::config::ConnectionConfig;
use crate::error::{Error, Result, StoreError};
use crate::retry::RetryPolicy;
use crate::store::{StoreResult, VectorStore};
use async_trait::async_trait;
use futures::FutureExt as _;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Opens sessions against a store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one session. Anything partially opened must be released before
    /// an error is returned, so a retry starts from nothing.
    async fn connect(&self) -> StoreResult<Arc<dyn VectorStore>>;

    /// Human-readable endpoint for logs. Must not contain secrets.
    fn endpoint(&self) -> String;
}

impl From<&ConnectionConfig> for RetryPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        RetryPolicy::exponential(
            config.max_connect_attempts,
            config.retry_delay(),
            config.retry_backoff_factor,
        )
    }
}

/// Open a session, retrying every failure up to `policy.max_attempts` times.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    policy: &RetryPolicy,
) -> Result<Arc<dyn VectorStore>> {
    let endpoint = connector.endpoint();
    let session = policy
        .run("connect", |_| connector.connect(), |_: &StoreError| true)
        .await
        .map_err(|exhausted| {
            tracing::error!(
                %endpoint,
                attempts = exhausted.attempts,
                error = %exhausted.error,
                "failed to connect to vector store"
            );
            Error::Connection {
                attempts: exhausted.attempts,
                source: exhausted.error,
            }
        })?;

    tracing::info!(%endpoint, "connected to vector store");
    Ok(session)
}

/// Run `body` with a freshly opened session and close the session afterwards,
/// whether `body` returns, fails or panics. A panic is resumed after closing.
pub async fn with_connection<T, F, Fut>(
    connector: &dyn Connector,
    policy: &RetryPolicy,
    body: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn VectorStore>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let session = connect_with_retry(connector, policy).await?;

    let scoped = session.clone();
    let outcome = AssertUnwindSafe(async move { body(scoped).await })
        .catch_unwind()
        .await;

    match session.close().await {
        Ok(()) => tracing::info!(endpoint = %connector.endpoint(), "vector store connection closed"),
        Err(error) => tracing::warn!(%error, "failed to close vector store session"),
    }

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnector, MemoryStore, TableSchema};
    use std::time::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(100), 2.0)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_the_third_attempt_succeeds() {
        let store = MemoryStore::new();
        let connector = MemoryConnector::new(store.clone()).fail_first(2);

        let count = with_connection(&connector, &policy(3), |session| async move {
            session
                .create_table("docs", TableSchema::new(4))
                .await?;
            Ok(session.count_rows("docs").await?)
        })
        .await
        .expect("session usable after retries");

        assert_eq!(count, 0);
        assert_eq!(connector.attempts(), 3);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_every_attempt_fails() {
        let store = MemoryStore::new();
        let connector = MemoryConnector::new(store.clone()).fail_first(3);

        let error = with_connection(&connector, &policy(3), |_session| async move { Ok(()) })
            .await
            .expect_err("all attempts fail");

        match error {
            Error::Connection { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("attempt 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.attempts(), 3);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn session_is_closed_when_body_fails() {
        let store = MemoryStore::new();
        let connector = MemoryConnector::new(store.clone());

        let result: Result<()> = with_connection(&connector, &policy(1), |session| async move {
            session.count_rows("missing").await?;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(Error::Store(StoreError::MissingTable(_)))));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn session_is_closed_when_body_panics() {
        let store = MemoryStore::new();
        let connector = MemoryConnector::new(store.clone());

        let outcome = AssertUnwindSafe(with_connection(
            &connector,
            &policy(1),
            |_session| async move {
                if std::hint::black_box(true) {
                    panic!("boom");
                }
                Ok(())
            },
        ))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(store.open_sessions(), 0);
    }
}
