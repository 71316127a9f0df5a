use async_trait::async_trait;
use bytes::Bytes;
use ghostpack_core::{Backend, Error, FileInfo, FileType, Handle, ListVisitor, Result};
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How often and how patiently a failed backend call is repeated.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Calls made in total, the first one included.
    pub attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay, before jitter.
    pub max_delay: Duration,
    /// Growth of the delay per retry.
    pub factor: f64,
    /// Adds up to a quarter of the delay at random.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Interactive use: three attempts within a few seconds.
    pub fn quick() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Long unattended runs against flaky object stores.
    pub fn persistent() -> Self {
        Self {
            attempts: 10,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (zero based).
    fn delay(&self, retry: u32) -> Duration {
        let scale = self.factor.powi(retry.min(64) as i32);
        let ms = (self.base_delay.as_millis() as f64 * scale).min(self.max_delay.as_millis() as f64);
        let delay = Duration::from_millis(ms as u64);
        if !self.jitter {
            return delay;
        }
        let quarter = delay.as_millis() as u64 / 4;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
    }
}

/// Errors that may go away when the call is repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    /// Only transient transport failures. Integrity, not-found, already-exists
    /// and cancellation errors are final.
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Runs `call` until it succeeds, fails with a final error or runs out of
/// attempts. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    what: &str,
    mut call: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 1;
    loop {
        let error = match call().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "call recovered");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() || attempt >= config.attempts {
            if error.is_retryable() {
                warn!(what, attempts = attempt, %error, "giving up");
            }
            return Err(error);
        }

        let delay = config.delay(attempt - 1);
        warn!(what, attempt, delay_ms = delay.as_millis() as u64, %error, "call failed, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Retries transient failures of the wrapped backend.
///
/// Listing is not retried: a visitor may already have seen part of the
/// listing when the error occurs.
pub struct RetryBackend<B: ?Sized> {
    inner: Arc<B>,
    config: RetryConfig,
}

impl<B: Backend + ?Sized> RetryBackend<B> {
    pub fn new(inner: Arc<B>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for RetryBackend<B> {
    fn location(&self) -> String {
        self.inner.location()
    }

    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
        retry_with_backoff(&self.config, "save", || {
            self.inner.save(handle, data.clone())
        })
        .await
    }

    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
        retry_with_backoff(&self.config, "load", || {
            self.inner.load(handle, length, offset)
        })
        .await
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        retry_with_backoff(&self.config, "stat", || self.inner.stat(handle)).await
    }

    async fn test(&self, handle: &Handle) -> Result<bool> {
        retry_with_backoff(&self.config, "test", || self.inner.test(handle)).await
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        retry_with_backoff(&self.config, "remove", || self.inner.remove(handle)).await
    }

    async fn list(&self, file_type: FileType, visit: &mut ListVisitor<'_>) -> Result<()> {
        self.inner.list(file_type, visit).await
    }

    async fn delete(&self) -> Result<()> {
        retry_with_backoff(&self.config, "delete", || self.inner.delete()).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn is_not_exist(&self, err: &Error) -> bool {
        self.inner.is_not_exist(err)
    }
}
