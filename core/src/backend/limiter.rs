use super::{Backend, ListVisitor};
use crate::{Error, FileInfo, FileType, Handle, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Bounds the number of concurrent calls into the wrapped backend.
/// Callers wait for a permit instead of failing when the limit is reached.
pub struct Limited<B: ?Sized> {
    inner: Arc<B>,
    permits: Semaphore,
    connections: usize,
}

impl<B: Backend + ?Sized> Limited<B> {
    pub fn new(inner: Arc<B>, connections: usize) -> Self {
        let connections = connections.max(1);
        Self {
            inner,
            permits: Semaphore::new(connections),
            connections,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| Error::Backend("connection limiter closed".to_string()))
    }
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Limited<B> {
    fn location(&self) -> String {
        self.inner.location()
    }

    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.save(handle, data).await
    }

    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
        let _permit = self.acquire().await?;
        self.inner.load(handle, length, offset).await
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        let _permit = self.acquire().await?;
        self.inner.stat(handle).await
    }

    async fn test(&self, handle: &Handle) -> Result<bool> {
        let _permit = self.acquire().await?;
        self.inner.test(handle).await
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.remove(handle).await
    }

    async fn list(&self, file_type: FileType, visit: &mut ListVisitor<'_>) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.list(file_type, visit).await
    }

    async fn delete(&self) -> Result<()> {
        let _permit = self.acquire().await?;
        self.inner.delete().await
    }

    async fn close(&self) -> Result<()> {
        self.permits.close();
        self.inner.close().await
    }

    fn is_not_exist(&self, err: &Error) -> bool {
        self.inner.is_not_exist(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records the highest number of overlapping `load` calls.
    struct SlowBackend {
        inner: MemoryBackend,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        fn location(&self) -> String {
            "slow".to_string()
        }
        async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
            self.inner.save(handle, data).await
        }
        async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.inner.load(handle, length, offset).await
        }
        async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
            self.inner.stat(handle).await
        }
        async fn test(&self, handle: &Handle) -> Result<bool> {
            self.inner.test(handle).await
        }
        async fn remove(&self, handle: &Handle) -> Result<()> {
            self.inner.remove(handle).await
        }
        async fn list(&self, file_type: FileType, visit: &mut ListVisitor<'_>) -> Result<()> {
            self.inner.list(file_type, visit).await
        }
        async fn delete(&self) -> Result<()> {
            self.inner.delete().await
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let slow = Arc::new(SlowBackend {
            inner: MemoryBackend::new(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let handle = Handle::new(FileType::Snapshot, "s");
        slow.save(&handle, Bytes::from_static(b"x")).await.unwrap();

        let limited = Limited::new(slow.clone(), 2);
        let loads = (0..8).map(|_| limited.load(&handle, 0, 0));
        for res in futures::future::join_all(loads).await {
            assert_eq!(res.unwrap(), Bytes::from_static(b"x"));
        }

        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limited.available(), 2);
    }
}
