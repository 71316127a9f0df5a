//! The storage capability contract the engine is written against.
//!
//! Concrete transports live outside the engine; everything in here only
//! talks to `dyn Backend`.

mod limiter;
mod memory;

pub use limiter::Limited;
pub use memory::MemoryBackend;

use crate::{Error, FileInfo, FileType, Handle, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Callback invoked once per listed object. Returning an error stops the listing.
pub type ListVisitor<'a> = dyn FnMut(FileInfo) -> Result<()> + Send + 'a;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Human readable location, e.g. a directory or bucket URL.
    fn location(&self) -> String;

    /// Stores `data` under `handle`. Saving over an existing object is an error.
    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()>;

    /// Reads `length` bytes at `offset`; a `length` of 0 reads to the end.
    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes>;

    async fn stat(&self, handle: &Handle) -> Result<FileInfo>;

    async fn test(&self, handle: &Handle) -> Result<bool>;

    async fn remove(&self, handle: &Handle) -> Result<()>;

    async fn list(&self, file_type: FileType, visit: &mut ListVisitor<'_>) -> Result<()>;

    /// Removes the whole repository.
    async fn delete(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_not_exist(&self, err: &Error) -> bool {
        err.is_not_found()
    }
}

/// Races `fut` against `token`; a cancelled call drops the in-flight future.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Collects every object name of `file_type`, aborting when `token` fires.
pub async fn list_names(
    backend: &dyn Backend,
    file_type: FileType,
    token: &CancellationToken,
) -> Result<Vec<FileInfo>> {
    let mut names = Vec::new();
    let mut visit = |fi: FileInfo| {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        names.push(fi);
        Ok(())
    };
    cancellable(token, backend.list(file_type, &mut visit)).await?;
    Ok(names)
}

/// Checks the requested byte range against an object of `size` bytes and
/// returns the `(start, end)` slice bounds.
pub fn range_bounds(handle: &Handle, size: u64, length: usize, offset: u64) -> Result<(usize, usize)> {
    if offset > size {
        return Err(Error::Backend(format!(
            "offset {offset} beyond end of {handle} ({size} bytes)"
        )));
    }
    let end = if length == 0 {
        size
    } else {
        offset + length as u64
    };
    if end > size {
        return Err(Error::Backend(format!(
            "range {offset}+{length} beyond end of {handle} ({size} bytes)"
        )));
    }
    Ok((offset as usize, end as usize))
}
