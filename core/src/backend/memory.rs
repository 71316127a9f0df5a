use super::{Backend, ListVisitor, range_bounds};
use crate::{Error, FileInfo, FileType, Handle, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Backend keeping every object in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<(FileType, String), Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<(FileType, String), Bytes>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(handle: &Handle) -> (FileType, String) {
        (handle.file_type, handle.name.clone())
    }

    fn missing(handle: &Handle) -> Error {
        Error::not_found(handle.to_string())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn location(&self) -> String {
        "memory:".to_string()
    }

    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
        handle.validate()?;
        let mut objects = self.objects();
        let key = Self::key(handle);
        if objects.contains_key(&key) {
            return Err(Error::Backend(format!("{handle} already exists")));
        }
        debug!(handle = %handle, size = data.len(), "memory save");
        objects.insert(key, data);
        Ok(())
    }

    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
        handle.validate()?;
        let objects = self.objects();
        let data = objects
            .get(&Self::key(handle))
            .ok_or_else(|| Self::missing(handle))?;
        let (start, end) = range_bounds(handle, data.len() as u64, length, offset)?;
        Ok(data.slice(start..end))
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        handle.validate()?;
        let objects = self.objects();
        let data = objects
            .get(&Self::key(handle))
            .ok_or_else(|| Self::missing(handle))?;
        Ok(FileInfo {
            name: handle.name.clone(),
            size: data.len() as u64,
        })
    }

    async fn test(&self, handle: &Handle) -> Result<bool> {
        handle.validate()?;
        Ok(self.objects().contains_key(&Self::key(handle)))
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        handle.validate()?;
        self.objects()
            .remove(&Self::key(handle))
            .map(|_| ())
            .ok_or_else(|| Self::missing(handle))
    }

    async fn list(&self, file_type: FileType, visit: &mut ListVisitor<'_>) -> Result<()> {
        // Snapshot the listing so visitors never run under the lock.
        let entries: Vec<FileInfo> = self
            .objects()
            .iter()
            .filter(|((t, _), _)| *t == file_type)
            .map(|((_, name), data)| FileInfo {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect();
        for fi in entries {
            visit(fi)?;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.objects().clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_stat_remove() {
        let be = MemoryBackend::new();
        let h = Handle::new(FileType::Pack, "abcd");

        assert!(!be.test(&h).await.unwrap());
        be.save(&h, Bytes::from_static(b"0123456789")).await.unwrap();
        assert!(be.save(&h, Bytes::from_static(b"again")).await.is_err());

        assert!(be.test(&h).await.unwrap());
        assert_eq!(be.stat(&h).await.unwrap().size, 10);
        assert_eq!(be.load(&h, 3, 2).await.unwrap(), Bytes::from_static(b"234"));
        assert_eq!(be.load(&h, 0, 7).await.unwrap(), Bytes::from_static(b"789"));

        be.remove(&h).await.unwrap();
        let err = be.load(&h, 0, 0).await.unwrap_err();
        assert!(be.is_not_exist(&err));
    }

    #[tokio::test]
    async fn test_list_filters_and_stops_on_error() {
        let be = MemoryBackend::new();
        for name in ["a", "b", "c"] {
            be.save(&Handle::new(FileType::Index, name), Bytes::from_static(b"i"))
                .await
                .unwrap();
        }
        be.save(&Handle::new(FileType::Key, "k"), Bytes::from_static(b"k"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        be.list(FileType::Index, &mut |fi| {
            seen.push(fi.name);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen, vec!["a", "b", "c"]);

        let mut count = 0;
        let res = be
            .list(FileType::Index, &mut |_| {
                count += 1;
                Err(Error::Cancelled)
            })
            .await;
        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_invalid_handle_rejected() {
        let be = MemoryBackend::new();
        let err = be
            .save(&Handle::new(FileType::Pack, ""), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)));
    }
}
