use async_trait::async_trait;
use bytes::Bytes;
use ghostpack_core::backend::range_bounds;
use ghostpack_core::{
    Backend, Error, FileInfo, FileType, Handle, Layout, LayoutKind, ListVisitor, Result,
    detect_layout,
};
use std::io::{ErrorKind, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Prefix `tempfile` gives files that are still being written.
const TEMP_PREFIX: &str = ".tmp";

/// Repository stored in a directory tree.
///
/// Files are written to a temporary file next to their final name and moved
/// into place once complete, so a crashed or cancelled save never leaves a
/// partial object behind.
pub struct LocalBackend {
    root: PathBuf,
    layout: Layout,
}

impl LocalBackend {
    pub fn with_layout<P: AsRef<Path>>(path: P, kind: LayoutKind) -> Self {
        let root = path.as_ref().to_path_buf();
        let layout = Layout::new(kind, root.to_string_lossy().into_owned());
        Self { root, layout }
    }

    /// Creates the directory structure for a new repository.
    pub async fn create<P: AsRef<Path>>(path: P, kind: LayoutKind) -> Result<Self> {
        let backend = Self::with_layout(path, kind);
        if fs::try_exists(backend.path(&Handle::config())).await? {
            return Err(Error::RepositoryExists {
                path: backend.root.display().to_string(),
            });
        }
        for dir in backend.layout.paths() {
            fs::create_dir_all(&dir).await?;
        }
        info!(path = %backend.root.display(), layout = %kind, "created local repository");
        Ok(backend)
    }

    /// Opens a repository directory, detecting its layout when `kind` is `None`.
    pub async fn open<P: AsRef<Path>>(path: P, kind: Option<LayoutKind>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let kind = match kind {
            Some(kind) => kind,
            None => {
                let detected = probe_layout(root.clone()).await?;
                debug!(path = %root.display(), layout = ?detected, "probed layout");
                detected.unwrap_or(LayoutKind::Default)
            }
        };
        Ok(Self::with_layout(root, kind))
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn path(&self, handle: &Handle) -> PathBuf {
        PathBuf::from(self.layout.filename(handle))
    }
}

fn io_error(handle: &Handle, err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::not_found(handle.to_string())
    } else {
        Error::Io(err)
    }
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Backend(format!("blocking task failed: {err}"))
}

/// Relative paths up to two levels below `root`, `/`-separated.
async fn probe_layout(root: PathBuf) -> Result<Option<LayoutKind>> {
    let entries = tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry.path().strip_prefix(&root).ok().map(|rel| {
                    rel.components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/")
                })
            })
            .collect::<Vec<String>>()
    })
    .await
    .map_err(join_error)?;
    Ok(detect_layout(&entries))
}

#[async_trait]
impl Backend for LocalBackend {
    fn location(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
        handle.validate()?;
        let path = self.path(handle);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let name = handle.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist_noclobber(&path).map_err(|e| {
                if e.error.kind() == ErrorKind::AlreadyExists {
                    Error::Backend(format!("{name} already exists"))
                } else {
                    Error::Io(e.error)
                }
            })?;
            Ok(())
        })
        .await
        .map_err(join_error)??;

        debug!(handle = %handle, "saved file");
        Ok(())
    }

    async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
        handle.validate()?;
        let mut file = fs::File::open(self.path(handle))
            .await
            .map_err(|e| io_error(handle, e))?;
        let size = file.metadata().await?.len();
        let (start, end) = range_bounds(handle, size, length, offset)?;

        file.seek(SeekFrom::Start(start as u64)).await?;
        let mut buf = vec![0u8; end - start];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo> {
        handle.validate()?;
        let metadata = fs::metadata(self.path(handle))
            .await
            .map_err(|e| io_error(handle, e))?;
        Ok(FileInfo {
            name: handle.name.clone(),
            size: metadata.len(),
        })
    }

    async fn test(&self, handle: &Handle) -> Result<bool> {
        handle.validate()?;
        Ok(fs::try_exists(self.path(handle)).await?)
    }

    async fn remove(&self, handle: &Handle) -> Result<()> {
        handle.validate()?;
        fs::remove_file(self.path(handle))
            .await
            .map_err(|e| io_error(handle, e))
    }

    async fn list(&self, file_type: FileType, visit: &mut ListVisitor<'_>) -> Result<()> {
        if file_type == FileType::Config {
            let handle = Handle::config();
            if let Ok(metadata) = fs::metadata(self.path(&handle)).await {
                visit(FileInfo {
                    name: "config".to_string(),
                    size: metadata.len(),
                })?;
            }
            return Ok(());
        }

        let (dir, subdirs) = self.layout.basedir(file_type);
        let dir = PathBuf::from(dir);
        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<FileInfo>> {
            let mut entries = Vec::new();
            if !dir.is_dir() {
                return Ok(entries);
            }
            let walker = WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(if subdirs { 2 } else { 1 })
                .sort_by_file_name();
            for entry in walker {
                let entry = entry
                    .map_err(|e| Error::Backend(format!("listing {}: {e}", dir.display())))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                // Removed between the directory read and the stat.
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                entries.push(FileInfo {
                    name,
                    size: metadata.len(),
                });
            }
            Ok(entries)
        })
        .await
        .map_err(join_error)??;

        for fi in entries {
            visit(fi)?;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!(path = %self.root.display(), "deleting local repository");
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
