use crate::backend::{Backend, Limited, cancellable, list_names};
use crate::chunker::Chunker;
use crate::config::RepositoryOptions;
use crate::crypto::{Key, KeyFile, MasterKey};
use crate::index::{BlobLocation, Index, IndexBatch, Reconciliation};
use crate::pack::{self, HeaderEntry, PackWriter, blob_aad};
use crate::{BlobHandle, BlobType, Error, FileType, Handle, Id, KdfParams, PackId, RepoConfig, Result};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONFIG_TAG: u8 = 0x12;
const SNAPSHOT_TAG: u8 = 0x13;
const LOCK_TAG: u8 = 0x14;

/// Lifecycle of a repository handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepoState::Closed => "closed",
            RepoState::Opening => "opening",
            RepoState::Open => "open",
            RepoState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// State shared by every concurrent save and load.
#[derive(Default)]
struct Inner {
    index: Index,
    /// Blobs accepted by `save_blob` whose pack is not indexed yet.
    pending: HashSet<BlobHandle>,
    packer: PackWriter,
    /// First upload error not yet reported by `flush`.
    failure: Option<String>,
}

/// A deduplicating, encrypted blob store on top of any [`Backend`].
///
/// Blobs are sealed, batched into packs and located through an in-memory
/// index that is persisted as append-only index objects. A blob becomes
/// visible to [`Repository::load_blob`] only once its pack and the matching
/// index object have both been written.
///
/// # Backend Structure
///
/// ```text
/// config          # sealed RepoConfig
/// keys/           # passphrase-wrapped repository keys
/// data/           # packs
/// index/          # sealed index objects
/// snapshots/      # sealed unpacked objects
/// locks/
/// ```
///
/// # Examples
///
/// ```no_run
/// use ghostpack_core::{BlobType, MemoryBackend, Repository, RepositoryOptions};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> ghostpack_core::Result<()> {
///     let backend = Arc::new(MemoryBackend::new());
///     let repo = Repository::init(backend, "my-password", RepositoryOptions::default()).await?;
///
///     let id = repo.save_blob(BlobType::Data, b"hello").await?;
///     repo.flush().await?;
///     assert_eq!(repo.load_blob(BlobType::Data, &id).await?, b"hello");
///
///     repo.close().await
/// }
/// ```
pub struct Repository {
    backend: Limited<dyn Backend>,
    master: MasterKey,
    key: Key,
    key_id: Id,
    config: RepoConfig,
    options: RepositoryOptions,
    state: Mutex<RepoState>,
    inner: Mutex<Inner>,
    /// Number of packs detached from the writer and not yet indexed or dropped.
    uploads: watch::Sender<usize>,
    /// Shared by pack uploads, held exclusively by maintenance passes.
    maintenance: RwLock<()>,
    cancel: CancellationToken,
}

impl Repository {
    /// Initializes a new repository in an empty backend.
    ///
    /// Generates a repository key, wraps it with `passphrase` and stores a
    /// sealed configuration holding a fresh chunker polynomial.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryExists` - the backend already holds a `config` object
    /// * `Error::Config` - `options` are invalid
    pub async fn init(
        backend: Arc<dyn Backend>,
        passphrase: &str,
        options: RepositoryOptions,
    ) -> Result<Self> {
        options.validate()?;
        let backend = Limited::new(backend, options.connections);
        let cancel = CancellationToken::new();

        let config_handle = Handle::config();
        if cancellable(&cancel, backend.test(&config_handle)).await? {
            return Err(Error::RepositoryExists {
                path: backend.location(),
            });
        }

        let config = RepoConfig::generate(options.chunker)?;
        let master = MasterKey::generate();
        let key = Key::new(&master);
        let key_id = write_key(&backend, &master, passphrase, options.kdf.params(), &cancel).await?;

        let sealed_config = key.seal(&serde_json::to_vec(&config)?, &[CONFIG_TAG])?;
        cancellable(&cancel, backend.save(&config_handle, sealed_config.into())).await?;
        info!(location = %backend.location(), id = %config.id, "initialized repository");

        let repo = Self::assemble(backend, master, key, key_id, config, options, cancel);
        repo.set_state(RepoState::Open);
        Ok(repo)
    }

    /// Opens an existing repository.
    ///
    /// Every key file is tried until one unwraps with `passphrase`, then the
    /// configuration is verified and the whole index is loaded into memory.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - the backend has no `config` object
    /// * `Error::InvalidPassword` - no key file accepts `passphrase`
    /// * `Error::InvalidFormatVersion` - unsupported repository version
    /// * `Error::Integrity` - the config or an index object fails verification
    pub async fn open(
        backend: Arc<dyn Backend>,
        passphrase: &str,
        options: RepositoryOptions,
    ) -> Result<Self> {
        options.validate()?;
        let backend = Limited::new(backend, options.connections);
        let cancel = CancellationToken::new();

        let sealed_config = match cancellable(&cancel, backend.load(&Handle::config(), 0, 0)).await {
            Ok(data) => data,
            Err(e) if backend.is_not_exist(&e) => {
                return Err(Error::RepositoryNotFound {
                    path: backend.location(),
                });
            }
            Err(e) => return Err(e),
        };

        let (master, key_id) = unlock(&backend, passphrase, &cancel).await?;
        let key = Key::new(&master);
        let plain = key
            .open(&sealed_config, &[CONFIG_TAG])
            .map_err(|e| e.for_object("config"))?;
        let config: RepoConfig = serde_json::from_slice(&plain)
            .map_err(|e| Error::Config(format!("invalid repository config: {e}")))?;
        config.validate()?;

        let repo = Self::assemble(backend, master, key, key_id, config, options, cancel);
        repo.set_state(RepoState::Opening);
        let index = Index::load(&repo.backend, &repo.key, &repo.cancel).await?;
        repo.lock().index = index;
        repo.set_state(RepoState::Open);

        info!(
            location = %repo.backend.location(),
            id = %repo.config.id,
            key = %key_id.short_string(),
            "opened repository"
        );
        Ok(repo)
    }

    fn assemble(
        backend: Limited<dyn Backend>,
        master: MasterKey,
        key: Key,
        key_id: Id,
        config: RepoConfig,
        options: RepositoryOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (uploads, _) = watch::channel(0);
        Self {
            backend,
            master,
            key,
            key_id,
            config,
            options,
            state: Mutex::new(RepoState::Closed),
            inner: Mutex::new(Inner::default()),
            uploads,
            maintenance: RwLock::new(()),
            cancel,
        }
    }

    pub fn state(&self) -> RepoState {
        *self.state_guard()
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    /// Name of the key file this handle was unlocked with.
    pub fn key_id(&self) -> Id {
        self.key_id
    }

    /// Cancelling the returned token aborts every in-flight backend call.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Every indexed location of a blob; empty when it is unknown.
    pub fn lookup(&self, blob_type: BlobType, id: &Id) -> Vec<BlobLocation> {
        self.lock()
            .index
            .lookup(&BlobHandle::new(blob_type, *id))
            .map(<[BlobLocation]>::to_vec)
            .unwrap_or_default()
    }

    /// Runs `f` against the in-memory index.
    pub fn with_index<T>(&self, f: impl FnOnce(&Index) -> T) -> T {
        f(&self.lock().index)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_guard(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RepoState) {
        *self.state_guard() = state;
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.state();
        if state != RepoState::Open {
            return Err(Error::InvalidState { state });
        }
        Ok(())
    }

    /// Stores `data` as a blob and returns its id.
    ///
    /// Saving content the repository already has, or that another task is
    /// currently saving, only returns the id. When the active pack reaches
    /// the configured size it is uploaded by this call.
    pub async fn save_blob(&self, blob_type: BlobType, data: &[u8]) -> Result<Id> {
        self.ensure_open()?;
        let handle = BlobHandle::new(blob_type, Id::from_data(data));

        {
            let mut inner = self.lock();
            if inner.index.has(&handle) || !inner.pending.insert(handle) {
                return Ok(handle.id);
            }
        }

        let sealed = match self.key.seal(data, &blob_aad(&handle)) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.lock().pending.remove(&handle);
                return Err(e);
            }
        };

        let detached = {
            let mut inner = self.lock();
            // `close` may have flushed since the check above.
            let state = self.state();
            if state != RepoState::Open {
                inner.pending.remove(&handle);
                return Err(Error::InvalidState { state });
            }
            if let Err(e) = inner.packer.add_sealed(handle, &sealed) {
                inner.pending.remove(&handle);
                return Err(e);
            }
            if inner.packer.is_full(self.options.pack_size) {
                Some(self.detach_writer(&mut inner))
            } else {
                None
            }
        };

        if let Some((writer, upload)) = detached {
            self.upload(writer, upload).await?;
        }
        Ok(handle.id)
    }

    /// Loads and verifies a blob, trying every indexed location in turn.
    pub async fn load_blob(&self, blob_type: BlobType, id: &Id) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let handle = BlobHandle::new(blob_type, *id);
        let candidates = self.lookup(blob_type, id);
        if candidates.is_empty() {
            return Err(Error::not_found(format!("blob {handle}")));
        }

        let mut last_error = None;
        for location in candidates {
            let entry = location.entry(&handle);
            match pack::load_blob(&self.backend, &self.key, &location.pack_id, &entry, &self.cancel)
                .await
            {
                Ok(data) => return Ok(data),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        blob = %handle,
                        pack = %location.pack_id.short_string(),
                        error = %e,
                        "failed to load blob from pack"
                    );
                    let e = if self.backend.is_not_exist(&e) {
                        Error::Inconsistent(format!(
                            "blob {handle} is indexed in missing pack {}",
                            location.pack_id
                        ))
                    } else {
                        e
                    };
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::not_found(format!("blob {handle}"))))
    }

    /// Uploads the active pack and waits until every detached pack is indexed.
    ///
    /// Reports the first upload failure since the previous flush, including
    /// failures hit by other tasks' saves.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_pending().await
    }

    async fn flush_pending(&self) -> Result<()> {
        let detached = {
            let mut inner = self.lock();
            if inner.packer.is_empty() {
                None
            } else {
                Some(self.detach_writer(&mut inner))
            }
        };
        let own = match detached {
            Some((writer, upload)) => self.upload(writer, upload).await.err(),
            None => None,
        };

        self.wait_for_uploads().await?;
        let recorded = self.lock().failure.take();
        if let Some(e) = own {
            return Err(e);
        }
        if let Some(reason) = recorded {
            return Err(Error::UploadFailed(reason));
        }
        Ok(())
    }

    /// Flushes and releases the backend. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state_guard();
            match *state {
                RepoState::Closed | RepoState::Closing => return Ok(()),
                RepoState::Opening => return Err(Error::InvalidState { state: *state }),
                RepoState::Open => *state = RepoState::Closing,
            }
        }

        let flushed = self.flush_pending().await;
        let closed = self.backend.close().await;
        self.set_state(RepoState::Closed);
        info!(location = %self.backend.location(), "closed repository");
        flushed.and(closed)
    }

    fn detach_writer(&self, inner: &mut Inner) -> (PackWriter, Upload<'_>) {
        let writer = mem::take(&mut inner.packer);
        let upload = Upload::begin(self, &writer);
        (writer, upload)
    }

    async fn upload(&self, writer: PackWriter, upload: Upload<'_>) -> Result<()> {
        let _gate = self.maintenance.read().await;
        match self.write_pack(writer).await {
            Ok((index_id, batch)) => {
                upload.commit(index_id, &batch);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "pack upload failed");
                self.lock().failure.get_or_insert_with(|| e.to_string());
                Err(e)
            }
        }
    }

    /// Finalizes and stores a pack, then its index object. An index failure
    /// removes the pack again so nothing unindexed is left behind.
    async fn write_pack(&self, writer: PackWriter) -> Result<(Id, IndexBatch)> {
        let pack = writer.finalize(&self.key)?;
        let handle = Handle::for_id(FileType::Pack, &pack.id);
        let size = pack.data.len();
        cancellable(&self.cancel, self.backend.save(&handle, pack.data.clone())).await?;

        let mut batch = IndexBatch::new();
        batch.push_pack(pack.id, &pack.entries);
        match batch.save(&self.backend, &self.key, &self.cancel).await {
            Ok(index_id) => {
                info!(
                    pack = %pack.id.short_string(),
                    size,
                    blobs = pack.entries.len(),
                    "uploaded pack"
                );
                Ok((index_id, batch))
            }
            Err(e) => {
                if let Err(rm) = self.backend.remove(&handle).await {
                    warn!(pack = %pack.id.short_string(), error = %rm, "failed to remove unindexed pack");
                }
                Err(e)
            }
        }
    }

    async fn wait_for_uploads(&self) -> Result<()> {
        let mut rx = self.uploads.subscribe();
        rx.wait_for(|n| *n == 0)
            .await
            .map(|_| ())
            .map_err(|_| Error::Other("upload tracker closed".to_string()))
    }

    /// A chunker using this repository's polynomial and sizes.
    pub fn chunker<R: Read>(&self, reader: R) -> Result<Chunker<R>> {
        Chunker::new(reader, self.config.chunker_polynomial, self.config.chunker)
    }

    /// Chunks `data` and saves every chunk as a blob, returning ids in order.
    pub async fn save_data(&self, blob_type: BlobType, data: &[u8]) -> Result<Vec<Id>> {
        self.ensure_open()?;
        let mut chunker = self.chunker(data)?;
        let mut ids = Vec::new();
        while let Some(chunk) = chunker.next_chunk()? {
            ids.push(self.save_blob(blob_type, chunk.data()).await?);
        }
        debug!(chunks = ids.len(), bytes = data.len(), "saved data stream");
        Ok(ids)
    }

    /// Stores a whole object outside of packs, named by the hash of its sealed bytes.
    pub async fn save_unpacked(&self, file_type: FileType, data: &[u8]) -> Result<Id> {
        self.ensure_open()?;
        let tag = unpacked_tag(file_type)?;
        let sealed = self.key.seal(data, &[tag])?;
        let id = Id::from_data(&sealed);
        let handle = Handle::for_id(file_type, &id);
        cancellable(&self.cancel, self.backend.save(&handle, sealed.into())).await?;
        debug!(handle = %handle, "saved unpacked object");
        Ok(id)
    }

    pub async fn load_unpacked(&self, file_type: FileType, id: &Id) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let tag = unpacked_tag(file_type)?;
        let handle = Handle::for_id(file_type, id);
        let sealed = cancellable(&self.cancel, self.backend.load(&handle, 0, 0)).await?;
        if Id::from_data(&sealed) != *id {
            return Err(Error::integrity(handle.to_string(), "content hash does not match name"));
        }
        self.key
            .open(&sealed, &[tag])
            .map_err(|e| e.for_object(&handle))
    }

    pub async fn remove_unpacked(&self, file_type: FileType, id: &Id) -> Result<()> {
        self.ensure_open()?;
        unpacked_tag(file_type)?;
        let handle = Handle::for_id(file_type, id);
        cancellable(&self.cancel, self.backend.remove(&handle)).await
    }

    /// Ids of every object of `file_type`; names that are not ids are skipped.
    pub async fn list_ids(&self, file_type: FileType) -> Result<Vec<Id>> {
        self.ensure_open()?;
        let mut ids = Vec::new();
        for fi in list_names(&self.backend, file_type, &self.cancel).await? {
            match fi.name.parse::<Id>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(name = %fi.name, file_type = %file_type, "ignoring foreign file"),
            }
        }
        Ok(ids)
    }

    /// Wraps the repository key with another passphrase.
    pub async fn add_key(&self, passphrase: &str) -> Result<Id> {
        self.ensure_open()?;
        let id = write_key(&self.backend, &self.master, passphrase, self.options.kdf.params(), &self.cancel).await?;
        info!(key = %id.short_string(), "added key");
        Ok(id)
    }

    /// Removes a key file. The key this handle was opened with cannot be removed.
    pub async fn remove_key(&self, id: &Id) -> Result<()> {
        self.ensure_open()?;
        if *id == self.key_id {
            return Err(Error::Other(format!(
                "refusing to remove key {} which is currently in use",
                id.short_string()
            )));
        }
        let handle = Handle::for_id(FileType::Key, id);
        cancellable(&self.cancel, self.backend.remove(&handle)).await?;
        info!(key = %id.short_string(), "removed key");
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<Id>> {
        self.list_ids(FileType::Key).await
    }

    /// Brings the index in line with the packs that actually exist.
    ///
    /// Entries pointing at missing packs are dropped and packs no entry
    /// references are reported as orphans. With `rewrite`, a changed index or
    /// one spread over several objects is written out as a single new index
    /// object before the superseded ones are removed.
    ///
    /// New packs are held back until the pass is done.
    pub async fn reconcile(&self, rewrite: bool) -> Result<Reconciliation> {
        self.ensure_open()?;
        let _gate = self.maintenance.write().await;
        let live: HashSet<PackId> = self.list_ids(FileType::Pack).await?.into_iter().collect();

        let (report, plan) = {
            let mut inner = self.lock();
            let report = inner.index.reconcile(&live);
            let changed = report.dropped_entries > 0 || inner.index.files().len() > 1;
            let plan = (rewrite && changed).then(|| (inner.index.to_batch(), inner.index.files().clone()));
            (report, plan)
        };
        info!(
            live = live.len(),
            dropped = report.dropped_entries,
            missing = report.missing_packs.len(),
            orphans = report.orphan_packs.len(),
            "reconciled index"
        );

        if let Some((batch, superseded)) = plan {
            let new_id = if batch.is_empty() {
                None
            } else {
                Some(batch.save(&self.backend, &self.key, &self.cancel).await?)
            };
            for id in superseded.iter().filter(|id| Some(**id) != new_id) {
                let handle = Handle::for_id(FileType::Index, id);
                match cancellable(&self.cancel, self.backend.remove(&handle)).await {
                    Ok(()) => {}
                    Err(e) if self.backend.is_not_exist(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            self.lock().index.replace_files(&superseded, new_id);
            info!(removed = superseded.len(), entries = batch.len(), "rewrote index");
        }
        Ok(report)
    }

    /// Deletes packs that the index no longer references.
    pub async fn remove_packs(&self, ids: &[PackId]) -> Result<()> {
        self.ensure_open()?;
        let referenced = self.lock().index.packs();
        if let Some(id) = ids.iter().find(|id| referenced.contains(id)) {
            return Err(Error::Inconsistent(format!(
                "pack {id} is still referenced by the index"
            )));
        }
        for id in ids {
            let handle = Handle::for_id(FileType::Pack, id);
            cancellable(&self.cancel, self.backend.remove(&handle)).await?;
            debug!(pack = %id.short_string(), "removed pack");
        }
        Ok(())
    }

    /// Copies the blobs of `ids` into new packs, then removes the old packs.
    ///
    /// Blobs that already have a copy outside the given packs are dropped
    /// rather than copied. Returns the number of blobs copied.
    pub async fn repack(&self, ids: &[PackId]) -> Result<usize> {
        self.ensure_open()?;
        let _gate = self.maintenance.write().await;
        let targets: HashSet<PackId> = ids.iter().copied().collect();

        let mut writer = PackWriter::new();
        let mut seen = HashSet::new();
        let mut copied = 0;
        for pack_id in &targets {
            let (data, entries) = self.read_pack(pack_id).await?;
            for entry in entries {
                let handle = entry.handle();
                let elsewhere = self.lock().index.lookup(&handle).is_some_and(|locations| {
                    locations.iter().any(|l| !targets.contains(&l.pack_id))
                });
                if elsewhere || !seen.insert(handle) {
                    continue;
                }

                let start = entry.offset as usize;
                let sealed = &data[start..start + entry.length as usize];
                pack::open_blob(&self.key, &handle, sealed)
                    .map_err(|e| e.for_object(format!("blob {handle} in pack {pack_id}")))?;
                writer.add_sealed(handle, sealed)?;
                copied += 1;

                if writer.is_full(self.options.pack_size) {
                    self.write_and_merge(mem::take(&mut writer)).await?;
                }
            }
        }
        if !writer.is_empty() {
            self.write_and_merge(writer).await?;
        }

        for pack_id in &targets {
            self.lock().index.remove_pack(pack_id);
            let handle = Handle::for_id(FileType::Pack, pack_id);
            cancellable(&self.cancel, self.backend.remove(&handle)).await?;
        }
        info!(packs = targets.len(), blobs = copied, "repacked");
        Ok(copied)
    }

    async fn write_and_merge(&self, writer: PackWriter) -> Result<()> {
        let (index_id, batch) = self.write_pack(writer).await?;
        self.lock().index.merge(index_id, &batch);
        Ok(())
    }

    /// Downloads a whole pack, verifies its name and parses its header.
    async fn read_pack(&self, pack_id: &PackId) -> Result<(Bytes, Vec<HeaderEntry>)> {
        let handle = Handle::for_id(FileType::Pack, pack_id);
        let data = cancellable(&self.cancel, self.backend.load(&handle, 0, 0)).await?;
        if Id::from_data(&data) != *pack_id {
            return Err(Error::integrity(
                format!("pack {pack_id}"),
                "content hash does not match name",
            ));
        }
        let entries = pack::list_blobs(&self.key, pack_id, &data)?;
        Ok((data, entries))
    }

    /// Verifies that every indexed blob has a location in an existing pack.
    /// With `read_data`, every such pack is also downloaded and each of its
    /// blobs decrypted and hash-checked.
    ///
    /// Locations in missing packs are tolerated while the blob has another
    /// copy, as after a repack; `reconcile` removes them.
    pub async fn check(&self, read_data: bool) -> Result<()> {
        self.ensure_open()?;
        let _gate = self.maintenance.write().await;
        let live: HashSet<PackId> = self.list_ids(FileType::Pack).await?.into_iter().collect();

        let mut expected: HashMap<PackId, Vec<HeaderEntry>> = HashMap::new();
        let mut stale = HashSet::new();
        let mut problems = Vec::new();
        self.with_index(|index| {
            for (handle, locations) in index.iter() {
                if !locations.iter().any(|l| live.contains(&l.pack_id)) {
                    problems.push(format!("blob {handle} is only indexed in missing packs"));
                }
                for location in locations {
                    if live.contains(&location.pack_id) {
                        expected
                            .entry(location.pack_id)
                            .or_default()
                            .push(location.entry(handle));
                    } else {
                        stale.insert(location.pack_id);
                    }
                }
            }
        });
        problems.sort();
        if !stale.is_empty() {
            warn!(packs = stale.len(), "index names missing packs");
        }

        if read_data {
            let mut packs: Vec<&PackId> = expected.keys().collect();
            packs.sort();
            for pack_id in packs {
                match self.check_pack(pack_id, &expected[pack_id]).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => problems.push(e.to_string()),
                }
            }
        }

        if problems.is_empty() {
            info!(packs = expected.len(), read_data, "check passed");
            return Ok(());
        }
        for problem in &problems {
            warn!(%problem, "check");
        }
        Err(Error::Inconsistent(format!(
            "{} problem(s) found: {}",
            problems.len(),
            problems.join("; ")
        )))
    }

    async fn check_pack(&self, pack_id: &PackId, indexed: &[HeaderEntry]) -> Result<()> {
        let (data, entries) = self.read_pack(pack_id).await?;
        for entry in &entries {
            let handle = entry.handle();
            let start = entry.offset as usize;
            pack::open_blob(&self.key, &handle, &data[start..start + entry.length as usize])
                .map_err(|e| e.for_object(format!("blob {handle} in pack {pack_id}")))?;
        }
        if let Some(entry) = indexed.iter().find(|e| !entries.contains(e)) {
            return Err(Error::Inconsistent(format!(
                "index entry for blob {} does not match the header of pack {pack_id}",
                entry.handle()
            )));
        }
        Ok(())
    }
}

/// Tracks one pack between leaving the writer and being indexed. Dropping it
/// without [`Upload::commit`] releases its blobs from the pending set, so a
/// failed or cancelled upload can be retried by saving the blobs again, and
/// leaves a failure for the next `flush` to report.
struct Upload<'a> {
    repo: &'a Repository,
    handles: Vec<BlobHandle>,
}

impl<'a> Upload<'a> {
    fn begin(repo: &'a Repository, writer: &PackWriter) -> Self {
        repo.uploads.send_modify(|n| *n += 1);
        Self {
            repo,
            handles: writer.entries().iter().map(HeaderEntry::handle).collect(),
        }
    }

    fn commit(mut self, index_id: Id, batch: &IndexBatch) {
        let handles = mem::take(&mut self.handles);
        let mut inner = self.repo.lock();
        inner.index.merge(index_id, batch);
        for handle in &handles {
            inner.pending.remove(handle);
        }
    }
}

impl Drop for Upload<'_> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let mut inner = self.repo.lock();
            for handle in &self.handles {
                inner.pending.remove(handle);
            }
            let lost = self.handles.len();
            inner
                .failure
                .get_or_insert_with(|| format!("pack upload of {lost} blob(s) was abandoned"));
        }
        self.repo.uploads.send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn unpacked_tag(file_type: FileType) -> Result<u8> {
    match file_type {
        FileType::Snapshot => Ok(SNAPSHOT_TAG),
        FileType::Lock => Ok(LOCK_TAG),
        other => Err(Error::InvalidHandle(format!(
            "{other} objects cannot be stored unpacked"
        ))),
    }
}

async fn write_key(
    backend: &dyn Backend,
    master: &MasterKey,
    passphrase: &str,
    kdf: KdfParams,
    token: &CancellationToken,
) -> Result<Id> {
    let data = KeyFile::wrap(master, passphrase, kdf)?.to_bytes()?;
    let id = Id::from_data(&data);
    let handle = Handle::for_id(FileType::Key, &id);
    cancellable(token, backend.save(&handle, data.into())).await?;
    Ok(id)
}

async fn unlock(
    backend: &dyn Backend,
    passphrase: &str,
    token: &CancellationToken,
) -> Result<(MasterKey, Id)> {
    for fi in list_names(backend, FileType::Key, token).await? {
        let Ok(id) = fi.name.parse::<Id>() else {
            warn!(name = %fi.name, "ignoring foreign file in key directory");
            continue;
        };
        let handle = Handle::for_id(FileType::Key, &id);
        let data = cancellable(token, backend.load(&handle, 0, 0)).await?;
        let key_file = match KeyFile::from_bytes(&data) {
            Ok(key_file) => key_file,
            Err(e) => {
                warn!(key = %id.short_string(), error = %e, "skipping unreadable key file");
                continue;
            }
        };
        match key_file.unwrap_key(passphrase) {
            Ok(master) => {
                debug!(key = %id.short_string(), "unlocked repository key");
                return Ok((master, id));
            }
            Err(Error::InvalidPassword) => continue,
            Err(e) => warn!(key = %id.short_string(), error = %e, "skipping key file"),
        }
    }
    Err(Error::InvalidPassword)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::chunker::ChunkerParams;
    use crate::config::KdfCost;
    use crate::FileInfo;
    use crate::backend::ListVisitor;
    use crate::crypto::NONCE_SIZE;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    fn options() -> RepositoryOptions {
        RepositoryOptions {
            pack_size: 4096,
            connections: 4,
            chunker: ChunkerParams::new(1024, 4096, 16384).unwrap(),
            kdf: KdfCost {
                iterations: 1,
                memory: 64,
                parallelism: 1,
            },
        }
    }

    fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rng.fill_bytes(&mut buf);
        buf
    }

    async fn fresh() -> (Arc<MemoryBackend>, Repository) {
        let backend = Arc::new(MemoryBackend::new());
        let repo = Repository::init(backend.clone(), "secret", options())
            .await
            .unwrap();
        (backend, repo)
    }

    /// Memory backend whose pack saves and pack listings can be slowed down.
    struct Gated {
        inner: MemoryBackend,
        save_delay_ms: AtomicU64,
        list_delay_ms: AtomicU64,
        pack_saves: AtomicUsize,
    }

    impl Gated {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                save_delay_ms: AtomicU64::new(0),
                list_delay_ms: AtomicU64::new(0),
                pack_saves: AtomicUsize::new(0),
            }
        }

        fn delay(value: &AtomicU64) -> Duration {
            Duration::from_millis(value.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl Backend for Gated {
        fn location(&self) -> String {
            "gated".to_string()
        }
        async fn save(&self, handle: &Handle, data: Bytes) -> Result<()> {
            if handle.file_type == FileType::Pack {
                self.pack_saves.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Self::delay(&self.save_delay_ms)).await;
            }
            self.inner.save(handle, data).await
        }
        async fn load(&self, handle: &Handle, length: usize, offset: u64) -> Result<Bytes> {
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
            if file_type != FileType::Pack {
                return self.inner.list(file_type, visit).await;
            }
            // The listing is taken first and delivered late.
            let mut listed = Vec::new();
            self.inner
                .list(file_type, &mut |fi| {
                    listed.push(fi);
                    Ok(())
                })
                .await?;
            tokio::time::sleep(Self::delay(&self.list_delay_ms)).await;
            for fi in listed {
                visit(fi)?;
            }
            Ok(())
        }
        async fn delete(&self) -> Result<()> {
            self.inner.delete().await
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_save_flush_reopen_load() {
        let (backend, repo) = fresh().await;
        assert_eq!(repo.state(), RepoState::Open);

        let h1 = repo.save_blob(BlobType::Data, b"hello").await.unwrap();
        assert_eq!(repo.save_blob(BlobType::Data, b"hello").await.unwrap(), h1);
        let h2 = repo.save_blob(BlobType::Data, b"world").await.unwrap();
        assert_ne!(h1, h2);

        // Nothing is visible before the pack is indexed.
        assert!(repo.lookup(BlobType::Data, &h1).is_empty());
        repo.flush().await.unwrap();
        assert_eq!(repo.lookup(BlobType::Data, &h1).len(), 1);
        repo.close().await.unwrap();

        let repo = Repository::open(backend, "secret", options()).await.unwrap();
        assert_eq!(repo.load_blob(BlobType::Data, &h1).await.unwrap(), b"hello");
        assert_eq!(repo.load_blob(BlobType::Data, &h2).await.unwrap(), b"world");
        assert!(
            repo.load_blob(BlobType::Tree, &h1)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_concurrent_saves_dedup() {
        let (_backend, repo) = fresh().await;
        let mut rng = StdRng::seed_from_u64(7);
        let distinct: Vec<Vec<u8>> = (0..20)
            .map(|i| random_bytes(&mut rng, 300 + i * 17))
            .collect();

        let saves = (0..200).map(|i| repo.save_blob(BlobType::Data, &distinct[i % distinct.len()]));
        let ids = futures::future::try_join_all(saves).await.unwrap();
        repo.flush().await.unwrap();

        assert_eq!(repo.with_index(Index::len), distinct.len());
        for (i, data) in distinct.iter().enumerate() {
            assert_eq!(ids[i], Id::from_data(data));
            assert_eq!(repo.lookup(BlobType::Data, &ids[i]).len(), 1);
            assert_eq!(&repo.load_blob(BlobType::Data, &ids[i]).await.unwrap(), data);
        }
        // Several packs were cut along the way.
        assert!(repo.with_index(|index| index.packs().len()) > 1);
    }

    #[tokio::test]
    async fn test_tampered_pack_fails_integrity() {
        let (backend, repo) = fresh().await;
        let id = repo.save_blob(BlobType::Data, b"precious").await.unwrap();
        repo.flush().await.unwrap();

        let location = repo.lookup(BlobType::Data, &id)[0];
        let handle = Handle::for_id(FileType::Pack, &location.pack_id);
        let mut data = backend.load(&handle, 0, 0).await.unwrap().to_vec();
        data[location.offset as usize + NONCE_SIZE] ^= 0xff;
        backend.remove(&handle).await.unwrap();
        backend.save(&handle, Bytes::from(data)).await.unwrap();

        let err = repo.load_blob(BlobType::Data, &id).await.unwrap_err();
        assert!(err.is_integrity(), "{err}");
        assert!(repo.check(true).await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let (backend, repo) = fresh().await;
        assert!(matches!(
            Repository::init(backend.clone(), "other", options()).await,
            Err(Error::RepositoryExists { .. })
        ));
        assert!(matches!(
            Repository::open(backend.clone(), "wrong", options()).await,
            Err(Error::InvalidPassword)
        ));
        assert!(matches!(
            Repository::open(Arc::new(MemoryBackend::new()), "secret", options()).await,
            Err(Error::RepositoryNotFound { .. })
        ));

        repo.close().await.unwrap();
        repo.close().await.unwrap();
        assert_eq!(repo.state(), RepoState::Closed);
        assert!(matches!(
            repo.save_blob(BlobType::Data, b"late").await,
            Err(Error::InvalidState {
                state: RepoState::Closed
            })
        ));
    }

    #[tokio::test]
    async fn test_keys() {
        let (backend, repo) = fresh().await;
        let second = repo.add_key("second").await.unwrap();
        assert_eq!(repo.list_keys().await.unwrap().len(), 2);
        assert!(repo.remove_key(&repo.key_id()).await.is_err());

        let other = Repository::open(backend.clone(), "second", options()).await.unwrap();
        assert_eq!(other.key_id(), second);
        assert_eq!(other.config().id, repo.config().id);

        repo.remove_key(&second).await.unwrap();
        assert!(matches!(
            Repository::open(backend, "second", options()).await,
            Err(Error::InvalidPassword)
        ));
    }

    #[tokio::test]
    async fn test_unpacked_objects() {
        let (_backend, repo) = fresh().await;
        let id = repo
            .save_unpacked(FileType::Snapshot, br#"{"tree":"abc"}"#)
            .await
            .unwrap();
        assert_eq!(
            repo.load_unpacked(FileType::Snapshot, &id).await.unwrap(),
            br#"{"tree":"abc"}"#
        );
        assert_eq!(repo.list_ids(FileType::Snapshot).await.unwrap(), vec![id]);
        assert!(repo.load_unpacked(FileType::Lock, &id).await.is_err());
        assert!(matches!(
            repo.save_unpacked(FileType::Pack, b"x").await,
            Err(Error::InvalidHandle(_))
        ));

        repo.remove_unpacked(FileType::Snapshot, &id).await.unwrap();
        assert!(repo.list_ids(FileType::Snapshot).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_data_chunks_and_dedups() {
        let (_backend, repo) = fresh().await;
        let mut rng = StdRng::seed_from_u64(42);
        let data = random_bytes(&mut rng, 96 * 1024);

        let ids = repo.save_data(BlobType::Data, &data).await.unwrap();
        assert!(ids.len() > 1);
        repo.flush().await.unwrap();
        let blobs = repo.with_index(Index::len);

        let mut restored = Vec::new();
        for id in &ids {
            restored.extend(repo.load_blob(BlobType::Data, id).await.unwrap());
        }
        assert_eq!(restored, data);

        assert_eq!(repo.save_data(BlobType::Data, &data).await.unwrap(), ids);
        repo.flush().await.unwrap();
        assert_eq!(repo.with_index(Index::len), blobs);
    }

    #[tokio::test]
    async fn test_reconcile_drops_missing_and_reports_orphans() {
        let (backend, repo) = fresh().await;
        let a = repo.save_blob(BlobType::Data, b"a").await.unwrap();
        repo.flush().await.unwrap();
        let b = repo.save_blob(BlobType::Tree, b"b").await.unwrap();
        repo.flush().await.unwrap();

        let lost = repo.lookup(BlobType::Tree, &b)[0].pack_id;
        backend
            .remove(&Handle::for_id(FileType::Pack, &lost))
            .await
            .unwrap();
        let orphan = Id::from_data(b"junk");
        backend
            .save(&Handle::for_id(FileType::Pack, &orphan), Bytes::from_static(b"junk"))
            .await
            .unwrap();

        assert!(matches!(repo.check(false).await, Err(Error::Inconsistent(_))));
        assert!(matches!(
            repo.load_blob(BlobType::Tree, &b).await,
            Err(Error::Inconsistent(_))
        ));

        let report = repo.reconcile(true).await.unwrap();
        assert_eq!(report.dropped_entries, 1);
        assert_eq!(report.missing_packs, vec![lost]);
        assert_eq!(report.orphan_packs, vec![orphan]);
        assert_eq!(repo.list_ids(FileType::Index).await.unwrap().len(), 1);

        let kept = repo.lookup(BlobType::Data, &a)[0].pack_id;
        assert!(repo.remove_packs(&[kept]).await.is_err());
        repo.remove_packs(&report.orphan_packs).await.unwrap();
        repo.check(true).await.unwrap();
        repo.close().await.unwrap();

        let repo = Repository::open(backend, "secret", options()).await.unwrap();
        assert_eq!(repo.with_index(Index::len), 1);
        assert_eq!(repo.load_blob(BlobType::Data, &a).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_repack_moves_blobs() {
        let (backend, repo) = fresh().await;
        let a = repo.save_blob(BlobType::Data, b"alpha").await.unwrap();
        let b = repo.save_blob(BlobType::Data, b"beta").await.unwrap();
        repo.flush().await.unwrap();
        let old = repo.lookup(BlobType::Data, &a)[0].pack_id;

        assert_eq!(repo.repack(&[old]).await.unwrap(), 2);
        let new = repo.lookup(BlobType::Data, &a);
        assert_eq!(new.len(), 1);
        assert_ne!(new[0].pack_id, old);
        assert!(
            !backend
                .test(&Handle::for_id(FileType::Pack, &old))
                .await
                .unwrap()
        );
        assert_eq!(repo.load_blob(BlobType::Data, &b).await.unwrap(), b"beta");
        repo.check(true).await.unwrap();

        // The old pack's index object still names it; reconcile cleans that up.
        let report = repo.reconcile(true).await.unwrap();
        assert!(report.orphan_packs.is_empty());
        assert_eq!(repo.list_ids(FileType::Index).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_flush_indexes_nothing() {
        let (backend, repo) = fresh().await;
        let id = repo.save_blob(BlobType::Data, b"never stored").await.unwrap();
        repo.cancellation_token().cancel();

        assert!(repo.flush().await.unwrap_err().is_cancelled());
        assert!(repo.lookup(BlobType::Data, &id).is_empty());
        let mut packs = 0;
        backend
            .list(FileType::Pack, &mut |_| {
                packs += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(packs, 0);
    }

    #[tokio::test]
    async fn test_abandoned_upload_fails_next_flush() {
        let backend = Arc::new(Gated::new());
        let repo = Repository::init(backend.clone(), "secret", options())
            .await
            .unwrap();
        let small = repo
            .save_blob(BlobType::Data, b"rides along")
            .await
            .unwrap();

        // The save that fills the pack is dropped while the pack is in flight.
        backend.save_delay_ms.store(5_000, Ordering::SeqCst);
        let big = random_bytes(&mut StdRng::seed_from_u64(9), 8 * 1024);
        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            repo.save_blob(BlobType::Data, &big),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(backend.pack_saves.load(Ordering::SeqCst), 1);

        assert!(repo.lookup(BlobType::Data, &small).is_empty());
        assert!(matches!(repo.flush().await, Err(Error::UploadFailed(_))));

        backend.save_delay_ms.store(0, Ordering::SeqCst);
        repo.save_blob(BlobType::Data, b"rides along").await.unwrap();
        repo.flush().await.unwrap();
        assert_eq!(
            repo.load_blob(BlobType::Data, &small).await.unwrap(),
            b"rides along"
        );
    }

    #[tokio::test]
    async fn test_reconcile_keeps_packs_saved_meanwhile() {
        let backend = Arc::new(Gated::new());
        let repo = Repository::init(backend.clone(), "secret", options())
            .await
            .unwrap();
        let a = repo.save_blob(BlobType::Data, b"a").await.unwrap();
        repo.flush().await.unwrap();
        let b = repo.save_blob(BlobType::Data, b"b").await.unwrap();
        repo.flush().await.unwrap();

        backend.list_delay_ms.store(200, Ordering::SeqCst);
        let (report, c) = tokio::join!(repo.reconcile(true), async {
            let c = repo.save_blob(BlobType::Data, b"c").await?;
            repo.flush().await?;
            Ok::<_, Error>(c)
        });
        let report = report.unwrap();
        let c = c.unwrap();
        assert_eq!(report.dropped_entries, 0);
        assert!(report.missing_packs.is_empty());
        assert_eq!(repo.lookup(BlobType::Data, &c).len(), 1);
        repo.close().await.unwrap();

        backend.list_delay_ms.store(0, Ordering::SeqCst);
        let repo = Repository::open(backend, "secret", options()).await.unwrap();
        for (id, data) in [(a, b"a"), (b, b"b"), (c, b"c")] {
            assert_eq!(repo.load_blob(BlobType::Data, &id).await.unwrap(), data);
        }
        repo.check(true).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_saves_racing_close_are_stored_or_rejected() {
        let (backend, repo) = fresh().await;
        let repo = Arc::new(repo);
        let tasks: Vec<_> = (0..64u32)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    let data = format!("blob number {i}").into_bytes();
                    repo.save_blob(BlobType::Data, &data)
                        .await
                        .map(|id| (id, data))
                })
            })
            .collect();
        repo.close().await.unwrap();

        let mut saved = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(pair) => saved.push(pair),
                Err(e) => assert!(matches!(e, Error::InvalidState { .. }), "{e}"),
            }
        }

        let repo = Repository::open(backend, "secret", options()).await.unwrap();
        assert_eq!(repo.with_index(Index::len), saved.len());
        for (id, data) in saved {
            assert_eq!(repo.load_blob(BlobType::Data, &id).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_check_after_repack_and_reopen() {
        let (backend, repo) = fresh().await;
        let a = repo.save_blob(BlobType::Data, b"alpha").await.unwrap();
        repo.save_blob(BlobType::Tree, b"beta").await.unwrap();
        repo.flush().await.unwrap();
        let old = repo.lookup(BlobType::Data, &a)[0].pack_id;
        repo.repack(&[old]).await.unwrap();
        repo.close().await.unwrap();

        // The first index object still lists the removed pack.
        let repo = Repository::open(backend, "secret", options()).await.unwrap();
        assert_eq!(repo.lookup(BlobType::Data, &a).len(), 2);
        repo.check(false).await.unwrap();
        repo.check(true).await.unwrap();
        assert_eq!(repo.load_blob(BlobType::Data, &a).await.unwrap(), b"alpha");
    }
}
