use crate::backend::{Backend, cancellable, list_names};
use crate::crypto::Key;
use crate::pack::{HEADER_ENTRY_SIZE, HeaderEntry};
use crate::types::ID_SIZE;
use crate::{BlobHandle, BlobType, Error, FileType, Handle, Id, PackId, Result};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INDEX_MAGIC: &[u8; 4] = b"GPIX";
const INDEX_VERSION: u8 = 1;
const INDEX_TAG: u8 = 0x11;
const RECORD_SIZE: usize = ID_SIZE + HEADER_ENTRY_SIZE;
const LOAD_CONCURRENCY: usize = 8;

/// Physical location of a sealed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobLocation {
    pub pack_id: PackId,
    pub offset: u64,
    pub length: u32,
}

impl BlobLocation {
    pub fn entry(&self, handle: &BlobHandle) -> HeaderEntry {
        HeaderEntry {
            blob_type: handle.blob_type,
            id: handle.id,
            length: self.length,
            offset: self.offset,
        }
    }
}

/// In-memory map from blob identity to every known location.
///
/// A handle can map to several locations while a repack is in progress; only
/// [`Index::reconcile`] and [`Index::remove_pack`] ever drop locations.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: HashMap<BlobHandle, Vec<BlobLocation>>,
    files: BTreeSet<Id>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub dropped_entries: usize,
    /// Packs referenced by the index but absent from the backend.
    pub missing_packs: Vec<PackId>,
    /// Packs present in the backend that no index entry references.
    pub orphan_packs: Vec<PackId>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, handle: &BlobHandle) -> Option<&[BlobLocation]> {
        self.entries.get(handle).map(Vec::as_slice)
    }

    pub fn has(&self, handle: &BlobHandle) -> bool {
        self.entries.contains_key(handle)
    }

    /// Returns false when this exact location was already known.
    pub fn insert(&mut self, handle: BlobHandle, location: BlobLocation) -> bool {
        let locations = self.entries.entry(handle).or_default();
        if locations.contains(&location) {
            return false;
        }
        locations.push(location);
        true
    }

    /// Number of distinct blobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, blob_type: BlobType) -> usize {
        self.entries
            .keys()
            .filter(|h| h.blob_type == blob_type)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlobHandle, &[BlobLocation])> {
        self.entries.iter().map(|(h, l)| (h, l.as_slice()))
    }

    pub fn packs(&self) -> BTreeSet<PackId> {
        self.entries
            .values()
            .flat_map(|locations| locations.iter().map(|l| l.pack_id))
            .collect()
    }

    /// Index objects whose entries have been merged in.
    pub fn files(&self) -> &BTreeSet<Id> {
        &self.files
    }

    pub fn merge(&mut self, file_id: Id, batch: &IndexBatch) {
        for (pack_id, entry) in batch.records() {
            self.insert(
                entry.handle(),
                BlobLocation {
                    pack_id: *pack_id,
                    offset: entry.offset,
                    length: entry.length,
                },
            );
        }
        self.files.insert(file_id);
    }

    pub(crate) fn replace_files(&mut self, old: &BTreeSet<Id>, new: Option<Id>) {
        self.files.retain(|id| !old.contains(id));
        self.files.extend(new);
    }

    /// Drops every location inside `pack_id`, returning how many were removed.
    pub fn remove_pack(&mut self, pack_id: &PackId) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, locations| {
            let before = locations.len();
            locations.retain(|l| l.pack_id != *pack_id);
            removed += before - locations.len();
            !locations.is_empty()
        });
        removed
    }

    /// Drops locations whose pack is not in `live` and reports packs nothing references.
    pub fn reconcile(&mut self, live: &HashSet<PackId>) -> Reconciliation {
        let mut missing = BTreeSet::new();
        let mut dropped = 0;
        self.entries.retain(|_, locations| {
            locations.retain(|l| {
                let keep = live.contains(&l.pack_id);
                if !keep {
                    missing.insert(l.pack_id);
                    dropped += 1;
                }
                keep
            });
            !locations.is_empty()
        });

        let referenced = self.packs();
        let mut orphans: Vec<PackId> = live
            .iter()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect();
        orphans.sort();

        Reconciliation {
            dropped_entries: dropped,
            missing_packs: missing.into_iter().collect(),
            orphan_packs: orphans,
        }
    }

    /// Every entry as one batch, grouped by pack.
    pub fn to_batch(&self) -> IndexBatch {
        let mut records: Vec<(PackId, HeaderEntry)> = self
            .entries
            .iter()
            .flat_map(|(handle, locations)| locations.iter().map(|l| (l.pack_id, l.entry(handle))))
            .collect();
        records.sort_by_key(|(pack_id, entry)| (*pack_id, entry.offset));
        IndexBatch { records }
    }

    /// Loads and merges every index object in the backend.
    pub async fn load(
        backend: &dyn Backend,
        key: &Key,
        token: &CancellationToken,
    ) -> Result<Self> {
        let mut ids = Vec::new();
        for fi in list_names(backend, FileType::Index, token).await? {
            match fi.name.parse::<Id>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(name = %fi.name, "ignoring foreign file in index directory"),
            }
        }

        let batches: Vec<(Id, IndexBatch)> = futures::stream::iter(ids)
            .map(|id| async move {
                let handle = Handle::for_id(FileType::Index, &id);
                let sealed = cancellable(token, backend.load(&handle, 0, 0)).await?;
                let batch = IndexBatch::open(key, &id, &sealed)?;
                Ok::<_, Error>((id, batch))
            })
            .buffer_unordered(LOAD_CONCURRENCY)
            .try_collect()
            .await?;

        let mut index = Index::new();
        for (id, batch) in &batches {
            index.merge(*id, batch);
        }
        info!(files = batches.len(), blobs = index.len(), "loaded index");
        Ok(index)
    }
}

/// The unit of index persistence: one object per batch, never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBatch {
    records: Vec<(PackId, HeaderEntry)>,
}

impl IndexBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pack(&mut self, pack_id: PackId, entries: &[HeaderEntry]) {
        self.records
            .extend(entries.iter().map(|entry| (pack_id, *entry)));
    }

    pub fn records(&self) -> &[(PackId, HeaderEntry)] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INDEX_MAGIC.len() + 1 + self.records.len() * RECORD_SIZE);
        out.extend_from_slice(INDEX_MAGIC);
        out.push(INDEX_VERSION);
        for (pack_id, entry) in &self.records {
            out.extend_from_slice(pack_id.as_bytes());
            entry.encode_into(&mut out);
        }
        out
    }

    pub fn decode(object: &str, data: &[u8]) -> Result<Self> {
        let prefix = INDEX_MAGIC.len() + 1;
        if data.len() < prefix || &data[..INDEX_MAGIC.len()] != INDEX_MAGIC {
            return Err(Error::integrity(object, "missing index magic"));
        }
        if data[INDEX_MAGIC.len()] != INDEX_VERSION {
            return Err(Error::integrity(
                object,
                format!("unsupported index version {}", data[INDEX_MAGIC.len()]),
            ));
        }
        let body = &data[prefix..];
        if body.len() % RECORD_SIZE != 0 {
            return Err(Error::integrity(object, "truncated index record"));
        }

        let mut records = Vec::with_capacity(body.len() / RECORD_SIZE);
        for raw in body.chunks_exact(RECORD_SIZE) {
            let pack_id = Id::from_slice(&raw[..ID_SIZE])
                .ok_or_else(|| Error::integrity(object, "bad pack id"))?;
            let entry = HeaderEntry::decode(&raw[ID_SIZE..])
                .map_err(|reason| Error::integrity(object, reason))?;
            records.push((pack_id, entry));
        }
        Ok(Self { records })
    }

    /// Seals the batch; the returned id is the hash of the sealed bytes.
    pub fn seal(&self, key: &Key) -> Result<(Id, Bytes)> {
        let sealed = key.seal(&self.encode(), &[INDEX_TAG])?;
        Ok((Id::from_data(&sealed), Bytes::from(sealed)))
    }

    pub fn open(key: &Key, id: &Id, sealed: &[u8]) -> Result<Self> {
        let object = format!("index {id}");
        if Id::from_data(sealed) != *id {
            return Err(Error::integrity(object, "content hash does not match name"));
        }
        let plain = key
            .open(sealed, &[INDEX_TAG])
            .map_err(|e| e.for_object(&object))?;
        Self::decode(&object, &plain)
    }

    /// Persists the batch as a new index object.
    pub async fn save(
        &self,
        backend: &dyn Backend,
        key: &Key,
        token: &CancellationToken,
    ) -> Result<Id> {
        let (id, data) = self.seal(key)?;
        let handle = Handle::for_id(FileType::Index, &id);
        cancellable(token, backend.save(&handle, data)).await?;
        debug!(index = %id.short_string(), entries = self.records.len(), "saved index");
        Ok(id)
    }
}
