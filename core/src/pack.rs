//! Pack containers: many sealed blobs followed by a sealed header and its length.
//!
//! ```text
//! Pack        := Blob* Header HeaderLength
//! Blob        := Seal(plaintext)                 aad = type || id
//! Header      := Seal(HeaderEntry*)              aad = HEADER_TAG
//! HeaderEntry := Type(1) | ID(32) | Length(4 LE) | Offset(8 LE)
//! HeaderLength:= u32 LE, length of the sealed header
//! ```

use crate::backend::{Backend, cancellable};
use crate::crypto::{CRYPTO_OVERHEAD, Key};
use crate::types::ID_SIZE;
use crate::{BlobHandle, BlobType, Error, FileType, Handle, Id, PackId, Result};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const HEADER_ENTRY_SIZE: usize = 1 + ID_SIZE + 4 + 8;
pub const HEADER_LENGTH_SIZE: usize = 4;
const HEADER_TAG: u8 = 0x10;

/// Header entries fetched with the trailer in one request; larger headers
/// need a second read.
const EAGER_ENTRIES: usize = 15;

/// Associated data binding a sealed blob to its type and id.
pub fn blob_aad(handle: &BlobHandle) -> [u8; 1 + ID_SIZE] {
    let mut aad = [0u8; 1 + ID_SIZE];
    aad[0] = handle.blob_type.to_byte();
    aad[1..].copy_from_slice(handle.id.as_bytes());
    aad
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderEntry {
    pub blob_type: BlobType,
    pub id: Id,
    /// Sealed length in bytes.
    pub length: u32,
    pub offset: u64,
}

impl HeaderEntry {
    pub fn handle(&self) -> BlobHandle {
        BlobHandle::new(self.blob_type, self.id)
    }

    pub fn plaintext_length(&self) -> usize {
        (self.length as usize).saturating_sub(CRYPTO_OVERHEAD)
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.blob_type.to_byte());
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }

    /// `raw` must be exactly [`HEADER_ENTRY_SIZE`] bytes.
    pub(crate) fn decode(raw: &[u8]) -> std::result::Result<Self, String> {
        if raw.len() != HEADER_ENTRY_SIZE {
            return Err(format!("header entry has {} bytes", raw.len()));
        }
        let blob_type =
            BlobType::from_byte(raw[0]).ok_or_else(|| format!("unknown blob type {}", raw[0]))?;
        let id = Id::from_slice(&raw[1..1 + ID_SIZE]).ok_or("bad id")?;
        let mut length = [0u8; 4];
        length.copy_from_slice(&raw[1 + ID_SIZE..5 + ID_SIZE]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&raw[5 + ID_SIZE..]);
        Ok(Self {
            blob_type,
            id,
            length: u32::from_le_bytes(length),
            offset: u64::from_le_bytes(offset),
        })
    }
}

/// A finalized pack ready for upload.
#[derive(Debug, Clone)]
pub struct FinishedPack {
    pub id: PackId,
    pub data: Bytes,
    pub entries: Vec<HeaderEntry>,
}

/// Accumulates sealed blobs; [`PackWriter::finalize`] appends the header trailer.
#[derive(Debug, Default)]
pub struct PackWriter {
    buf: Vec<u8>,
    entries: Vec<HeaderEntry>,
}

impl PackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seals `plaintext` for `handle` and appends it.
    pub fn add(&mut self, key: &Key, handle: BlobHandle, plaintext: &[u8]) -> Result<HeaderEntry> {
        let sealed = key.seal(plaintext, &blob_aad(&handle))?;
        self.add_sealed(handle, &sealed)
    }

    /// Appends a blob that was already sealed with [`blob_aad`].
    pub fn add_sealed(&mut self, handle: BlobHandle, sealed: &[u8]) -> Result<HeaderEntry> {
        let length = u32::try_from(sealed.len())
            .map_err(|_| Error::Other(format!("blob {handle} is too large for a pack")))?;
        let entry = HeaderEntry {
            blob_type: handle.blob_type,
            id: handle.id,
            length,
            offset: self.buf.len() as u64,
        };
        self.buf.extend_from_slice(sealed);
        self.entries.push(entry);
        Ok(entry)
    }

    /// Bytes of sealed blob data buffered so far.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self, target_size: usize) -> bool {
        self.buf.len() >= target_size
    }

    pub fn entries(&self) -> &[HeaderEntry] {
        &self.entries
    }

    pub fn finalize(self, key: &Key) -> Result<FinishedPack> {
        if self.entries.is_empty() {
            return Err(Error::Other("cannot finalize an empty pack".to_string()));
        }
        let mut buf = self.buf;

        let mut header = Vec::with_capacity(self.entries.len() * HEADER_ENTRY_SIZE);
        for entry in &self.entries {
            entry.encode_into(&mut header);
        }
        let sealed_header = key.seal(&header, &[HEADER_TAG])?;
        let header_len = u32::try_from(sealed_header.len())
            .map_err(|_| Error::Other("pack header too large".to_string()))?;

        buf.extend_from_slice(&sealed_header);
        buf.extend_from_slice(&header_len.to_le_bytes());

        let id = Id::from_data(&buf);
        debug!(pack = %id.short_string(), blobs = self.entries.len(), size = buf.len(), "finalized pack");
        Ok(FinishedPack {
            id,
            data: Bytes::from(buf),
            entries: self.entries,
        })
    }
}

fn malformed(pack_id: &PackId, reason: impl Into<String>) -> Error {
    Error::integrity(format!("pack {pack_id}"), reason)
}

/// Opens a sealed header and checks that its entries exactly tile the first
/// `blobs_end` bytes of the pack.
fn open_header(
    key: &Key,
    pack_id: &PackId,
    sealed_header: &[u8],
    blobs_end: u64,
) -> Result<Vec<HeaderEntry>> {
    let plain = key
        .open(sealed_header, &[HEADER_TAG])
        .map_err(|e| e.for_object(format!("pack {pack_id} header")))?;

    if plain.is_empty() || plain.len() % HEADER_ENTRY_SIZE != 0 {
        return Err(malformed(
            pack_id,
            format!("header size {} is not a multiple of {}", plain.len(), HEADER_ENTRY_SIZE),
        ));
    }

    let mut entries = Vec::with_capacity(plain.len() / HEADER_ENTRY_SIZE);
    let mut expected_offset = 0u64;
    for raw in plain.chunks_exact(HEADER_ENTRY_SIZE) {
        let entry = HeaderEntry::decode(raw).map_err(|reason| malformed(pack_id, reason))?;
        if entry.offset != expected_offset {
            return Err(malformed(
                pack_id,
                format!("blob {} at offset {}, expected {}", entry.id, entry.offset, expected_offset),
            ));
        }
        if (entry.length as usize) < CRYPTO_OVERHEAD {
            return Err(malformed(pack_id, format!("blob {} is too short", entry.id)));
        }
        expected_offset += entry.length as u64;
        if expected_offset > blobs_end {
            return Err(malformed(pack_id, format!("blob {} extends into the header", entry.id)));
        }
        entries.push(entry);
    }
    if expected_offset != blobs_end {
        return Err(malformed(pack_id, "unaccounted bytes before the header"));
    }
    Ok(entries)
}

fn header_length(pack_id: &PackId, tail: &[u8], pack_size: u64) -> Result<u64> {
    if tail.len() < HEADER_LENGTH_SIZE {
        return Err(malformed(pack_id, "pack is too short"));
    }
    let mut raw = [0u8; HEADER_LENGTH_SIZE];
    raw.copy_from_slice(&tail[tail.len() - HEADER_LENGTH_SIZE..]);
    let len = u32::from_le_bytes(raw) as u64;
    if len < CRYPTO_OVERHEAD as u64 || len + HEADER_LENGTH_SIZE as u64 > pack_size {
        return Err(malformed(pack_id, format!("invalid header length {len}")));
    }
    Ok(len)
}

/// Reads the header of a pack that is fully in memory.
pub fn list_blobs(key: &Key, pack_id: &PackId, pack: &[u8]) -> Result<Vec<HeaderEntry>> {
    let size = pack.len() as u64;
    let header_len = header_length(pack_id, pack, size)?;
    let header_end = pack.len() - HEADER_LENGTH_SIZE;
    let header_start = header_end - header_len as usize;
    open_header(key, pack_id, &pack[header_start..header_end], header_start as u64)
}

/// Opens one sealed blob and checks that its plaintext hashes to its id.
pub fn open_blob(key: &Key, handle: &BlobHandle, sealed: &[u8]) -> Result<Vec<u8>> {
    let plaintext = key
        .open(sealed, &blob_aad(handle))
        .map_err(|e| e.for_object(format!("blob {handle}")))?;
    if Id::from_data(&plaintext) != handle.id {
        return Err(Error::integrity(format!("blob {handle}"), "content hash mismatch"));
    }
    Ok(plaintext)
}

/// Seeks to the trailer of a stored pack and returns its verified header.
pub async fn read_header(
    backend: &dyn Backend,
    key: &Key,
    pack_id: &PackId,
    token: &CancellationToken,
) -> Result<Vec<HeaderEntry>> {
    let handle = Handle::for_id(FileType::Pack, pack_id);
    let size = cancellable(token, backend.stat(&handle)).await?.size;
    if size < (HEADER_LENGTH_SIZE + CRYPTO_OVERHEAD) as u64 {
        return Err(malformed(pack_id, format!("pack is only {size} bytes")));
    }

    let eager = size.min((EAGER_ENTRIES * HEADER_ENTRY_SIZE + CRYPTO_OVERHEAD + HEADER_LENGTH_SIZE) as u64);
    let tail = cancellable(token, backend.load(&handle, eager as usize, size - eager)).await?;
    if tail.len() as u64 != eager {
        return Err(malformed(pack_id, "short read of pack trailer"));
    }

    let header_len = header_length(pack_id, &tail, size)?;
    let header_start = size - HEADER_LENGTH_SIZE as u64 - header_len;
    let sealed_header = if header_len + HEADER_LENGTH_SIZE as u64 <= eager {
        let end = tail.len() - HEADER_LENGTH_SIZE;
        tail.slice(end - header_len as usize..end)
    } else {
        let data = cancellable(token, backend.load(&handle, header_len as usize, header_start)).await?;
        if data.len() as u64 != header_len {
            return Err(malformed(pack_id, "short read of pack header"));
        }
        data
    };

    open_header(key, pack_id, &sealed_header, header_start)
}

/// Ranged read of a single blob, verified before it is returned.
pub async fn load_blob(
    backend: &dyn Backend,
    key: &Key,
    pack_id: &PackId,
    entry: &HeaderEntry,
    token: &CancellationToken,
) -> Result<Vec<u8>> {
    let handle = Handle::for_id(FileType::Pack, pack_id);
    let sealed = cancellable(
        token,
        backend.load(&handle, entry.length as usize, entry.offset),
    )
    .await?;
    if sealed.len() != entry.length as usize {
        return Err(malformed(
            pack_id,
            format!("short read of blob {} ({} of {} bytes)", entry.id, sealed.len(), entry.length),
        ));
    }
    open_blob(key, &entry.handle(), &sealed).map_err(|e| match e {
        Error::Integrity { object, reason } => Error::Integrity {
            object: format!("{object} in pack {pack_id}"),
            reason,
        },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::chunker::ChunkerParams;
    use crate::crypto::MasterKey;

    fn blob(t: BlobType, data: &[u8]) -> (BlobHandle, Vec<u8>) {
        (BlobHandle::new(t, Id::from_data(data)), data.to_vec())
    }

    fn sample_blobs() -> Vec<(BlobHandle, Vec<u8>)> {
        vec![
            blob(BlobType::Data, b""),
            blob(BlobType::Data, b"hello"),
            blob(BlobType::Tree, br#"{"nodes":[]}"#),
            blob(BlobType::Data, &vec![0xAB; 64 * 1024]),
            // The largest chunk the default chunker can emit.
            blob(BlobType::Data, &vec![0x5C; ChunkerParams::default().max_size]),
        ]
    }

    #[test]
    fn test_entry_encoding() {
        let entry = HeaderEntry {
            blob_type: BlobType::Tree,
            id: Id::from_data(b"x"),
            length: 0x01020304,
            offset: 0x0A0B0C0D0E0F,
        };
        let mut raw = Vec::new();
        entry.encode_into(&mut raw);
        assert_eq!(raw.len(), HEADER_ENTRY_SIZE);
        assert_eq!(raw[0], 1);
        assert_eq!(&raw[1..33], entry.id.as_bytes());
        assert_eq!(&raw[33..37], &[4, 3, 2, 1]);
        assert_eq!(&raw[37..45], &[0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A, 0, 0]);
        assert_eq!(HeaderEntry::decode(&raw).unwrap(), entry);
    }

    #[test]
    fn test_pack_layout_and_roundtrip() {
        let key = Key::new(&MasterKey::generate());
        let blobs = sample_blobs();
        let mut writer = PackWriter::new();
        for (handle, data) in &blobs {
            writer.add(&key, *handle, data).unwrap();
        }
        assert_eq!(writer.count(), blobs.len());
        let blob_bytes = writer.size();
        let pack = writer.finalize(&key).unwrap();

        let expected_header = blobs.len() * HEADER_ENTRY_SIZE + CRYPTO_OVERHEAD;
        assert_eq!(pack.data.len(), blob_bytes + expected_header + HEADER_LENGTH_SIZE);
        let trailer = &pack.data[pack.data.len() - 4..];
        assert_eq!(u32::from_le_bytes(trailer.try_into().unwrap()) as usize, expected_header);
        assert_eq!(pack.id, Id::from_data(&pack.data));

        let entries = list_blobs(&key, &pack.id, &pack.data).unwrap();
        assert_eq!(entries, pack.entries);
        for ((handle, data), entry) in blobs.iter().zip(&entries) {
            assert_eq!(entry.handle(), *handle);
            assert_eq!(entry.plaintext_length(), data.len());
            let start = entry.offset as usize;
            let sealed = &pack.data[start..start + entry.length as usize];
            assert_eq!(&open_blob(&key, handle, sealed).unwrap(), data);
        }
    }

    #[test]
    fn test_empty_writer_cannot_finalize() {
        let key = Key::new(&MasterKey::generate());
        assert!(PackWriter::new().finalize(&key).is_err());
    }

    #[test]
    fn test_corrupted_header_is_integrity_error() {
        let key = Key::new(&MasterKey::generate());
        let mut writer = PackWriter::new();
        let (h, d) = blob(BlobType::Data, b"payload");
        writer.add(&key, h, &d).unwrap();
        let pack = writer.finalize(&key).unwrap();

        let mut data = pack.data.to_vec();
        let n = data.len();
        data[n - 10] ^= 0xFF;
        assert!(list_blobs(&key, &pack.id, &data).unwrap_err().is_integrity());

        let mut data = pack.data.to_vec();
        data[n - 1] = 0x7F;
        assert!(list_blobs(&key, &pack.id, &data).unwrap_err().is_integrity());

        assert!(list_blobs(&key, &pack.id, &pack.data[..3]).unwrap_err().is_integrity());
    }

    #[test]
    fn test_blob_bound_to_its_identity() {
        let key = Key::new(&MasterKey::generate());
        let (h, d) = blob(BlobType::Data, b"content");
        let sealed = key.seal(&d, &blob_aad(&h)).unwrap();

        let as_tree = BlobHandle::new(BlobType::Tree, h.id);
        assert!(open_blob(&key, &as_tree, &sealed).unwrap_err().is_integrity());

        let other = BlobHandle::new(BlobType::Data, Id::from_data(b"other"));
        assert!(open_blob(&key, &other, &sealed).unwrap_err().is_integrity());
    }

    #[tokio::test]
    async fn test_ranged_reads_from_backend() {
        let key = Key::new(&MasterKey::generate());
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();

        // Enough entries to overflow the eager trailer read.
        let mut writer = PackWriter::new();
        let mut blobs = Vec::new();
        for i in 0..40u32 {
            let data = i.to_le_bytes().repeat(i as usize);
            let handle = BlobHandle::new(BlobType::Data, Id::from_data(&data));
            writer.add(&key, handle, &data).unwrap();
            blobs.push((handle, data));
        }
        let pack = writer.finalize(&key).unwrap();
        backend
            .save(&Handle::for_id(FileType::Pack, &pack.id), pack.data.clone())
            .await
            .unwrap();

        let entries = read_header(&backend, &key, &pack.id, &token).await.unwrap();
        assert_eq!(entries.len(), 40);
        for ((handle, data), entry) in blobs.iter().zip(&entries) {
            assert_eq!(entry.handle(), *handle);
            let loaded = load_blob(&backend, &key, &pack.id, entry, &token).await.unwrap();
            assert_eq!(&loaded, data);
        }
    }

    #[tokio::test]
    async fn test_small_header_read_in_one_request() {
        let key = Key::new(&MasterKey::generate());
        let backend = MemoryBackend::new();
        let token = CancellationToken::new();

        let mut writer = PackWriter::new();
        let (h, d) = blob(BlobType::Tree, b"tree");
        writer.add(&key, h, &d).unwrap();
        let pack = writer.finalize(&key).unwrap();
        backend
            .save(&Handle::for_id(FileType::Pack, &pack.id), pack.data.clone())
            .await
            .unwrap();

        let entries = read_header(&backend, &key, &pack.id, &token).await.unwrap();
        assert_eq!(entries, pack.entries);
    }
}
