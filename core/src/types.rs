use crate::chunker::{ChunkerParams, Pol, validate_polynomial};
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const ID_SIZE: usize = 32;

/// Content address used for blobs, packs, index objects and key files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn new(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self::from(blake3::hash(data))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for Id {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short_string())
    }
}

pub type PackId = Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlobType {
    Data,
    Tree,
}

impl BlobType {
    pub fn to_byte(self) -> u8 {
        match self {
            BlobType::Data => 0,
            BlobType::Tree => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(BlobType::Data),
            1 => Some(BlobType::Tree),
            _ => None,
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobType::Data => write!(f, "data"),
            BlobType::Tree => write!(f, "tree"),
        }
    }
}

/// Identity of a blob: two blobs with equal handles have identical plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHandle {
    pub blob_type: BlobType,
    pub id: Id,
}

impl BlobHandle {
    pub fn new(blob_type: BlobType, id: Id) -> Self {
        Self { blob_type, id }
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/{}>", self.blob_type, self.id.short_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Config,
    Pack,
    Index,
    Snapshot,
    Key,
    Lock,
}

impl FileType {
    pub const ALL: [FileType; 6] = [
        FileType::Config,
        FileType::Pack,
        FileType::Index,
        FileType::Snapshot,
        FileType::Key,
        FileType::Lock,
    ];
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Config => "config",
            FileType::Pack => "data",
            FileType::Index => "index",
            FileType::Snapshot => "snapshot",
            FileType::Key => "key",
            FileType::Lock => "lock",
        };
        f.write_str(name)
    }
}

/// Abstract address of one backend object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    pub fn config() -> Self {
        Self::new(FileType::Config, "")
    }

    pub fn for_id(file_type: FileType, id: &Id) -> Self {
        Self::new(file_type, id.to_hex())
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_type != FileType::Config && self.name.is_empty() {
            return Err(Error::InvalidHandle(format!(
                "{} handle has an empty name",
                self.file_type
            )));
        }
        if self.name.contains('/') || self.name.contains('\\') {
            return Err(Error::InvalidHandle(format!(
                "name {:?} contains a path separator",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file_type == FileType::Config {
            return write!(f, "<config>");
        }
        let short: String = self.name.chars().take(8).collect();
        write!(f, "<{}/{}>", self.file_type, short)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub chunker_polynomial: Pol,
    pub chunker: ChunkerParams,
}

impl RepoConfig {
    pub const VERSION: u32 = 1;

    /// Fresh configuration with a random irreducible chunker polynomial.
    pub fn generate(chunker: ChunkerParams) -> Result<Self> {
        Ok(Self {
            version: Self::VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            chunker_polynomial: Pol::random()?,
            chunker,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != Self::VERSION {
            return Err(Error::InvalidFormatVersion {
                version: self.version,
            });
        }
        validate_polynomial(self.chunker_polynomial)?;
        self.chunker.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

impl KdfParams {
    pub fn argon2id(iterations: u32, memory: u32, parallelism: u32) -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations,
            memory,
            parallelism,
            salt,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::argon2id(3, 65536, 4)
    }
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_hex_roundtrip() {
        let id = Id::from_data(b"hello");
        let parsed: Id = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short_string().len(), 8);
        assert!("abcd".parse::<Id>().is_err());
    }

    #[test]
    fn test_handle_validation() {
        assert!(Handle::config().validate().is_ok());
        assert!(Handle::new(FileType::Pack, "").validate().is_err());
        assert!(Handle::new(FileType::Index, "../etc").validate().is_err());
        assert!(Handle::for_id(FileType::Key, &Id::from_data(b"k")).validate().is_ok());
    }

    #[test]
    fn test_blob_type_bytes() {
        for t in [BlobType::Data, BlobType::Tree] {
            assert_eq!(BlobType::from_byte(t.to_byte()), Some(t));
        }
        assert_eq!(BlobType::from_byte(7), None);
    }

    #[test]
    fn test_repo_config_rejects_small_polynomial() {
        let mut config = RepoConfig::generate(ChunkerParams::default()).unwrap();
        assert!(config.validate().is_ok());

        config.chunker_polynomial = Pol::new(0b1011);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_kdf_params_json_uses_base64_salt() {
        let params = KdfParams::argon2id(1, 8, 1);
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"salt\":\""));
        let back: KdfParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
