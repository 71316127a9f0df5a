use crate::chunker::ChunkerParams;
use crate::{Error, KdfParams, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PACK_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CONNECTIONS: usize = 20;

/// Tunables for one open repository handle. Nothing in here is persisted
/// except `chunker` and `kdf`, which only matter when creating a repository
/// or a new key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryOptions {
    /// Packs are finalized once their sealed blobs reach this many bytes.
    pub pack_size: usize,
    /// Upper bound on concurrent backend calls.
    pub connections: usize,
    pub chunker: ChunkerParams,
    pub kdf: KdfCost,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfCost {
    pub iterations: u32,
    /// Memory cost in KiB.
    pub memory: u32,
    pub parallelism: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            iterations: 3,
            memory: 65536,
            parallelism: 4,
        }
    }
}

impl KdfCost {
    /// Fresh parameters with a new random salt.
    pub fn params(&self) -> KdfParams {
        KdfParams::argon2id(self.iterations, self.memory, self.parallelism)
    }
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            pack_size: DEFAULT_PACK_SIZE,
            connections: DEFAULT_CONNECTIONS,
            chunker: ChunkerParams::default(),
            kdf: KdfCost::default(),
        }
    }
}

impl RepositoryOptions {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pack_size == 0 {
            return Err(Error::Config("pack_size must be greater than zero".to_string()));
        }
        if self.connections == 0 {
            return Err(Error::Config(
                "connections must be greater than zero".to_string(),
            ));
        }
        if self.kdf.iterations == 0 || self.kdf.parallelism == 0 {
            return Err(Error::Config(
                "kdf iterations and parallelism must be greater than zero".to_string(),
            ));
        }
        self.chunker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = RepositoryOptions::default();
        options.validate().unwrap();
        assert_eq!(options.pack_size, 16 * 1024 * 1024);
        assert_eq!(options.connections, 20);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let options = RepositoryOptions::from_toml_str(
            r#"
            pack_size = 4194304
            connections = 5

            [kdf]
            iterations = 1
            "#,
        )
        .unwrap();
        assert_eq!(options.pack_size, 4 * 1024 * 1024);
        assert_eq!(options.connections, 5);
        assert_eq!(options.kdf.iterations, 1);
        assert_eq!(options.kdf.memory, 65536);
        assert_eq!(options.chunker, ChunkerParams::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            RepositoryOptions::from_toml_str("connections = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RepositoryOptions::from_toml_str("pack_size = \"big\""),
            Err(Error::Config(_))
        ));
        assert!(RepositoryOptions::from_toml_str(
            "[chunker]\nmin_size = 512\navg_size = 1000\nmax_size = 4096"
        )
        .is_err());
    }
}
