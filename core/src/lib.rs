pub mod backend;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod layout;
pub mod pack;
pub mod repository;
pub mod types;

pub use backend::{Backend, Limited, ListVisitor, MemoryBackend};
pub use chunker::{Chunk, Chunker, ChunkerParams, Pol};
pub use config::{KdfCost, RepositoryOptions};
pub use error::{Error, Result};
pub use index::{BlobLocation, Index, Reconciliation};
pub use layout::{Layout, LayoutKind, detect_layout};
pub use repository::{RepoState, Repository};
pub use types::*;
