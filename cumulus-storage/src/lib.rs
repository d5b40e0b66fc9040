//! Cumulus Storage
//!
//! Durable per-node storage for erasure-coded shares:
//! - `Catalog` sled-backed tables for segments, sequences, value files and conjoined uploads
//! - `ValueFileStore` append-only value files, sharded by file id
//! - `Writer` the segment write path and its active-segment table
//! - `Reader` the segment read path
//! - `VersionVisibility` current-version lookup used by the retriever

pub mod catalog;
pub mod reader;
pub mod value_file;
pub mod visibility;
pub mod writer;

pub use catalog::Catalog;
pub use reader::Reader;
pub use value_file::{value_file_path, OutputValueFile, ValueFileStore};
pub use visibility::{CatalogVisibility, VersionVisibility, VisibleSegment};
pub use writer::{ConjoinedUpdate, FileFinal, NewSegment, SequenceWrite, Writer, WriterConfig};

use cumulus_core::error::Result;
use std::path::PathBuf;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory; value files live under `repository/`, the catalog under `catalog/`
    pub path: PathBuf,

    /// Maximum value file size before rollover
    pub max_value_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./cumulus_data"),
            max_value_file_size: cumulus_core::DEFAULT_MAX_VALUE_FILE_SIZE,
        }
    }
}

impl StorageConfig {
    /// Create a new storage config with the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the rollover size
    pub fn with_max_value_file_size(mut self, bytes: u64) -> Self {
        self.max_value_file_size = bytes;
        self
    }

    pub fn repository_path(&self) -> PathBuf {
        self.path.join("repository")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.path.join("catalog")
    }
}

/// Everything a node needs to read and write its shares
pub struct NodeStorage {
    pub catalog: Catalog,
    pub store: ValueFileStore,
    pub config: StorageConfig,
}

impl NodeStorage {
    /// Open the catalog and close any value files a crashed process left open
    pub fn open(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(config.repository_path())?;
        let catalog = Catalog::open(config.catalog_path())?;
        let store = ValueFileStore::new(config.repository_path(), catalog.clone());
        store.reconcile_at_startup()?;
        Ok(Self {
            catalog,
            store,
            config,
        })
    }

    pub fn writer(&self) -> Writer {
        Writer::new(
            self.catalog.clone(),
            self.store.clone(),
            WriterConfig {
                max_value_file_size: self.config.max_value_file_size,
            },
        )
    }

    pub fn reader(&self) -> Reader {
        Reader::new(self.catalog.clone(), self.store.clone())
    }

    pub fn visibility(&self) -> CatalogVisibility {
        CatalogVisibility::new(self.catalog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let storage = NodeStorage::open(StorageConfig::new(dir.path()).with_max_value_file_size(64)).unwrap();
        assert!(dir.path().join("repository").is_dir());
        assert_eq!(storage.config.max_value_file_size, 64);
    }
}
