//! Append-only value files
//!
//! A value file aggregates sequence data from many unrelated segments.
//! Exactly one is open for writing per node; any number may be read.
//! Files live at `<repository>/<id mod 1000>/<id>` so no directory grows
//! without bound.

use crate::catalog::Catalog;
use bytes::Bytes;
use chrono::Utc;
use cumulus_core::error::Result;
use cumulus_core::model::{CollectionId, ValueFileRow};
use cumulus_core::Md5Digest;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Location of a value file inside the repository
pub fn value_file_path(repository_path: &Path, value_file_id: u64) -> PathBuf {
    repository_path
        .join(format!("{:03}", value_file_id % 1000))
        .join(format!("{:08}", value_file_id))
}

/// Opens, reads and reconciles the value files of one repository
#[derive(Clone)]
pub struct ValueFileStore {
    repository_path: PathBuf,
    catalog: Catalog,
}

impl ValueFileStore {
    pub fn new(repository_path: impl Into<PathBuf>, catalog: Catalog) -> Self {
        Self {
            repository_path: repository_path.into(),
            catalog,
        }
    }

    pub fn repository_path(&self) -> &Path {
        &self.repository_path
    }

    /// Allocate a catalog row in the open state and create its backing file
    pub fn open_for_write(&self) -> Result<OutputValueFile> {
        let id = self.catalog.next_id()?;
        let path = value_file_path(&self.repository_path, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        let row = ValueFileRow::open(id, Utc::now());
        self.catalog.put_value_file(&row)?;

        debug!(value_file_id = id, path = ?path, "Opened value file");
        Ok(OutputValueFile {
            row,
            path,
            writer: BufWriter::new(file),
            md5: md5::Context::new(),
            dirty: false,
            catalog: self.catalog.clone(),
        })
    }

    /// Random-access read of `size` bytes at `offset`
    pub fn read(&self, value_file_id: u64, offset: u64, size: u64) -> Result<Bytes> {
        let path = value_file_path(&self.repository_path, value_file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size as usize];
        file.read_exact(&mut buffer)?;
        Ok(Bytes::from(buffer))
    }

    /// Close every value file a previous process left open
    ///
    /// Bytes already on disk stay valid. A file that never received any
    /// bytes is removed outright. Returns the number of rows touched.
    pub fn reconcile_at_startup(&self) -> Result<usize> {
        let mut reconciled = 0;
        for mut row in self.catalog.value_files()? {
            if !row.is_open() {
                continue;
            }
            reconciled += 1;

            let path = value_file_path(&self.repository_path, row.id);
            let size = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };

            if size == 0 {
                warn!(value_file_id = row.id, "Removing empty value file left open");
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                self.catalog.remove_value_file(row.id)?;
                continue;
            }

            row.size = size;
            row.hash = Some(hash_file(&path)?);
            row.close_time = Some(Utc::now());
            self.catalog.put_value_file(&row)?;
            warn!(value_file_id = row.id, size, "Closed value file left open");
        }

        if reconciled > 0 {
            info!(reconciled, "Reconciled value files at startup");
        }
        Ok(reconciled)
    }
}

fn hash_file(path: &Path) -> Result<Md5Digest> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(Md5Digest(context.compute().0))
}

/// The one value file currently open for writing
pub struct OutputValueFile {
    row: ValueFileRow,
    path: PathBuf,
    writer: BufWriter<File>,
    md5: md5::Context,
    dirty: bool,
    catalog: Catalog,
}

impl OutputValueFile {
    pub fn id(&self) -> u64 {
        self.row.id
    }

    pub fn size(&self) -> u64 {
        self.row.size
    }

    pub fn sequence_count(&self) -> u64 {
        self.row.sequence_count
    }

    /// Append one sequence; returns the offset it was written at
    ///
    /// Does not sync.
    pub fn write_sequence(&mut self, collection_id: CollectionId, segment_id: u64, data: &[u8]) -> Result<u64> {
        let offset = self.row.size;
        self.writer.write_all(data)?;
        self.md5.consume(data);
        self.dirty = true;

        self.row.size += data.len() as u64;
        self.row.sequence_count += 1;
        self.row.min_segment_id = Some(self.row.min_segment_id.map_or(segment_id, |m| m.min(segment_id)));
        self.row.max_segment_id = Some(self.row.max_segment_id.map_or(segment_id, |m| m.max(segment_id)));
        self.row.collection_ids.insert(collection_id);

        Ok(offset)
    }

    /// Flush to stable storage; free when nothing was written since the last sync
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.dirty = false;
        Ok(())
    }

    /// Sync and record final metadata, or delete the file if nothing was written
    pub fn close(mut self) -> Result<()> {
        self.sync()?;

        if self.row.sequence_count == 0 {
            debug!(value_file_id = self.row.id, "Deleting empty value file");
            drop(self.writer);
            fs::remove_file(&self.path)?;
            self.catalog.remove_value_file(self.row.id)?;
            return Ok(());
        }

        self.row.close_time = Some(Utc::now());
        self.row.hash = Some(Md5Digest(self.md5.compute().0));
        self.row.distinct_collection_count = self.row.collection_ids.len() as u32;
        self.catalog.put_value_file(&self.row)?;

        info!(
            value_file_id = self.row.id,
            size = self.row.size,
            sequences = self.row.sequence_count,
            "Closed value file"
        );
        Ok(())
    }
}

impl std::fmt::Debug for OutputValueFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputValueFile")
            .field("id", &self.row.id)
            .field("size", &self.row.size)
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ValueFileStore, Catalog) {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::temporary().unwrap();
        let store = ValueFileStore::new(dir.path(), catalog.clone());
        (dir, store, catalog)
    }

    #[test]
    fn test_path_is_sharded() {
        let path = value_file_path(Path::new("/repo"), 123_456);
        assert_eq!(path, PathBuf::from("/repo/456/00123456"));
    }

    #[test]
    fn test_write_close_and_read() {
        let (_dir, store, catalog) = store();
        let mut output = store.open_for_write().unwrap();
        let id = output.id();

        assert_eq!(output.write_sequence(1, 10, b"hello ").unwrap(), 0);
        assert_eq!(output.write_sequence(2, 11, b"world").unwrap(), 6);
        output.sync().unwrap();

        assert_eq!(store.read(id, 6, 5).unwrap().as_ref(), b"world");

        output.close().unwrap();
        let row = catalog.get_value_file(id).unwrap().unwrap();
        assert!(!row.is_open());
        assert_eq!(row.size, 11);
        assert_eq!(row.sequence_count, 2);
        assert_eq!(row.min_segment_id, Some(10));
        assert_eq!(row.max_segment_id, Some(11));
        assert_eq!(row.distinct_collection_count, 2);
        assert_eq!(row.hash, Some(Md5Digest::compute(b"hello world")));
    }

    #[test]
    fn test_empty_file_is_pruned_on_close() {
        let (dir, store, catalog) = store();
        let output = store.open_for_write().unwrap();
        let id = output.id();
        assert!(catalog.get_value_file(id).unwrap().is_some());

        output.close().unwrap();
        assert!(catalog.get_value_file(id).unwrap().is_none());
        assert!(!value_file_path(dir.path(), id).exists());
    }

    #[test]
    fn test_reconcile_closes_abandoned_files() {
        let (_dir, store, catalog) = store();

        let mut abandoned = store.open_for_write().unwrap();
        let abandoned_id = abandoned.id();
        abandoned.write_sequence(1, 1, b"durable bytes").unwrap();
        abandoned.sync().unwrap();
        drop(abandoned);

        let empty = store.open_for_write().unwrap();
        let empty_id = empty.id();
        drop(empty);

        assert_eq!(store.reconcile_at_startup().unwrap(), 2);

        let row = catalog.get_value_file(abandoned_id).unwrap().unwrap();
        assert!(!row.is_open());
        assert_eq!(row.size, 13);
        assert!(catalog.get_value_file(empty_id).unwrap().is_none());

        assert_eq!(store.reconcile_at_startup().unwrap(), 0);
    }
}
