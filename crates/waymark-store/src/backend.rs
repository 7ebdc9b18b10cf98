//! Durable byte storage behind the [`SceneDatabase`](crate::database::SceneDatabase).
//!
//! The database only needs "load all bytes" and "replace all bytes". A write
//! must be all-or-nothing: after a crash mid-save the previous complete store
//! is still readable. [`FileBackend`] gets there with write-to-temp, fsync,
//! rename.

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::StoreError;

/// Raw load/save of the serialized store.
pub trait StoreBackend {
    /// Returns `Ok(None)` when nothing has been saved yet.
    fn load_raw(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the stored bytes atomically.
    fn save_raw(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// FileBackend
// ---------------------------------------------------------------------------

/// Stores the database as a single file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl StoreBackend for FileBackend {
    fn load_raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(&self.path, err)),
        }
    }

    fn save_raw(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(parent, e))?;
        }
        let tmp_path = self.tmp_path();
        {
            let file = File::create(&tmp_path).map_err(|e| self.io_error(&tmp_path, e))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(bytes)
                .and_then(|_| writer.flush())
                .map_err(|e| self.io_error(&tmp_path, e))?;
            let file = writer
                .into_inner()
                .map_err(|e| self.io_error(&tmp_path, e.into_error()))?;
            file.sync_all().map_err(|e| self.io_error(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "store file replaced");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// Keeps the serialized store in memory.
///
/// Clones share the same buffer, so a test can hand one clone to a database,
/// drop it, and reopen a second database from another clone to simulate a
/// process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    bytes: Rc<RefCell<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents, if anything was saved.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.bytes.borrow().clone()
    }

    /// Overwrite the contents directly (e.g. to simulate corruption).
    pub fn set_contents(&self, bytes: Vec<u8>) {
        *self.bytes.borrow_mut() = Some(bytes);
    }
}

impl StoreBackend for MemoryBackend {
    fn load_raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.bytes.borrow().clone())
    }

    fn save_raw(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        *self.bytes.borrow_mut() = Some(bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "<memory>".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
