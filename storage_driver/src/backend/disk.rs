//! Local directory backend.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use fs2::FileExt;
use object_store::{local::LocalFileSystem, ObjectStore};
use tracing::info;

use super::LOCK_KEY;
use crate::{Error, Result};

/// Chunk size for streamed writes (16 KiB).
pub(super) const WRITE_CHUNK_SIZE: usize = 16 * 1024;

/// Blob store rooted at a local directory.
///
/// The directory is locked for the lifetime of the store so that two
/// processes never write to it at once. The lock file lives inside the
/// directory under [`LOCK_KEY`].
pub struct DiskStorage {
    object_store: Arc<dyn ObjectStore>,
    base_path: PathBuf,
    lock_file: Mutex<Option<File>>,
}

impl DiskStorage {
    /// Opens (creating if needed) the store at `base_path` and takes its
    /// lock.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;

        let lock_path = base_path.join(LOCK_KEY);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if let Err(err) = lock_file.try_lock_exclusive() {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(Error::Locked {
                    path: lock_path.display().to_string(),
                });
            }
            return Err(err.into());
        }

        let object_store = LocalFileSystem::new_with_prefix(&base_path)?;
        info!(path = %base_path.display(), "opened disk storage");

        Ok(Self {
            object_store: Arc::new(object_store),
            base_path,
            lock_file: Mutex::new(Some(lock_file)),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub(super) fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    /// Releases the directory lock. Later calls are no-ops.
    pub(super) fn close(&self) -> Result<()> {
        let lock_file = self
            .lock_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lock_file) = lock_file {
            FileExt::unlock(&lock_file)?;
            info!(path = %self.base_path.display(), "closed disk storage");
        }
        Ok(())
    }
}
