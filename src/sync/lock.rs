//! Per-pin lock files, so the fetch slot holds across processes sharing one
//! data directory.
//!
//! The lock is released when the file handle is dropped, or by the OS if the
//! holding process dies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use super::SyncError;
use crate::store::PinId;

#[derive(Debug, Clone)]
pub struct AlbumLocks {
    dir: PathBuf,
}

impl AlbumLocks {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, pin_id: PinId) -> PathBuf {
        self.dir.join(format!("album-{}.lock", pin_id))
    }

    /// Take the pin's lock file. `Ok(None)` when another holder has it.
    pub async fn try_acquire(&self, pin_id: PinId) -> Result<Option<File>, SyncError> {
        let dir = self.dir.clone();
        let lock_path = self.path_for(pin_id);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|source| SyncError::Lock {
                path: dir.clone(),
                source,
            })?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|source| SyncError::Lock {
                    path: lock_path.clone(),
                    source,
                })?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok(Some(file)),
                Err(e) => {
                    tracing::debug!(
                        pin_id = %pin_id,
                        lock = %lock_path.display(),
                        error = %e,
                        "Album lock held elsewhere"
                    );
                    Ok(None)
                }
            }
        })
        .await?
    }
}
