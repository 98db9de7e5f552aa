//! Atomic JSON document repository.
//!
//! Every persisted document (miners config, profiles, settings, generated
//! miner configs) goes through the same write protocol: sibling temp file,
//! write, fsync, chmod, rename. A reader never observes a partial write.

use crate::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

type DefaultsFn<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Typed JSON document bound to one on-disk path.
///
/// `load`/`exists` take the read lock, `save`/`update`/`delete` the write
/// lock; `update` performs load -> mutate -> save under a single write guard.
pub struct JsonRepository<T> {
    path: PathBuf,
    mode: u32,
    defaults: Option<DefaultsFn<T>>,
    lock: RwLock<()>,
}

impl<T> JsonRepository<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: 0o600,
            defaults: None,
            lock: RwLock::new(()),
        }
    }

    /// File mode applied to the committed document (Unix only).
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Factory invoked when the file does not exist yet.
    pub fn with_defaults(mut self, f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.defaults = Some(Arc::new(f));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.path.exists()
    }

    /// Missing file yields the defaults (or `T::default()`); corrupt JSON is
    /// an error.
    pub fn load(&self) -> Result<T> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.load_unlocked()
    }

    pub fn save(&self, value: &T) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        self.save_unlocked(value)
    }

    /// Load, mutate in place, save — all under one write guard.
    pub fn update(&self, mutate: impl FnOnce(&mut T) -> Result<()>) -> Result<T> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut value = self.load_unlocked()?;
        mutate(&mut value)?;
        self.save_unlocked(&value)?;
        Ok(value)
    }

    pub fn delete(&self) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_unlocked(&self) -> Result<T> {
        if !self.path.exists() {
            return Ok(match &self.defaults {
                Some(f) => f(),
                None => T::default(),
            });
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_unlocked(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        write_atomic(&self.path, &bytes, self.mode)
    }
}

/// Commit `bytes` to `path` atomically: sibling temp file, write, fsync,
/// chmod, rename. The temp file is removed on any failure before rename.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("path has no parent directory")))?;
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        set_mode(&tmp_path, mode)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove temp file {:?}: {}", tmp_path, e);
            }
        }
    } else {
        debug!("committed {} bytes to {:?}", bytes.len(), path);
    }
    result
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
