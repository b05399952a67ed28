//! File storage helpers
//!
//! JSON files are written atomically (temp file + rename) and guarded by an
//! advisory `fs2` lock on a sibling `.lock` file so that two processes
//! sharing a persistence path never interleave a read with a write.

use fs2::FileExt;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub type FileResult<T> = Result<T, String>;

/// Create a directory (and parents) if it doesn't exist
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Failed to create directory {}: {}", path.display(), e))?;
    }
    Ok(())
}

/// Write content to a temp file next to `path`, then rename it into place
pub fn atomic_write(path: &Path, content: &str) -> FileResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }

    let tmp_path = sibling_path(path, "tmp");
    {
        let mut file = File::create(&tmp_path)
            .map_err(|e| format!("Failed to create {}: {}", tmp_path.display(), e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| format!("Failed to write {}: {}", tmp_path.display(), e))?;
        file.sync_all()
            .map_err(|e| format!("Failed to sync {}: {}", tmp_path.display(), e))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        format!("Failed to move {} into place: {}", path.display(), e)
    })
}

/// Read and deserialize a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
}

/// Run `f` while holding an advisory lock on `<path>.lock`
pub fn with_file_lock<T>(
    path: &Path,
    exclusive: bool,
    f: impl FnOnce() -> FileResult<T>,
) -> FileResult<T> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }

    let lock_path = sibling_path(path, "lock");
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let locked = if exclusive {
        lock_file.lock_exclusive()
    } else {
        lock_file.lock_shared()
    };
    locked.map_err(|e| format!("Failed to lock {}: {}", lock_path.display(), e))?;

    let result = f();

    if let Err(e) = lock_file.unlock() {
        log::warn!("Failed to unlock {}: {}", lock_path.display(), e);
    }
    result
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
