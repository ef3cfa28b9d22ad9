//! Store-wide run lock.
//!
//! The lock is an advisory OS lock (`flock` / `LockFileEx`) on
//! `<store>/run.lock`, so it dies with the process that took it: a run
//! killed by SIGKILL or a power loss never leaves the store locked. The
//! file itself persists between runs and only carries [`LockMetadata`]
//! describing the current holder, for error messages.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Written into the lock file by the holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

impl LockMetadata {
    pub fn current(run_id: &str) -> Self {
        Self {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Another run holds the store.
#[derive(Debug)]
pub struct LockHeld {
    pub path: PathBuf,
    pub holder: Option<LockMetadata>,
}

impl std::fmt::Display for LockHeld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "another run holds the release store (lock file {})",
            self.path.display()
        )?;
        if let Some(h) = &self.holder {
            write!(
                f,
                ": run {} in pid {} since {}",
                h.run_id,
                h.pid,
                h.started_at.to_rfc3339()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for LockHeld {}

/// Held for the duration of a run; released on drop.
pub struct RunLock {
    file: File,
    metadata: LockMetadata,
}

impl RunLock {
    pub fn acquire(path: &Path, run_id: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open run lock: {}", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(LockHeld {
                    path: path.to_path_buf(),
                    holder: read_metadata(&mut file),
                }
                .into());
            }
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to lock {}", path.display())));
        }

        let metadata = LockMetadata::current(run_id);
        let json = serde_json::to_vec_pretty(&metadata)?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|_| file.write_all(&json))
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to write run lock metadata: {}", path.display()))?;

        Ok(Self { file, metadata })
    }

    pub fn metadata(&self) -> &LockMetadata {
        &self.metadata
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Clear the holder before unlocking; the file stays for the next run.
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

fn read_metadata(file: &mut File) -> Option<LockMetadata> {
    let mut buf = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut buf).ok()?;
    serde_json::from_str(&buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_is_refused_with_holder() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run.lock");
        let lock = RunLock::acquire(&path, "run-a").unwrap();

        let err = RunLock::acquire(&path, "run-b").err().unwrap();
        let held = err.downcast_ref::<LockHeld>().unwrap();
        assert_eq!(held.holder.as_ref(), Some(lock.metadata()));
        assert!(err.to_string().contains("run run-a"));

        drop(lock);
        let again = RunLock::acquire(&path, "run-b").unwrap();
        assert_eq!(again.metadata().run_id, "run-b");
    }

    #[test]
    fn leftover_file_from_dead_run_does_not_block() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run.lock");
        let stale = LockMetadata {
            pid: 4_194_304,
            run_id: "killed".into(),
            started_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = RunLock::acquire(&path, "fresh").unwrap();
        let on_disk: LockMetadata =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, *lock.metadata());
    }

    #[test]
    fn release_clears_holder() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run.lock");
        drop(RunLock::acquire(&path, "done").unwrap());
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap().len(), 0);
    }
}
