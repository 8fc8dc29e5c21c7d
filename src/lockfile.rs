//! Single-instance lock.
//!
//! One bridge process per bot token: the lock file next to the config stores
//! `{pid, token_fingerprint}`. A live pid with the same fingerprint refuses
//! startup; stale pids and locks held for a different token are replaced.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("already running\nremove {} if stale", path.display())]
    Running { path: PathBuf },

    #[error("lock failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: i32,
    #[serde(default)]
    token_fingerprint: Option<String>,
}

pub struct LockHandle {
    path: PathBuf,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "lock.remove_failed");
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Short stable fingerprint of the bot token; safe to log and persist.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..10].to_string()
}

pub fn lock_path_for_config(config_path: &Path) -> PathBuf {
    config_path.with_extension("lock")
}

pub fn acquire_lock(
    config_path: &Path,
    token_fingerprint: Option<&str>,
) -> Result<LockHandle, LockError> {
    let lock_path = lock_path_for_config(config_path);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Some(existing) = read_lock_info(&lock_path) {
        let foreign_token = match (token_fingerprint, existing.token_fingerprint.as_deref()) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        };
        if !foreign_token && pid_running(existing.pid) {
            return Err(LockError::Running { path: lock_path });
        }
    }

    write_lock_info(&lock_path, std::process::id() as i32, token_fingerprint)?;
    Ok(LockHandle { path: lock_path })
}

fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_lock_info(
    path: &Path,
    pid: i32,
    token_fingerprint: Option<&str>,
) -> Result<(), std::io::Error> {
    let info = LockInfo {
        pid,
        token_fingerprint: token_fingerprint.map(String::from),
    };
    let mut payload = serde_json::to_string_pretty(&info).unwrap_or_default();
    payload.push('\n');
    std::fs::write(path, payload)
}

#[cfg(unix)]
fn pid_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes liveness; EPERM means alive but not ours.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_running(_pid: i32) -> bool {
    false
}
