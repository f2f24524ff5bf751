//! Locating the `moor-worker` binary.

use std::path::PathBuf;

use crate::error::{Error, Result};

const WORKER_BIN: &str = if cfg!(windows) {
    "moor-worker.exe"
} else {
    "moor-worker"
};

/// Find the moor-worker binary.
///
/// Looks in this order:
/// 1. the `configured` path (`worker_path` / `MOOR_WORKER_PATH`)
/// 2. same directory as the current executable
/// 3. system PATH
/// 4. `target/{debug,release}` of this workspace, for development
pub fn find_worker_binary(configured: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(Error::Config(format!(
            "worker binary {} does not exist",
            path.display()
        )));
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let worker_path = exe_dir.join(WORKER_BIN);
        if worker_path.exists() {
            return Ok(worker_path);
        }
        // Test binaries live one level down, in target/<profile>/deps.
        if let Some(profile_dir) = exe_dir.parent() {
            let worker_path = profile_dir.join(WORKER_BIN);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BIN) {
        return Ok(path);
    }

    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    for profile in ["debug", "release"] {
        let path = manifest_dir
            .join("..")
            .join("..")
            .join("target")
            .join(profile)
            .join(WORKER_BIN);
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::Config(
        "Could not find moor-worker binary. Set MOOR_WORKER_PATH or ensure it's in PATH."
            .to_string(),
    ))
}
