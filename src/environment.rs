//! Process environment snapshot
//!
//! Installers routinely change PATH (a freshly installed interpreter lands in
//! a new directory), but a running process never sees that on its own.
//! Instead of mutating the global environment, the engine holds an
//! [`EnvSnapshot`] and re-captures it at defined points. Commands are
//! launched with the snapshot's PATH, so a refreshed snapshot is all it takes
//! for the next probe to find a just-installed executable.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// PATH captured at a point in time, plus extra search directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSnapshot {
    path: OsString,
    extra_dirs: Vec<PathBuf>,
}

impl EnvSnapshot {
    /// Capture the current process PATH. `extra_dirs` are appended if they
    /// exist at capture time; missing ones are re-checked on every refresh.
    pub fn capture(extra_dirs: &[PathBuf]) -> Self {
        let base = std::env::var_os("PATH").unwrap_or_default();
        Self::from_parts(base, extra_dirs)
    }

    /// Build a snapshot from an explicit base PATH
    pub fn from_parts(base: OsString, extra_dirs: &[PathBuf]) -> Self {
        let mut dirs: Vec<PathBuf> = std::env::split_paths(&base).collect();
        for dir in extra_dirs {
            if dir.is_dir() && !dirs.iter().any(|d| d == dir) {
                dirs.push(dir.clone());
            }
        }
        let path = std::env::join_paths(&dirs).unwrap_or(base);
        Self {
            path,
            extra_dirs: extra_dirs.to_vec(),
        }
    }

    /// Re-read the process environment, keeping the same extra directories
    pub fn refreshed(&self) -> Self {
        let fresh = Self::capture(&self.extra_dirs);
        if fresh.path != self.path {
            debug!(path = ?fresh.path, "environment snapshot changed");
        }
        fresh
    }

    pub fn path(&self) -> &OsString {
        &self.path
    }

    pub fn search_dirs(&self) -> impl Iterator<Item = PathBuf> + '_ {
        std::env::split_paths(&self.path)
    }

    pub fn contains_dir(&self, dir: &Path) -> bool {
        self.search_dirs().any(|d| d == dir)
    }
}
