//! On-disk layout of a dock data directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::store::Store;

pub const DATABASE_FILE: &str = "dock.db";
pub const CONFIG_FILE: &str = "dock.toml";
pub const PIDFILE: &str = "dock-serve.pid";

/// `~/.dock`, falling back to `./.dock` when no home directory is known.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".dock")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Explicit path, else `DOCK_DATA_DIR`, else the default.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        let root = explicit
            .map(PathBuf::from)
            .or_else(|| env::var_os("DOCK_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(default_base_dir);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn pidfile_path(&self) -> PathBuf {
        self.root.join(PIDFILE)
    }

    /// Create the directory if needed and open its database.
    pub fn open_store(&self) -> Result<Store> {
        fs::create_dir_all(&self.root).map_err(|e| {
            StoreError::InvalidData(format!("failed to create {}: {e}", self.root.display()))
        })?;
        Store::open(&self.database_path())
    }
}
