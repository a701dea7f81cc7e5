//! Central path resolution for CampusDock data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `CAMPUSDOCK_DATA_DIR` env > `~/.campusdock`.
//! Clap already folds the env var into `--data-dir`; the env check here covers
//! callers that bypass the CLI.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const DEFAULT_DIR_NAME: &str = ".campusdock";

/// Initialize the global data directory. Returns the resolved path.
///
/// Falls back to a relative `.campusdock` when no home directory exists.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("CAMPUSDOCK_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .map(|home| home.join(DEFAULT_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR_NAME))
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(PoisonError::into_inner);
    *guard = Some(dir.clone());
    dir
}

/// Current data directory; resolves the default if `init_data_dir` was never called.
pub fn data_dir() -> PathBuf {
    let current = DATA_DIR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    current.unwrap_or_else(|| init_data_dir(None))
}

pub fn db_path() -> PathBuf {
    data_dir().join("campusdock.db")
}

pub fn token_file_path() -> PathBuf {
    data_dir().join("admin-token")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
