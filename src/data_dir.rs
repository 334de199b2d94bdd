use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

/// Candidate roots, most specific first: `--data-dir`, then
/// `GTD_INDEX_DATA_DIR`, then the XDG data home (`~/.local/share/gtd-index/`).
fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(val) = std::env::var_os("GTD_INDEX_DATA_DIR") {
        return Ok(PathBuf::from(val));
    }
    xdg::BaseDirectories::with_prefix("gtd-index")
        .get_data_home()
        .ok_or_else(|| {
            Error::Config("could not determine XDG data home directory".into())
        })
}

fn ensure(path: PathBuf) -> Result<PathBuf> {
    std::fs::create_dir_all(&path).map_err(|_| Error::DataDir(path.clone()))?;
    Ok(path)
}

impl DataDir {
    /// Locate the data directory and create it if missing.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = ensure(locate(explicit)?)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entities_db(&self) -> PathBuf {
        self.root.join("entities.redb")
    }

    /// Where the full-text index lives, without creating it. Read-only
    /// commands use this so that a missing index reads as empty instead of
    /// leaving an empty directory behind.
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    /// Like [`DataDir::index_dir`], creating the directory for commands
    /// that write to the index.
    pub fn ensure_index_dir(&self) -> Result<PathBuf> {
        ensure(self.index_dir())
    }
}
