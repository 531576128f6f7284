use crate::root::{FileInfo, FileMode};
use std::path::{Component, Path, PathBuf};
use strata_core::{Error, Result};

/// Local-filesystem VFS over the pages root. Site locations are
/// relative paths like `<group>/<project>/public`.
#[derive(Debug, Clone)]
pub struct LocalFs {
    base: PathBuf,
}

impl LocalFs {
    /// `base` must exist; it is canonicalized once so per-request
    /// containment checks are a plain prefix comparison.
    pub fn new(base: &Path) -> Result<Self> {
        let base = std::fs::canonicalize(base)?;
        Ok(Self { base })
    }

    pub async fn root(&self, location: &str) -> Result<LocalRoot> {
        let joined = self.base.join(relative(location)?);
        let path = tokio::fs::canonicalize(&joined).await?;
        if !path.starts_with(&self.base) {
            return Err(Error::OutsideRoot(location.to_string()));
        }
        Ok(LocalRoot { path })
    }
}

/// One site's content directory.
#[derive(Debug, Clone)]
pub struct LocalRoot {
    path: PathBuf,
}

impl LocalRoot {
    pub async fn open(&self, path: &str) -> Result<(tokio::fs::File, u64)> {
        let full = self.join(path)?;
        let file = tokio::fs::File::open(&full).await?;
        let meta = file.metadata().await?;
        Ok((file, meta.len()))
    }

    pub async fn lstat(&self, path: &str) -> Result<FileInfo> {
        let full = self.join(path)?;
        let meta = tokio::fs::symlink_metadata(&full).await?;

        let file_type = meta.file_type();
        let mode = if file_type.is_dir() {
            FileMode::Dir
        } else if file_type.is_symlink() {
            FileMode::Symlink
        } else if file_type.is_file() {
            FileMode::File
        } else {
            FileMode::Other
        };

        Ok(FileInfo {
            size: meta.len(),
            mode,
            modified: meta.modified().ok(),
        })
    }

    pub async fn read_link(&self, path: &str) -> Result<String> {
        let full = self.join(path)?;
        let target = tokio::fs::read_link(&full).await?;
        target
            .into_os_string()
            .into_string()
            .map_err(|_| Error::Io(format!("{path}: non-utf8 symlink target")))
    }

    fn join(&self, path: &str) -> Result<PathBuf> {
        Ok(self.path.join(relative(path)?))
    }
}

/// Accept only forward relative paths. The symlink evaluator hands us
/// pre-resolved paths; anything else trying to climb out is refused.
fn relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(Error::OutsideRoot(path.to_string())),
        }
    }
    Ok(p)
}
