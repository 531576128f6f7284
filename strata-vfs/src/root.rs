use crate::local::{LocalFs, LocalRoot};
use crate::zip::archive::ZipFile;
use crate::zip::{ZipCache, ZipRoot};
use bytes::Bytes;
use std::time::SystemTime;
use strata_core::lookup::ServingType;
use strata_core::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const LOCAL_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    File,
    Dir,
    Symlink,
    /// Sockets, devices, anything else we refuse to serve.
    Other,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: u64,
    pub mode: FileMode,
    pub modified: Option<SystemTime>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.mode == FileMode::Dir
    }

    pub fn is_symlink(&self) -> bool {
        self.mode == FileMode::Symlink
    }

    pub fn is_regular(&self) -> bool {
        self.mode == FileMode::File
    }
}

/// The two content backends behind one front: local directories under
/// the pages root, and remote archives through the archive cache.
pub struct Vfs {
    local: LocalFs,
    zip: ZipCache,
}

impl Vfs {
    pub fn new(local: LocalFs, zip: ZipCache) -> Self {
        Self { local, zip }
    }

    pub async fn root(&self, serving: ServingType, location: &str) -> Result<Root> {
        match serving {
            ServingType::File => Ok(Root::Local(self.local.root(location).await?)),
            ServingType::Zip => Ok(Root::Zip(self.zip.root(location).await?)),
        }
    }

    pub fn zip_cache(&self) -> &ZipCache {
        &self.zip
    }
}

/// A site root. All serving paths are resolved against one of these.
#[derive(Debug, Clone)]
pub enum Root {
    Local(LocalRoot),
    Zip(ZipRoot),
}

impl Root {
    pub async fn open(&self, path: &str) -> Result<File> {
        match self {
            Root::Local(root) => {
                let (file, size) = root.open(path).await?;
                Ok(File::Local(LocalFile { file, size }))
            }
            Root::Zip(root) => Ok(match root.open(path).await? {
                ZipFile::Stored(reader) => File::Stored(reader),
                ZipFile::Deflated(reader) => File::Deflated(reader),
            }),
        }
    }

    pub async fn lstat(&self, path: &str) -> Result<FileInfo> {
        match self {
            Root::Local(root) => root.lstat(path).await,
            Root::Zip(root) => root.lstat(path),
        }
    }

    pub async fn read_link(&self, path: &str) -> Result<String> {
        match self {
            Root::Local(root) => root.read_link(path).await,
            Root::Zip(root) => root.read_link(path).await,
        }
    }
}

/// An opened file. Local and stored-archive files are seekable;
/// deflated archive entries only read forward.
#[derive(Debug)]
pub enum File {
    Local(LocalFile),
    Stored(crate::zip::archive::StoredReader),
    Deflated(crate::zip::archive::DeflatedReader),
}

#[derive(Debug)]
pub struct LocalFile {
    file: tokio::fs::File,
    size: u64,
}

impl File {
    pub fn size(&self) -> u64 {
        match self {
            File::Local(f) => f.size,
            File::Stored(r) => r.size(),
            File::Deflated(r) => r.size(),
        }
    }

    pub fn is_seekable(&self) -> bool {
        !matches!(self, File::Deflated(_))
    }

    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        match self {
            File::Local(f) => {
                f.file.seek(std::io::SeekFrom::Start(pos)).await?;
                Ok(())
            }
            File::Stored(r) => {
                r.seek(pos);
                Ok(())
            }
            File::Deflated(_) => Err(Error::Io("deflated entry is not seekable".into())),
        }
    }

    /// Next chunk of content, empty at EOF.
    pub async fn chunk(&mut self) -> Result<Bytes> {
        match self {
            File::Local(f) => {
                let mut buf = vec![0u8; LOCAL_CHUNK];
                let n = f.file.read(&mut buf).await?;
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            File::Stored(r) => r.chunk().await,
            File::Deflated(r) => r.chunk().await,
        }
    }

    /// Read up to `limit` bytes from the current position.
    pub async fn read_all(&mut self, limit: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.chunk().await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
            if out.len() as u64 >= limit {
                out.truncate(limit as usize);
                return Ok(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn local_file_chunks_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("site/public");
        std::fs::create_dir_all(&root).unwrap();
        let mut f = std::fs::File::create(root.join("page.html")).unwrap();
        f.write_all(b"0123456789").unwrap();

        let fs = LocalFs::new(dir.path()).unwrap();
        let vfs_root = Root::Local(fs.root("site/public").await.unwrap());

        let mut file = vfs_root.open("page.html").await.unwrap();
        assert!(file.is_seekable());
        assert_eq!(file.size(), 10);

        let body = file.read_all(4).await.unwrap();
        assert_eq!(body, b"0123");

        let mut file = vfs_root.open("page.html").await.unwrap();
        file.seek(6).await.unwrap();
        let rest = file.read_all(64).await.unwrap();
        assert_eq!(rest, b"6789");
    }
}
