pub mod archive;
pub mod cache;

pub use archive::{ZipArchive, ZipFile};
pub use cache::ZipCache;

use crate::root::FileInfo;
use std::sync::Arc;
use strata_core::Result;
use tokio::sync::mpsc;

/// Corruption report channel handed to archive readers. A failed range
/// read sends the archive URL back to the cache, which quarantines the
/// entry. A message, not a back-pointer.
#[derive(Debug, Clone)]
pub struct CorruptionNotice {
    url: String,
    tx: mpsc::UnboundedSender<String>,
}

impl CorruptionNotice {
    pub fn new(url: String, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { url, tx }
    }

    pub fn send(&self) {
        let _ = self.tx.send(self.url.clone());
    }
}

/// A site root inside an opened remote archive.
#[derive(Debug, Clone)]
pub struct ZipRoot {
    archive: Arc<ZipArchive>,
    notice: CorruptionNotice,
}

impl ZipRoot {
    pub(crate) fn new(archive: Arc<ZipArchive>, notice: CorruptionNotice) -> Self {
        Self { archive, notice }
    }

    pub async fn open(&self, path: &str) -> Result<ZipFile> {
        self.archive
            .open_file(path, Some(self.notice.clone()))
            .await
    }

    pub fn lstat(&self, path: &str) -> Result<FileInfo> {
        self.archive.lstat(path)
    }

    pub async fn read_link(&self, path: &str) -> Result<String> {
        self.archive.read_link(path).await
    }
}
