use crate::range::{RangeReader, RangeStream, Resource};
use crate::root::{FileInfo, FileMode};
use crate::zip::CorruptionNotice;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use strata_core::{Error, Result};

/// Entries outside this prefix never existed as far as serving is
/// concerned.
pub const PUBLIC_PREFIX: &str = "public/";

/// Upper bound on a symlink target stored in an archive.
pub const MAX_SYMLINK_SIZE: u64 = 4096;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

const EOCD_SIG: u32 = 0x0605_4b50;
const CD_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;
const EOCD_LEN: u64 = 22;
const MAX_COMMENT: u64 = 65_535;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// A remote ZIP archive with its file index, opened over HTTP range
/// reads. The index costs two range reads (EOCD tail scan plus the
/// central directory); per-entry data offsets are resolved lazily and
/// cached.
#[derive(Debug)]
pub struct ZipArchive {
    reader: Arc<RangeReader>,
    entries: HashMap<String, Arc<ZipEntry>>,
}

#[derive(Debug)]
pub struct ZipEntry {
    pub name: String,
    pub local_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub method: u16,
    pub mode: u32,
    pub is_dir: bool,

    // Resolved on first open: local header size varies per entry.
    data_offset: tokio::sync::OnceCell<u64>,
    // Small symlink payloads are read once and kept.
    symlink_target: tokio::sync::OnceCell<String>,
}

impl ZipEntry {
    fn synthetic_dir(name: &str) -> Self {
        Self {
            name: name.to_string(),
            local_offset: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            method: METHOD_STORED,
            mode: 0o755,
            is_dir: true,
            data_offset: tokio::sync::OnceCell::new(),
            symlink_target: tokio::sync::OnceCell::new(),
        }
    }

    pub fn is_symlink(&self) -> bool {
        !self.is_dir && (self.mode & S_IFMT) == S_IFLNK
    }

    pub fn file_info(&self) -> FileInfo {
        let mode = if self.is_dir {
            FileMode::Dir
        } else if self.is_symlink() {
            FileMode::Symlink
        } else {
            FileMode::File
        };
        FileInfo {
            size: self.uncompressed_size,
            mode,
            modified: None,
        }
    }
}

impl ZipArchive {
    /// Open an archive: probe the resource, locate the end-of-central-
    /// directory record, and parse the central directory into the index.
    pub async fn open(client: &reqwest::Client, url: &str) -> Result<ZipArchive> {
        let resource = Resource::probe(client, url).await?;
        let reader = Arc::new(RangeReader::new(client.clone(), resource));

        let size = reader.size();
        if size < EOCD_LEN {
            return Err(Error::ArchiveCorrupted(format!(
                "{url}: {size} bytes is too small for a zip archive"
            )));
        }

        let tail_len = size.min(EOCD_LEN + MAX_COMMENT);
        let tail = reader.read_range(size - tail_len, tail_len).await?;
        let eocd = find_eocd(&tail)
            .ok_or_else(|| Error::ArchiveCorrupted(format!("{url}: no end of central directory")))?;

        let entries_total = read_u16(&tail, eocd + 10);
        let cd_size = read_u32(&tail, eocd + 12) as u64;
        let cd_offset = read_u32(&tail, eocd + 16) as u64;

        if entries_total == u16::MAX || cd_size == u32::MAX as u64 || cd_offset == u32::MAX as u64 {
            return Err(Error::ArchiveNotSupported(format!("{url}: zip64")));
        }
        if cd_offset.checked_add(cd_size).map_or(true, |end| end > size) {
            return Err(Error::ArchiveCorrupted(format!(
                "{url}: central directory out of bounds"
            )));
        }

        let directory = reader.read_range(cd_offset, cd_size).await?;
        let entries = parse_central_directory(&directory, entries_total, url)?;

        Ok(ZipArchive { reader, entries })
    }

    pub fn etag(&self) -> Option<&str> {
        self.reader.resource().etag.as_deref()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn entry(&self, path: &str) -> Result<&Arc<ZipEntry>> {
        self.entries.get(path).ok_or(Error::NotFound)
    }

    /// Stat without following symlinks.
    pub fn lstat(&self, path: &str) -> Result<FileInfo> {
        Ok(self.entry(path)?.file_info())
    }

    /// Open a regular file for reading.
    pub async fn open_file(
        &self,
        path: &str,
        notice: Option<CorruptionNotice>,
    ) -> Result<ZipFile> {
        let entry = self.entry(path)?;
        if entry.is_dir || entry.is_symlink() {
            return Err(Error::NotRegularFile(path.to_string()));
        }

        let data_offset = self.data_offset(entry).await?;

        match entry.method {
            METHOD_STORED => Ok(ZipFile::Stored(StoredReader {
                stream: self.reader.stream(data_offset, entry.compressed_size),
                start: data_offset,
                size: entry.compressed_size,
                notice,
            })),
            METHOD_DEFLATED => Ok(ZipFile::Deflated(DeflatedReader {
                reader: Arc::clone(&self.reader),
                data_offset,
                compressed_size: entry.compressed_size,
                uncompressed_size: entry.uncompressed_size,
                decoder: None,
                notice,
            })),
            other => Err(Error::ArchiveNotSupported(format!(
                "{path}: compression method {other}"
            ))),
        }
    }

    /// Read a symlink target, at most `MAX_SYMLINK_SIZE` bytes.
    pub async fn read_link(&self, path: &str) -> Result<String> {
        let entry = self.entry(path)?;
        if !entry.is_symlink() {
            return Err(Error::NotSymlink(path.to_string()));
        }
        if entry.uncompressed_size > MAX_SYMLINK_SIZE {
            return Err(Error::SymlinkTooLarge(path.to_string()));
        }

        let target = entry
            .symlink_target
            .get_or_try_init(|| async {
                let data_offset = self.data_offset(entry).await?;
                let raw = match entry.method {
                    METHOD_STORED => {
                        self.reader
                            .read_range(data_offset, entry.compressed_size)
                            .await?
                    }
                    METHOD_DEFLATED => {
                        let packed = self
                            .reader
                            .read_range(data_offset, entry.compressed_size)
                            .await?;
                        inflate_all(&packed, entry.uncompressed_size, path)?
                    }
                    other => {
                        return Err(Error::ArchiveNotSupported(format!(
                            "{path}: compression method {other}"
                        )))
                    }
                };
                String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::ArchiveCorrupted(format!("{path}: non-utf8 symlink")))
            })
            .await?;

        Ok(target.clone())
    }

    async fn data_offset(&self, entry: &Arc<ZipEntry>) -> Result<u64> {
        entry
            .data_offset
            .get_or_try_init(|| async {
                let header = self.reader.read_range(entry.local_offset, 30).await?;
                if read_u32(&header, 0) != LOCAL_SIG {
                    return Err(Error::ArchiveCorrupted(format!(
                        "{}: bad local file header",
                        entry.name
                    )));
                }
                let name_len = read_u16(&header, 26) as u64;
                let extra_len = read_u16(&header, 28) as u64;
                Ok(entry.local_offset + 30 + name_len + extra_len)
            })
            .await
            .copied()
    }
}

fn inflate_all(packed: &[u8], expected: u64, path: &str) -> Result<Bytes> {
    let mut decoder = flate2::read::DeflateDecoder::new(packed);
    let mut out = Vec::with_capacity(expected as usize);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::ArchiveCorrupted(format!("{path}: {e}")))?;
    Ok(Bytes::from(out))
}

/// Scan backwards for the EOCD signature. The record is at least 22
/// bytes, possibly followed by a comment.
fn find_eocd(tail: &[u8]) -> Option<usize> {
    if tail.len() < EOCD_LEN as usize {
        return None;
    }
    let mut pos = tail.len() - EOCD_LEN as usize;
    loop {
        if read_u32(tail, pos) == EOCD_SIG {
            return Some(pos);
        }
        if pos == 0 {
            return None;
        }
        pos -= 1;
    }
}

fn parse_central_directory(
    directory: &[u8],
    entries_total: u16,
    url: &str,
) -> Result<HashMap<String, Arc<ZipEntry>>> {
    let mut entries: HashMap<String, Arc<ZipEntry>> = HashMap::new();
    // The site root always exists, even for archives without an
    // explicit `public/` directory entry.
    entries.insert(String::new(), Arc::new(ZipEntry::synthetic_dir("")));

    let mut pos = 0usize;
    for _ in 0..entries_total {
        if pos + 46 > directory.len() {
            return Err(Error::ArchiveCorrupted(format!(
                "{url}: truncated central directory"
            )));
        }
        if read_u32(directory, pos) != CD_SIG {
            return Err(Error::ArchiveCorrupted(format!(
                "{url}: bad central directory signature"
            )));
        }

        let version_made_by = read_u16(directory, pos + 4);
        let method = read_u16(directory, pos + 10);
        let compressed_size = read_u32(directory, pos + 20) as u64;
        let uncompressed_size = read_u32(directory, pos + 24) as u64;
        let name_len = read_u16(directory, pos + 28) as usize;
        let extra_len = read_u16(directory, pos + 30) as usize;
        let comment_len = read_u16(directory, pos + 32) as usize;
        let external_attrs = read_u32(directory, pos + 38);
        let local_offset = read_u32(directory, pos + 42) as u64;

        let name_start = pos + 46;
        let name_end = name_start + name_len;
        if name_end > directory.len() {
            return Err(Error::ArchiveCorrupted(format!(
                "{url}: truncated entry name"
            )));
        }
        let raw_name = String::from_utf8_lossy(&directory[name_start..name_end]).into_owned();
        pos = name_end + extra_len + comment_len;

        // Unix creator versions carry the file mode in the high half of
        // the external attributes.
        let mode = if version_made_by >> 8 == 3 {
            external_attrs >> 16
        } else {
            0o644
        };

        let Some(rest) = raw_name.strip_prefix(PUBLIC_PREFIX) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }

        let is_dir = rest.ends_with('/');
        let key = rest.trim_end_matches('/').to_string();

        entries.insert(
            key.clone(),
            Arc::new(ZipEntry {
                name: key,
                local_offset,
                compressed_size,
                uncompressed_size,
                method,
                mode,
                is_dir,
                data_offset: tokio::sync::OnceCell::new(),
                symlink_target: tokio::sync::OnceCell::new(),
            }),
        );
    }

    // Fabricate directory entries the archive omitted.
    let keys: Vec<String> = entries.keys().cloned().collect();
    for key in keys {
        let mut ancestor = key.as_str();
        while let Some(cut) = ancestor.rfind('/') {
            ancestor = &ancestor[..cut];
            if !entries.contains_key(ancestor) {
                entries.insert(
                    ancestor.to_string(),
                    Arc::new(ZipEntry::synthetic_dir(ancestor)),
                );
            }
        }
    }

    Ok(entries)
}

fn read_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

// ── File readers ──────────────────────────────────────────────

/// An opened archive entry. Stored entries stream raw ranges and are
/// seekable; deflated entries decompress on the fly and are not.
#[derive(Debug)]
pub enum ZipFile {
    Stored(StoredReader),
    Deflated(DeflatedReader),
}

impl ZipFile {
    /// Next chunk of content, empty at EOF.
    pub async fn chunk(&mut self) -> Result<Bytes> {
        match self {
            ZipFile::Stored(r) => r.chunk().await,
            ZipFile::Deflated(r) => r.chunk().await,
        }
    }
}

#[derive(Debug)]
pub struct StoredReader {
    stream: RangeStream,
    start: u64,
    size: u64,
    notice: Option<CorruptionNotice>,
}

impl StoredReader {
    pub async fn chunk(&mut self) -> Result<Bytes> {
        match self.stream.chunk().await {
            Err(err @ Error::RangeRequestsNotSupported) => {
                if let Some(notice) = &self.notice {
                    notice.send();
                }
                Err(err)
            }
            other => other,
        }
    }

    pub fn seek(&mut self, pos: u64) {
        self.stream.seek_to(self.start + pos.min(self.size));
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
pub struct DeflatedReader {
    reader: Arc<RangeReader>,
    data_offset: u64,
    compressed_size: u64,
    uncompressed_size: u64,
    decoder: Option<flate2::read::DeflateDecoder<std::io::Cursor<Bytes>>>,
    notice: Option<CorruptionNotice>,
}

impl DeflatedReader {
    pub async fn chunk(&mut self) -> Result<Bytes> {
        if self.decoder.is_none() {
            let packed = match self
                .reader
                .read_range(self.data_offset, self.compressed_size)
                .await
            {
                Err(err @ Error::RangeRequestsNotSupported) => {
                    if let Some(notice) = &self.notice {
                        notice.send();
                    }
                    return Err(err);
                }
                other => other?,
            };
            self.decoder = Some(flate2::read::DeflateDecoder::new(std::io::Cursor::new(
                packed,
            )));
        }

        let decoder = self.decoder.as_mut().expect("decoder initialized above");
        let mut buf = vec![0u8; 64 * 1024];
        let n = decoder
            .read(&mut buf)
            .map_err(|e| Error::ArchiveCorrupted(format!("inflate: {e}")))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    pub fn size(&self) -> u64 {
        self.uncompressed_size
    }
}
