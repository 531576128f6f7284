use bytes::Bytes;
use http::header;
use strata_core::{Error, Result};

/// Read size for sequential chunked reads over a range resource.
pub const CHUNK_SIZE: u64 = 128 * 1024;

/// Metadata of a remote resource recorded by the initial probe.
///
/// The validators (`etag`, `last_modified`) pin the object version:
/// when the backing object changes, subsequent range reads stop
/// returning 206 and the caller learns the resource mutated.
#[derive(Debug, Clone)]
pub struct Resource {
    pub url: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Resource {
    /// Probe the resource with a one-byte range request. Establishes
    /// that the server honors `Range` and records size and validators.
    pub async fn probe(client: &reqwest::Client, url: &str) -> Result<Resource> {
        let response = client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        match response.status().as_u16() {
            206 => {}
            404 => return Err(Error::NotFound),
            // A 200 means the server ignored the Range header.
            200 => return Err(Error::RangeRequestsNotSupported),
            other => {
                return Err(Error::Upstream(format!(
                    "{url}: unexpected status {other} probing resource"
                )))
            }
        }

        let size = content_range_total(&response)
            .ok_or_else(|| Error::Upstream(format!("{url}: missing or malformed Content-Range")))?;

        Ok(Resource {
            url: url.to_string(),
            size,
            etag: header_string(&response, header::ETAG),
            last_modified: header_string(&response, header::LAST_MODIFIED),
        })
    }
}

/// A read-only random-access view of a URL, one HTTP range request per
/// read. Never retries: any deviation after the initial 206 means the
/// backing object changed, and archive-level code must quarantine it.
#[derive(Debug)]
pub struct RangeReader {
    client: reqwest::Client,
    resource: Resource,
}

impl RangeReader {
    pub fn new(client: reqwest::Client, resource: Resource) -> Self {
        Self { client, resource }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn size(&self) -> u64 {
        self.resource.size
    }

    /// Read `len` bytes starting at `offset`.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = offset
            .checked_add(len)
            .and_then(|e| e.checked_sub(1))
            .ok_or_else(|| Error::Io("range arithmetic overflow".into()))?;

        let response = self
            .client
            .get(&self.resource.url)
            .header(header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        match response.status().as_u16() {
            206 => {}
            404 => return Err(Error::NotFound),
            // Any non-206 (notably 416) after the probe saw 206 signals
            // that the object behind the URL changed.
            _ => return Err(Error::RangeRequestsNotSupported),
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        if body.len() as u64 != len {
            return Err(Error::RangeRequestsNotSupported);
        }

        Ok(body)
    }

    /// Sequential forward reads over `[offset, offset + len)`.
    pub fn stream(self: &std::sync::Arc<Self>, offset: u64, len: u64) -> RangeStream {
        RangeStream {
            reader: std::sync::Arc::clone(self),
            pos: offset,
            end: offset + len,
        }
    }
}

/// Chunked sequential reader over a byte range.
#[derive(Debug)]
pub struct RangeStream {
    reader: std::sync::Arc<RangeReader>,
    pos: u64,
    end: u64,
}

impl RangeStream {
    /// Next chunk, empty at end of range.
    pub async fn chunk(&mut self) -> Result<Bytes> {
        if self.pos >= self.end {
            return Ok(Bytes::new());
        }
        let len = (self.end - self.pos).min(CHUNK_SIZE);
        let chunk = self.reader.read_range(self.pos, len).await?;
        self.pos += chunk.len() as u64;
        Ok(chunk)
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.pos)
    }

    pub fn seek_to(&mut self, pos: u64) {
        self.pos = pos.min(self.end);
    }
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Parse the total length out of `Content-Range: bytes 0-0/N`.
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let raw = response
        .headers()
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?;
    let total = raw.rsplit('/').next()?;
    total.parse().ok()
}
