use bytes::Bytes;
use http::{header, Response, StatusCode};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use std::pin::Pin;
use std::task::{Context, Poll};
use strata_vfs::File;
use tokio::sync::mpsc;

/// Response body used across the daemon.
pub type Body = BoxBody<Bytes, std::io::Error>;

// Pre-built error pages, one per client-visible failure mode.
pub const PAGE_404: &str =
    "<html><head><title>Not Found</title></head><body><h1>404 Not Found</h1></body></html>\n";
pub const PAGE_500: &str =
    "<html><head><title>Error</title></head><body><h1>500 Internal Server Error</h1></body></html>\n";
pub const PAGE_502: &str =
    "<html><head><title>Error</title></head><body><h1>502 Bad Gateway</h1></body></html>\n";
pub const PAGE_503: &str =
    "<html><head><title>Unavailable</title></head><body><h1>503 Service Unavailable</h1></body></html>\n";

pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> Body {
    full(Bytes::new())
}

/// Error page for a status code, HTML body included.
pub fn error_response(status: StatusCode) -> Response<Body> {
    let page = match status.as_u16() {
        404 => PAGE_404,
        502 => PAGE_502,
        503 => PAGE_503,
        _ => PAGE_500,
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full(page))
        .expect("static response")
}

pub fn redirect(location: &str, status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::LOCATION, location)
        .body(empty())
        .expect("redirect response")
}

// ── Streaming body over a VFS file ─────────────────────────────

/// How many chunks may sit in flight between the reader task and the
/// connection.
const BODY_CHANNEL_DEPTH: usize = 4;

/// Body streaming from an opened VFS file. A detached task pulls
/// chunks so remote range reads overlap with the client write.
///
/// `prefix` is content the caller already read (serving prefetches the
/// first chunk so read failures surface before any header is written);
/// `limit` bounds the total body including the prefix.
pub struct FileBody {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl FileBody {
    pub fn new(prefix: Bytes, mut file: File, limit: u64) -> Self {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);

        tokio::spawn(async move {
            let mut remaining = limit;
            let mut next = Some(prefix);
            loop {
                let chunk = match next.take() {
                    Some(chunk) => chunk,
                    None => match file.chunk().await {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
                            break;
                        }
                    },
                };

                if chunk.is_empty() || remaining == 0 {
                    break;
                }

                let mut chunk = chunk;
                if chunk.len() as u64 > remaining {
                    chunk.truncate(remaining as usize);
                }
                remaining -= chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    break; // client went away
                }
            }
        });

        Self { rx }
    }

    pub fn boxed(prefix: Bytes, file: File, limit: u64) -> Body {
        BoxBody::new(Self::new(prefix, file, limit))
    }
}

impl http_body::Body for FileBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
