use crate::pipeline::{EntryVariant, PagesService};
use crate::tls::TlsSettings;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use rustls::sign::CertifiedKey;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept loop for a plaintext listener. Admission control happens
/// before `accept`: when the shared semaphore is exhausted the listener
/// stops accepting and the TCP backlog applies backpressure.
pub async fn serve_plain(
    listener: TcpListener,
    service: Arc<PagesService>,
    limiter: Arc<Semaphore>,
    variant: EntryVariant,
    header_timeout: Duration,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, variant = ?variant, "http listener ready");

    loop {
        let permit = Arc::clone(&limiter).acquire_owned().await?;
        let (stream, _peer) = listener.accept().await?;
        let service = Arc::clone(&service);

        tokio::spawn(async move {
            let _permit = permit;
            serve_connection(TokioIo::new(stream), service, false, variant, header_timeout).await;
        });
    }
}

/// Accept loop for an HTTPS listener. The TLS config is chosen after
/// the ClientHello: the SNI name resolves a domain whose memoized
/// certificate is served, falling back to the root certificate.
pub async fn serve_tls(
    listener: TcpListener,
    service: Arc<PagesService>,
    limiter: Arc<Semaphore>,
    settings: Arc<TlsSettings>,
    header_timeout: Duration,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "https listener ready");

    loop {
        let permit = Arc::clone(&limiter).acquire_owned().await?;
        let (stream, peer) = listener.accept().await?;
        let service = Arc::clone(&service);
        let settings = Arc::clone(&settings);

        tokio::spawn(async move {
            let _permit = permit;

            let accept = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
            let start = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, accept).await {
                Ok(Ok(start)) => start,
                Ok(Err(err)) => {
                    debug!(peer = %peer, error = %err, "tls client hello failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "tls handshake timed out");
                    return;
                }
            };

            let sni = start.client_hello().server_name().map(str::to_string);
            let Some(key) = resolve_certificate(&service, sni.as_deref(), &settings).await else {
                debug!(peer = %peer, sni = ?sni, "no certificate for connection");
                return;
            };

            let config = settings.server_config(key);
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, start.into_stream(config)).await {
                Ok(Ok(tls_stream)) => {
                    serve_connection(
                        TokioIo::new(tls_stream),
                        service,
                        true,
                        EntryVariant::Direct,
                        header_timeout,
                    )
                    .await;
                }
                Ok(Err(err)) => debug!(peer = %peer, error = %err, "tls handshake failed"),
                Err(_) => debug!(peer = %peer, "tls handshake timed out"),
            }
        });
    }
}

/// Pick the certificate for an incoming TLS connection. Custom-domain
/// certificates are parsed at most once per domain (memoized, errors
/// included); the root certificate covers everything else.
async fn resolve_certificate(
    service: &Arc<PagesService>,
    sni: Option<&str>,
    settings: &TlsSettings,
) -> Option<Arc<CertifiedKey>> {
    if let Some(name) = sni {
        if let Ok(Some(domain)) = service.source.get_domain(name).await {
            match domain.certified_key() {
                Ok(key) => return Some(key),
                Err(err) => {
                    debug!(domain = %domain.name, error = %err, "domain certificate unusable")
                }
            }
        }
    }
    settings.fallback()
}

async fn serve_connection<IO>(
    io: IO,
    service: Arc<PagesService>,
    https: bool,
    variant: EntryVariant,
    header_timeout: Duration,
) where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let hyper_service = service_fn(move |req: hyper::Request<Incoming>| {
        let service = Arc::clone(&service);
        async move {
            let (parts, _body) = req.into_parts();
            let response = service.handle(&parts, https, variant).await;
            Ok::<_, Infallible>(response)
        }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout);

    if let Err(err) = builder.serve_connection(io, hyper_service).await {
        debug!(error = %err, "connection closed with error");
    }
}

/// Bind a listener address, failing loudly: a daemon that cannot open
/// its sockets must not come up half-deaf.
pub async fn bind(addr: std::net::SocketAddr) -> anyhow::Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            warn!(addr = %addr, error = %err, "could not bind listener");
            Err(err.into())
        }
    }
}

/// Connection budget shared by every listener. Zero means unlimited.
pub fn connection_limiter(max_conns: usize) -> Arc<Semaphore> {
    let permits = if max_conns == 0 {
        Semaphore::MAX_PERMITS
    } else {
        max_conns
    };
    Arc::new(Semaphore::new(permits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_zero_means_unlimited() {
        let limiter = connection_limiter(0);
        assert_eq!(limiter.available_permits(), Semaphore::MAX_PERMITS);

        let limiter = connection_limiter(7);
        assert_eq!(limiter.available_permits(), 7);
    }
}
