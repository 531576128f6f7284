use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use strata_core::config::TlsConfig;
use strata_core::{Error, Result};
use tracing::warn;

/// Shared TLS parameters for the HTTPS listeners: protocol version
/// bounds and the fallback certificate served when SNI resolves no
/// domain.
pub struct TlsSettings {
    versions: Vec<&'static rustls::SupportedProtocolVersion>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl TlsSettings {
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let fallback = match (&config.root_certificate, &config.root_key) {
            (Some(cert), Some(key)) => Some(load_key_pair(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "tls.root_certificate and tls.root_key must be set together".into(),
                ))
            }
        };

        if config.insecure_ciphers {
            // rustls only ships vetted suites; the escape hatch exists
            // for config compatibility and changes nothing.
            warn!("tls.insecure_ciphers is set but has no effect with this TLS stack");
        }

        Ok(Self {
            versions: protocol_versions(&config.min_version, &config.max_version)?,
            fallback,
        })
    }

    pub fn fallback(&self) -> Option<Arc<CertifiedKey>> {
        self.fallback.clone()
    }

    /// A server config serving exactly one certificate, with ALPN for
    /// h2 and http/1.1.
    pub fn server_config(&self, key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder_with_protocol_versions(&self.versions)
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCert(key)));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl rustls::server::ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn protocol_versions(
    min: &str,
    max: &str,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
    let rank = |v: &str| match v {
        "1.2" => Ok(2u8),
        "1.3" => Ok(3u8),
        other => Err(Error::Config(format!(
            "unsupported TLS version {other:?} (1.2 or 1.3)"
        ))),
    };
    let min = rank(min)?;
    let max = rank(max)?;
    if min > max {
        return Err(Error::Config(
            "tls.min_version must not exceed tls.max_version".into(),
        ));
    }

    let mut versions = Vec::new();
    if min <= 2 && max >= 2 {
        versions.push(&rustls::version::TLS12);
    }
    if max >= 3 {
        versions.push(&rustls::version::TLS13);
    }
    Ok(versions)
}

/// Load a PEM certificate/key pair from disk into a signing key.
pub fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_pem = std::fs::read(cert_path)?;
    let key_pem = std::fs::read(key_path)?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsKeyPair(format!("{}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(Error::TlsKeyPair(format!(
            "{}: no certificates found",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::TlsKeyPair(format!("{}: {e}", key_path.display())))?
        .ok_or_else(|| {
            Error::TlsKeyPair(format!("{}: no private key found", key_path.display()))
        })?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| Error::TlsKeyPair(format!("{}: {e}", key_path.display())))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_bounds() {
        assert_eq!(protocol_versions("1.2", "1.3").unwrap().len(), 2);
        assert_eq!(protocol_versions("1.3", "1.3").unwrap().len(), 1);
        assert_eq!(protocol_versions("1.2", "1.2").unwrap().len(), 1);
        assert!(protocol_versions("1.3", "1.2").is_err());
        assert!(protocol_versions("1.1", "1.3").is_err());
    }

    #[test]
    fn half_configured_fallback_is_rejected() {
        let config = TlsConfig {
            root_certificate: Some("cert.pem".into()),
            root_key: None,
            ..Default::default()
        };
        assert!(matches!(
            TlsSettings::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn no_fallback_is_fine() {
        let settings = TlsSettings::from_config(&TlsConfig::default()).unwrap();
        assert!(settings.fallback().is_none());
    }
}
