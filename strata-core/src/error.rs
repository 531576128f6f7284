use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the Strata daemon.
///
/// All variants carry owned data so the error can be cloned: the lookup
/// cache and the archive cache both memoize error outcomes and hand them
/// to multiple waiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("domain does not exist")]
    DomainNotFound,

    #[error("domains source is not ready")]
    SourceNotReady,

    #[error("domains source failed: {0}")]
    SourceUnavailable(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("{0}: path escapes the site root")]
    OutsideRoot(String),

    #[error("{0}: is not a regular file")]
    NotRegularFile(String),

    #[error("file not found")]
    NotFound,

    #[error("{0}: is not a symlink")]
    NotSymlink(String),

    #[error("{0}: symlink too large")]
    SymlinkTooLarge(String),

    #[error("{0}: too many levels of symbolic links")]
    SymlinkLoop(String),

    /// The resolved entry is a directory. Drives the serving state
    /// machine (retry with `index.html` or redirect to `…/`), never
    /// shown to the client.
    #[error("{full_path}: is a directory")]
    IsDirectory {
        full_path: String,
        relative_path: String,
    },

    /// The path has no `.html` extension and does not exist. Drives the
    /// serving state machine (retry with `.html` appended).
    #[error("{full_path}: no extension and does not exist")]
    NoExtension { full_path: String },

    #[error("range requests are not supported by the remote server")]
    RangeRequestsNotSupported,

    #[error("archive corrupted: {0}")]
    ArchiveCorrupted(String),

    #[error("archive open timed out: {0}")]
    ArchiveOpenTimeout(String),

    #[error("archive not supported: {0}")]
    ArchiveNotSupported(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("the internal API rejected the shared secret")]
    Unauthorized,

    #[error("tls key pair: {0}")]
    TlsKeyPair(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("request canceled: {0}")]
    Canceled(String),
}

impl Error {
    /// Map to the HTTP status served to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::DomainNotFound => 404,
            Error::SourceNotReady => 503,
            Error::SourceUnavailable(_) | Error::Upstream(_) | Error::Unauthorized => 502,
            Error::MethodNotAllowed => 405,
            Error::OutsideRoot(_)
            | Error::NotRegularFile(_)
            | Error::NotFound
            | Error::NotSymlink(_)
            | Error::SymlinkTooLarge(_)
            | Error::SymlinkLoop(_)
            | Error::IsDirectory { .. }
            | Error::NoExtension { .. } => 404,
            Error::RangeRequestsNotSupported
            | Error::ArchiveCorrupted(_)
            | Error::ArchiveOpenTimeout(_)
            | Error::ArchiveNotSupported(_) => 500,
            _ => 500,
        }
    }

    /// True when the lookup definitively said the domain does not exist
    /// (a permanent outcome, unlike transport failures).
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::DomainNotFound)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Io(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::DomainNotFound.status_code(), 404);
        assert_eq!(Error::SourceNotReady.status_code(), 503);
        assert_eq!(Error::SourceUnavailable("x".into()).status_code(), 502);
        assert_eq!(Error::MethodNotAllowed.status_code(), 405);
        assert_eq!(Error::OutsideRoot("p".into()).status_code(), 404);
        assert_eq!(Error::NotRegularFile("p".into()).status_code(), 404);
        assert_eq!(Error::RangeRequestsNotSupported.status_code(), 500);
        assert_eq!(Error::ArchiveCorrupted("u".into()).status_code(), 500);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(err), Error::NotFound);
    }

    #[test]
    fn io_other_keeps_message() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        match Error::from(err) {
            Error::Io(msg) => assert!(msg.contains("denied")),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn only_domain_not_found_is_permanent() {
        assert!(Error::DomainNotFound.is_permanent());
        assert!(!Error::Upstream("x".into()).is_permanent());
        assert!(!Error::SourceNotReady.is_permanent());
    }
}
