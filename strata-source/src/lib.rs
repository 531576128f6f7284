pub mod api;
pub mod disk;

use std::sync::Arc;
use strata_core::domain::Domain;
use strata_core::{host, Result};

/// The two interchangeable domain configuration sources.
pub enum Source {
    Disk(Arc<disk::DiskSource>),
    Api(Arc<api::ApiSource>),
}

impl Source {
    /// Look up the domain serving `host`. Hostnames are normalized
    /// (lowercased, port stripped) so lookups are case-insensitive.
    pub async fn get_domain(&self, raw_host: &str) -> Result<Option<Arc<Domain>>> {
        let host = host::normalize(raw_host);
        match self {
            Source::Disk(disk) => Ok(disk.get_domain(&host)),
            Source::Api(api) => api.get_domain(&host).await,
        }
    }

    /// Ready to serve: the disk source after its first full scan, the
    /// API source once the upstream accepted our credentials.
    pub fn is_ready(&self) -> bool {
        match self {
            Source::Disk(disk) => disk.is_ready(),
            Source::Api(api) => api.is_ready(),
        }
    }
}
