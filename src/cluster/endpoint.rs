//! Cluster endpoints
//!
//! The command line tool names its cluster with a URL-like string. Only
//! `file://<dir>` endpoints, backed by a persisted [`MemoryCluster`], can be
//! opened; network schemes are recognised so they can be rejected with a
//! clear configuration error.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::debug;

use super::credentials::Credentials;
use super::memory::{MemoryCluster, MemorySession};
use crate::error::{BackupError, BackupResult};

/// A parsed cluster endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEndpoint {
    /// A persisted in-process cluster stored in a directory
    File(PathBuf),
    /// A network endpoint (`http://`, `https://`, `couchbase://`)
    Remote(String),
}

impl FromStr for ClusterEndpoint {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(BackupError::Config(
                    "file:// endpoint needs a directory".into(),
                ));
            }
            return Ok(Self::File(PathBuf::from(path)));
        }

        for scheme in ["http://", "https://", "couchbase://", "couchbases://"] {
            if s.starts_with(scheme) && s.len() > scheme.len() {
                return Ok(Self::Remote(s.to_string()));
            }
        }

        Err(BackupError::Config(format!(
            "Unrecognised cluster endpoint '{}'",
            s
        )))
    }
}

impl fmt::Display for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Remote(url) => write!(f, "{}", url),
        }
    }
}

/// An open, authenticated cluster connection
#[derive(Debug)]
pub struct Connection {
    cluster: MemoryCluster,
    session: MemorySession,
}

impl Connection {
    /// The authenticated client
    pub fn client(&self) -> &MemorySession {
        &self.session
    }

    /// The cluster behind the connection
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    /// Flush cluster state and close
    pub fn close(self) -> BackupResult<()> {
        self.cluster.save()
    }
}

/// Open a connection to an endpoint
pub fn connect(endpoint: &str, credentials: Credentials) -> BackupResult<Connection> {
    match endpoint.parse::<ClusterEndpoint>()? {
        ClusterEndpoint::File(dir) => {
            debug!(dir = %dir.display(), "opening file cluster");
            let cluster = MemoryCluster::open(&dir)?;
            let session = cluster.connect(credentials);
            Ok(Connection { cluster, session })
        }
        ClusterEndpoint::Remote(url) => Err(BackupError::Config(format!(
            "Network endpoints are not supported by this build: {}",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::BucketManager;
    use tempfile::TempDir;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            "file:///tmp/cluster".parse::<ClusterEndpoint>().unwrap(),
            ClusterEndpoint::File(PathBuf::from("/tmp/cluster"))
        );
        assert!(matches!(
            "http://localhost:8091".parse::<ClusterEndpoint>().unwrap(),
            ClusterEndpoint::Remote(_)
        ));
        assert!("localhost".parse::<ClusterEndpoint>().is_err());
        assert!("file://".parse::<ClusterEndpoint>().is_err());
    }

    #[test]
    fn test_remote_rejected() {
        let err = connect(
            "http://localhost:8091",
            Credentials::new("Administrator", "password"),
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_file_connection_persists() {
        let temp_dir = TempDir::new().unwrap();
        let endpoint = format!("file://{}", temp_dir.path().display());

        let conn = connect(&endpoint, Credentials::new("Administrator", "password")).unwrap();
        conn.client()
            .create_bucket(&crate::cluster::BucketSettings::couchbase("default"))
            .unwrap();
        conn.close().unwrap();

        let conn = connect(&endpoint, Credentials::new("Administrator", "password")).unwrap();
        let buckets = conn.client().list_buckets().unwrap();
        assert_eq!(buckets.len(), 1);
    }
}
