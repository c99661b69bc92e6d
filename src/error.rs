//! Error taxonomy shared by the warehouse, media and UI layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DashboardError {
    /// Bad OAuth client credentials or rejected token.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Warehouse or object store unreachable.
    #[error("warehouse unreachable: {0}")]
    Connection(String),

    /// Malformed SQL, missing table, or a failure after the reconnect budget is spent.
    #[error("query failed: {0}")]
    Query(String),

    /// Principal lacks the warehouse grant. Never retried.
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("media not found: {0}")]
    MediaNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Local decode / encode / transcode failure.
    #[error("media processing failed: {0}")]
    Media(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = DashboardError> = std::result::Result<T, E>;

impl DashboardError {
    /// Errors that justify tearing the session down and reconnecting once.
    pub fn is_stale_connection(&self) -> bool {
        matches!(self, DashboardError::Connection(_) | DashboardError::Authentication(_))
    }

    /// Short text for the UI error banner.
    pub fn banner(&self) -> String {
        match self {
            DashboardError::MediaNotFound(_) => "Media unavailable".to_string(),
            other => format!("Error: {}", other),
        }
    }
}

impl From<reqwest::Error> for DashboardError {
    fn from(e: reqwest::Error) -> Self {
        DashboardError::Connection(e.to_string())
    }
}

impl From<image::ImageError> for DashboardError {
    fn from(e: image::ImageError) -> Self {
        DashboardError::Media(e.to_string())
    }
}

impl From<object_store::Error> for DashboardError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => DashboardError::MediaNotFound(path),
            other => DashboardError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_classification() {
        assert!(DashboardError::Connection("reset".into()).is_stale_connection());
        assert!(DashboardError::Authentication("expired".into()).is_stale_connection());
        assert!(!DashboardError::Query("syntax".into()).is_stale_connection());
        assert!(!DashboardError::Permission("no grant".into()).is_stale_connection());
    }

    #[test]
    fn not_found_maps_to_media_not_found() {
        let e = object_store::Error::NotFound {
            path: "frames/a.jpg".into(),
            source: "missing".into(),
        };
        assert!(matches!(DashboardError::from(e), DashboardError::MediaNotFound(p) if p == "frames/a.jpg"));
    }

    #[test]
    fn banner_hides_media_details() {
        assert_eq!(DashboardError::MediaNotFound("gs://b/k".into()).banner(), "Media unavailable");
        assert!(DashboardError::Query("boom".into()).banner().starts_with("Error: query failed"));
    }
}
