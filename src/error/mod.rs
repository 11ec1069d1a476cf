//! Error types for the fetch and squash pipeline
//!
//! Every failure aborts the remaining pipeline steps. Nothing is downgraded to a warning.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Invalid configuration, rejected before any network call
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Unparseable image reference, digest or metadata document
    #[error("Parse error: {0}")]
    Parse(String),
    /// Transport-level failure, propagated as-is
    #[error("Network error: {0}")]
    Network(String),
    /// Unexpected HTTP status from a registry or trust endpoint
    #[error("HTTP error: {url} returned {status}")]
    Http { status: u16, url: String },
    /// Authorization could not be attached to a request
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("no signed target for tag {tag}")]
    NoSignedTarget { tag: String },
    #[error("signed target has no {algorithm} digest")]
    MissingDigest { algorithm: String },
    /// Trust metadata is absent, inconsistent, or violates the pinning policy
    #[error("Trust metadata error: {0}")]
    TrustMetadata(String),
    /// The reference pinned a digest other than the one signed for its tag
    #[error("reference pins {pinned} but the tag is signed for {signed}")]
    PinnedDigestMismatch { pinned: String, signed: String },
    #[error("manifest not found: {digest}")]
    ManifestNotFound { digest: String },
    #[error("unsupported manifest: {0}")]
    UnsupportedManifest(String),
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },
    #[error("got no layers to squash")]
    NoLayers,
    #[error("refusing to extract outside of the working tree: {path}")]
    PathTraversal { path: String },
    /// Extraction failure, tagged with the 1-based index of the offending layer
    #[error("layer {index}/{total}: {source}")]
    Layer {
        index: usize,
        total: usize,
        #[source]
        source: Box<FetchError>,
    },
    #[error("IO error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn io_at(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        FetchError::Io {
            message: format!("{}: {}", path.display(), err),
            path: Some(path),
        }
    }

    pub fn layer(index: usize, total: usize, source: FetchError) -> Self {
        FetchError::Layer {
            index,
            total,
            source: Box::new(source),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::Configuration(err.to_string())
    }
}
