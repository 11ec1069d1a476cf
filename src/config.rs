//! Configuration module for the fetcher client

use crate::error::{FetchError, Result};
use crate::image::digest::DigestAlgorithm;
use crate::image::reference::DEFAULT_TAG;
use crate::registry::transport::RoundTrip;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub const ENV_DEFAULT_TAG: &str = "ROOTFS_FETCH_DEFAULT_TAG";
pub const ENV_DIGEST_ALGO: &str = "ROOTFS_FETCH_DIGEST_ALGO";
pub const ENV_DISABLE_HTTPS: &str = "ROOTFS_FETCH_DISABLE_HTTPS";

/// Trust pinning policy handed to the trust metadata repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPinConfig {
    /// GUN to the root key ids it must be signed with
    #[serde(default)]
    pub certs: HashMap<String, Vec<String>>,
    /// GUN prefix to a CA bundle path
    #[serde(default)]
    pub ca: HashMap<String, String>,
    #[serde(default)]
    pub disable_tofu: bool,
}

impl TrustPinConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| FetchError::io_at(e, path))?;
        serde_json::from_str(&content).map_err(|e| {
            FetchError::Configuration(format!(
                "invalid trust pin file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Options for fetching and verifying images
///
/// Immutable once built; one value may start any number of independent fetches.
#[derive(Clone)]
pub struct FetcherConfig {
    /// Tag used when a reference has none
    pub default_tag: String,
    /// Algorithm of the trusted digest looked up in trust metadata
    pub digest_algo: DigestAlgorithm,
    /// Use plain http for both endpoints
    pub disable_https: bool,
    /// Opt-out of trust verification; rejected by [`FetcherConfig::validate`]
    pub disable_notary: bool,
    /// Base transport, a reqwest client when `None`
    pub transport: Option<Arc<dyn RoundTrip>>,
    pub trust_pin: TrustPinConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            default_tag: DEFAULT_TAG.to_string(),
            digest_algo: DigestAlgorithm::CANONICAL,
            disable_https: false,
            disable_notary: false,
            transport: None,
            trust_pin: TrustPinConfig::default(),
        }
    }
}

impl fmt::Debug for FetcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherConfig")
            .field("default_tag", &self.default_tag)
            .field("digest_algo", &self.digest_algo)
            .field("disable_https", &self.disable_https)
            .field("disable_notary", &self.disable_notary)
            .field("transport", &self.transport.as_ref().map(|_| "custom"))
            .field("trust_pin", &self.trust_pin)
            .finish()
    }
}

impl FetcherConfig {
    /// Defaults overlaid with `ROOTFS_FETCH_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(tag) = lookup(ENV_DEFAULT_TAG).filter(|v| !v.is_empty()) {
            config.default_tag = tag;
        }
        if let Some(algo) = lookup(ENV_DIGEST_ALGO).filter(|v| !v.is_empty()) {
            config.digest_algo = algo.parse()?;
        }
        if let Some(flag) = lookup(ENV_DISABLE_HTTPS) {
            config.disable_https = parse_bool(ENV_DISABLE_HTTPS, &flag)?;
        }
        Ok(config)
    }

    pub fn with_transport(mut self, transport: Arc<dyn RoundTrip>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Checks made before any network I/O
    pub fn validate(&self) -> Result<()> {
        if self.disable_notary {
            return Err(FetchError::Configuration(
                "trust verification cannot be disabled: unsigned fetches are not supported"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        other => Err(FetchError::Configuration(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}
