//! Trust metadata lookup
//!
//! Resolves a tag to the digest the trust service has signed for it. The
//! resulting [`TrustedDigest`] is the only value the registry side of the
//! pipeline accepts as a manifest address.

pub mod keys;
pub mod repository;

pub use keys::PublicKey;
pub use repository::{FileCachedRepository, TargetEntry};

use crate::config::FetcherConfig;
use crate::error::{FetchError, Result};
use crate::image::digest::{ContentDigest, TrustedDigest};
use crate::image::reference::ImageReference;
use crate::logging::{EventObserver, FetchEvent};
use crate::registry::auth::token_auth;
use crate::registry::transport::RoundTrip;
use std::sync::Arc;

const CACHE_PREFIX: &str = "notary";

/// Look up the signed digest for `reference.tag` on the trust service at `trust_url`.
///
/// Metadata is cached in a fresh temporary directory that is removed before
/// this returns, whatever the outcome.
pub async fn lookup_trusted_digest(
    reference: &ImageReference,
    trust_url: &str,
    base: Arc<dyn RoundTrip>,
    config: &FetcherConfig,
    observer: Arc<dyn EventObserver>,
) -> Result<TrustedDigest> {
    let cache = tempfile::Builder::new()
        .prefix(CACHE_PREFIX)
        .tempdir()
        .map_err(|e| FetchError::Io {
            message: format!("could not create trust cache: {}", e),
            path: None,
        })?;

    let gun = reference.canonical_name();
    let transport = token_auth(trust_url, base, &gun, observer.clone()).await?;
    let repository = FileCachedRepository::new(
        cache.path(),
        &gun,
        trust_url,
        Arc::new(transport),
        config.trust_pin.clone(),
    )?;

    let target = repository
        .get_target_by_name(&reference.tag)
        .await?
        .ok_or_else(|| FetchError::NoSignedTarget {
            tag: reference.tag.clone(),
        })?;
    let trusted = trusted_digest_of(&target, config)?;
    check_pinned(reference, &trusted)?;

    observer.on_event(&FetchEvent::TrustedDigest {
        digest: trusted.to_string(),
    });
    Ok(trusted)
}

fn trusted_digest_of(target: &TargetEntry, config: &FetcherConfig) -> Result<TrustedDigest> {
    let algorithm = config.digest_algo;
    let hash = target
        .hashes
        .get(algorithm.name())
        .ok_or_else(|| FetchError::MissingDigest {
            algorithm: algorithm.to_string(),
        })?;
    let digest = ContentDigest::from_bytes(algorithm, hash.clone())?;
    Ok(TrustedDigest::new(digest))
}

fn check_pinned(reference: &ImageReference, trusted: &TrustedDigest) -> Result<()> {
    match &reference.digest {
        Some(pinned) if pinned != trusted.digest() => Err(FetchError::PinnedDigestMismatch {
            pinned: pinned.to_string(),
            signed: trusted.to_string(),
        }),
        _ => Ok(()),
    }
}
