//! File-cached trust metadata repository
//!
//! Metadata is downloaded from `<trust>/v2/<gun>/_trust/tuf/<role>.json` and
//! written through to `<base>/tuf/<gun>/metadata/<role>.json`. Root must be
//! signed by its own root keys (narrowed to the pinned ones when pins exist).
//! Every other role must carry a threshold of signatures from the keys its
//! parent assigns it, must not be expired, and must match the hash chain
//! timestamp → snapshot → targets before any target is returned.

use super::keys::{self, PublicKey, RoleKeys, SignatureEntry};
use crate::config::TrustPinConfig;
use crate::error::{FetchError, Result};
use crate::image::digest::DigestAlgorithm;
use crate::registry::transport::{HttpRequest, RoundTrip, v2_url};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

pub const ROLE_ROOT: &str = "root";
pub const ROLE_TIMESTAMP: &str = "timestamp";
pub const ROLE_SNAPSHOT: &str = "snapshot";
pub const ROLE_TARGETS: &str = "targets";
pub const ROLE_RELEASES: &str = "targets/releases";

#[derive(Debug, Deserialize)]
struct SignedDocument {
    signed: serde_json::Value,
    #[serde(default)]
    signatures: Vec<SignatureEntry>,
}

/// Fields every role carries
#[derive(Debug, Deserialize)]
struct Header {
    #[serde(rename = "_type")]
    kind: String,
    expires: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RootMeta {
    #[serde(default)]
    keys: HashMap<String, PublicKey>,
    #[serde(default)]
    roles: HashMap<String, RoleKeys>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileMeta {
    length: u64,
    #[serde(default)]
    hashes: HashMap<String, String>,
}

/// Timestamp and snapshot roles share this shape
#[derive(Debug, Deserialize)]
struct MetaListing {
    #[serde(default)]
    meta: HashMap<String, FileMeta>,
}

#[derive(Debug, Deserialize)]
struct TargetsMeta {
    #[serde(default)]
    targets: HashMap<String, FileMeta>,
    #[serde(default)]
    delegations: Delegations,
}

#[derive(Debug, Default, Deserialize)]
struct Delegations {
    #[serde(default)]
    keys: HashMap<String, PublicKey>,
    #[serde(default)]
    roles: Vec<DelegatedRole>,
}

#[derive(Debug, Deserialize)]
struct DelegatedRole {
    name: String,
    #[serde(flatten)]
    keys: RoleKeys,
}

/// A signed target, hashes decoded to raw bytes and keyed by algorithm name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub name: String,
    pub role: String,
    pub length: u64,
    pub hashes: HashMap<String, Vec<u8>>,
}

pub struct FileCachedRepository {
    cache_dir: PathBuf,
    gun: String,
    base_url: Url,
    transport: Arc<dyn RoundTrip>,
    trust_pin: TrustPinConfig,
}

impl FileCachedRepository {
    /// Open (or create) the metadata cache for `gun` under `base_dir`.
    pub fn new(
        base_dir: &Path,
        gun: &str,
        base_url: &str,
        transport: Arc<dyn RoundTrip>,
        trust_pin: TrustPinConfig,
    ) -> Result<Self> {
        let cache_dir = base_dir.join("tuf").join(gun).join("metadata");
        std::fs::create_dir_all(&cache_dir).map_err(|e| FetchError::io_at(e, &cache_dir))?;
        Ok(Self {
            cache_dir,
            gun: gun.to_string(),
            base_url: Url::parse(base_url)?,
            transport,
            trust_pin,
        })
    }

    /// Look `name` up in `targets/releases`, then in `targets`.
    pub async fn get_target_by_name(&self, name: &str) -> Result<Option<TargetEntry>> {
        let now = Utc::now();

        let root_bytes = self.download(ROLE_ROOT).await?.ok_or_else(|| {
            FetchError::TrustMetadata(format!("no trust data for {}", self.gun))
        })?;
        let root_document: SignedDocument = decode(ROLE_ROOT, &root_bytes)?;
        let claimed: RootMeta = from_value(ROLE_ROOT, root_document.signed.clone())?;
        keys::check_key_ids(ROLE_ROOT, &claimed.keys)?;
        let signers = self.root_signers(assignment(&claimed.roles, ROLE_ROOT)?)?;
        let root: RootMeta = open(ROLE_ROOT, "Root", root_document, &signers, &claimed.keys, now)?;

        let timestamp_bytes = self.require(ROLE_TIMESTAMP).await?;
        let timestamp: MetaListing = open(
            ROLE_TIMESTAMP,
            "Timestamp",
            decode(ROLE_TIMESTAMP, &timestamp_bytes)?,
            assignment(&root.roles, ROLE_TIMESTAMP)?,
            &root.keys,
            now,
        )?;
        let snapshot_meta = listed(&timestamp, ROLE_TIMESTAMP, ROLE_SNAPSHOT)?;

        let snapshot_bytes = self.require(ROLE_SNAPSHOT).await?;
        verify_file_meta(ROLE_SNAPSHOT, &snapshot_bytes, snapshot_meta)?;
        let snapshot: MetaListing = open(
            ROLE_SNAPSHOT,
            "Snapshot",
            decode(ROLE_SNAPSHOT, &snapshot_bytes)?,
            assignment(&root.roles, ROLE_SNAPSHOT)?,
            &root.keys,
            now,
        )?;
        if let Some(root_meta) = snapshot.meta.get(ROLE_ROOT) {
            verify_file_meta(ROLE_ROOT, &root_bytes, root_meta)?;
        }

        let targets_meta = listed(&snapshot, ROLE_SNAPSHOT, ROLE_TARGETS)?;
        let targets_bytes = self.require(ROLE_TARGETS).await?;
        verify_file_meta(ROLE_TARGETS, &targets_bytes, targets_meta)?;
        let targets: TargetsMeta = open(
            ROLE_TARGETS,
            "Targets",
            decode(ROLE_TARGETS, &targets_bytes)?,
            assignment(&root.roles, ROLE_TARGETS)?,
            &root.keys,
            now,
        )?;

        let mut roles = Vec::new();
        if let Some(releases_meta) = snapshot.meta.get(ROLE_RELEASES) {
            let delegation = targets
                .delegations
                .roles
                .iter()
                .find(|role| role.name == ROLE_RELEASES)
                .ok_or_else(|| {
                    FetchError::TrustMetadata(format!(
                        "{} is listed but targets does not delegate it",
                        ROLE_RELEASES
                    ))
                })?;
            keys::check_key_ids(ROLE_TARGETS, &targets.delegations.keys)?;

            let bytes = self.require(ROLE_RELEASES).await?;
            verify_file_meta(ROLE_RELEASES, &bytes, releases_meta)?;
            let releases: TargetsMeta = open(
                ROLE_RELEASES,
                "Targets",
                decode(ROLE_RELEASES, &bytes)?,
                &delegation.keys,
                &targets.delegations.keys,
                now,
            )?;
            roles.push((ROLE_RELEASES, releases));
        }
        roles.push((ROLE_TARGETS, targets));

        for (role, listing) in roles {
            if let Some(meta) = listing.targets.get(name) {
                return Ok(Some(TargetEntry {
                    name: name.to_string(),
                    role: role.to_string(),
                    length: meta.length,
                    hashes: decode_hashes(role, &meta.hashes)?,
                }));
            }
        }

        Ok(None)
    }

    /// Keys root must be signed with. Pins narrow the root role to the pinned ids.
    fn root_signers(&self, assigned: &RoleKeys) -> Result<RoleKeys> {
        if let Some(pinned) = self.trust_pin.certs.get(&self.gun) {
            let keyids: Vec<String> = assigned
                .keyids
                .iter()
                .filter(|id| pinned.contains(id))
                .cloned()
                .collect();
            if keyids.is_empty() {
                return Err(FetchError::TrustMetadata(format!(
                    "root keys of {} do not match the pinned certificates",
                    self.gun
                )));
            }
            return Ok(RoleKeys {
                keyids,
                threshold: assigned.threshold,
            });
        }

        if self
            .trust_pin
            .ca
            .keys()
            .any(|prefix| self.gun.starts_with(prefix.as_str()))
        {
            return Err(FetchError::Configuration(format!(
                "CA trust pinning for {} is not supported",
                self.gun
            )));
        }

        if self.trust_pin.disable_tofu {
            return Err(FetchError::TrustMetadata(format!(
                "trust on first use is disabled and {} has no pinned certificates",
                self.gun
            )));
        }

        Ok(assigned.clone())
    }

    async fn require(&self, role: &str) -> Result<Vec<u8>> {
        self.download(role).await?.ok_or_else(|| {
            FetchError::TrustMetadata(format!("{} has no {} metadata", self.gun, role))
        })
    }

    /// `None` when the trust service has no such role
    async fn download(&self, role: &str) -> Result<Option<Vec<u8>>> {
        let url = v2_url(
            &self.base_url,
            &format!("{}/_trust/tuf/{}.json", self.gun, role),
        )?;
        let response = self.transport.round_trip(&HttpRequest::get(url.clone())).await?;
        match response.status {
            StatusCode::OK => {
                self.cache(role, &response.body)?;
                Ok(Some(response.body))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    fn cache(&self, role: &str, bytes: &[u8]) -> Result<()> {
        let path = self.cache_dir.join(format!("{}.json", role));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FetchError::io_at(e, parent))?;
        }
        std::fs::write(&path, bytes).map_err(|e| FetchError::io_at(e, &path))
    }
}

fn assignment<'a>(roles: &'a HashMap<String, RoleKeys>, role: &str) -> Result<&'a RoleKeys> {
    roles.get(role).ok_or_else(|| {
        FetchError::TrustMetadata(format!("root metadata assigns no keys to {}", role))
    })
}

/// Verify signatures, type and expiry, then read the role body.
fn open<T: DeserializeOwned>(
    role: &str,
    kind: &str,
    document: SignedDocument,
    assigned: &RoleKeys,
    keys: &HashMap<String, PublicKey>,
    now: DateTime<Utc>,
) -> Result<T> {
    keys::verify_signatures(role, &document.signed, &document.signatures, assigned, keys, now)?;

    let header: Header = from_value(role, document.signed.clone())?;
    if header.kind != kind {
        return Err(FetchError::TrustMetadata(format!(
            "{} metadata has type {}, expected {}",
            role, header.kind, kind
        )));
    }
    if header.expires <= now {
        return Err(FetchError::TrustMetadata(format!(
            "{} metadata expired at {}",
            role, header.expires
        )));
    }
    from_value(role, document.signed)
}

fn from_value<T: DeserializeOwned>(role: &str, value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| FetchError::TrustMetadata(format!("malformed {} metadata: {}", role, e)))
}

fn decode<T: DeserializeOwned>(role: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| FetchError::TrustMetadata(format!("malformed {} metadata: {}", role, e)))
}

fn listed<'a>(listing: &'a MetaListing, owner: &str, role: &str) -> Result<&'a FileMeta> {
    listing.meta.get(role).ok_or_else(|| {
        FetchError::TrustMetadata(format!("{} metadata does not list {}", owner, role))
    })
}

fn decode_hashes(role: &str, hashes: &HashMap<String, String>) -> Result<HashMap<String, Vec<u8>>> {
    hashes
        .iter()
        .map(|(algorithm, encoded)| {
            STANDARD
                .decode(encoded)
                .map(|bytes| (algorithm.clone(), bytes))
                .map_err(|e| {
                    FetchError::TrustMetadata(format!(
                        "invalid {} hash in {} metadata: {}",
                        algorithm, role, e
                    ))
                })
        })
        .collect()
}

/// Check `bytes` against the length and every supported hash listed for them
fn verify_file_meta(role: &str, bytes: &[u8], meta: &FileMeta) -> Result<()> {
    if bytes.len() as u64 != meta.length {
        return Err(FetchError::TrustMetadata(format!(
            "{} metadata is {} bytes, expected {}",
            role,
            bytes.len(),
            meta.length
        )));
    }

    let mut checked = 0;
    for (name, expected) in decode_hashes(role, &meta.hashes)? {
        let Ok(algorithm) = name.parse::<DigestAlgorithm>() else {
            continue;
        };
        if algorithm.hash(bytes) != expected {
            return Err(FetchError::TrustMetadata(format!(
                "{} metadata does not match its {} checksum",
                role, algorithm
            )));
        }
        checked += 1;
    }

    if checked == 0 {
        return Err(FetchError::TrustMetadata(format!(
            "{} metadata has no supported checksum",
            role
        )));
    }
    Ok(())
}
