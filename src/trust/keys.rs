//! Trust metadata keys and signatures
//!
//! Keys are identified by the hex sha256 of their canonical JSON form, so an id
//! can always be recomputed from the key material it names. Signatures are
//! ECDSA P-256 over the canonical JSON of a document's `signed` object.

use crate::error::{FetchError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use der::DecodePem;
use olpc_cjson::CanonicalFormatter;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use x509_cert::Certificate;

/// Bare public key, `public` is base64 DER SubjectPublicKeyInfo
pub const KEY_TYPE_ECDSA: &str = "ecdsa";
/// Certificate-wrapped public key, `public` is a base64 PEM certificate
pub const KEY_TYPE_ECDSA_X509: &str = "ecdsa-x509";
pub const SIGNATURE_METHOD_ECDSA: &str = "ecdsa";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub public: String,
    #[serde(default)]
    pub private: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub keytype: String,
    pub keyval: KeyValue,
}

impl PublicKey {
    pub fn ecdsa(spki_der: &[u8]) -> Self {
        Self::with_material(KEY_TYPE_ECDSA, spki_der)
    }

    pub fn ecdsa_x509(certificate_pem: &[u8]) -> Self {
        Self::with_material(KEY_TYPE_ECDSA_X509, certificate_pem)
    }

    fn with_material(keytype: &str, material: &[u8]) -> Self {
        Self {
            keytype: keytype.to_string(),
            keyval: KeyValue {
                public: STANDARD.encode(material),
                private: None,
            },
        }
    }

    /// Id derived from the key material, never from what a document claims.
    pub fn key_id(&self) -> Result<String> {
        let public_only = Self {
            keytype: self.keytype.clone(),
            keyval: KeyValue {
                public: self.keyval.public.clone(),
                private: None,
            },
        };
        Ok(hex::encode(Sha256::digest(canonical_json(&public_only)?)))
    }

    /// Certificates must be within their validity window at `now`.
    pub fn verifying_key(&self, now: DateTime<Utc>) -> Result<VerifyingKey> {
        let material = STANDARD
            .decode(&self.keyval.public)
            .map_err(|e| invalid_key(&self.keytype, e))?;

        match self.keytype.as_str() {
            KEY_TYPE_ECDSA => {
                VerifyingKey::from_public_key_der(&material).map_err(|e| invalid_key(KEY_TYPE_ECDSA, e))
            }
            KEY_TYPE_ECDSA_X509 => {
                let certificate =
                    Certificate::from_pem(&material).map_err(|e| invalid_key(KEY_TYPE_ECDSA_X509, e))?;
                let validity = &certificate.tbs_certificate.validity;
                let not_before = validity.not_before.to_unix_duration().as_secs() as i64;
                let not_after = validity.not_after.to_unix_duration().as_secs() as i64;
                let now = now.timestamp();
                if now < not_before || now > not_after {
                    return Err(FetchError::TrustMetadata(
                        "root certificate is outside its validity period".to_string(),
                    ));
                }

                let point = certificate
                    .tbs_certificate
                    .subject_public_key_info
                    .subject_public_key
                    .as_bytes()
                    .ok_or_else(|| invalid_key(KEY_TYPE_ECDSA_X509, "unaligned public key"))?;
                VerifyingKey::from_sec1_bytes(point).map_err(|e| invalid_key(KEY_TYPE_ECDSA_X509, e))
            }
            other => Err(FetchError::TrustMetadata(format!(
                "unsupported key type {}",
                other
            ))),
        }
    }
}

fn invalid_key(keytype: &str, cause: impl std::fmt::Display) -> FetchError {
    FetchError::TrustMetadata(format!("invalid {} key: {}", keytype, cause))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub keyid: String,
    pub method: String,
    /// base64 of the raw `r || s` pair
    pub sig: String,
}

pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, CanonicalFormatter::new());
    value.serialize(&mut serializer).map_err(|e| {
        FetchError::TrustMetadata(format!("could not canonicalize metadata: {}", e))
    })?;
    Ok(out)
}

/// Every declared key id must be the id of the key it labels.
pub fn check_key_ids(owner: &str, keys: &HashMap<String, PublicKey>) -> Result<()> {
    for (declared, key) in keys {
        if key.key_id()? != *declared {
            return Err(FetchError::TrustMetadata(format!(
                "{} metadata labels a key with the wrong id {}",
                owner, declared
            )));
        }
    }
    Ok(())
}

/// Keys a role may sign with, and how many distinct ones must
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoleKeys {
    #[serde(default)]
    pub keyids: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
}

fn default_threshold() -> u32 {
    1
}

/// Count valid signatures by distinct assigned keys and require `threshold` of them.
pub fn verify_signatures(
    role: &str,
    signed: &serde_json::Value,
    signatures: &[SignatureEntry],
    assigned: &RoleKeys,
    keys: &HashMap<String, PublicKey>,
    now: DateTime<Utc>,
) -> Result<()> {
    let message = canonical_json(signed)?;
    let mut valid: HashSet<&str> = HashSet::new();

    for entry in signatures {
        if valid.contains(entry.keyid.as_str())
            || !assigned.keyids.contains(&entry.keyid)
            || !entry.method.eq_ignore_ascii_case(SIGNATURE_METHOD_ECDSA)
        {
            continue;
        }
        let Some(key) = keys.get(&entry.keyid) else {
            continue;
        };
        let verifying_key = key.verifying_key(now)?;
        let Ok(raw) = STANDARD.decode(&entry.sig) else {
            continue;
        };
        let Ok(signature) = Signature::from_slice(&raw) else {
            continue;
        };
        if verifying_key.verify(&message, &signature).is_ok() {
            valid.insert(entry.keyid.as_str());
        }
    }

    let required = assigned.threshold.max(1) as usize;
    if valid.len() < required {
        return Err(FetchError::TrustMetadata(format!(
            "{} metadata has {} valid signatures, {} required",
            role,
            valid.len(),
            required
        )));
    }
    Ok(())
}
