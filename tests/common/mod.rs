// Shared fixtures: a scripted registry/trust/token server behind the
// `RoundTrip` seam, signed trust metadata and in-memory layer archives.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P256_SHA256};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use rootfs_fetch::Result;
use rootfs_fetch::image::digest::{ContentDigest, DigestAlgorithm};
use rootfs_fetch::image::manifest::{MEDIA_TYPE_LAYER, MEDIA_TYPE_SCHEMA2};
use rootfs_fetch::registry::transport::{HttpRequest, HttpResponse, RoundTrip};
use rootfs_fetch::trust::keys::{PublicKey, SIGNATURE_METHOD_ECDSA, SignatureEntry, canonical_json};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Mutex;

pub const AUTH_HOST: &str = "auth.example.com";
pub const REGISTRY_HOST: &str = "registry-1.docker.io";
pub const TRUST_HOST: &str = "notary.docker.io";
pub const ALPINE_GUN: &str = "docker.io/library/alpine";
pub const ALPINE_REPOSITORY: &str = "library/alpine";

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn typed(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }
}

/// Scripted hub answering by `METHOD host/path`
///
/// Protected hosts challenge with a bearer realm on [`AUTH_HOST`] and only
/// serve requests carrying the token that realm issued for them. Unknown
/// routes are `404`.
#[derive(Default)]
pub struct FakeHub {
    routes: Mutex<HashMap<String, Reply>>,
    protected: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
    scopes: Mutex<Vec<String>>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protect(&self, host: &str) {
        self.protected.lock().unwrap().insert(host.to_string());
    }

    pub fn route(&self, method: &str, host: &str, path: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .insert(format!("{} {}{}", method, host, path), reply);
    }

    pub fn unroute(&self, method: &str, host: &str, path: &str) {
        self.routes
            .lock()
            .unwrap()
            .remove(&format!("{} {}{}", method, host, path));
    }

    /// Every request seen, as `METHOD host/path`
    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Scopes asked of the token realm, in order
    pub fn token_scopes(&self) -> Vec<String> {
        self.scopes.lock().unwrap().clone()
    }

    fn token_for(host: &str) -> String {
        format!("token-{}", host)
    }

    fn issue_token(&self, request: &HttpRequest) -> HttpResponse {
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        if let Some(scope) = query.get("scope") {
            self.scopes.lock().unwrap().push(scope.clone());
        }
        let service = query.get("service").cloned().unwrap_or_default();
        let mut response = HttpResponse::new(StatusCode::OK);
        response.body = json!({ "token": Self::token_for(&service), "expires_in": 300 })
            .to_string()
            .into_bytes();
        response
    }
}

#[async_trait]
impl RoundTrip for FakeHub {
    async fn round_trip(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let host = request.url.host_str().unwrap_or_default().to_string();
        let path = request.url.path().to_string();
        let key = format!("{} {}{}", request.method.as_str(), host, path);
        self.log.lock().unwrap().push(key.clone());

        if host == AUTH_HOST {
            return Ok(self.issue_token(request));
        }

        if self.protected.lock().unwrap().contains(&host) {
            let expected = format!("Bearer {}", Self::token_for(&host));
            let authorized = request
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                == Some(expected.as_str());
            if !authorized {
                let mut response = HttpResponse::new(StatusCode::UNAUTHORIZED);
                let challenge = format!(
                    r#"Bearer realm="https://{}/token",service="{}""#,
                    AUTH_HOST, host
                );
                response
                    .headers
                    .insert(WWW_AUTHENTICATE, HeaderValue::from_str(&challenge).unwrap());
                return Ok(response);
            }
        }

        if path == "/v2/" {
            return Ok(HttpResponse::new(StatusCode::OK));
        }

        let reply = self.routes.lock().unwrap().get(&key).cloned();
        Ok(match reply {
            Some(reply) => {
                let mut response = HttpResponse::new(StatusCode::from_u16(reply.status).unwrap());
                if let Some(content_type) = reply.content_type {
                    response
                        .headers
                        .insert(CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
                }
                if request.method != reqwest::Method::HEAD {
                    response.body = reply.body;
                }
                response
            }
            None => HttpResponse::new(StatusCode::NOT_FOUND),
        })
    }
}

pub fn sha256(data: &[u8]) -> ContentDigest {
    DigestAlgorithm::Sha256.digest(data)
}

/// Build a gzip layer from `(path, content)` pairs
pub fn layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// Regular files of a squashed archive, path to content
pub fn archive_files(archive: &[u8]) -> std::collections::BTreeMap<String, String> {
    use std::io::Read;

    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(archive));
    let mut files = std::collections::BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type().is_file() {
            let path = entry.path().unwrap().display().to_string();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            files.insert(path, content);
        }
    }
    files
}

pub struct ImageFixture {
    pub manifest: Vec<u8>,
    pub digest: ContentDigest,
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
}

impl ImageFixture {
    /// Schema 2 image with a config blob and the given gzip layers
    pub fn schema2(layers: Vec<Vec<u8>>) -> Self {
        let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let mut descriptors = vec![];
        for layer in &layers {
            descriptors.push(json!({
                "mediaType": MEDIA_TYPE_LAYER,
                "size": layer.len(),
                "digest": sha256(layer).to_string(),
            }));
        }
        let manifest = serde_json::to_vec_pretty(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_SCHEMA2,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": config.len(),
                "digest": sha256(&config).to_string(),
            },
            "layers": descriptors,
        }))
        .unwrap();
        Self {
            digest: sha256(&manifest),
            manifest,
            config,
            layers,
        }
    }

    /// Serve the manifest (HEAD and GET), the config and every layer blob
    pub fn publish(&self, hub: &FakeHub, host: &str, repository: &str) {
        let manifest_path = format!("/v2/{}/manifests/{}", repository, self.digest);
        hub.route(
            "HEAD",
            host,
            &manifest_path,
            Reply::typed(MEDIA_TYPE_SCHEMA2, Vec::new()),
        );
        hub.route(
            "GET",
            host,
            &manifest_path,
            Reply::typed(MEDIA_TYPE_SCHEMA2, self.manifest.clone()),
        );
        for blob in std::iter::once(&self.config).chain(self.layers.iter()) {
            hub.route(
                "GET",
                host,
                &format!("/v2/{}/blobs/{}", repository, sha256(blob)),
                Reply::ok(blob.clone()),
            );
        }
    }
}

fn file_meta(bytes: &[u8]) -> serde_json::Value {
    json!({
        "length": bytes.len(),
        "hashes": {
            "sha256": STANDARD.encode(DigestAlgorithm::Sha256.hash(bytes)),
            "sha512": STANDARD.encode(DigestAlgorithm::Sha512.hash(bytes)),
        }
    })
}

/// A metadata signing key and the public form documents list it under
pub struct FixtureKey {
    signing: SigningKey,
    pub public: PublicKey,
    pub id: String,
}

impl FixtureKey {
    /// Bare ECDSA key derived from `seed`
    pub fn ecdsa(seed: u8) -> Self {
        let signing = SigningKey::from_slice(&[seed; 32]).unwrap();
        let der = signing.verifying_key().to_public_key_der().unwrap();
        Self::new(signing, PublicKey::ecdsa(der.as_bytes()))
    }

    /// Fresh key wrapped in a self-signed certificate, the way root keys are published
    pub fn certificate(subject: &str) -> Self {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let signing = SigningKey::from_pkcs8_der(&key_pair.serialize_der()).unwrap();
        let certificate = CertificateParams::new(vec![subject.to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        Self::new(signing, PublicKey::ecdsa_x509(certificate.pem().as_bytes()))
    }

    fn new(signing: SigningKey, public: PublicKey) -> Self {
        let id = public.key_id().unwrap();
        Self { signing, public, id }
    }

    pub fn sign(&self, signed: &serde_json::Value) -> SignatureEntry {
        let signature: Signature = self.signing.sign(&canonical_json(signed).unwrap());
        SignatureEntry {
            keyid: self.id.clone(),
            method: SIGNATURE_METHOD_ECDSA.to_string(),
            sig: STANDARD.encode(signature.to_bytes()),
        }
    }

    fn assignment(&self) -> serde_json::Value {
        json!({ "keyids": [self.id], "threshold": 1 })
    }
}

/// Signed trust metadata for one GUN
pub struct TrustFixture {
    pub targets: Vec<(String, Vec<u8>)>,
    pub releases: Option<Vec<(String, Vec<u8>)>>,
    pub expires: DateTime<Utc>,
    /// Publish root without any signature
    pub unsigned_root: bool,
    /// Role whose document is signed by a key nobody assigned
    pub foreign_signer: Option<String>,
    pub root_key: FixtureKey,
    pub timestamp_key: FixtureKey,
    pub snapshot_key: FixtureKey,
    pub targets_key: FixtureKey,
    pub releases_key: FixtureKey,
}

impl TrustFixture {
    pub fn signing(tag: &str, manifest: &[u8]) -> Self {
        Self {
            targets: vec![(tag.to_string(), manifest.to_vec())],
            releases: None,
            expires: Utc::now() + Duration::days(365),
            unsigned_root: false,
            foreign_signer: None,
            root_key: FixtureKey::certificate("notary-root"),
            timestamp_key: FixtureKey::ecdsa(11),
            snapshot_key: FixtureKey::ecdsa(12),
            targets_key: FixtureKey::ecdsa(13),
            releases_key: FixtureKey::ecdsa(14),
        }
    }

    pub fn root_key_id(&self) -> String {
        self.root_key.id.clone()
    }

    fn expires(&self) -> String {
        self.expires.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn envelope(&self, role: &str, signed: serde_json::Value, key: &FixtureKey) -> Vec<u8> {
        let signatures = if role == "root" && self.unsigned_root {
            vec![]
        } else if self.foreign_signer.as_deref() == Some(role) {
            vec![FixtureKey::ecdsa(99).sign(&signed)]
        } else {
            vec![key.sign(&signed)]
        };
        serde_json::to_vec(&json!({ "signed": signed, "signatures": signatures })).unwrap()
    }

    fn targets_signed(&self, list: &[(String, Vec<u8>)], delegate: bool) -> serde_json::Value {
        let entries: serde_json::Map<String, serde_json::Value> = list
            .iter()
            .map(|(tag, manifest)| (tag.clone(), file_meta(manifest)))
            .collect();
        let mut signed = json!({
            "_type": "Targets",
            "version": 1,
            "expires": self.expires(),
            "targets": entries,
        });
        if delegate {
            signed["delegations"] = json!({
                "keys": { self.releases_key.id.clone(): self.releases_key.public },
                "roles": [{
                    "name": "targets/releases",
                    "keyids": [self.releases_key.id],
                    "threshold": 1,
                    "paths": [""],
                }],
            });
        }
        signed
    }

    /// Role name to document, signed and hash chain consistent
    pub fn documents(&self) -> Vec<(String, Vec<u8>)> {
        let keys = [
            &self.root_key,
            &self.timestamp_key,
            &self.snapshot_key,
            &self.targets_key,
        ];
        let listed: serde_json::Map<String, serde_json::Value> = keys
            .iter()
            .map(|k| (k.id.clone(), json!(k.public)))
            .collect();
        let root = self.envelope(
            "root",
            json!({
                "_type": "Root",
                "version": 1,
                "expires": self.expires(),
                "consistent_snapshot": false,
                "keys": listed,
                "roles": {
                    "root": self.root_key.assignment(),
                    "timestamp": self.timestamp_key.assignment(),
                    "snapshot": self.snapshot_key.assignment(),
                    "targets": self.targets_key.assignment(),
                },
            }),
            &self.root_key,
        );

        let targets = self.envelope(
            "targets",
            self.targets_signed(&self.targets, self.releases.is_some()),
            &self.targets_key,
        );

        let mut meta = serde_json::Map::new();
        meta.insert("root".to_string(), file_meta(&root));
        meta.insert("targets".to_string(), file_meta(&targets));
        let mut documents = vec![
            ("root".to_string(), root),
            ("targets".to_string(), targets),
        ];
        if let Some(releases) = &self.releases {
            let releases = self.envelope(
                "targets/releases",
                self.targets_signed(releases, false),
                &self.releases_key,
            );
            meta.insert("targets/releases".to_string(), file_meta(&releases));
            documents.push(("targets/releases".to_string(), releases));
        }

        let snapshot = self.envelope(
            "snapshot",
            json!({ "_type": "Snapshot", "version": 1, "expires": self.expires(), "meta": meta }),
            &self.snapshot_key,
        );
        let timestamp = self.envelope(
            "timestamp",
            json!({
                "_type": "Timestamp",
                "version": 1,
                "expires": self.expires(),
                "meta": { "snapshot": file_meta(&snapshot) },
            }),
            &self.timestamp_key,
        );
        documents.push(("snapshot".to_string(), snapshot));
        documents.push(("timestamp".to_string(), timestamp));
        documents
    }

    pub fn publish(&self, hub: &FakeHub, host: &str, gun: &str) {
        for (role, document) in self.documents() {
            hub.route(
                "GET",
                host,
                &format!("/v2/{}/_trust/tuf/{}.json", gun, role),
                Reply::ok(document),
            );
        }
    }
}
