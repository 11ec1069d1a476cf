// Registry API v2 read operations for a single repository: manifest
// existence, manifest fetch and blob fetch, all addressed by digest.

use crate::error::{FetchError, Result};
use crate::image::digest::ContentDigest;
use crate::image::manifest::{Manifest, accepted_media_types};
use crate::registry::transport::{HttpRequest, RoundTrip, v2_url};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use url::Url;

pub struct RegistryRepository {
    transport: Arc<dyn RoundTrip>,
    base_url: Url,
    name: String,
}

impl RegistryRepository {
    pub fn new(transport: Arc<dyn RoundTrip>, base_url: &str, name: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        Ok(Self {
            transport,
            base_url,
            name: name.to_string(),
        })
    }

    fn manifest_url(&self, digest: &ContentDigest) -> Result<Url> {
        v2_url(&self.base_url, &format!("{}/manifests/{}", self.name, digest))
    }

    fn blob_url(&self, digest: &ContentDigest) -> Result<Url> {
        v2_url(&self.base_url, &format!("{}/blobs/{}", self.name, digest))
    }

    /// `HEAD` the manifest: `200` means present, `404` absent, anything else fails
    pub async fn manifest_exists(&self, digest: &ContentDigest) -> Result<bool> {
        let url = self.manifest_url(digest)?;
        let request = HttpRequest::head(url.clone()).with_header(ACCEPT, &accepted_media_types())?;
        let response = self.transport.round_trip(&request).await?;
        match response.status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    /// Fetch and decode the manifest stored under `digest`.
    ///
    /// The body is trusted to match the digest it was requested by; it is
    /// not re-hashed here.
    pub async fn get_manifest(&self, digest: &ContentDigest) -> Result<Manifest> {
        let url = self.manifest_url(digest)?;
        let request = HttpRequest::get(url.clone()).with_header(ACCEPT, &accepted_media_types())?;
        let response = self
            .transport
            .round_trip(&request)
            .await?
            .expect_status(StatusCode::OK, &url)?;
        let content_type = response
            .header(CONTENT_TYPE.as_str())
            .unwrap_or_default()
            .to_string();
        Manifest::parse(&content_type, &response.body)
    }

    pub async fn get_blob(&self, digest: &ContentDigest) -> Result<Vec<u8>> {
        let url = self.blob_url(digest)?;
        let response = self
            .transport
            .round_trip(&HttpRequest::get(url.clone()))
            .await?
            .expect_status(StatusCode::OK, &url)?;
        Ok(response.body)
    }
}
