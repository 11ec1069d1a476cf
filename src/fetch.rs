//! Trust-verified image fetch
//!
//! [`Client::fetch`] drives the whole pipeline: reference resolution, endpoint
//! mapping, trust lookup, manifest resolution against the trusted digest and
//! sequential layer download into digest-named files.

use crate::config::FetcherConfig;
use crate::error::{FetchError, Result};
use crate::image::digest::{ContentDigest, TrustedDigest};
use crate::image::manifest::{LayerDescriptor, is_layer_media_type};
use crate::image::reference::ImageReference;
use crate::logging::{EventObserver, FetchEvent, NullObserver};
use crate::registry::auth::token_auth;
use crate::registry::client::RegistryRepository;
use crate::registry::endpoints::EndpointPair;
use crate::registry::transport::{ReqwestTransport, RoundTrip};
use crate::trust::lookup_trusted_digest;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LAYER_EXTENSION: &str = "tgz";

/// A downloaded layer blob, open for reading
///
/// Owned by the caller until handed to [`release_layers`].
#[derive(Debug)]
pub struct LayerFile {
    pub digest: ContentDigest,
    pub path: PathBuf,
    file: File,
}

impl LayerFile {
    fn create(dest_dir: &Path, digest: &ContentDigest, data: &[u8]) -> Result<Self> {
        let path = dest_dir.join(format!("{}.{}", digest, LAYER_EXTENSION));
        std::fs::write(&path, data).map_err(|e| FetchError::io_at(e, &path))?;
        let file = File::open(&path).map_err(|e| FetchError::io_at(e, &path))?;
        Ok(Self {
            digest: digest.clone(),
            path,
            file,
        })
    }

    /// A second handle on the same file, for a digest listed more than once
    fn reopen(&self) -> Result<Self> {
        let file = File::open(&self.path).map_err(|e| FetchError::io_at(e, &self.path))?;
        Ok(Self {
            digest: self.digest.clone(),
            path: self.path.clone(),
            file,
        })
    }
}

impl Read for LayerFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Close every handle and remove its file. All layers are attempted; the last
/// failure is returned. Handles sharing a file remove it once.
pub fn release_layers(layers: Vec<LayerFile>) -> Result<()> {
    let mut last = Ok(());
    let mut released = HashSet::new();
    for layer in layers {
        let LayerFile { path, file, .. } = layer;
        drop(file);
        if !released.insert(path.clone()) {
            continue;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            last = Err(FetchError::io_at(e, &path));
        }
    }
    last
}

/// Fetch client
///
/// The configuration is fixed at construction; one client may run any number
/// of independent fetches.
pub struct Client {
    config: FetcherConfig,
    transport: Arc<dyn RoundTrip>,
    observer: Arc<dyn EventObserver>,
}

impl Client {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn RoundTrip> = match &config.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::new()?),
        };
        Ok(Self {
            config,
            transport,
            observer: Arc::new(NullObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Resolve `image_ref` to its signed layers and download them into `dest_dir`.
    ///
    /// Layers come back in application order. On failure, files already written
    /// for earlier layers are left in `dest_dir`.
    pub async fn fetch(&self, dest_dir: &Path, image_ref: &str) -> Result<Vec<LayerFile>> {
        let reference = ImageReference::parse(image_ref, &self.config.default_tag)?;
        self.observer.on_event(&FetchEvent::ReferenceParsed {
            canonical: reference.canonical_name(),
            familiar: reference.familiar_name(),
            tag: reference.tag.clone(),
        });

        let endpoints = EndpointPair::for_reference(&reference, self.config.disable_https);
        self.observer.on_event(&FetchEvent::EndpointsResolved {
            registry: endpoints.registry_url.clone(),
            trust: endpoints.trust_url.clone(),
        });

        let trusted = lookup_trusted_digest(
            &reference,
            &endpoints.trust_url,
            self.transport.clone(),
            &self.config,
            self.observer.clone(),
        )
        .await?;

        let registry_transport = token_auth(
            &endpoints.registry_url,
            self.transport.clone(),
            &reference.repository_path,
            self.observer.clone(),
        )
        .await?;
        let repository = RegistryRepository::new(
            Arc::new(registry_transport),
            &endpoints.registry_url,
            &reference.repository_path,
        )?;

        let descriptors = self
            .resolve_layers(&repository, &trusted, &endpoints, &reference)
            .await?;
        self.fetch_layers(&repository, &descriptors, dest_dir).await
    }

    async fn resolve_layers(
        &self,
        repository: &RegistryRepository,
        trusted: &TrustedDigest,
        endpoints: &EndpointPair,
        reference: &ImageReference,
    ) -> Result<Vec<LayerDescriptor>> {
        let digest = trusted.digest();
        if !repository.manifest_exists(digest).await? {
            return Err(FetchError::ManifestNotFound {
                digest: digest.to_string(),
            });
        }
        self.observer.on_event(&FetchEvent::ManifestExists {
            registry: endpoints.registry_url.clone(),
            digest: digest.to_string(),
            tag: reference.tag.clone(),
        });

        let manifest = repository.get_manifest(digest).await?;
        let mut layers = Vec::new();
        for (index, descriptor) in manifest.references().into_iter().enumerate() {
            if is_layer_media_type(&descriptor.media_type) {
                layers.push(descriptor);
            } else {
                self.observer.on_event(&FetchEvent::LayerSkipped {
                    index,
                    media_type: descriptor.media_type,
                });
            }
        }
        Ok(layers)
    }

    async fn fetch_layers(
        &self,
        repository: &RegistryRepository,
        descriptors: &[LayerDescriptor],
        dest_dir: &Path,
    ) -> Result<Vec<LayerFile>> {
        let total = descriptors.len();
        let mut layers = Vec::with_capacity(total);
        for (index, descriptor) in descriptors.iter().enumerate() {
            let earlier = layers
                .iter()
                .find(|layer: &&LayerFile| layer.digest == descriptor.digest);
            let (layer, length) = match earlier {
                Some(earlier) => {
                    let length = std::fs::metadata(&earlier.path)
                        .map_err(|e| FetchError::io_at(e, &earlier.path))?
                        .len();
                    (earlier.reopen()?, length)
                }
                None => {
                    self.observer
                        .on_event(&FetchEvent::LayerDownloading { index, total });
                    let data = repository.get_blob(&descriptor.digest).await?;
                    descriptor.digest.verify(&data)?;
                    (
                        LayerFile::create(dest_dir, &descriptor.digest, &data)?,
                        data.len() as u64,
                    )
                }
            };

            self.observer.on_event(&FetchEvent::LayerFetched {
                index,
                digest: descriptor.digest.to_string(),
                length,
                media_type: descriptor.media_type.clone(),
            });
            layers.push(layer);
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::digest::DigestAlgorithm;

    #[test]
    fn layer_files_are_digest_named_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let digest = DigestAlgorithm::Sha256.digest(b"layer");
        let mut layer = LayerFile::create(dir.path(), &digest, b"layer").unwrap();
        assert_eq!(
            layer.path.file_name().unwrap().to_str().unwrap(),
            format!("sha256:{}.tgz", digest.hex())
        );

        let mut content = String::new();
        layer.read_to_string(&mut content).unwrap();
        assert_eq!(content, "layer");

        let path = layer.path.clone();
        release_layers(vec![layer]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn release_reports_last_failure_but_removes_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let a = DigestAlgorithm::Sha256.digest(b"a");
        let b = DigestAlgorithm::Sha256.digest(b"b");
        let first = LayerFile::create(dir.path(), &a, b"a").unwrap();
        let second = LayerFile::create(dir.path(), &b, b"b").unwrap();
        std::fs::remove_file(&first.path).unwrap();
        let second_path = second.path.clone();

        assert!(release_layers(vec![first, second]).is_err());
        assert!(!second_path.exists());
    }

    #[test]
    fn shared_files_are_released_once() {
        let dir = tempfile::tempdir().unwrap();
        let digest = DigestAlgorithm::Sha256.digest(b"empty");
        let first = LayerFile::create(dir.path(), &digest, b"empty").unwrap();
        let again = first.reopen().unwrap();
        let path = first.path.clone();

        release_layers(vec![first, again]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn disabled_trust_is_rejected_at_construction() {
        let config = FetcherConfig {
            disable_notary: true,
            ..FetcherConfig::default()
        };
        assert!(matches!(
            Client::new(config),
            Err(FetchError::Configuration(_))
        ));
    }
}
