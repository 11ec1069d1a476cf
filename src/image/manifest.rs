//! Registry manifest schemas
//!
//! Only single-image manifests are understood: Docker schema 2 and signed
//! schema 1. [`Manifest::references`] returns descriptors oldest first, which
//! is the order layers must be applied in.

use crate::error::{FetchError, Result};
use crate::image::digest::ContentDigest;
use serde::Deserialize;

pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Schema 2 layer
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// Schema 1 layer
pub const MEDIA_TYPE_MANIFEST_LAYER: &str =
    "application/vnd.docker.container.image.rootfs.diff+x-gtar";

/// Media types sent in the `Accept` header of manifest requests
pub fn accepted_media_types() -> String {
    [MEDIA_TYPE_SCHEMA2, MEDIA_TYPE_SCHEMA1_SIGNED, MEDIA_TYPE_SCHEMA1].join(", ")
}

/// Whether a descriptor is a tar layer the squasher can apply
pub fn is_layer_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_LAYER || media_type == MEDIA_TYPE_MANIFEST_LAYER
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub digest: ContentDigest,
    pub media_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    media_type: String,
    #[serde(default)]
    size: u64,
    digest: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schema2 {
    schema_version: u32,
    config: RawDescriptor,
    #[serde(default)]
    layers: Vec<RawDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schema1 {
    schema_version: u32,
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Schema2 {
        config: LayerDescriptor,
        layers: Vec<LayerDescriptor>,
    },
    /// `fs_layers` as listed by the registry, newest first
    Schema1 { fs_layers: Vec<ContentDigest> },
}

impl Manifest {
    /// Decode a manifest body according to the response content type.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Self> {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match media_type.as_str() {
            MEDIA_TYPE_SCHEMA2 => Self::parse_schema2(body),
            MEDIA_TYPE_SCHEMA1 | MEDIA_TYPE_SCHEMA1_SIGNED | "application/json" | "" => {
                Self::parse_schema1(body)
            }
            MEDIA_TYPE_MANIFEST_LIST => Err(FetchError::UnsupportedManifest(
                "manifest lists are not supported".to_string(),
            )),
            other => Err(FetchError::UnsupportedManifest(format!(
                "unsupported manifest media type: {}",
                other
            ))),
        }
    }

    fn parse_schema2(body: &[u8]) -> Result<Self> {
        let raw: Schema2 = serde_json::from_slice(body)?;
        if raw.schema_version != 2 {
            return Err(FetchError::UnsupportedManifest(format!(
                "schema2 manifest with schemaVersion {}",
                raw.schema_version
            )));
        }
        Ok(Manifest::Schema2 {
            config: raw.config.try_into()?,
            layers: raw
                .layers
                .into_iter()
                .map(LayerDescriptor::try_from)
                .collect::<Result<_>>()?,
        })
    }

    fn parse_schema1(body: &[u8]) -> Result<Self> {
        let raw: Schema1 = serde_json::from_slice(body)?;
        if raw.schema_version != 1 {
            return Err(FetchError::UnsupportedManifest(format!(
                "schema1 manifest with schemaVersion {}",
                raw.schema_version
            )));
        }
        Ok(Manifest::Schema1 {
            fs_layers: raw
                .fs_layers
                .iter()
                .map(|l| l.blob_sum.parse())
                .collect::<Result<_>>()?,
        })
    }

    /// Every descriptor the manifest references, in application order.
    ///
    /// Schema 2 lists its config first; schema 1 layers are reversed so the
    /// base layer comes first.
    pub fn references(&self) -> Vec<LayerDescriptor> {
        match self {
            Manifest::Schema2 { config, layers } => std::iter::once(config.clone())
                .chain(layers.iter().cloned())
                .collect(),
            Manifest::Schema1 { fs_layers } => fs_layers
                .iter()
                .rev()
                .map(|digest| LayerDescriptor {
                    digest: digest.clone(),
                    media_type: MEDIA_TYPE_MANIFEST_LAYER.to_string(),
                    size: 0,
                })
                .collect(),
        }
    }
}

impl TryFrom<RawDescriptor> for LayerDescriptor {
    type Error = FetchError;

    fn try_from(raw: RawDescriptor) -> Result<Self> {
        Ok(LayerDescriptor {
            digest: raw.digest.parse()?,
            media_type: raw.media_type,
            size: raw.size,
        })
    }
}
