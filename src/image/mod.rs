//! Image addressing
//!
//! References as users type them, content digests, and the registry manifest
//! formats that list an image's layers.

pub mod digest;
pub mod manifest;
pub mod reference;

pub use digest::{ContentDigest, DigestAlgorithm, TrustedDigest};
pub use manifest::{LayerDescriptor, Manifest};
pub use reference::ImageReference;
