//! rootfs-fetch library
//!
//! Fetches a container image whose tag is signed on a trust service, checks
//! every registry step against the trusted digest, and squashes the layers
//! into a single rootfs archive.

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod image;
pub mod logging;
pub mod registry;
pub mod squash;
pub mod trust;

pub use config::{FetcherConfig, TrustPinConfig};
pub use error::{FetchError, Result};
pub use fetch::{Client, LayerFile, release_layers};
pub use logging::{EventObserver, FetchEvent, Logger};
pub use squash::{SquashState, Squasher, squash};
