//! Command-line argument parsing

use crate::config::{FetcherConfig, TrustPinConfig};
use crate::error::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rootfs-fetch")]
#[command(about = "Fetch a signed container image and squash its layers into one rootfs archive")]
#[command(version, author)]
pub struct Args {
    /// Image reference, e.g. alpine:3.5 or myregistry.example.com/foo/bar:v1
    #[arg(value_name = "IMAGE")]
    pub image: String,

    /// Verbose output
    #[arg(
        long = "verbose",
        short = 'v',
        conflicts_with = "quiet",
        help = "Enable verbose output"
    )]
    pub verbose: bool,

    /// Quiet mode
    #[arg(long = "quiet", short = 'q', help = "Only print errors")]
    pub quiet: bool,

    #[arg(
        long = "insecure-http",
        help = "Talk plain http to the registry and trust service"
    )]
    pub insecure_http: bool,

    #[arg(
        long = "default-tag",
        value_name = "TAG",
        help = "Tag used when the image reference has none"
    )]
    pub default_tag: Option<String>,

    #[arg(
        long = "trust-pin",
        value_name = "FILE",
        help = "JSON file with trust pinning policy"
    )]
    pub trust_pin: Option<PathBuf>,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Environment defaults overlaid with the flags given
    pub fn to_config(&self) -> Result<FetcherConfig> {
        let mut config = FetcherConfig::from_env()?;
        if let Some(tag) = &self.default_tag {
            config.default_tag = tag.clone();
        }
        if self.insecure_http {
            config.disable_https = true;
        }
        if let Some(path) = &self.trust_pin {
            config.trust_pin = TrustPinConfig::from_file(path)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_image_and_flags() {
        let args = Args::try_parse_from([
            "rootfs-fetch",
            "alpine:3.5",
            "--insecure-http",
            "--default-tag",
            "edge",
        ])
        .unwrap();
        assert_eq!(args.image, "alpine:3.5");
        let config = args.to_config().unwrap();
        assert!(config.disable_https);
        assert_eq!(config.default_tag, "edge");
    }

    #[test]
    fn image_is_required() {
        assert!(Args::try_parse_from(["rootfs-fetch"]).is_err());
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["rootfs-fetch", "alpine", "-v", "-q"]).is_err());
    }
}
