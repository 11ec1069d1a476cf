//! Image reference parsing
//!
//! Accepts `[docker://][registry-host/]repository[:tag][@digest]` and
//! normalizes it the way the public registry tooling does: a missing host
//! means `docker.io`, single-component names there live under `library/`.

use crate::error::{FetchError, Result};
use crate::image::digest::ContentDigest;
use std::fmt;

pub const DEFAULT_DOMAIN: &str = "docker.io";
pub const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
pub const OFFICIAL_REPOSITORY_PREFIX: &str = "library/";
pub const DEFAULT_TAG: &str = "latest";

const NAME_TOTAL_LENGTH_MAX: usize = 255;
const TAG_LENGTH_MAX: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (with optional port), `docker.io` when none was given
    pub registry_host: String,
    /// Repository path as used by the registry API, e.g. `library/alpine`
    pub repository_path: String,
    pub tag: String,
    /// Digest pinned with `@`, checked against the signed digest for `tag`
    pub digest: Option<ContentDigest>,
}

impl ImageReference {
    /// Parse `input`, substituting `default_tag` when no tag is present.
    pub fn parse(input: &str, default_tag: &str) -> Result<Self> {
        let input = input.trim();
        let input = input.strip_prefix("docker://").unwrap_or(input);
        if input.is_empty() {
            return Err(FetchError::Parse("empty image reference".to_string()));
        }

        let (name_and_tag, digest) = match input.split_once('@') {
            Some((left, digest)) => (left, Some(digest.parse::<ContentDigest>()?)),
            None => (input, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a host port
        let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name_and_tag[..split], Some(&name_and_tag[split + 1..]))
            }
            None => (name_and_tag, None),
        };

        let (registry_host, repository_path) = split_domain(name);
        validate_repository_path(&repository_path)?;
        if registry_host.len() + 1 + repository_path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(FetchError::Parse(format!(
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            )));
        }

        let tag = match (tag, &digest) {
            (Some(tag), _) => {
                validate_tag(tag)?;
                tag.to_string()
            }
            (None, Some(_)) => return Err(FetchError::Parse("missing tag".to_string())),
            (None, None) => {
                let tag = if default_tag.is_empty() {
                    DEFAULT_TAG
                } else {
                    default_tag
                };
                validate_tag(tag)?;
                tag.to_string()
            }
        };

        Ok(Self {
            registry_host,
            repository_path,
            tag,
            digest,
        })
    }

    /// Fully qualified repository name, the trust-service GUN
    pub fn canonical_name(&self) -> String {
        format!("{}/{}", self.registry_host, self.repository_path)
    }

    /// Short form shown to users: `alpine` rather than `docker.io/library/alpine`
    pub fn familiar_name(&self) -> String {
        if self.registry_host == DEFAULT_DOMAIN {
            if let Some(short) = self.repository_path.strip_prefix(OFFICIAL_REPOSITORY_PREFIX) {
                return short.to_string();
            }
            return self.repository_path.clone();
        }
        self.canonical_name()
    }

    /// Host component used to derive the remote endpoints
    pub fn domain(&self) -> &str {
        &self.registry_host
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.canonical_name(), self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (domain, remainder) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some((first, rest)) if first.chars().any(|c| c.is_ascii_uppercase()) => {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    let domain = if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    };

    let remainder = if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        format!("{}{}", OFFICIAL_REPOSITORY_PREFIX, remainder)
    } else {
        remainder
    };

    (domain, remainder)
}

fn validate_repository_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(FetchError::Parse("repository name cannot be empty".to_string()));
    }
    if path.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(FetchError::Parse(format!(
            "repository name must be lowercase: {}",
            path
        )));
    }
    for component in path.split('/') {
        if !is_path_component(component) {
            return Err(FetchError::Parse(format!(
                "invalid repository path component {:?} in {}",
                component, path
            )));
        }
    }
    Ok(())
}

/// `[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*`
fn is_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.is_empty() || !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let valid = separator == "."
            || separator == "_"
            || separator == "__"
            || separator.chars().all(|c| c == '-');
        if !valid {
            return false;
        }
    }
    true
}

/// `[\w][\w.-]{0,127}`
fn validate_tag(tag: &str) -> Result<()> {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut chars = tag.chars();
    let valid = match chars.next() {
        Some(first) => word(first) && chars.all(|c| word(c) || c == '.' || c == '-'),
        None => false,
    };
    if !valid || tag.len() > TAG_LENGTH_MAX {
        return Err(FetchError::Parse(format!("invalid tag: {:?}", tag)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn official_image_gets_default_domain_and_tag() {
        let r = ImageReference::parse("busybox", "latest").unwrap();
        assert_eq!(r.registry_host, "docker.io");
        assert_eq!(r.repository_path, "library/busybox");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.canonical_name(), "docker.io/library/busybox");
        assert_eq!(r.familiar_name(), "busybox");
    }

    #[test]
    fn configured_default_tag_is_applied() {
        let r = ImageReference::parse("library/busybox", "stable").unwrap();
        assert_eq!(r.tag, "stable");
        let r = ImageReference::parse("library/busybox", "").unwrap();
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn explicit_host_port_and_tag() {
        let r = ImageReference::parse("myregistry.example.com/foo/bar:v1", "latest").unwrap();
        assert_eq!(r.registry_host, "myregistry.example.com");
        assert_eq!(r.repository_path, "foo/bar");
        assert_eq!(r.tag, "v1");

        let r = ImageReference::parse("localhost:5000/app", "latest").unwrap();
        assert_eq!(r.registry_host, "localhost:5000");
        assert_eq!(r.repository_path, "app");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn transport_prefix_and_legacy_index_are_normalized() {
        let r = ImageReference::parse("docker://index.docker.io/alpine:3.5", "latest").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/alpine:3.5");
    }

    #[test]
    fn digest_without_tag_is_rejected() {
        let input = "alpine@sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        match ImageReference::parse(input, "latest") {
            Err(FetchError::Parse(msg)) => assert_eq!(msg, "missing tag"),
            other => panic!("unexpected: {:?}", other),
        }
        let tagged = "alpine:3.5@sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let r = ImageReference::parse(tagged, "latest").unwrap();
        assert_eq!(r.tag, "3.5");
        assert_eq!(
            r.digest.unwrap().hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(ImageReference::parse("alpine:3.5", "latest").unwrap().digest.is_none());
    }

    #[test]
    fn invalid_references_fail() {
        for bad in ["", "Alpine", "foo//bar", "foo/-bar", "alpine:", "alpine:.bad", "a/b:c d"] {
            assert!(
                ImageReference::parse(bad, "latest").is_err(),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn separators_in_components() {
        assert!(is_path_component("my-app"));
        assert!(is_path_component("my__app"));
        assert!(is_path_component("a.b_c--d"));
        assert!(!is_path_component("a..b"));
        assert!(!is_path_component("a___b"));
        assert!(!is_path_component("app-"));
    }
}
