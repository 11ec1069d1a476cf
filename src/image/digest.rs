//! Content digests
//!
//! [`ContentDigest`] identifies registry content (`algorithm:hex`). A
//! [`TrustedDigest`] can only be minted by the trust verifier and is the one
//! value the manifest resolver accepts as its integrity anchor.

use crate::error::{FetchError, Result};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// The canonical algorithm used by registries and trust metadata
    pub const CANONICAL: DigestAlgorithm = DigestAlgorithm::Sha256;

    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Length of the raw hash in bytes
    pub fn size(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub fn digest(&self, data: &[u8]) -> ContentDigest {
        ContentDigest {
            algorithm: *self,
            bytes: self.hash(data),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(FetchError::Configuration(format!(
                "unsupported digest algorithm: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl ContentDigest {
    pub fn from_bytes(algorithm: DigestAlgorithm, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != algorithm.size() {
            return Err(FetchError::Parse(format!(
                "invalid {} digest length: expected {} bytes, got {}",
                algorithm,
                algorithm.size(),
                bytes.len()
            )));
        }
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Check `data` hashes to this digest
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let computed = self.algorithm.digest(data);
        if computed.bytes != self.bytes {
            return Err(FetchError::DigestMismatch {
                expected: self.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex())
    }
}

impl FromStr for ContentDigest {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| FetchError::Parse(format!("digest missing algorithm: {}", s)))?;
        let algorithm: DigestAlgorithm = algorithm
            .parse()
            .map_err(|_| FetchError::Parse(format!("unsupported digest algorithm in {}", s)))?;
        if encoded.len() != algorithm.size() * 2
            || !encoded.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(FetchError::Parse(format!(
                "invalid {} digest encoding: {}",
                algorithm, s
            )));
        }
        let bytes = hex::decode(encoded).map_err(|e| FetchError::Parse(e.to_string()))?;
        ContentDigest::from_bytes(algorithm, bytes)
    }
}

/// Digest vouched for by the trust service for one (repository, tag)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedDigest(ContentDigest);

impl TrustedDigest {
    pub(crate) fn new(digest: ContentDigest) -> Self {
        Self(digest)
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.0
    }
}

impl fmt::Display for TrustedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_input_matches_well_known_digest() {
        let digest = DigestAlgorithm::Sha256.digest(b"");
        assert_eq!(digest.to_string(), EMPTY_SHA256);
        assert_eq!(EMPTY_SHA256.parse::<ContentDigest>().unwrap(), digest);
    }

    #[test]
    fn parse_rejects_malformed_digests() {
        assert!("e3b0c44298fc".parse::<ContentDigest>().is_err());
        assert!("md5:d41d8cd98f00b204e9800998ecf8427e".parse::<ContentDigest>().is_err());
        assert!("sha256:abc".parse::<ContentDigest>().is_err());
        let upper = EMPTY_SHA256.to_uppercase().replacen("SHA256", "sha256", 1);
        assert!(upper.parse::<ContentDigest>().is_err());
    }

    #[test]
    fn verify_detects_tampering() {
        let digest = DigestAlgorithm::Sha256.digest(b"layer");
        assert!(digest.verify(b"layer").is_ok());
        match digest.verify(b"tampered") {
            Err(FetchError::DigestMismatch { expected, .. }) => {
                assert_eq!(expected, digest.to_string())
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn from_bytes_checks_length() {
        assert!(ContentDigest::from_bytes(DigestAlgorithm::Sha512, vec![0; 32]).is_err());
        let d = ContentDigest::from_bytes(DigestAlgorithm::Sha512, vec![0; 64]).unwrap();
        assert!(d.to_string().starts_with("sha512:"));
    }

    #[test]
    fn gzip_layer_digest_is_over_compressed_bytes() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"dummy tar layer content for test").unwrap();
        let gzipped = encoder.finish().unwrap();

        let digest = DigestAlgorithm::Sha256.digest(&gzipped);
        assert_eq!(digest.hex(), hex::encode(Sha256::digest(&gzipped)));
    }
}
