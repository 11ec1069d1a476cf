//! Registry and trust-service endpoint derivation

use crate::image::reference::{DEFAULT_DOMAIN, ImageReference};

pub const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";
pub const DEFAULT_TRUST_HOST: &str = "notary.docker.io";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Base URLs of the registry API and of the trust metadata service for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPair {
    pub registry_url: String,
    pub trust_url: String,
    pub scheme: Scheme,
}

impl EndpointPair {
    /// The public registry splits its API and trust service across two hosts;
    /// any other domain serves both.
    pub fn for_domain(domain: &str, disable_https: bool) -> Self {
        let scheme = if disable_https {
            Scheme::Http
        } else {
            Scheme::Https
        };
        let (registry_host, trust_host) = if domain == DEFAULT_DOMAIN {
            (DEFAULT_REGISTRY_HOST, DEFAULT_TRUST_HOST)
        } else {
            (domain, domain)
        };
        Self {
            registry_url: format!("{}://{}", scheme.as_str(), registry_host),
            trust_url: format!("{}://{}", scheme.as_str(), trust_host),
            scheme,
        }
    }

    pub fn for_reference(reference: &ImageReference, disable_https: bool) -> Self {
        Self::for_domain(reference.domain(), disable_https)
    }
}
