//! Registry module for Docker registry interactions
//!
//! This module provides the HTTP round-trip seam, challenge-driven
//! authentication, endpoint derivation and the read-only Registry HTTP API v2
//! operations the fetch pipeline needs.

pub mod auth;
pub mod client;
pub mod endpoints;
pub mod transport;

pub use auth::{AnonymousCredentials, CredentialStore, FallbackTransport, token_auth};
pub use client::RegistryRepository;
pub use endpoints::{EndpointPair, Scheme};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, RoundTrip};
