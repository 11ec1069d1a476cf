//! Authenticating transport for registry and trust endpoints
//!
//! [`token_auth`] probes an endpoint's `/v2/` root, records the
//! `WWW-Authenticate` challenges it answers with, and builds a
//! [`FallbackTransport`] over two candidates: token auth with basic fallback,
//! then token auth alone. The first candidate whose response is not
//! `401 Unauthorized` wins.
//!
//! Credentials come from a [`CredentialStore`]. The only store used by the
//! pipeline is [`AnonymousCredentials`], which grants pull-only anonymous
//! access and keeps nothing between calls.

use crate::error::{FetchError, Result};
use crate::logging::{EventObserver, FetchEvent};
use crate::registry::transport::{HttpRequest, HttpResponse, RoundTrip, v2_url};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

/// Client id reported to token servers
pub const CLIENT_ID: &str = "rootfs-fetch";

/// Tokens without `expires_in` (or with a shorter one) live this long
const MINIMUM_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// Capability set for supplying credentials to auth handlers
pub trait CredentialStore: Send + Sync {
    /// Username and password for basic auth against `url`
    fn basic(&self, url: &Url) -> (String, String);
    /// OAuth2 refresh token for `service` at `url`, empty when none is known
    fn refresh_token(&self, url: &Url, service: &str) -> String;
    fn set_refresh_token(&self, url: &Url, service: &str, token: &str);
}

/// Empty credentials, nothing remembered
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousCredentials;

impl CredentialStore for AnonymousCredentials {
    fn basic(&self, _url: &Url) -> (String, String) {
        (String::new(), String::new())
    }

    fn refresh_token(&self, _url: &Url, _service: &str) -> String {
        String::new()
    }

    fn set_refresh_token(&self, _url: &Url, _service: &str, _token: &str) {}
}

/// One parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercased auth scheme, e.g. `bearer`
    pub scheme: String,
    /// Parameters with lowercased keys
    pub parameters: HashMap<String, String>,
}

/// Parse every challenge in one `WWW-Authenticate` header value.
///
/// Handles several comma-separated challenges and quoted parameter values
/// that themselves contain commas (`scope="repository:a:pull,push"`).
pub fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut challenges = Vec::new();
    let mut rest = header;

    loop {
        rest = skip_separators(rest);
        let (scheme, after_scheme) = take_token(rest);
        if scheme.is_empty() {
            break;
        }
        rest = after_scheme;

        let mut parameters = HashMap::new();
        loop {
            let trimmed = skip_separators(rest);
            let (key, after_key) = take_token(trimmed);
            let Some(value_part) = after_key.trim_start().strip_prefix('=') else {
                // Either the end or the scheme of the next challenge
                rest = trimmed;
                break;
            };
            if key.is_empty() {
                rest = trimmed;
                break;
            }
            let value_part = value_part.trim_start();
            let (value, remaining) = if value_part.starts_with('"') {
                take_quoted(value_part)
            } else {
                let (value, remaining) = take_token(value_part);
                (value.to_string(), remaining)
            };
            parameters.insert(key.to_ascii_lowercase(), value);
            rest = remaining;
        }

        challenges.push(Challenge {
            scheme: scheme.to_ascii_lowercase(),
            parameters,
        });
    }

    challenges
}

fn skip_separators(s: &str) -> &str {
    s.trim_start_matches(|c: char| c == ',' || c.is_whitespace())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn take_token(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !is_token_char(c)).unwrap_or(s.len());
    s.split_at(end)
}

/// `s` starts with `"`; returns the unescaped value and the text after the closing quote
fn take_quoted(s: &str) -> (String, &str) {
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        if escaped {
            value.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return (value, &s[i + 1..]);
        } else {
            value.push(c);
        }
    }
    (value, "")
}

/// Challenges seen per endpoint, keyed by scheme and authority
#[derive(Debug, Default, Clone)]
pub struct ChallengeManager {
    challenges: HashMap<String, Vec<Challenge>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the challenges of an unauthorized `response` to a request for `url`
    pub fn add_response(&mut self, url: &Url, response: &HttpResponse) {
        if response.status != StatusCode::UNAUTHORIZED {
            return;
        }
        let parsed: Vec<Challenge> = response
            .headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_challenges)
            .collect();
        self.challenges.insert(endpoint_key(url), parsed);
    }

    pub fn get_challenges(&self, url: &Url) -> &[Challenge] {
        self.challenges
            .get(&endpoint_key(url))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn endpoint_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}

/// Repository access requested from a token server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryScope {
    pub repository: String,
    pub actions: Vec<String>,
}

impl RepositoryScope {
    pub fn pull(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            actions: vec!["pull".to_string()],
        }
    }
}

impl fmt::Display for RepositoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repository:{}:{}", self.repository, self.actions.join(","))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Bearer token strategy
pub struct TokenHandler {
    transport: Arc<dyn RoundTrip>,
    credentials: Arc<dyn CredentialStore>,
    scope: RepositoryScope,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenHandler {
    pub fn new(
        transport: Arc<dyn RoundTrip>,
        credentials: Arc<dyn CredentialStore>,
        scope: RepositoryScope,
    ) -> Self {
        Self {
            transport,
            credentials,
            scope,
            cached: Mutex::new(None),
        }
    }

    async fn authorize_request(
        &self,
        request: &mut HttpRequest,
        parameters: &HashMap<String, String>,
    ) -> Result<()> {
        let token = self.token(parameters).await?;
        set_authorization(request, &format!("Bearer {}", token))
    }

    async fn token(&self, parameters: &HashMap<String, String>) -> Result<String> {
        if let Some(cached) = self.cached_token() {
            return Ok(cached);
        }

        let realm = parameters
            .get("realm")
            .ok_or_else(|| FetchError::Auth("token auth challenge has no realm".to_string()))?;
        let realm = Url::parse(realm)
            .map_err(|e| FetchError::Auth(format!("invalid token realm {}: {}", realm, e)))?;
        let service = parameters.get("service").cloned().unwrap_or_default();

        let refresh_token = self.credentials.refresh_token(&realm, &service);
        let response = if refresh_token.is_empty() {
            self.fetch_token(&realm, &service).await?
        } else {
            self.fetch_oauth_token(&realm, &service, &refresh_token).await?
        };

        if let Some(refresh) = response.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            self.credentials.set_refresh_token(&realm, &service, refresh);
        }

        let token = response
            .token
            .filter(|t| !t.is_empty())
            .or(response.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                FetchError::Auth("authorization server did not include a token".to_string())
            })?;

        let lifetime = response
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(MINIMUM_TOKEN_LIFETIME)
            .max(MINIMUM_TOKEN_LIFETIME);
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + lifetime,
            });
        }

        Ok(token)
    }

    fn cached_token(&self) -> Option<String> {
        let guard = self.cached.lock().ok()?;
        guard
            .as_ref()
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.token.clone())
    }

    async fn fetch_token(&self, realm: &Url, service: &str) -> Result<TokenResponse> {
        let (username, password) = self.credentials.basic(realm);

        let mut url = realm.clone();
        {
            let mut query = url.query_pairs_mut();
            if !service.is_empty() {
                query.append_pair("service", service);
            }
            query.append_pair("scope", &self.scope.to_string());
            if !username.is_empty() {
                query.append_pair("offline_token", "true");
                query.append_pair("client_id", CLIENT_ID);
            }
        }

        let mut request = HttpRequest::get(url);
        if !username.is_empty() {
            let encoded = STANDARD.encode(format!("{}:{}", username, password));
            set_authorization(&mut request, &format!("Basic {}", encoded))?;
        }

        let response = self.transport.round_trip(&request).await?;
        decode_token_response(response, realm)
    }

    async fn fetch_oauth_token(
        &self,
        realm: &Url,
        service: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .append_pair("service", service)
            .append_pair("scope", &self.scope.to_string())
            .append_pair("client_id", CLIENT_ID)
            .finish();

        let request = HttpRequest::new(Method::POST, realm.clone())
            .with_header(CONTENT_TYPE, "application/x-www-form-urlencoded")?
            .with_body(form.into_bytes());

        let response = self.transport.round_trip(&request).await?;
        decode_token_response(response, realm)
    }
}

fn decode_token_response(response: HttpResponse, realm: &Url) -> Result<TokenResponse> {
    if response.status != StatusCode::OK {
        return Err(FetchError::Auth(format!(
            "token request to {} failed with status {}",
            realm, response.status
        )));
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| FetchError::Auth(format!("unable to decode token response: {}", e)))
}

fn set_authorization(request: &mut HttpRequest, value: &str) -> Result<()> {
    let value = reqwest::header::HeaderValue::from_str(value)
        .map_err(|_| FetchError::Auth("credentials are not a valid header value".to_string()))?;
    request.headers.insert(AUTHORIZATION, value);
    Ok(())
}

/// Basic auth strategy
pub struct BasicHandler {
    credentials: Arc<dyn CredentialStore>,
}

impl BasicHandler {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    fn authorize_request(&self, request: &mut HttpRequest) -> Result<()> {
        let (username, password) = self.credentials.basic(&request.url);
        if username.is_empty() && password.is_empty() {
            return Err(FetchError::Auth("no basic auth credentials".to_string()));
        }
        let encoded = STANDARD.encode(format!("{}:{}", username, password));
        set_authorization(request, &format!("Basic {}", encoded))
    }
}

/// An auth strategy, selected by the challenge scheme it answers
pub enum AuthHandler {
    Token(TokenHandler),
    Basic(BasicHandler),
}

impl AuthHandler {
    pub fn scheme(&self) -> &'static str {
        match self {
            AuthHandler::Token(_) => "bearer",
            AuthHandler::Basic(_) => "basic",
        }
    }

    async fn authorize_request(
        &self,
        request: &mut HttpRequest,
        parameters: &HashMap<String, String>,
    ) -> Result<()> {
        match self {
            AuthHandler::Token(handler) => handler.authorize_request(request, parameters).await,
            AuthHandler::Basic(handler) => handler.authorize_request(request),
        }
    }
}

/// Attaches authorization for every handler whose scheme the endpoint challenged with
pub struct AuthorizingTransport {
    base: Arc<dyn RoundTrip>,
    challenges: Arc<ChallengeManager>,
    handlers: Vec<AuthHandler>,
}

impl AuthorizingTransport {
    pub fn new(
        base: Arc<dyn RoundTrip>,
        challenges: Arc<ChallengeManager>,
        handlers: Vec<AuthHandler>,
    ) -> Self {
        Self {
            base,
            challenges,
            handlers,
        }
    }
}

#[async_trait]
impl RoundTrip for AuthorizingTransport {
    async fn round_trip(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut request = request.clone();
        let challenges = self.challenges.get_challenges(&request.url);
        for handler in &self.handlers {
            if let Some(challenge) = challenges.iter().find(|c| c.scheme == handler.scheme()) {
                handler
                    .authorize_request(&mut request, &challenge.parameters)
                    .await?;
            }
        }
        self.base.round_trip(&request).await
    }
}

/// Tries candidates in order and returns the first response that is not `401`.
///
/// A transport error from any candidate aborts immediately. When every
/// candidate is unauthorized the last response is returned as `Ok`; callers
/// must treat a still-401 response as a failure themselves.
pub struct FallbackTransport {
    candidates: Vec<Arc<dyn RoundTrip>>,
    observer: Arc<dyn EventObserver>,
}

impl FallbackTransport {
    pub fn new(candidates: Vec<Arc<dyn RoundTrip>>, observer: Arc<dyn EventObserver>) -> Self {
        Self {
            candidates,
            observer,
        }
    }
}

#[async_trait]
impl RoundTrip for FallbackTransport {
    async fn round_trip(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut last = None;
        for candidate in &self.candidates {
            let response = candidate.round_trip(request).await?;
            if !response.is_unauthorized() {
                return Ok(response);
            }
            last = Some(response);
        }

        self.observer.on_event(&FetchEvent::AuthExhausted {
            url: request.url.to_string(),
        });
        last.ok_or_else(|| FetchError::Configuration("no candidate transports".to_string()))
    }
}

/// Build the authenticating transport for `endpoint`, scoped to pulling `repository`.
pub async fn token_auth(
    endpoint: &str,
    base: Arc<dyn RoundTrip>,
    repository: &str,
    observer: Arc<dyn EventObserver>,
) -> Result<FallbackTransport> {
    let endpoint_url = Url::parse(endpoint).map_err(|e| {
        FetchError::Configuration(format!(
            "could not parse remote endpoint url ({}): {}",
            endpoint, e
        ))
    })?;
    if endpoint_url.scheme() != "https" && endpoint_url.scheme() != "http" {
        return Err(FetchError::Configuration(format!(
            "unknown endpoint URL scheme, got {}",
            endpoint
        )));
    }

    let ping = v2_url(&endpoint_url, "")?;
    let response = base.round_trip(&HttpRequest::get(ping.clone())).await?;
    let status = response.status.as_u16();
    if !(200..400).contains(&status) && response.status != StatusCode::UNAUTHORIZED {
        return Err(FetchError::Configuration(format!(
            "could not reach {}: {}",
            endpoint, status
        )));
    }

    let mut challenges = ChallengeManager::new();
    challenges.add_response(&ping, &response);
    let challenges = Arc::new(challenges);

    let credentials: Arc<dyn CredentialStore> = Arc::new(AnonymousCredentials);
    let scope = RepositoryScope::pull(repository);

    let token_and_basic = AuthorizingTransport::new(
        base.clone(),
        challenges.clone(),
        vec![
            AuthHandler::Token(TokenHandler::new(
                base.clone(),
                credentials.clone(),
                scope.clone(),
            )),
            AuthHandler::Basic(BasicHandler::new(credentials.clone())),
        ],
    );
    let token_only = AuthorizingTransport::new(
        base.clone(),
        challenges,
        vec![AuthHandler::Token(TokenHandler::new(
            base,
            credentials,
            scope,
        ))],
    );

    Ok(FallbackTransport::new(
        vec![Arc::new(token_and_basic), Arc::new(token_only)],
        observer,
    ))
}
