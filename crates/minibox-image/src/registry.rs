//! Docker Registry HTTP API V2 client.
//!
//! Implements the bearer-token challenge flow: an unauthenticated
//! `GET /v2/` either succeeds (token-less registry) or answers 401 with a
//! `WWW-Authenticate` header naming the token endpoint. The token is
//! fetched once with a `repository:<name>:pull` scope and cached for the
//! rest of the run.

use std::sync::RwLock;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{ImageError, Result};
use crate::manifest::{ImageManifest, MEDIA_TYPE_MANIFEST_V2, SUPPORTED_SCHEMA_VERSION};
use crate::ImageRef;

/// Request timeout covering an entire blob download.
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Connect-phase timeout.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Token response from the registry auth service.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// `WWW-Authenticate` challenge parsed from a 401 response.
#[derive(Debug, Default, PartialEq, Eq)]
struct AuthChallenge {
    realm: String,
    service: String,
}

/// Client for one registry host.
///
/// Holds the HTTP client, the resolved base URL, and the bearer token
/// cache. The token lives for one run; there is no refresh.
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    /// `None` until the challenge flow has run; `Some("")` for registries
    /// that serve `/v2/` without auth.
    token: RwLock<Option<String>>,
}

impl RegistryClient {
    /// Creates a client for `registry` (host, optionally with port).
    ///
    /// `insecure` downgrades the scheme to plain http. Self-signed TLS is
    /// not supported.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed (should not happen
    /// in practice).
    #[must_use]
    pub fn new(registry: &str, insecure: bool) -> Self {
        let scheme = if insecure { "http" } else { "https" };
        let http = reqwest::Client::builder()
            .user_agent(concat!("minibox/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("failed to create HTTP client");

        Self {
            http,
            base_url: format!("{scheme}://{registry}"),
            token: RwLock::new(None),
        }
    }

    /// Fetches the V2 manifest for `image`.
    ///
    /// # Errors
    ///
    /// [`ImageError::Registry`] on HTTP failures, [`ImageError::Decode`]
    /// on malformed JSON, [`ImageError::Manifest`] on an unsupported
    /// schema version.
    pub async fn get_manifest(&self, image: &ImageRef) -> Result<ImageManifest> {
        let token = self.token(&image.repository).await?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, image.repository, image.tag
        );
        debug!(url = %url, "fetching manifest");

        let mut request = self
            .http
            .get(&url)
            .header(header::ACCEPT, MEDIA_TYPE_MANIFEST_V2);
        if !token.is_empty() {
            request = request.bearer_auth(&token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageError::Registry(format!("manifest request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImageError::Registry(format!(
                "fetching manifest for {image}: {status} - {body}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ImageError::Registry(format!("reading manifest body: {e}")))?;
        trace!(body_len = body.len(), "received manifest");

        let manifest: ImageManifest = serde_json::from_slice(&body)
            .map_err(|e| ImageError::Decode(format!("manifest for {image}: {e}")))?;

        if manifest.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(ImageError::Manifest(format!(
                "unsupported schema version {} for {image}",
                manifest.schema_version
            )));
        }

        Ok(manifest)
    }

    /// Downloads the blob `digest`, streaming it into memory.
    ///
    /// Layer blobs are gzip-compressed tar archives; the caller gunzips.
    ///
    /// # Errors
    ///
    /// [`ImageError::Registry`] on HTTP failures.
    pub async fn get_blob(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let token = self.token(&image.repository).await?;
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, image.repository, digest
        );
        debug!(url = %url, "fetching blob");

        let mut request = self.http.get(&url);
        if !token.is_empty() {
            request = request.bearer_auth(&token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageError::Registry(format!("blob request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImageError::Registry(format!(
                "fetching blob {digest}: {status} - {body}"
            )));
        }

        let mut stream = response.bytes_stream();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ImageError::Registry(format!("reading blob chunk: {e}")))?;
            data.extend_from_slice(&chunk);
        }

        debug!(digest = %digest, size = data.len(), "blob downloaded");
        Ok(data)
    }

    /// Returns the cached bearer token, running the challenge flow on the
    /// first call. An empty token means the registry needs none.
    async fn token(&self, repository: &str) -> Result<String> {
        {
            let cached = self
                .token
                .read()
                .map_err(|_| ImageError::Auth("token cache lock poisoned".to_string()))?;
            if let Some(token) = cached.as_ref() {
                return Ok(token.clone());
            }
        }

        let token = self.fetch_token(repository).await?;

        let mut cached = self
            .token
            .write()
            .map_err(|_| ImageError::Auth("token cache lock poisoned".to_string()))?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Probes `/v2/` and, on a 401 challenge, obtains a pull-scoped token.
    async fn fetch_token(&self, repository: &str) -> Result<String> {
        let probe_url = format!("{}/v2/", self.base_url);
        let response = self
            .http
            .get(&probe_url)
            .send()
            .await
            .map_err(|e| ImageError::Registry(format!("registry probe failed: {e}")))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            debug!(status = %response.status(), "registry serves /v2/ without auth");
            return Ok(String::new());
        }

        let challenge_header = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ImageError::Auth("missing WWW-Authenticate header".to_string()))?;
        let challenge = parse_www_authenticate(challenge_header)?;

        let token_url = format!(
            "{}?service={}&scope=repository:{}:pull",
            challenge.realm, challenge.service, repository
        );
        debug!(url = %token_url, "requesting bearer token");

        let response = self
            .http
            .get(&token_url)
            .send()
            .await
            .map_err(|e| ImageError::Auth(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ImageError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ImageError::Auth(format!("parsing token response: {e}")))?;

        Ok(token.token)
    }
}

/// Parses `Bearer realm="...",service="..."` out of a `WWW-Authenticate`
/// header value.
fn parse_www_authenticate(header: &str) -> Result<AuthChallenge> {
    trace!(header = %header, "parsing WWW-Authenticate");

    let mut challenge = AuthChallenge::default();
    for part in header.trim_start_matches("Bearer ").split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("realm=") {
            challenge.realm = value.trim_matches('"').to_string();
        } else if let Some(value) = part.strip_prefix("service=") {
            challenge.service = value.trim_matches('"').to_string();
        }
    }

    if challenge.realm.is_empty() {
        return Err(ImageError::Auth(format!(
            "invalid WWW-Authenticate header: {header}"
        )));
    }

    Ok(challenge)
}
