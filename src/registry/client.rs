//! Digest lookups against the Docker Registry HTTP API v2
//!
//! A `HEAD` on the manifest answers with the digest in the
//! `Docker-Content-Digest` header. Registries that require authentication
//! answer 401 with a `WWW-Authenticate` challenge: `Bearer` challenges are
//! met by fetching a token from the named realm, `Basic` ones by sending
//! the credential directly.

use crate::observability;
use crate::registry::keychain::Credential;
use crate::registry::reference::ImageReference;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderValue, ACCEPT, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Manifest media types a digest may be reported for
const MANIFEST_TYPES: &str = concat!(
    "application/vnd.oci.image.index.v1+json,",
    "application/vnd.docker.distribution.manifest.list.v2+json,",
    "application/vnd.oci.image.manifest.v1+json,",
    "application/vnd.docker.distribution.manifest.v2+json"
);

static CHALLENGE_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)="([^"]*)""#).expect("valid challenge parameter regex (verified by tests)")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    #[error("{image} is unauthorized: {message}")]
    Unauthorized { image: String, message: String },

    #[error("{image} not found")]
    NotFound { image: String },

    #[error("registry did not report a digest for {image}")]
    MissingDigest { image: String },

    #[error("failed to create HTTP client: {0}")]
    Client(String),
}

/// Looks up the digest an image reference currently points at
#[async_trait]
pub trait DigestResolver: Send + Sync + fmt::Debug {
    /// `algorithm:hex` digest of the manifest `image` refers to
    async fn resolve(&self, image: &ImageReference, credential: &Credential) -> Result<String, RegistryError>;
}

/// How a 401 asked to be authenticated
#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Self::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let mut params: HashMap<String, String> = CHALLENGE_PARAM
            .captures_iter(params)
            .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
            .collect();
        Some(Self::Bearer {
            realm: params.remove("realm")?,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

fn with_credential(request: RequestBuilder, credential: &Credential) -> RequestBuilder {
    match credential {
        Credential::Anonymous => request,
        Credential::Basic { username, password } => request.basic_auth(username, Some(password)),
    }
}

/// [`DigestResolver`] speaking HTTP to the registry
#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Client(e.to_string()))?;
        Ok(Self { http })
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, RegistryError> {
        match request.send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                observability::metrics::increment_outbound_requests("registry", "error");
                warn!(url = %url, error = %e, "Registry request failed");
                Err(RegistryError::Request {
                    url: url.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn manifest_request(&self, url: &str) -> RequestBuilder {
        self.http
            .head(url)
            .header(ACCEPT, HeaderValue::from_static(MANIFEST_TYPES))
    }

    /// Exchange the credential for a bearer token scoped to pulling `image`
    async fn token(
        &self,
        image: &ImageReference,
        credential: &Credential,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<String, RegistryError> {
        let default_scope = format!("repository:{}:pull", image.repository);
        let mut query = vec![("scope", scope.unwrap_or(&default_scope))];
        if let Some(service) = service {
            query.push(("service", service));
        }
        let request = with_credential(self.http.get(realm).query(&query), credential);
        let response = self.send(request, realm).await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(RegistryError::Unauthorized {
                    image: image.to_string(),
                    message: format!("token request to {realm} was refused"),
                });
            }
            status => {
                return Err(RegistryError::Status {
                    url: realm.to_string(),
                    status: status.as_u16(),
                });
            }
        }
        let body: TokenResponse = response.json().await.map_err(|e| RegistryError::Request {
            url: realm.to_string(),
            message: format!("unreadable token response: {e}"),
        })?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Unauthorized {
                image: image.to_string(),
                message: format!("{realm} returned no token"),
            })
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve(&self, image: &ImageReference, credential: &Credential) -> Result<String, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            image.registry_url(),
            image.repository,
            image.reference
        );
        let span = info_span!("registry.resolve", image = %image, registry = %image.registry);
        async {
            let mut response = self.send(self.manifest_request(&url), &url).await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(Challenge::parse);
                debug!(challenge = ?challenge, "Registry asked for authentication");
                let request = match challenge {
                    Some(Challenge::Bearer { realm, service, scope }) => {
                        let token = self
                            .token(image, credential, &realm, service.as_deref(), scope.as_deref())
                            .await?;
                        self.manifest_request(&url).bearer_auth(token)
                    }
                    Some(Challenge::Basic) | None => with_credential(self.manifest_request(&url), credential),
                };
                response = self.send(request, &url).await?;
            }

            let outcome = if response.status().is_success() { "success" } else { "error" };
            observability::metrics::increment_outbound_requests("registry", outcome);
            match response.status() {
                status if status.is_success() => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(RegistryError::Unauthorized {
                        image: image.to_string(),
                        message: format!("registry answered {}", response.status().as_u16()),
                    });
                }
                StatusCode::NOT_FOUND => {
                    return Err(RegistryError::NotFound {
                        image: image.to_string(),
                    });
                }
                status => {
                    return Err(RegistryError::Status {
                        url,
                        status: status.as_u16(),
                    });
                }
            }

            response
                .headers()
                .get(DIGEST_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|d| d.contains(':'))
                .map(ToString::to_string)
                .ok_or_else(|| RegistryError::MissingDigest {
                    image: image.to_string(),
                })
        }
        .instrument(span)
        .await
    }
}

/// In-memory [`DigestResolver`] for tests and local runs
///
/// Digests are keyed by [`ImageReference::name`]; every lookup is recorded
/// together with the credential it was made with.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    digests: Mutex<HashMap<String, String>>,
    lookups: Mutex<Vec<(String, Credential)>>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point repository `name` (as `registry/repository`) at `digest`
    pub fn push(&self, name: &str, digest: &str) {
        if let Ok(mut digests) = self.digests.lock() {
            digests.insert(name.to_string(), digest.to_string());
        }
    }

    #[must_use]
    pub fn lookups(&self) -> Vec<(String, Credential)> {
        self.lookups.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DigestResolver for MemoryRegistry {
    async fn resolve(&self, image: &ImageReference, credential: &Credential) -> Result<String, RegistryError> {
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.push((image.name(), credential.clone()));
        }
        self.digests
            .lock()
            .ok()
            .and_then(|d| d.get(&image.name()).cloned())
            .ok_or_else(|| RegistryError::NotFound {
                image: image.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::sync::Arc;

    const DIGEST: &str = "sha256:4bbd4a7f0f3e1a4b9f5e1b1c2f2b0a6c3d9e8f7a6b5c4d3e2f1a0b9c8d7e6f5a";
    /// `riff:s3cr3t`
    const BASIC_HEADER: &str = "Basic cmlmZjpzM2NyM3Q=";

    #[derive(Clone)]
    struct Registry {
        address: String,
        auth: bool,
    }

    async fn manifest(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> AxumResponse {
        let authorized = headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer t0k3n");
        if registry.auth && !authorized {
            let challenge = format!(
                r#"Bearer realm="http://{}/token",service="test-registry",scope="repository:riff/base:pull""#,
                registry.address
            );
            return (AxumStatus::UNAUTHORIZED, [("www-authenticate", challenge)]).into_response();
        }
        (AxumStatus::OK, [(DIGEST_HEADER, DIGEST)]).into_response()
    }

    async fn token(headers: HeaderMap) -> AxumResponse {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(BASIC_HEADER) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        Json(serde_json::json!({ "token": "t0k3n" })).into_response()
    }

    /// Serve a registry on a loopback port and return its address
    async fn serve(auth: bool) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Registry {
            address: address.clone(),
            auth,
        });
        let app = Router::new()
            .route("/v2/riff/base/manifests/latest", get(manifest))
            .route("/token", get(token))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    fn client() -> RegistryClient {
        RegistryClient::new(Duration::from_secs(5)).unwrap()
    }

    fn credential() -> Credential {
        Credential::Basic {
            username: "riff".to_string(),
            password: "s3cr3t".to_string(),
        }
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull""#,
        );
        assert_eq!(
            challenge,
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/ubuntu:pull".to_string()),
            })
        );
        assert_eq!(Challenge::parse(r#"Basic realm="registry""#), Some(Challenge::Basic));
        assert_eq!(Challenge::parse("Bearer service=\"x\""), None);
        assert_eq!(Challenge::parse("Negotiate"), None);
    }

    #[tokio::test]
    async fn test_open_registry_reports_digest() {
        let address = serve(false).await;
        let image = ImageReference::parse(&format!("{address}/riff/base")).unwrap();
        let digest = client().resolve(&image, &Credential::Anonymous).await.unwrap();
        assert_eq!(digest, DIGEST);
        assert_eq!(image.with_digest(&digest), format!("{address}/riff/base@{DIGEST}"));
    }

    #[tokio::test]
    async fn test_bearer_challenge_is_met_with_credentials() {
        let address = serve(true).await;
        let image = ImageReference::parse(&format!("{address}/riff/base:latest")).unwrap();
        let digest = client().resolve(&image, &credential()).await.unwrap();
        assert_eq!(digest, DIGEST);
    }

    #[tokio::test]
    async fn test_anonymous_pull_of_private_image_is_unauthorized() {
        let address = serve(true).await;
        let image = ImageReference::parse(&format!("{address}/riff/base")).unwrap();
        let err = client().resolve(&image, &Credential::Anonymous).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_unknown_tag_is_not_found() {
        let address = serve(false).await;
        let image = ImageReference::parse(&format!("{address}/riff/base:missing")).unwrap();
        let err = client().resolve(&image, &Credential::Anonymous).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_memory_registry_records_lookups() {
        let registry = MemoryRegistry::new();
        registry.push("gcr.io/riff/base", DIGEST);
        let image = ImageReference::parse("gcr.io/riff/base:v1").unwrap();
        assert_eq!(registry.resolve(&image, &credential()).await.unwrap(), DIGEST);
        let missing = ImageReference::parse("gcr.io/riff/other").unwrap();
        assert!(registry.resolve(&missing, &Credential::Anonymous).await.is_err());
        assert_eq!(
            registry.lookups(),
            vec![
                ("gcr.io/riff/base".to_string(), credential()),
                ("gcr.io/riff/other".to_string(), Credential::Anonymous),
            ]
        );
    }
}
