//! # Stream Provisioner
//!
//! Client for the provisioner behind a streaming Gateway. Provisioning a
//! stream is an idempotent `PUT` to `<provisioner>/<namespace>/<name>`; the
//! reply names the gateway address and topic clients of the stream use.

use crate::observability;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

/// Where a provisioned stream can be reached
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StreamAddress {
    pub gateway: String,
    pub topic: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    #[error("failed to create HTTP client: {0}")]
    Client(String),
}

#[async_trait]
pub trait StreamProvisioner: Send + Sync + fmt::Debug {
    async fn provision(&self, url: &str) -> Result<StreamAddress, ProvisionError>;
}

/// [`StreamProvisioner`] speaking HTTP
#[derive(Clone, Debug)]
pub struct HttpProvisioner {
    http: reqwest::Client,
}

impl HttpProvisioner {
    pub fn new(timeout: Duration) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::Client(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl StreamProvisioner for HttpProvisioner {
    async fn provision(&self, url: &str) -> Result<StreamAddress, ProvisionError> {
        let span = info_span!("provisioner.provision", url = %url);
        async {
            let request = self
                .http
                .put(url)
                .header(ACCEPT, HeaderValue::from_static("application/json"));
            let response = request.send().await.map_err(|e| {
                observability::metrics::increment_outbound_requests("provisioner", "error");
                warn!(error = %e, "Provisioner request failed");
                ProvisionError::Request {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            })?;
            if !response.status().is_success() {
                observability::metrics::increment_outbound_requests("provisioner", "error");
                return Err(ProvisionError::Status {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }
            let address = response.json::<StreamAddress>().await.map_err(|e| ProvisionError::Request {
                url: url.to_string(),
                message: format!("unreadable provisioner response: {e}"),
            })?;
            observability::metrics::increment_outbound_requests("provisioner", "success");
            Ok(address)
        }
        .instrument(span)
        .await
    }
}

/// In-memory [`StreamProvisioner`] for tests
///
/// Answers with the address registered for a URL, or a 404 for URLs it
/// does not know. Every call is recorded.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    replies: Mutex<HashMap<String, Result<StreamAddress, ProvisionError>>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryProvisioner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, address: StreamAddress) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(url.to_string(), Ok(address));
        }
    }

    pub fn fail(&self, url: &str, message: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(
                url.to_string(),
                Err(ProvisionError::Request {
                    url: url.to_string(),
                    message: message.to_string(),
                }),
            );
        }
    }

    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StreamProvisioner for MemoryProvisioner {
    async fn provision(&self, url: &str) -> Result<StreamAddress, ProvisionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(url.to_string());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|r| r.get(url).cloned())
            .unwrap_or_else(|| {
                Err(ProvisionError::Status {
                    url: url.to_string(),
                    status: 404,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::put;
    use axum::{Json, Router};

    async fn provision(Path((namespace, name)): Path<(String, String)>) -> Json<StreamAddress> {
        Json(StreamAddress {
            gateway: "franz.riff-system.svc.cluster.local:6565".to_string(),
            topic: format!("{namespace}_{name}"),
        })
    }

    async fn serve() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let app = Router::new().route("/{namespace}/{name}", put(provision));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    #[tokio::test]
    async fn test_put_returns_stream_address() {
        let address = serve().await;
        let provisioner = HttpProvisioner::new(Duration::from_secs(5)).unwrap();
        let stream = provisioner
            .provision(&format!("http://{address}/default/letters"))
            .await
            .unwrap();
        assert_eq!(stream.gateway, "franz.riff-system.svc.cluster.local:6565");
        assert_eq!(stream.topic, "default_letters");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let address = serve().await;
        let provisioner = HttpProvisioner::new(Duration::from_secs(5)).unwrap();
        let url = format!("http://{address}/too/many/segments");
        let err = provisioner.provision(&url).await.unwrap_err();
        assert_eq!(err, ProvisionError::Status { url, status: 404 });
    }

    #[tokio::test]
    async fn test_memory_provisioner_answers_registered_urls() {
        let provisioner = MemoryProvisioner::new();
        let address = StreamAddress {
            gateway: "gw:6565".to_string(),
            topic: "t".to_string(),
        };
        provisioner.respond("http://gw/default/s", address.clone());
        provisioner.fail("http://gw/default/broken", "remote error");

        assert_eq!(provisioner.provision("http://gw/default/s").await.unwrap(), address);
        let err = provisioner.provision("http://gw/default/broken").await.unwrap_err();
        assert_eq!(err.to_string(), "request to http://gw/default/broken failed: remote error");
        assert!(provisioner.provision("http://gw/default/unknown").await.is_err());
        assert_eq!(provisioner.calls().len(), 3);
    }
}
