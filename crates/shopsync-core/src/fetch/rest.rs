//! REST backend over reqwest
//!
//! Payloads are opaque JSON here; typing happens in the fetcher.

use super::{Backend, FetchRequest};
use crate::auth::Credential;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Storefront REST API client
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    credential: RwLock<Option<Credential>>,
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}{}", self.base_url, target)
        }
    }
}

impl Backend for RestBackend {
    async fn get_json(&self, request: &FetchRequest) -> SyncResult<Value> {
        let url = self.url_for(&request.target);
        let bearer = self.credential.read().as_ref().map(Credential::bearer);

        let mut builder = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .query(&request.params);
        if let Some(bearer) = bearer {
            builder = builder.header(AUTHORIZATION, bearer);
        }

        let response = builder.send().await.map_err(|e| SyncError::NetworkFailure {
            url: url.clone(),
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %url, status = status.as_u16(), "Backend returned error status");
            return Err(SyncError::NetworkFailure {
                url,
                status: Some(status.as_u16()),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        if status.as_u16() == 204 {
            return Ok(Value::Null);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::malformed(url, e.to_string()))
    }

    fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write() = credential;
    }
}
