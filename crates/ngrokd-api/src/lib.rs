//! HTTP client for the ngrok control-plane API.
//!
//! The daemon performs exactly three calls: registering a kubernetes
//! operator (which signs our CSR), fetching it back, and listing the
//! endpoints bound to it. Anything outside 200/201 is surfaced with the
//! response body so the reconciler can log it and retry on the next tick.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.ngrok.com";
const API_VERSION: &str = "2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API client errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("operator ID is empty - certificate may not be properly provisioned")]
    MissingOperatorId,
}

/// Request to create a kubernetes operator
#[derive(Debug, Clone, Serialize)]
pub struct CreateOperator {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enabled_features: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<OperatorBindingCreate>,
}

/// Binding section of the create request
#[derive(Debug, Clone, Serialize)]
pub struct OperatorBindingCreate {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub endpoint_selectors: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub csr: String,
}

/// A kubernetes operator as returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct Operator {
    pub id: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub enabled_features: Vec<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub binding: Option<OperatorBinding>,
}

/// Binding section of an operator
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorBinding {
    #[serde(default)]
    pub endpoint_selectors: Vec<String>,
    #[serde(default)]
    pub cert: OperatorCert,
    #[serde(default)]
    pub ingress_endpoint: String,
}

/// Signed client certificate returned at registration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorCert {
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub not_before: String,
    #[serde(default)]
    pub not_after: String,
}

/// A bound endpoint observed via the API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub hostname_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub binding: String,
}

#[derive(Debug, Deserialize)]
struct EndpointList {
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

/// ngrok API client
pub struct Client {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl Client {
    /// Create a client against the production API
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    /// Create a client against a specific base URL
    pub fn with_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("ngrokd/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    /// Register a kubernetes operator; the response carries the signed
    /// client certificate and the ingress endpoint.
    pub async fn create_operator(&self, req: &CreateOperator) -> Result<Operator, ApiError> {
        let resp = self
            .http
            .post(format!("{}/kubernetes_operators", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Ngrok-Version", API_VERSION)
            .json(req)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body).map_err(|e| ApiError::Status {
            status: status.as_u16(),
            body: format!("unparseable response: {e}"),
        })?)
    }

    /// Fetch an operator by id
    pub async fn get_operator(&self, id: &str) -> Result<Operator, ApiError> {
        let resp = self
            .http
            .get(format!("{}/kubernetes_operators/{id}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Ngrok-Version", API_VERSION)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body).map_err(|e| ApiError::Status {
            status: status.as_u16(),
            body: format!("unparseable response: {e}"),
        })?)
    }

    /// List the endpoints currently bound to an operator
    pub async fn list_bound_endpoints(&self, operator_id: &str) -> Result<Vec<Endpoint>, ApiError> {
        if operator_id.is_empty() {
            return Err(ApiError::MissingOperatorId);
        }

        let resp = self
            .http
            .get(format!(
                "{}/kubernetes_operators/{operator_id}/bound_endpoints",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .header("Ngrok-Version", API_VERSION)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let list: EndpointList = serde_json::from_str(&body).map_err(|e| ApiError::Status {
            status: status.as_u16(),
            body: format!("unparseable response: {e}"),
        })?;

        Ok(list.endpoints)
    }
}
