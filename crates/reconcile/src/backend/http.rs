//! HTTP backend speaking to a Satellite server.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::query::SearchQuery;
use crate::types::{Connection, Endpoint};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use std::time::Duration;
use ureq::http::Response;
use ureq::tls::TlsConfig;
use ureq::{Agent, Body};

/// Upper bound for a single request. Long-running work is tracked through
/// tasks, not through hanging requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Backend that issues real HTTP requests.
pub struct HttpBackend {
    agent: Agent,
    base_url: String,
    authorization: String,
}

impl HttpBackend {
    /// Create a backend for a server connection.
    pub fn new(connection: &Connection) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .tls_config(
                TlsConfig::builder()
                    .disable_verification(!connection.verify_tls)
                    .build(),
            )
            .build();
        let credentials = format!("{}:{}", connection.username, connection.password);
        Self {
            agent: Agent::new_with_config(config),
            base_url: connection.url.trim_end_matches('/').to_string(),
            authorization: format!("Basic {}", STANDARD.encode(credentials)),
        }
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Read the body and turn error statuses into [`Error::Http`].
    fn decode(mut response: Response<Body>) -> Result<Value> {
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;
        if status >= 400 {
            return Err(Error::http(status, body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

impl Backend for HttpBackend {
    fn search(&self, endpoint: &Endpoint, query: &SearchQuery) -> Result<Vec<Value>> {
        let url = format!("{}{}", self.base_url, endpoint.url_path());
        log::debug!("Searching {url} for {:?}", query.search);

        let mut request = self
            .agent
            .get(&url)
            .header("Authorization", &self.authorization)
            .header("Accept", "application/json")
            .query("search", &query.search)
            .query("per_page", &query.per_page.to_string());
        if let Some(org) = endpoint.organization_id {
            request = request.query("organization_id", &org.to_string());
        }

        let decoded = match Self::decode(request.call()?) {
            Ok(value) => value,
            Err(Error::Http { status: 404, .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        match decoded.get("results") {
            Some(Value::Array(results)) => Ok(results.clone()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(Error::InvalidResponse(format!(
                "expected an array of results, got {other}"
            ))),
        }
    }

    fn create(&self, endpoint: &Endpoint, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint.url_path());
        log::debug!("POST {url}: {body}");
        let response = self
            .agent
            .post(&url)
            .header("Authorization", &self.authorization)
            .header("Accept", "application/json")
            .send_json(body)?;
        Self::decode(response)
    }

    fn update(&self, endpoint: &Endpoint, id: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint.member_path(id));
        log::debug!("PUT {url}: {body}");
        let response = self
            .agent
            .put(&url)
            .header("Authorization", &self.authorization)
            .header("Accept", "application/json")
            .send_json(body)?;
        Self::decode(response)
    }
}
