//! REST/JSON remote client.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use shelfsync_common::{Error, FieldMap, RemoteError, RemoteResult, Result};

use crate::client::{RemoteClient, RemoteRecord};

/// Configuration for [`HttpRemote`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRemoteConfig {
    /// API root, e.g. `http://192.168.1.91:3000/api`. Unset until configured.
    pub base_url: Option<Url>,
    /// Collection path segment under the API root.
    pub collection: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl HttpRemoteConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url: Some(base_url),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            collection: "records".to_string(),
            timeout_secs: 10,
            user_agent: format!("ShelfSync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Remote client mapping CRUD onto REST paths under `{base_url}/{collection}`.
///
/// | Call | Request |
/// |---|---|
/// | `create` | `POST /{collection}` |
/// | `update` | `PUT /{collection}/{id}` with the whole record |
/// | `update_field` | `PATCH /{collection}/{id}/{field}` with `{field: value}` |
/// | `delete` | `DELETE /{collection}/{id}` |
/// | `list` | `GET /{collection}` |
///
/// Only `create` and `list` need a JSON body back. Update and delete
/// responses are judged by status; an update body that is not a record
/// leaves the values sent as the confirmed state.
///
/// Without a base URL every call fails as transient, so queued work is kept
/// until a remote is configured.
pub struct HttpRemote {
    http: Client,
    config: HttpRemoteConfig,
}

impl HttpRemote {
    /// Create a new HTTP remote.
    ///
    /// # Errors
    /// - `InvalidInput` if the base URL cannot carry path segments or the
    ///   HTTP client cannot be built
    pub fn new(config: HttpRemoteConfig) -> Result<Self> {
        if let Some(base_url) = &config.base_url {
            if base_url.cannot_be_a_base() {
                return Err(Error::InvalidInput(format!(
                    "Remote URL cannot be a base: {}",
                    base_url
                )));
            }
        }

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &HttpRemoteConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.config.base_url.is_some()
    }

    /// Build `{base_url}/{collection}/{segments...}` with each segment escaped.
    fn url(&self, segments: &[&str]) -> RemoteResult<Url> {
        let mut url = self
            .config
            .base_url
            .clone()
            .ok_or_else(|| RemoteError::transient("No remote URL configured"))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::permanent("Remote URL cannot be a base"))?
            .pop_if_empty()
            .push(&self.config.collection)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> RemoteResult<RequestBuilder> {
        let url = self.url(segments)?;
        debug!("{} {}", method, url);
        Ok(self.http.request(method, url))
    }

    /// Send a request, failing on any unsuccessful status.
    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status, &body);
            warn!("Remote returned {}: {}", status, err);
            Err(err)
        }
    }

    /// Send a request and decode its JSON body; an empty body decodes as `null`.
    async fn send_json(&self, request: RequestBuilder) -> RemoteResult<Value> {
        let body = self.send(request).await?.bytes().await.map_err(classify_transport)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|e| RemoteError::permanent(format!("Undecodable response body: {}", e)))
    }

    /// Send a request whose body is informational; anything but JSON reads as `null`.
    async fn send_lenient(&self, request: RequestBuilder) -> RemoteResult<Value> {
        let body = self.send(request).await?.bytes().await.map_err(classify_transport)?;
        Ok(serde_json::from_slice(&body).unwrap_or_else(|_| {
            debug!("Ignoring non-JSON response body ({} bytes)", body.len());
            Value::Null
        }))
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    fn name(&self) -> &str {
        "http"
    }

    async fn create(&self, fields: &FieldMap) -> RemoteResult<RemoteRecord> {
        let body = self
            .send_json(self.request(Method::POST, &[])?.json(fields))
            .await?;
        parse_created(body, fields)
    }

    async fn update(&self, id: &str, fields: &FieldMap) -> RemoteResult<RemoteRecord> {
        let body = self
            .send_lenient(self.request(Method::PUT, &[id])?.json(fields))
            .await?;
        parse_updated(body, id, fields)
    }

    async fn update_field(
        &self,
        id: &str,
        field: &str,
        value: &Value,
    ) -> RemoteResult<RemoteRecord> {
        let mut fields = FieldMap::new();
        fields.insert(field.to_string(), value.clone());

        let body = self
            .send_lenient(self.request(Method::PATCH, &[id, field])?.json(&fields))
            .await?;
        parse_updated(body, id, &fields)
    }

    async fn delete(&self, id: &str) -> RemoteResult<()> {
        self.send(self.request(Method::DELETE, &[id])?).await?;
        Ok(())
    }

    async fn list(&self) -> RemoteResult<Vec<RemoteRecord>> {
        let body = self.send_json(self.request(Method::GET, &[])?).await?;
        parse_list(body, &self.config.collection)
    }
}

/// Classify a failure to get any response at all.
fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_builder() {
        RemoteError::permanent(format!("Invalid request: {}", err))
    } else if err.is_timeout() {
        RemoteError::transient(format!("Request timed out: {}", err))
    } else if err.is_connect() {
        RemoteError::transient(format!("Connection failed: {}", err))
    } else {
        RemoteError::transient(format!("Network error: {}", err))
    }
}

/// Classify an unsuccessful HTTP status.
///
/// 408, 429 and 5xx are worth retrying; every other status is a rejection.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{} - {}", status, body.trim())
    };

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteError::transient(message)
    } else {
        RemoteError::permanent(message)
    }
}

/// Servers may send ids as strings or numbers.
fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn into_object(body: Value, what: &str) -> RemoteResult<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(RemoteError::permanent(format!(
            "Expected {} object, got {}",
            what, other
        ))),
    }
}

/// Parse a full record object, splitting off its `id`.
pub fn parse_record(body: Value) -> RemoteResult<RemoteRecord> {
    let mut map = into_object(body, "record")?;
    let id = map
        .remove("id")
        .as_ref()
        .and_then(id_to_string)
        .ok_or_else(|| RemoteError::permanent("Record without id"))?;
    Ok(RemoteRecord::new(id, map.into_iter().collect()))
}

/// Parse a create response: a full record, or only `{"insertId": ..}`.
pub fn parse_created(body: Value, sent: &FieldMap) -> RemoteResult<RemoteRecord> {
    let map = into_object(body, "create response")?;
    if map.contains_key("id") {
        return parse_record(Value::Object(map));
    }
    let id = map
        .get("insertId")
        .and_then(id_to_string)
        .ok_or_else(|| RemoteError::permanent("Create response carries no id"))?;
    Ok(RemoteRecord::new(id, sent.clone()))
}

/// Parse an update response, falling back to the values sent when the server
/// answers with no record.
fn parse_updated(body: Value, id: &str, sent: &FieldMap) -> RemoteResult<RemoteRecord> {
    if body.get("id").is_some() {
        parse_record(body)
    } else {
        Ok(RemoteRecord::new(id, sent.clone()))
    }
}

/// Parse a list response: a bare array or `{collection: [..]}`.
pub fn parse_list(body: Value, collection: &str) -> RemoteResult<Vec<RemoteRecord>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(collection) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(RemoteError::permanent(format!(
                    "List response has no '{}' array",
                    collection
                )))
            }
        },
        other => {
            return Err(RemoteError::permanent(format!(
                "Expected list, got {}",
                other
            )))
        }
    };

    items.into_iter().map(parse_record).collect()
}
