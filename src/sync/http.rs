//! reqwest-backed CRM client.
//!
//! Speaks a records/attributes REST shape:
//!   PUT  {base}/objects/{object}/records?matching_attribute={attr}
//!   GET  {base}/objects/{object}/attributes
//!   POST {base}/objects/{object}/attributes
//!
//! This client never retries. Retry policy lives in the batch writer, which
//! reads the typed `CrmError` this module produces.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use url::Url;

use super::client::{AttributeSpec, CrmClient};
use crate::error::{CrmError, SyncError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

pub struct HttpCrmClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl HttpCrmClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Configuration(format!("Invalid CRM base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Configuration(format!(
                "CRM base URL {} cannot carry a path",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Configuration(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    fn object_url(&self, object_type: &str, tail: &str) -> Result<Url, CrmError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CrmError::Unexpected(format!("unusable base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(["objects", object_type, tail]);
        Ok(url)
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> Result<Value, CrmError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| CrmError::Unexpected(format!("unreadable CRM response: {}", e)));
        }
        let retry_after = response.headers().get(RETRY_AFTER).cloned();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after.as_ref(), &body))
    }

    async fn existing_attributes(&self, object_type: &str) -> Result<BTreeMap<String, String>, CrmError> {
        let url = self.object_url(object_type, "attributes")?;
        let body = self.send_json(self.http.get(url)).await?;
        let mut found = BTreeMap::new();
        if let Some(items) = body.get("data").and_then(Value::as_array) {
            for item in items {
                let slug = item.get("api_slug").and_then(Value::as_str);
                if let (Some(slug), Some(id)) = (slug, attribute_id(item)) {
                    found.insert(slug.to_string(), id);
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn upsert_record(
        &self,
        object_type: &str,
        values: &Map<String, Value>,
        matching_attribute: &str,
    ) -> Result<String, CrmError> {
        let mut url = self.object_url(object_type, "records")?;
        url.query_pairs_mut()
            .append_pair("matching_attribute", matching_attribute);
        let body = self
            .send_json(self.http.put(url).json(&json!({ "data": { "values": values } })))
            .await?;
        record_id(&body).ok_or_else(|| CrmError::Unexpected("CRM response has no record id".into()))
    }

    async fn ensure_attributes(
        &self,
        object_type: &str,
        required: &[AttributeSpec],
    ) -> Result<BTreeMap<String, String>, CrmError> {
        let mut mapping = self.existing_attributes(object_type).await?;
        for attr in required {
            if mapping.contains_key(&attr.api_slug) {
                continue;
            }
            log::info!("Creating CRM attribute {}.{}", object_type, attr.api_slug);
            let url = self.object_url(object_type, "attributes")?;
            let payload = json!({
                "data": {
                    "api_slug": attr.api_slug,
                    "title": attr.title,
                    "type": attr.attribute_type,
                    "is_required": false,
                    "is_unique": false,
                    "is_multiselect": false,
                }
            });
            let body = self.send_json(self.http.post(url).json(&payload)).await?;
            let id = body
                .get("data")
                .and_then(attribute_id)
                .unwrap_or_else(|| attr.api_slug.clone());
            mapping.insert(attr.api_slug.clone(), id);
        }
        Ok(mapping)
    }
}

/// Map a non-success response onto the writer's retry classes.
pub fn classify_status(status: StatusCode, retry_after: Option<&HeaderValue>, body: &str) -> CrmError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CrmError::Auth(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => CrmError::Validation(detail),
        StatusCode::TOO_MANY_REQUESTS => CrmError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        _ => CrmError::Provider(detail),
    }
}

fn transport_error(err: reqwest::Error) -> CrmError {
    if err.is_timeout() || err.is_connect() {
        CrmError::Provider(format!("transport: {}", err))
    } else {
        CrmError::Unexpected(err.to_string())
    }
}

/// `data.id.record_id`, falling back to a bare string id.
fn record_id(body: &Value) -> Option<String> {
    let id = body.get("data")?.get("id")?;
    id.get("record_id")
        .and_then(Value::as_str)
        .or_else(|| id.as_str())
        .map(str::to_string)
}

fn attribute_id(item: &Value) -> Option<String> {
    let id = item.get("id")?;
    id.get("attribute_id")
        .and_then(Value::as_str)
        .or_else(|| id.as_str())
        .map(str::to_string)
}
