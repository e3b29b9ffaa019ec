//! Collaborator contracts for the CRM and the analytics query service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CrmError;

/// An attribute the sync expects to exist on the CRM object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSpec {
    pub api_slug: String,
    pub title: String,
    pub attribute_type: String,
}

impl AttributeSpec {
    pub fn new(api_slug: &str, title: &str, attribute_type: &str) -> Self {
        Self {
            api_slug: api_slug.to_string(),
            title: title.to_string(),
            attribute_type: attribute_type.to_string(),
        }
    }
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Create or update the record whose `matching_attribute` equals the
    /// value in `values`. Returns the CRM record id.
    async fn upsert_record(
        &self,
        object_type: &str,
        values: &Map<String, Value>,
        matching_attribute: &str,
    ) -> Result<String, CrmError>;

    /// Make sure every attribute exists. Returns `api_slug -> attribute id`.
    async fn ensure_attributes(
        &self,
        object_type: &str,
        required: &[AttributeSpec],
    ) -> Result<BTreeMap<String, String>, CrmError>;
}

/// A named analytics query. `params` is hashed into the cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl AnalyticsQuery {
    pub fn new(name: &str, params: Value) -> Self {
        Self {
            name: name.to_string(),
            params,
        }
    }

    /// What the cache keys on: the query name plus its parameters.
    pub fn signature(&self) -> Value {
        serde_json::json!({ "name": self.name, "params": self.params })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn ok(data: Vec<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Only ever called through `QueryCache::get_or_execute`.
#[async_trait]
pub trait AnalyticsClient: Send + Sync {
    async fn execute_query(&self, query: &AnalyticsQuery) -> QueryResult;
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------
