//! HTTP client for the Avro schema registry
//!
//! [`SchemaRegistryClient`] fetches and registers schemas per subject.
//! [`SchemaRetriever`] sits in front of it and caches what it learns, so each
//! subject costs at most one lookup and one registration per process.

use crate::error::Result;
use crate::topic::Schema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Failure of a single registry request.
#[derive(Debug, Clone, Error)]
pub enum SchemaLookupError {
    /// The registry has no schema under the subject.
    #[error("schema not found: {0}")]
    NotFound(String),

    /// The registry could not be reached or failed internally.
    #[error("registry unreachable: {0}")]
    Transport(String),

    /// The registry answered with something unusable.
    #[error("registry request failed: {0}")]
    Fatal(String),
}

/// A schema as known to the registry.
///
/// `id` is `None` when the registry does not know the schema; senders then
/// inline the schema text.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMetadata {
    pub id: Option<i32>,
    pub version: Option<i32>,
    pub schema: Schema,
}

/// Response of `GET /subjects/{subject}/versions/latest`
#[derive(Debug, Deserialize)]
struct SubjectVersionResponse {
    id: i32,
    version: Option<i32>,
    schema: String,
}

#[derive(Debug, Serialize)]
struct RegisterSchemaRequest<'a> {
    schema: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterSchemaResponse {
    id: i32,
}

/// HTTP client for schema registry operations
pub struct SchemaRegistryClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl SchemaRegistryClient {
    /// Create a client for the registry at `base_url`
    /// (e.g. "http://localhost:8081").
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Latest schema registered under `subject`.
    pub async fn latest_schema_metadata(
        &self,
        subject: &str,
    ) -> std::result::Result<SchemaMetadata, SchemaLookupError> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, subject).await?;

        let body: SubjectVersionResponse = response
            .json()
            .await
            .map_err(|e| SchemaLookupError::Fatal(format!("unparseable schema response: {}", e)))?;
        let schema = Schema::parse(&body.schema)
            .map_err(|e| SchemaLookupError::Fatal(format!("registry returned {}", e)))?;

        debug!(
            subject,
            schema_id = body.id,
            version = body.version,
            "Schema retrieved"
        );

        Ok(SchemaMetadata {
            id: Some(body.id),
            version: body.version,
            schema,
        })
    }

    /// Register `schema` under `subject` and return its id.
    ///
    /// Registering a schema the registry already holds returns the existing
    /// id.
    pub async fn register_schema(
        &self,
        subject: &str,
        schema: &Schema,
    ) -> std::result::Result<i32, SchemaLookupError> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);

        let response = self
            .http_client
            .post(&url)
            .json(&RegisterSchemaRequest {
                schema: schema.as_str(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, subject).await?;

        let body: RegisterSchemaResponse = response.json().await.map_err(|e| {
            SchemaLookupError::Fatal(format!("unparseable registration response: {}", e))
        })?;

        debug!(subject, schema_id = body.id, "Schema registered");
        Ok(body.id)
    }
}

fn transport_error(e: reqwest::Error) -> SchemaLookupError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        SchemaLookupError::Transport(e.to_string())
    } else {
        SchemaLookupError::Fatal(e.to_string())
    }
}

async fn check_status(
    response: reqwest::Response,
    subject: &str,
) -> std::result::Result<reqwest::Response, SchemaLookupError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", subject, status, body);
    if status == reqwest::StatusCode::NOT_FOUND {
        Err(SchemaLookupError::NotFound(message))
    } else if status.is_server_error() {
        Err(SchemaLookupError::Transport(message))
    } else {
        Err(SchemaLookupError::Fatal(message))
    }
}

/// Registry subject of a topic's key or value schema.
pub fn subject(topic: &str, is_value: bool) -> String {
    format!("{}-{}", topic, if is_value { "value" } else { "key" })
}

/// Caching front of a [`SchemaRegistryClient`], shared by every sender.
pub struct SchemaRetriever {
    client: SchemaRegistryClient,
    cache: RwLock<HashMap<String, SchemaMetadata>>,
}

impl SchemaRetriever {
    pub fn new(client: SchemaRegistryClient) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached metadata, falling back to a registry lookup.
    pub async fn schema_metadata(
        &self,
        topic: &str,
        is_value: bool,
    ) -> std::result::Result<SchemaMetadata, SchemaLookupError> {
        let subject = subject(topic, is_value);
        if let Some(metadata) = self.cache.read().await.get(&subject) {
            return Ok(metadata.clone());
        }

        let metadata = self.client.latest_schema_metadata(&subject).await?;
        let mut cache = self.cache.write().await;
        Ok(cache.entry(subject).or_insert(metadata).clone())
    }

    /// Metadata for `schema`, registering it when the registry lacks it.
    ///
    /// Never fails: if registration fails too, the result has no id and is
    /// not cached, so a later call tries again.
    pub async fn get_or_set_schema_metadata(
        &self,
        topic: &str,
        is_value: bool,
        schema: &Schema,
    ) -> SchemaMetadata {
        match self.schema_metadata(topic, is_value).await {
            Ok(metadata) => return metadata,
            Err(e) => {
                warn!(topic, is_value, error = %e, "Schema not yet in the registry, registering it");
            }
        }

        let subject = subject(topic, is_value);
        match self.client.register_schema(&subject, schema).await {
            Ok(id) => {
                let metadata = SchemaMetadata {
                    id: Some(id),
                    version: None,
                    schema: schema.clone(),
                };
                self.cache.write().await.insert(subject, metadata.clone());
                metadata
            }
            Err(e) => {
                warn!(topic, is_value, error = %e, "Failed to register schema, sending it inline");
                SchemaMetadata {
                    id: None,
                    version: None,
                    schema: schema.clone(),
                }
            }
        }
    }
}
