//! Kafka REST proxy sender.
//!
//! One batch becomes one request:
//!
//! ```text
//! POST {rest_url}/topics/{topic}
//! Content-Type: application/vnd.kafka.avro.v1+json; charset=utf-8
//!
//! {
//!   "key_schema_id": 4,              or "key_schema": "<schema text>"
//!   "value_schema_id": 7,            or "value_schema": "<schema text>"
//!   "records": [{"key": {...}, "value": {...}}, ...]
//! }
//! ```
//!
//! Schema ids come from the shared [`SchemaRetriever`]; a schema the
//! registry does not know is sent inline instead.

use super::{RecordSender, TopicSender};
use crate::config::SenderConfig;
use crate::encoder::{AvroJsonEncoder, RecordEncoder};
use crate::error::{ClientError, Result};
use crate::record::Record;
use crate::schema_registry_client::{SchemaMetadata, SchemaRegistryClient, SchemaRetriever};
use crate::topic::Topic;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::value::RawValue;
use std::sync::Arc;
use tracing::{debug, warn};

pub const KAFKA_REST_CONTENT_TYPE: &str = "application/vnd.kafka.avro.v1+json; charset=utf-8";
pub const KAFKA_REST_ACCEPT: &str =
    "application/vnd.kafka.v1+json, application/vnd.kafka+json, application/json";

#[derive(Debug, Serialize)]
struct ProduceRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    key_schema_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_schema_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_schema: Option<&'a str>,
    records: Vec<ProduceRecord>,
}

#[derive(Debug, Serialize)]
struct ProduceRecord {
    key: Box<RawValue>,
    value: Box<RawValue>,
}

/// [`RecordSender`] for a Kafka REST proxy.
pub struct RestSender {
    base_url: String,
    http_client: reqwest::Client,
    retriever: Arc<SchemaRetriever>,
    encoder: Arc<dyn RecordEncoder>,
}

impl RestSender {
    pub fn new(config: &SenderConfig) -> Result<Self> {
        let registry =
            SchemaRegistryClient::new(config.schema_registry_url.clone(), config.request_timeout)?;
        let retriever = Arc::new(SchemaRetriever::new(registry));
        Self::with_retriever(config, retriever, Arc::new(AvroJsonEncoder))
    }

    pub fn with_retriever(
        config: &SenderConfig,
        retriever: Arc<SchemaRetriever>,
        encoder: Arc<dyn RecordEncoder>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(KAFKA_REST_ACCEPT));
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            http_client,
            retriever,
            encoder,
        })
    }

    async fn probe(&self) -> bool {
        match self.http_client.head(&self.base_url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!(url = %self.base_url, status = %response.status(), "Server probe rejected");
                false
            }
            Err(e) => {
                debug!(url = %self.base_url, error = %e, "Server probe failed");
                false
            }
        }
    }
}

#[async_trait]
impl RecordSender for RestSender {
    async fn sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>> {
        Ok(Box::new(RestTopicSender {
            topic: topic.clone(),
            url: format!("{}/topics/{}", self.base_url, topic.name()),
            http_client: self.http_client.clone(),
            retriever: Arc::clone(&self.retriever),
            encoder: Arc::clone(&self.encoder),
            last_sent_offset: -1,
        }))
    }

    async fn is_connected(&self) -> bool {
        self.probe().await
    }

    async fn reset_connection(&self) -> bool {
        self.probe().await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One topic's sender. Sends each batch in one request.
pub struct RestTopicSender {
    topic: Topic,
    url: String,
    http_client: reqwest::Client,
    retriever: Arc<SchemaRetriever>,
    encoder: Arc<dyn RecordEncoder>,
    last_sent_offset: i64,
}

impl RestTopicSender {
    fn encode_records(&self, records: &[Record]) -> Vec<ProduceRecord> {
        let key_schema = self.topic.key_schema();
        let value_schema = self.topic.value_schema();

        records
            .iter()
            .filter_map(|record| {
                let encoded = self
                    .encoder
                    .encode(key_schema, &record.key)
                    .and_then(|key| Ok((key, self.encoder.encode(value_schema, &record.value)?)))
                    .and_then(|(key, value)| {
                        Ok(ProduceRecord {
                            key: RawValue::from_string(key)?,
                            value: RawValue::from_string(value)?,
                        })
                    });
                match encoded {
                    Ok(produce) => Some(produce),
                    Err(e) => {
                        warn!(
                            topic = %self.topic,
                            offset = record.offset,
                            error = %e,
                            "Skipping record that does not match its schema"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

fn schema_fields(metadata: &SchemaMetadata) -> (Option<i32>, Option<&str>) {
    match metadata.id {
        Some(id) => (Some(id), None),
        None => (None, Some(metadata.schema.as_str())),
    }
}

#[async_trait]
impl TopicSender for RestTopicSender {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn send(&mut self, records: Vec<Record>) -> Result<()> {
        let Some(last_offset) = records.last().map(|r| r.offset) else {
            return Ok(());
        };

        let encoded = self.encode_records(&records);
        if encoded.is_empty() {
            // Nothing sendable; the batch counts as handled
            self.last_sent_offset = self.last_sent_offset.max(last_offset);
            return Ok(());
        }

        let name = self.topic.name();
        let key_metadata = self
            .retriever
            .get_or_set_schema_metadata(name, false, self.topic.key_schema())
            .await;
        let value_metadata = self
            .retriever
            .get_or_set_schema_metadata(name, true, self.topic.value_schema())
            .await;
        let (key_schema_id, key_schema) = schema_fields(&key_metadata);
        let (value_schema_id, value_schema) = schema_fields(&value_metadata);

        let request = ProduceRequest {
            key_schema_id,
            key_schema,
            value_schema_id,
            value_schema,
            records: encoded,
        };
        let count = request.records.len();

        let response = self
            .http_client
            .post(&self.url)
            .header(CONTENT_TYPE, KAFKA_REST_CONTENT_TYPE)
            .body(serde_json::to_vec(&request)?)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Transport(format!(
                "{} rejected {} records with status {}: {}",
                self.url, count, status, body
            )));
        }

        self.last_sent_offset = self.last_sent_offset.max(last_offset);
        debug!(topic = %self.topic, records = count, last_offset, "Records sent");
        Ok(())
    }

    fn last_sent_offset(&self) -> i64 {
        self.last_sent_offset
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn clear(&mut self) {}

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
