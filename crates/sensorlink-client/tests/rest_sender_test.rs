//! REST sender and schema registry tests against a mock server
//!
//! One axum server plays both roles: the REST proxy at `/` and the schema
//! registry under `/registry`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sensorlink_client::sender::rest::KAFKA_REST_CONTENT_TYPE;
use sensorlink_client::{
    ClientError, Record, RecordSender, RestSender, Schema, SchemaRegistryClient, SchemaRetriever,
    SenderConfig, Topic, TopicSender,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KEY_SCHEMA: &str = r#"{"type": "record", "name": "ObservationKey", "namespace": "org.sensorlink.kafka", "fields": [{"name": "userId", "type": "string"}, {"name": "sourceId", "type": "string"}]}"#;

const VALUE_SCHEMA: &str = r#"{"type": "record", "name": "Acceleration", "namespace": "org.sensorlink.passive", "fields": [{"name": "time", "type": "double"}, {"name": "timeReceived", "type": "double"}, {"name": "x", "type": "float"}, {"name": "label", "type": ["null", "string"], "default": null}]}"#;

#[derive(Default)]
struct MockInner {
    /// (content type, body) of every produce request
    produced: Vec<(String, Value)>,
    /// Subjects registered through POST
    registered: Vec<String>,
    /// Subjects the registry already knows, with their ids
    known: HashMap<String, (i32, String)>,
    fail_registration: bool,
    reject_produce: bool,
}

#[derive(Clone, Default)]
struct Mock {
    inner: Arc<Mutex<MockInner>>,
}

async fn probe() -> &'static str {
    "{}"
}

async fn latest_version(State(mock): State<Mock>, Path(subject): Path<String>) -> Response {
    let inner = mock.inner.lock().unwrap();
    match inner.known.get(&subject) {
        Some((id, schema)) => Json(json!({"id": id, "version": 1, "schema": schema})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error_code": 40401, "message": "Subject not found"})),
        )
            .into_response(),
    }
}

async fn register(
    State(mock): State<Mock>,
    Path(subject): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut inner = mock.inner.lock().unwrap();
    if inner.fail_registration {
        return (StatusCode::INTERNAL_SERVER_ERROR, "registry down").into_response();
    }
    let schema = body["schema"].as_str().unwrap_or_default().to_string();
    inner.registered.push(subject.clone());
    let id = 100 + inner.registered.len() as i32;
    inner.known.insert(subject, (id, schema));
    Json(json!({"id": id})).into_response()
}

async fn produce(State(mock): State<Mock>, headers: HeaderMap, body: Bytes) -> Response {
    let mut inner = mock.inner.lock().unwrap();
    if inner.reject_produce {
        return (StatusCode::UNPROCESSABLE_ENTITY, "invalid records").into_response();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body: Value = serde_json::from_slice(&body).unwrap();
    inner.produced.push((content_type, body));
    Json(json!({"offsets": []})).into_response()
}

async fn start_mock(mock: Mock) -> SocketAddr {
    let app = Router::new()
        .route("/", get(probe))
        .route("/topics/:topic", post(produce))
        .route("/registry/subjects/:subject/versions/latest", get(latest_version))
        .route("/registry/subjects/:subject/versions", post(register))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn sender_config(addr: SocketAddr) -> SenderConfig {
    let mut config = SenderConfig::new(format!("http://{}", addr), format!("http://{}/registry", addr));
    config.request_timeout = Duration::from_secs(5);
    config
}

fn topic() -> Topic {
    Topic::new(
        "acceleration",
        Schema::parse(KEY_SCHEMA).unwrap(),
        Schema::parse(VALUE_SCHEMA).unwrap(),
    )
    .unwrap()
}

fn records(offsets: std::ops::RangeInclusive<i64>) -> Vec<Record> {
    offsets
        .map(|offset| {
            Record::new(
                offset,
                json!({"userId": "u1", "sourceId": "s1"}),
                json!({"time": 10.0, "timeReceived": 11.0, "x": 0.5, "label": "walking"}),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_schemas_are_registered_and_sent_by_id() {
    let mock = Mock::default();
    let addr = start_mock(mock.clone()).await;
    let sender = RestSender::new(&sender_config(addr)).unwrap();
    assert!(sender.is_connected().await);

    let mut topic_sender = sender.sender(&topic()).await.unwrap();
    topic_sender.send(records(1..=2)).await.unwrap();
    topic_sender.send(records(3..=3)).await.unwrap();
    assert_eq!(topic_sender.last_sent_offset(), 3);

    let inner = mock.inner.lock().unwrap();
    assert_eq!(inner.registered, vec!["acceleration-key", "acceleration-value"]);
    assert_eq!(inner.produced.len(), 2);

    let (content_type, body) = &inner.produced[0];
    assert_eq!(content_type, KAFKA_REST_CONTENT_TYPE);
    assert_eq!(body["key_schema_id"], json!(101));
    assert_eq!(body["value_schema_id"], json!(102));
    assert!(body.get("key_schema").is_none());
    assert!(body.get("value_schema").is_none());

    let produced = body["records"].as_array().unwrap();
    assert_eq!(produced.len(), 2);
    assert_eq!(produced[0]["key"], json!({"userId": "u1", "sourceId": "s1"}));
    assert_eq!(produced[0]["value"]["x"], json!(0.5));
    assert_eq!(produced[0]["value"]["label"], json!({"string": "walking"}));
}

#[tokio::test]
async fn test_known_schema_uses_registry_id() {
    let mock = Mock::default();
    mock.inner
        .lock()
        .unwrap()
        .known
        .insert("acceleration-value".to_string(), (42, VALUE_SCHEMA.to_string()));
    let addr = start_mock(mock.clone()).await;

    let sender = RestSender::new(&sender_config(addr)).unwrap();
    let mut topic_sender = sender.sender(&topic()).await.unwrap();
    topic_sender.send(records(1..=1)).await.unwrap();

    let inner = mock.inner.lock().unwrap();
    assert_eq!(inner.registered, vec!["acceleration-key"]);
    assert_eq!(inner.produced[0].1["value_schema_id"], json!(42));
}

#[tokio::test]
async fn test_failed_registration_inlines_schemas() {
    let mock = Mock::default();
    mock.inner.lock().unwrap().fail_registration = true;
    let addr = start_mock(mock.clone()).await;

    let sender = RestSender::new(&sender_config(addr)).unwrap();
    let mut topic_sender = sender.sender(&topic()).await.unwrap();
    topic_sender.send(records(1..=1)).await.unwrap();

    let inner = mock.inner.lock().unwrap();
    let body = &inner.produced[0].1;
    assert!(body.get("key_schema_id").is_none());
    assert_eq!(body["key_schema"], json!(topic().key_schema().as_str()));
    assert_eq!(body["value_schema"], json!(topic().value_schema().as_str()));
}

#[tokio::test]
async fn test_rejected_request_is_a_transport_error() {
    let mock = Mock::default();
    mock.inner.lock().unwrap().reject_produce = true;
    let addr = start_mock(mock.clone()).await;

    let sender = RestSender::new(&sender_config(addr)).unwrap();
    let mut topic_sender = sender.sender(&topic()).await.unwrap();
    let result = topic_sender.send(records(1..=4)).await;

    assert!(matches!(result, Err(ClientError::Transport(_))));
    assert_eq!(topic_sender.last_sent_offset(), -1);
}

#[tokio::test]
async fn test_records_not_matching_schema_are_skipped() {
    let mock = Mock::default();
    let addr = start_mock(mock.clone()).await;

    let sender = RestSender::new(&sender_config(addr)).unwrap();
    let mut topic_sender = sender.sender(&topic()).await.unwrap();
    let mut batch = records(1..=3);
    batch[1].value = json!({"time": "yesterday"});
    topic_sender.send(batch).await.unwrap();

    assert_eq!(topic_sender.last_sent_offset(), 3);
    let inner = mock.inner.lock().unwrap();
    assert_eq!(inner.produced[0].1["records"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unreachable_server_is_not_connected() {
    // Nothing listens on port 9 of localhost
    let mut config = SenderConfig::new("http://127.0.0.1:9", "http://127.0.0.1:9");
    config.request_timeout = Duration::from_millis(500);
    let sender = RestSender::new(&config).unwrap();

    assert!(!sender.is_connected().await);
    assert!(!sender.reset_connection().await);
}

#[tokio::test]
async fn test_retriever_caches_lookups() {
    let mock = Mock::default();
    mock.inner
        .lock()
        .unwrap()
        .known
        .insert("acceleration-key".to_string(), (7, KEY_SCHEMA.to_string()));
    let addr = start_mock(mock.clone()).await;

    let client =
        SchemaRegistryClient::new(format!("http://{}/registry", addr), Duration::from_secs(5)).unwrap();
    let retriever = SchemaRetriever::new(client);

    let metadata = retriever.schema_metadata("acceleration", false).await.unwrap();
    assert_eq!(metadata.id, Some(7));
    assert_eq!(metadata.version, Some(1));

    mock.inner.lock().unwrap().known.clear();
    let cached = retriever.schema_metadata("acceleration", false).await.unwrap();
    assert_eq!(cached.id, Some(7));
    assert!(retriever.schema_metadata("acceleration", true).await.is_err());
}
