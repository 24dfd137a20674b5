//! Submitter and data handler integration tests
//!
//! Uploads go to an in-memory sender that records the size of every
//! request; caches are real tape caches in a temporary directory.

use async_trait::async_trait;
use sensorlink_client::record::now_ms;
use sensorlink_client::sender::{BatchedSender, RecordSender, TopicSender};
use sensorlink_client::{
    CacheConfig, CacheRegistry, DataCache, DataHandler, Record, RecordCache, Result, Schema,
    SensorLinkConfig, ServerStatus, Submitter, SubmitterConfig, SubmitterEvent, Topic,
    TopicConfig,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const KEY_SCHEMA: &str = r#"{"type": "record", "name": "ObservationKey", "namespace": "org.sensorlink.kafka", "fields": [{"name": "userId", "type": "string"}, {"name": "sourceId", "type": "string"}]}"#;

const VALUE_SCHEMA: &str = r#"{"type": "record", "name": "Acceleration", "namespace": "org.sensorlink.passive", "fields": [{"name": "time", "type": "double"}, {"name": "timeReceived", "type": "double"}, {"name": "x", "type": "float"}]}"#;

fn topic(name: &str) -> Topic {
    Topic::new(
        name,
        Schema::parse(KEY_SCHEMA).unwrap(),
        Schema::parse(VALUE_SCHEMA).unwrap(),
    )
    .unwrap()
}

fn key() -> Value {
    json!({"userId": "u1", "sourceId": "s1"})
}

fn value(x: f64) -> Value {
    let now = now_ms() as f64 / 1000.0;
    json!({"time": now, "timeReceived": now, "x": x})
}

/// Sender that accepts everything and records request sizes.
#[derive(Clone, Default)]
struct RecordingSender {
    requests: Arc<Mutex<Vec<(String, usize)>>>,
}

impl RecordingSender {
    fn request_sizes(&self) -> Vec<usize> {
        self.requests.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }
}

#[async_trait]
impl RecordSender for RecordingSender {
    async fn sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>> {
        Ok(Box::new(RecordingTopicSender {
            topic: topic.clone(),
            requests: Arc::clone(&self.requests),
            last_sent_offset: -1,
        }))
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn reset_connection(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct RecordingTopicSender {
    topic: Topic,
    requests: Arc<Mutex<Vec<(String, usize)>>>,
    last_sent_offset: i64,
}

#[async_trait]
impl TopicSender for RecordingTopicSender {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn send(&mut self, records: Vec<Record>) -> Result<()> {
        if let Some(last) = records.last() {
            self.last_sent_offset = last.offset;
        }
        self.requests
            .lock()
            .unwrap()
            .push((self.topic.name().to_string(), records.len()));
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

fn cache_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        directory: dir.path().to_path_buf(),
        time_window: Duration::from_millis(10),
        ..CacheConfig::default()
    }
}

fn quiet_schedule() -> SubmitterConfig {
    SubmitterConfig {
        upload_interval: Duration::from_secs(3600),
        ..SubmitterConfig::default()
    }
}

async fn wait_for_status(events: &mut broadcast::Receiver<SubmitterEvent>, wanted: ServerStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let SubmitterEvent::Status(status) = events.recv().await.unwrap() {
                if status == wanted {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_upload_drains_cache_in_send_limit_batches() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(DataCache::open_tape(topic("acceleration"), &cache_config(&dir)).await.unwrap());
    for i in 0..12_000 {
        cache.add_measurement(key(), value(i as f64)).unwrap();
    }
    cache.flush().await.unwrap();
    assert_eq!(cache.record_count().await.unwrap(), 12_000);

    let mut caches = CacheRegistry::new();
    caches.register(cache.clone()).unwrap();
    let sender = RecordingSender::default();
    let submitter = Submitter::new(
        caches,
        Arc::new(sender.clone()),
        quiet_schedule(),
        Duration::from_secs(24 * 3600),
    );
    let mut events = submitter.subscribe();
    submitter.start().unwrap();
    wait_for_status(&mut events, ServerStatus::Connected).await;

    submitter.upload_now().await.unwrap();
    assert_eq!(sender.request_sizes(), vec![5000, 5000, 2000]);

    let mut counts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SubmitterEvent::RecordsSent { topic, count } = event {
            assert_eq!(topic, "acceleration");
            counts.push(count);
        }
    }
    assert_eq!(counts, vec![5000, 5000, 2000]);

    cache.flush().await.unwrap();
    assert_eq!(cache.record_count().await.unwrap(), 0);

    submitter.close();
    assert!(submitter.join(Duration::from_secs(5)).await);
    assert_eq!(sender.request_sizes().len(), 3);
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_close_uploads_remaining_records() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(DataCache::open_tape(topic("acceleration"), &cache_config(&dir)).await.unwrap());

    let mut caches = CacheRegistry::new();
    caches.register(cache.clone()).unwrap();
    let sender = RecordingSender::default();
    let submitter = Submitter::new(
        caches,
        Arc::new(sender.clone()),
        quiet_schedule(),
        Duration::from_secs(24 * 3600),
    );
    let mut events = submitter.subscribe();
    submitter.start().unwrap();
    wait_for_status(&mut events, ServerStatus::Connected).await;

    // Still buffered in the cache worker when close runs
    for i in 0..10 {
        cache.add_measurement(key(), value(i as f64)).unwrap();
    }
    submitter.close();
    assert!(submitter.join(Duration::from_secs(5)).await);

    assert_eq!(sender.request_sizes(), vec![10]);
    cache.flush().await.unwrap();
    assert_eq!(cache.record_count().await.unwrap(), 0);
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_close_acknowledges_records_held_by_batching() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(DataCache::open_tape(topic("acceleration"), &cache_config(&dir)).await.unwrap());
    for i in 0..4 {
        cache.add_measurement(key(), value(i as f64)).unwrap();
    }
    cache.flush().await.unwrap();

    let mut caches = CacheRegistry::new();
    caches.register(cache.clone()).unwrap();
    let sender = RecordingSender::default();
    let batched = BatchedSender::new(Arc::new(sender.clone()), 100, Duration::from_secs(3600));
    let submitter = Submitter::new(caches, Arc::new(batched), quiet_schedule(), Duration::from_secs(24 * 3600));
    let mut events = submitter.subscribe();
    submitter.start().unwrap();
    wait_for_status(&mut events, ServerStatus::Connected).await;

    submitter.upload_now().await.unwrap();
    assert!(sender.request_sizes().is_empty());

    submitter.close();
    assert!(submitter.join(Duration::from_secs(5)).await);
    assert_eq!(sender.request_sizes(), vec![4]);
    cache.flush().await.unwrap();
    assert_eq!(cache.record_count().await.unwrap(), 0);
    cache.close().await.unwrap();
}

fn handler_config(dir: &TempDir) -> SensorLinkConfig {
    SensorLinkConfig {
        topics: vec![TopicConfig {
            name: "acceleration".to_string(),
            key_schema: KEY_SCHEMA.to_string(),
            value_schema: VALUE_SCHEMA.to_string(),
        }],
        cache: cache_config(dir),
        submitter: quiet_schedule(),
        sender: None,
    }
}

#[tokio::test]
async fn test_handler_without_sender_is_disabled() {
    let dir = TempDir::new().unwrap();
    let mut handler = DataHandler::open(handler_config(&dir)).await.unwrap();

    assert_eq!(handler.status(), ServerStatus::Disabled);
    assert!(handler.start().is_err());
    assert!(handler.add_measurement("unknown", key(), value(1.0)).is_err());
    handler.add_measurement("acceleration", key(), value(1.0)).unwrap();
    handler.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_uploads_and_tracks_progress() {
    let dir = TempDir::new().unwrap();
    let mut handler = DataHandler::open(handler_config(&dir)).await.unwrap();
    for i in 0..3 {
        handler.add_measurement("acceleration", key(), value(i as f64)).unwrap();
    }

    let sender = RecordingSender::default();
    handler.start_with_sender(Arc::new(sender.clone())).unwrap();
    assert!(handler.start_with_sender(Arc::new(sender.clone())).is_err());

    handler.stop().await;
    assert!(!handler.is_started());
    assert_eq!(sender.request_sizes(), vec![3]);
    assert_eq!(handler.records_sent("acceleration"), Some(3));

    let cache = handler.caches().get("acceleration").unwrap().clone();
    cache.flush().await.unwrap();
    assert_eq!(cache.record_count().await.unwrap(), 0);
    handler.close().await.unwrap();
}
