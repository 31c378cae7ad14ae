//! In-process broker: partitioned append-only topics, consumer groups,
//! watermarks and delivery callbacks, all behind one lock.
//!
//! Useful for running pipelines and their tests without a broker cluster.

mod consumer;
mod producer;
mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use dataset_api::broker::{Broker, BrokerAdmin, BrokerConsumer, BrokerProducer, NewTopic};
use dataset_api::{BrokerError, ClientConfig};

pub use consumer::{MemoryConsumer, OffsetReset};
pub use producer::MemoryProducer;
pub use state::FaultPoint;

use producer::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_QUEUE_MAX_MESSAGES};
use state::Shared;

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// Cheap to clone; clones share the same topics and groups.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("MemoryBroker")
            .field("topics", &state.topics.len())
            .field("groups", &state.groups.len())
            .finish()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    /// Convenience for tests: create a topic with `partitions` partitions.
    pub fn create_topic(&self, name: &str, partitions: i32) -> Result<(), BrokerError> {
        self.shared
            .lock()
            .create_topic(&NewTopic {
                name: name.to_string(),
                num_partitions: partitions,
                replication_factor: 1,
                config: BTreeMap::new(),
            })
            .map(|_| ())
    }

    /// `(low, high)` watermarks of every partition of `topic`.
    pub fn watermarks(&self, topic: &str) -> Vec<(i64, i64)> {
        let state = self.shared.lock();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        (0..log.partitions.len() as i32)
            .map(|p| state.watermarks(topic, p))
            .collect()
    }

    /// Topic-level config the topic was created with.
    pub fn topic_config(&self, topic: &str) -> Option<BTreeMap<String, String>> {
        self.shared.lock().topics.get(topic).map(|log| log.config.clone())
    }

    /// Raw payloads of one partition, in offset order.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Vec<u8>> {
        let state = self.shared.lock();
        state
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(usize::try_from(partition).ok()?))
            .map(|records| records.iter().map(|r| r.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Key of every record of one partition, in offset order.
    pub fn keys(&self, topic: &str, partition: i32) -> Vec<Option<Vec<u8>>> {
        let state = self.shared.lock();
        state
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(usize::try_from(partition).ok()?))
            .map(|records| records.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default()
    }

    /// Append a raw payload to a partition, bypassing producers.
    pub fn append_raw(&self, topic: &str, partition: i32, value: &[u8]) -> Result<i64, BrokerError> {
        let mut state = self.shared.lock();
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::new("_UNKNOWN_TOPIC", format!("topic '{topic}' does not exist")))?;
        let records = usize::try_from(partition)
            .ok()
            .and_then(|p| log.partitions.get_mut(p))
            .ok_or_else(|| BrokerError::new("_UNKNOWN_PARTITION", format!("{topic}[{partition}]")))?;
        records.push(state::StoredRecord {
            key: None,
            value: value.to_vec(),
        });
        let offset = records.len() as i64 - 1;
        drop(state);
        self.shared.records_arrived.notify_all();
        Ok(offset)
    }

    /// Make watermark lookups on `topic` report `OFFSET_INVALID`.
    pub fn set_watermarks_unavailable(&self, topic: &str, unavailable: bool) {
        if let Some(log) = self.shared.lock().topics.get_mut(topic) {
            log.watermarks_unavailable = unavailable;
        }
    }

    /// Queue an error for the next operation of `point` by any member of `group_id`.
    pub fn inject_fault(&self, group_id: &str, point: FaultPoint, error: BrokerError) {
        self.shared
            .lock()
            .faults
            .entry((group_id.to_string(), point))
            .or_default()
            .push_back(error);
    }

    /// Number of members currently in a consumer group.
    pub fn group_size(&self, group_id: &str) -> usize {
        self.shared
            .lock()
            .groups
            .get(group_id)
            .map_or(0, |g| g.members.len())
    }

    /// `(fresh, cached)` watermark lookups served so far.
    pub fn watermark_lookups(&self) -> (u64, u64) {
        let state = self.shared.lock();
        (state.fresh_watermark_lookups, state.cached_watermark_lookups)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Broker / BrokerAdmin
// ═══════════════════════════════════════════════════════════════

impl Broker for MemoryBroker {
    fn create_consumer(&self, config: &ClientConfig) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let group_id = config
            .get("group.id")
            .filter(|g| !g.is_empty())
            .ok_or_else(|| BrokerError::new("_INVALID_ARG", "group.id is required for consumers"))?;
        let reset = match config.get("auto.offset.reset") {
            Some(value) => OffsetReset::parse(value)?,
            None => OffsetReset::Latest,
        };
        Ok(Box::new(MemoryConsumer::new(
            Arc::clone(&self.shared),
            group_id.to_string(),
            reset,
        )))
    }

    fn create_producer(&self, config: &ClientConfig) -> Result<Box<dyn BrokerProducer>, BrokerError> {
        let max_message_bytes = config
            .get_usize("message.max.bytes")
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        let queue_max_messages = config
            .get_usize("queue.buffering.max.messages")
            .unwrap_or(DEFAULT_QUEUE_MAX_MESSAGES);
        let auto_create = config.get_bool("allow.auto.create.topics").unwrap_or(true);
        Ok(Box::new(MemoryProducer::new(
            Arc::clone(&self.shared),
            max_message_bytes,
            queue_max_messages,
            auto_create,
        )))
    }
}

impl BrokerAdmin for MemoryBroker {
    fn create_topics(&self, topics: &[NewTopic]) -> Vec<Result<String, BrokerError>> {
        let mut state = self.shared.lock();
        topics.iter().map(|new_topic| state.create_topic(new_topic)).collect()
    }

    fn delete_topics(&self, names: &[&str]) -> Vec<Result<String, BrokerError>> {
        let mut state = self.shared.lock();
        names.iter().map(|name| state.delete_topic(name)).collect()
    }

    fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let mut names: Vec<String> = self.shared.lock().topics.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
