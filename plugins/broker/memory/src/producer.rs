use std::collections::{BTreeMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use dataset_api::broker::{BrokerProducer, DeliveryCallback, RawRecord};
use dataset_api::BrokerError;

use crate::state::{Shared, State, StoredRecord, TopicLog};

pub(crate) const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;
pub(crate) const DEFAULT_QUEUE_MAX_MESSAGES: usize = 100_000;

struct Pending {
    topic: String,
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    on_delivery: DeliveryCallback,
}

/// Producer handle of a [`crate::MemoryBroker`].
///
/// `produce` only queues locally; records reach the topic (and delivery
/// callbacks fire) during `poll` / `flush`.
pub struct MemoryProducer {
    shared: Arc<Shared>,
    queue: VecDeque<Pending>,
    max_message_bytes: usize,
    queue_max_messages: usize,
    auto_create_topics: bool,
}

impl MemoryProducer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        max_message_bytes: usize,
        queue_max_messages: usize,
        auto_create_topics: bool,
    ) -> Self {
        Self {
            shared,
            queue: VecDeque::new(),
            max_message_bytes,
            queue_max_messages,
            auto_create_topics,
        }
    }

    /// Append one record to its topic.
    fn deliver(&self, state: &mut State, pending: &Pending) -> Result<RawRecord, BrokerError> {
        if pending.value.len() > self.max_message_bytes {
            return Err(BrokerError::new(
                "_MSG_SIZE_TOO_LARGE",
                format!(
                    "message of {} bytes exceeds message.max.bytes = {}",
                    pending.value.len(),
                    self.max_message_bytes
                ),
            ));
        }

        if !state.topics.contains_key(&pending.topic) {
            if !self.auto_create_topics {
                return Err(BrokerError::new(
                    "_UNKNOWN_TOPIC",
                    format!("topic '{}' does not exist", pending.topic),
                ));
            }
            tracing::debug!(topic = %pending.topic, "auto-creating topic");
            state
                .topics
                .insert(pending.topic.clone(), TopicLog::new(1, BTreeMap::new()));
            state.bump_generations();
        }

        let Some(log) = state.topics.get_mut(&pending.topic) else {
            return Err(BrokerError::new("_UNKNOWN_TOPIC", pending.topic.clone()));
        };
        let partition = match &pending.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % log.partitions.len() as u64) as usize
            }
            None => {
                let p = log.next_partition % log.partitions.len();
                log.next_partition = log.next_partition.wrapping_add(1);
                p
            }
        };
        let records = &mut log.partitions[partition];
        let offset = records.len() as i64;
        records.push(StoredRecord {
            key: pending.key.clone(),
            value: pending.value.clone(),
        });

        Ok(RawRecord {
            topic: pending.topic.clone(),
            partition: partition as i32,
            offset,
            key: pending.key.clone(),
            value: Some(pending.value.clone()),
            error: None,
        })
    }
}

impl BrokerProducer for MemoryProducer {
    fn produce(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        on_delivery: DeliveryCallback,
    ) -> Result<(), BrokerError> {
        if self.queue.len() >= self.queue_max_messages {
            return Err(BrokerError::new(
                "_QUEUE_FULL",
                format!("local queue holds {} messages", self.queue.len()),
            ));
        }
        self.queue.push_back(Pending {
            topic: topic.to_string(),
            key: key.map(<[u8]>::to_vec),
            value: value.to_vec(),
            on_delivery,
        });
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> usize {
        if self.queue.is_empty() {
            return 0;
        }
        let mut settled = Vec::with_capacity(self.queue.len());
        {
            let mut state = self.shared.lock();
            while let Some(pending) = self.queue.pop_front() {
                let outcome = self.deliver(&mut state, &pending);
                settled.push((pending, outcome));
            }
        }
        self.shared.records_arrived.notify_all();

        // Callbacks run without the broker lock held.
        let count = settled.len();
        for (pending, outcome) in settled {
            match outcome {
                Ok(record) => (pending.on_delivery)(None, &record),
                Err(err) => {
                    let record = RawRecord {
                        topic: pending.topic,
                        partition: -1,
                        offset: -1,
                        key: pending.key,
                        value: Some(pending.value),
                        error: Some(err.clone()),
                    };
                    (pending.on_delivery)(Some(&err), &record);
                }
            }
        }
        count
    }

    fn flush(&mut self, timeout: Option<Duration>) -> Result<(), BrokerError> {
        self.poll(timeout.unwrap_or(Duration::ZERO));
        if !self.queue.is_empty() {
            return Err(BrokerError::new(
                "_TIMED_OUT",
                format!("{} messages still in queue", self.queue.len()),
            ));
        }
        Ok(())
    }
}
