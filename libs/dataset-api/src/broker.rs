use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::BrokerError;

/// Watermark could not be determined (rebalancing, unknown partition, ...).
pub const OFFSET_INVALID: i64 = -1001;

/// Logical offset: the end of the partition.
pub const OFFSET_END: i64 = -1;

/// Logical offset: the beginning of the partition.
pub const OFFSET_BEGINNING: i64 = -2;

// ═══════════════════════════════════════════════════════════════
//  Partitions & records
// ═══════════════════════════════════════════════════════════════

/// A partition of a topic with a (possibly logical) offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset: OFFSET_INVALID,
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// A record as returned by a broker poll.
///
/// A record may carry an error instead of (or along with) a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub error: Option<BrokerError>,
}

/// Called once per produced record when its delivery is settled.
///
/// `error` is `None` on successful delivery.
pub type DeliveryCallback = Box<dyn FnOnce(Option<&BrokerError>, &RawRecord) + Send>;

// ═══════════════════════════════════════════════════════════════
//  Consumer / Producer handles
// ═══════════════════════════════════════════════════════════════

/// Subscription handle of a consumer.
pub trait BrokerConsumer: Send {
    /// Join the consumer group for these topics. Assignment happens lazily
    /// during subsequent polls.
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError>;

    /// Replace the current assignment, positioning each partition at its offset.
    fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError>;

    /// Partitions currently assigned to this consumer.
    fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError>;

    /// Wait up to `timeout` for the next record. `Ok(None)` on timeout.
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawRecord>, BrokerError>;

    /// `(low, high)` watermarks; `OFFSET_INVALID` when unknown.
    ///
    /// With `cached = true` the client may answer from locally cached
    /// metadata instead of querying the broker.
    fn watermark_offsets(
        &self,
        partition: &TopicPartition,
        cached: bool,
    ) -> Result<(i64, i64), BrokerError>;
}

/// Publish handle of a producer.
pub trait BrokerProducer: Send {
    /// Enqueue a record locally. Delivery is reported through `on_delivery`
    /// from within `poll` or `flush`.
    fn produce(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: &[u8],
        on_delivery: DeliveryCallback,
    ) -> Result<(), BrokerError>;

    /// Serve delivery callbacks; returns the number of callbacks fired.
    fn poll(&mut self, timeout: Duration) -> usize;

    /// Wait until every enqueued record has been settled.
    /// `None` waits without limit.
    fn flush(&mut self, timeout: Option<Duration>) -> Result<(), BrokerError>;
}

// ═══════════════════════════════════════════════════════════════
//  Admin & factory
// ═══════════════════════════════════════════════════════════════

/// Topic definition for [`BrokerAdmin::create_topics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i32,
    pub config: BTreeMap<String, String>,
}

/// Topic management.
pub trait BrokerAdmin: Send + Sync {
    /// Create topics. One result per requested topic, in request order.
    fn create_topics(&self, topics: &[NewTopic]) -> Vec<Result<String, BrokerError>>;

    fn delete_topics(&self, names: &[&str]) -> Vec<Result<String, BrokerError>>;

    fn list_topics(&self) -> Result<Vec<String>, BrokerError>;
}

/// Factory for broker handles.
///
/// Implementations: `broker_memory::MemoryBroker` (in-process).
pub trait Broker: Send + Sync {
    fn create_consumer(&self, config: &ClientConfig) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    fn create_producer(&self, config: &ClientConfig) -> Result<Box<dyn BrokerProducer>, BrokerError>;
}
