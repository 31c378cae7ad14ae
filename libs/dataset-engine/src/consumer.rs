use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use dataset_api::broker::{Broker, BrokerConsumer, RawRecord, OFFSET_END, OFFSET_INVALID};
use dataset_api::dataset::check_last_timeout;
use dataset_api::{
    BrokerError, DatasetAddress, DatasetConfig, DatasetError, DatasetRead, Envelope, KafkaConfig,
    ReadMode,
};

/// Reads one dataset through a broker subscription.
///
/// The topic is derived from the dataset address (see
/// [`dataset_api::naming::resolve`]); the consumer group is the node identity,
/// so two consumers built for the same node share partitions.
///
/// Two read modes are offered:
/// - `next`: every record in order; may fall behind a faster producer.
/// - `last`: seeks to the newest record before each read; may skip records
///   when slower than the producer and repeat one when faster.
pub struct DatasetConsumer {
    name: String,
    dataset: String,
    topic_name: String,
    /// Dataset `type`, defaulted from `KafkaConfig::stream_type`.
    kind: String,
    bootstrap_servers: String,
    config: Arc<KafkaConfig>,
    consumer: Box<dyn BrokerConsumer>,
    /// Set after the first read; later `last` reads may use cached watermarks.
    cached: bool,
}

impl std::fmt::Debug for DatasetConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetConsumer")
            .field("name", &self.name)
            .field("topic_name", &self.topic_name)
            .field("cached", &self.cached)
            .finish()
    }
}

impl DatasetConsumer {
    /// Create the broker consumer and subscribe it to the dataset topic.
    ///
    /// `bootstrap_servers` overrides the configured servers. Every dataset
    /// param is passed through to the client config.
    pub fn new(
        broker: &dyn Broker,
        address: &DatasetAddress,
        dataset_config: DatasetConfig,
        config: Arc<KafkaConfig>,
        bootstrap_servers: Option<&str>,
    ) -> Result<Self, DatasetError> {
        let dataset_config = dataset_config.with_default_type(&config);
        let kind = dataset_config.kind.clone().unwrap_or_default();
        let names = address.resolve();

        let client = config.consumer_client_config(&dataset_config, bootstrap_servers, &names.identity);
        let mut consumer = broker
            .create_consumer(&client)
            .map_err(|e| e.with_context(format!("consumer '{}'", names.identity)))?;
        consumer.subscribe(&[names.topic_name.as_str()])?;

        tracing::debug!(
            consumer = %names.identity,
            topic = %names.topic_name,
            "subscribed"
        );

        Ok(Self {
            name: names.identity,
            dataset: address.dataset.clone(),
            topic_name: names.topic_name,
            kind,
            bootstrap_servers: client.get("bootstrap.servers").unwrap_or_default().to_string(),
            config,
            consumer,
            cached: false,
        })
    }

    /// Consumer identity, also used as the group id.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn cached(&self) -> bool {
        self.cached
    }

    pub fn describe(&self) -> String {
        [
            format!("Dataset: {} ({})", self.dataset, self.kind),
            format!("Kafka topic: {}", self.topic_name),
            format!("Consumer: {}", self.name),
            format!("bootstrap_servers: {}", self.bootstrap_servers),
        ]
        .join("\n")
    }

    /// Position every assigned partition on its newest record.
    ///
    /// Waits for the group assignment first (zero-timeout polls), for at
    /// most `timeout`. Returns false when no partition got assigned in time.
    /// A timeout too large to represent as an instant never expires.
    fn update_offset_to_latest(&mut self, timeout: Duration) -> Result<bool, BrokerError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut partitions = self.consumer.assignment()?;
        while partitions.is_empty() {
            if let Some(record) = self.consumer.poll(Duration::ZERO)? {
                tracing::debug!(
                    consumer = %self.name,
                    offset = record.offset,
                    "discarding record polled while joining group"
                );
            }
            partitions = self.consumer.assignment()?;
            if partitions.is_empty() && deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
        }

        for partition in &mut partitions {
            let (_, high) = self.consumer.watermark_offsets(partition, self.cached)?;
            // Rebalancing or an empty topic can leave the watermark invalid.
            if high == OFFSET_INVALID {
                tracing::error!(
                    consumer = %self.name,
                    topic = %partition.topic,
                    partition = partition.partition,
                    "invalid offset received"
                );
                partition.offset = OFFSET_END;
            } else {
                partition.offset = high - 1;
            }
            tracing::debug!(
                consumer = %self.name,
                partition = partition.partition,
                offset = partition.offset,
                "seek to latest"
            );
        }

        self.consumer.assign(&partitions)?;
        Ok(true)
    }

    /// Unwrap a polled record. Anything unusable is logged and dropped.
    fn validate(&self, raw: Option<RawRecord>) -> Option<Envelope> {
        let raw = raw?;
        if let Some(err) = raw.error {
            tracing::error!(consumer = %self.name, topic = %self.topic_name, error = %err, "record error");
            return None;
        }
        let value = raw.value?;
        match Envelope::from_bytes(&value) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::error!(
                    topic = %self.topic_name,
                    error = %e,
                    "error decoding message from dataset"
                );
                None
            }
        }
    }

    /// Retry `consume` until it yields, swallowing transient broker errors.
    fn consume_blocking(
        &mut self,
        how: ReadMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Envelope, DatasetError> {
        loop {
            if cancel.is_cancelled() {
                return Err(DatasetError::Cancelled);
            }
            match self.consume(how, timeout) {
                Ok(Some(envelope)) => return Ok(envelope),
                Ok(None) => {}
                Err(DatasetError::Broker(e)) if self.config.is_transient(e.code()) => {
                    tracing::debug!(consumer = %self.name, code = %e.code(), "transient broker error, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  DatasetRead
// ═══════════════════════════════════════════════════════════════

impl DatasetRead for DatasetConsumer {
    /// One poll against the subscription.
    ///
    /// In `last` mode a failed seek yields `None` when the error code is
    /// transient and propagates otherwise. Errors from the poll itself
    /// always propagate.
    fn consume(
        &mut self,
        how: ReadMode,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, DatasetError> {
        let timeout = timeout.unwrap_or_else(|| self.config.consumer_timeout());

        let raw = match how {
            ReadMode::Next => self.consumer.poll(timeout)?,
            ReadMode::Last => {
                match self.update_offset_to_latest(timeout) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(consumer = %self.name, "no partitions assigned yet");
                        return Ok(None);
                    }
                    Err(e) if self.config.is_transient(e.code()) => {
                        tracing::error!(
                            consumer = %self.name,
                            error = %e,
                            "error updating offset to latest"
                        );
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
                self.consumer.poll(timeout)?
            }
        };

        self.cached = true;
        Ok(self.validate(raw))
    }

    fn next(&mut self, cancel: &CancellationToken) -> Result<Envelope, DatasetError> {
        self.consume_blocking(ReadMode::Next, None, cancel)
    }

    fn last(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<Envelope, DatasetError> {
        check_last_timeout(timeout)?;
        self.consume_blocking(ReadMode::Last, Some(timeout), cancel)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;

    use dataset_api::broker::{BrokerProducer, TopicPartition};
    use dataset_api::error::MAX_POLL_EXCEEDED;
    use dataset_api::ClientConfig;

    use super::*;

    /// Everything the scripted consumer was asked to do.
    #[derive(Default)]
    struct Script {
        polls: VecDeque<Result<Option<RawRecord>, BrokerError>>,
        /// Polls needed before partitions show up.
        polls_until_assigned: usize,
        partitions: Vec<TopicPartition>,
        high: i64,
        watermark_error: Option<BrokerError>,
        assigned: Vec<Vec<TopicPartition>>,
        watermark_cached: Vec<bool>,
        subscribed: Vec<String>,
        client: Option<ClientConfig>,
        poll_count: usize,
    }

    #[derive(Clone, Default)]
    struct ScriptedBroker {
        script: Arc<Mutex<Script>>,
    }

    struct ScriptedConsumer {
        script: Arc<Mutex<Script>>,
        assignment: Vec<TopicPartition>,
    }

    impl BrokerConsumer for ScriptedConsumer {
        fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError> {
            let mut s = self.script.lock().unwrap();
            s.subscribed = topics.iter().map(|t| t.to_string()).collect();
            Ok(())
        }

        fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
            self.script.lock().unwrap().assigned.push(partitions.to_vec());
            self.assignment = partitions.to_vec();
            Ok(())
        }

        fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
            Ok(self.assignment.clone())
        }

        fn poll(&mut self, _timeout: Duration) -> Result<Option<RawRecord>, BrokerError> {
            let mut s = self.script.lock().unwrap();
            s.poll_count += 1;
            if self.assignment.is_empty() && s.poll_count >= s.polls_until_assigned {
                self.assignment = s.partitions.clone();
            }
            s.polls.pop_front().unwrap_or(Ok(None))
        }

        fn watermark_offsets(
            &self,
            _partition: &TopicPartition,
            cached: bool,
        ) -> Result<(i64, i64), BrokerError> {
            let mut s = self.script.lock().unwrap();
            s.watermark_cached.push(cached);
            match s.watermark_error.take() {
                Some(e) => Err(e),
                None => Ok((0, s.high)),
            }
        }
    }

    impl Broker for ScriptedBroker {
        fn create_consumer(&self, config: &ClientConfig) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
            self.script.lock().unwrap().client = Some(config.clone());
            Ok(Box::new(ScriptedConsumer {
                script: Arc::clone(&self.script),
                assignment: Vec::new(),
            }))
        }

        fn create_producer(&self, _config: &ClientConfig) -> Result<Box<dyn BrokerProducer>, BrokerError> {
            Err(BrokerError::new("_NOT_IMPLEMENTED", "consumer-only broker"))
        }
    }

    fn record(message: serde_json::Value) -> RawRecord {
        let env = Envelope::wrap(message, "ds", "writer", "pipe", "%Y");
        RawRecord {
            topic: "pipe.ds".into(),
            value: Some(env.to_bytes().unwrap()),
            ..RawRecord::default()
        }
    }

    fn consumer(broker: &ScriptedBroker, config: KafkaConfig) -> DatasetConsumer {
        let address = DatasetAddress::new("ds", "pipe", "reader").pipeline_prefixed(true);
        DatasetConsumer::new(broker, &address, DatasetConfig::default(), Arc::new(config), None).unwrap()
    }

    fn scripted(f: impl FnOnce(&mut Script)) -> ScriptedBroker {
        let broker = ScriptedBroker::default();
        f(&mut broker.script.lock().unwrap());
        broker
    }

    #[test]
    fn subscribes_to_resolved_topic_with_identity_group() {
        let broker = ScriptedBroker::default();
        let c = consumer(&broker, KafkaConfig::default());
        assert_eq!(c.topic_name(), "pipe.ds");
        assert_eq!(c.name(), "pipe.reader");
        let s = broker.script.lock().unwrap();
        assert_eq!(s.subscribed, vec!["pipe.ds".to_string()]);
        assert_eq!(s.client.as_ref().unwrap().get("group.id"), Some("pipe.reader"));
    }

    #[test]
    fn next_returns_envelope_and_sets_cached() {
        let broker = scripted(|s| s.polls.push_back(Ok(Some(record(json!({"i": 1}))))));
        let mut c = consumer(&broker, KafkaConfig::default());
        assert!(!c.cached());
        let env = c.consume(ReadMode::Next, None).unwrap().unwrap();
        assert_eq!(env.message, json!({"i": 1}));
        assert!(c.cached());
    }

    #[test]
    fn malformed_and_error_records_are_absent() {
        let broker = scripted(|s| {
            s.polls.push_back(Ok(Some(RawRecord {
                value: Some(b"{not json".to_vec()),
                ..RawRecord::default()
            })));
            s.polls.push_back(Ok(Some(RawRecord {
                value: Some(br#"{"message": 1}"#.to_vec()),
                ..RawRecord::default()
            })));
            s.polls.push_back(Ok(Some(RawRecord {
                error: Some(BrokerError::new("_PARTITION_EOF", "eof")),
                ..RawRecord::default()
            })));
            s.polls.push_back(Ok(Some(RawRecord::default())));
        });
        let mut c = consumer(&broker, KafkaConfig::default());
        for _ in 0..4 {
            assert!(c.consume(ReadMode::Next, None).unwrap().is_none());
        }
    }

    #[test]
    fn poll_errors_propagate_from_consume() {
        let broker = scripted(|s| s.polls.push_back(Err(BrokerError::new("_TRANSPORT", "down"))));
        let mut c = consumer(&broker, KafkaConfig::default());
        let err = c.consume(ReadMode::Next, None).unwrap_err();
        assert_eq!(err.broker_code(), Some("_TRANSPORT"));
    }

    #[test]
    fn last_seeks_one_before_high_watermark() {
        let broker = scripted(|s| {
            s.partitions = vec![TopicPartition::new("pipe.ds", 0), TopicPartition::new("pipe.ds", 1)];
            s.high = 5;
            s.polls_until_assigned = 3;
        });
        let mut c = consumer(&broker, KafkaConfig::default());
        c.consume(ReadMode::Last, Some(Duration::from_secs(1))).unwrap();

        let s = broker.script.lock().unwrap();
        assert_eq!(s.assigned.len(), 1);
        assert!(s.assigned[0].iter().all(|tp| tp.offset == 4));
        assert_eq!(s.assigned[0].len(), 2);
        // waited for the assignment, then one real poll
        assert_eq!(s.poll_count, 4);
    }

    #[test]
    fn invalid_watermark_seeks_to_end() {
        let broker = scripted(|s| {
            s.partitions = vec![TopicPartition::new("pipe.ds", 0)];
            s.high = OFFSET_INVALID;
        });
        let mut c = consumer(&broker, KafkaConfig::default());
        assert!(c.consume(ReadMode::Last, Some(Duration::from_millis(10))).unwrap().is_none());
        let s = broker.script.lock().unwrap();
        assert_eq!(s.assigned[0][0].offset, OFFSET_END);
    }

    #[test]
    fn watermarks_cached_after_first_read() {
        let broker = scripted(|s| {
            s.partitions = vec![TopicPartition::new("pipe.ds", 0)];
            s.high = 1;
        });
        let mut c = consumer(&broker, KafkaConfig::default());
        c.consume(ReadMode::Last, Some(Duration::from_millis(10))).unwrap();
        c.consume(ReadMode::Last, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(broker.script.lock().unwrap().watermark_cached, vec![false, true]);
    }

    #[test]
    fn unassigned_last_gives_up_after_timeout() {
        let broker = scripted(|s| s.polls_until_assigned = usize::MAX);
        let mut c = consumer(&broker, KafkaConfig::default());
        assert!(c.consume(ReadMode::Last, Some(Duration::from_millis(5))).unwrap().is_none());
        assert!(broker.script.lock().unwrap().assigned.is_empty());
    }

    #[test]
    fn transient_seek_error_is_absent_fatal_propagates() {
        let broker = scripted(|s| {
            s.partitions = vec![TopicPartition::new("pipe.ds", 0)];
            s.high = 1;
            s.watermark_error = Some(BrokerError::new(MAX_POLL_EXCEEDED, "slow"));
        });
        let mut c = consumer(&broker, KafkaConfig::default());
        assert!(c.consume(ReadMode::Last, Some(Duration::from_millis(5))).unwrap().is_none());

        broker.script.lock().unwrap().watermark_error = Some(BrokerError::new("_AUTHENTICATION", "denied"));
        let err = c.consume(ReadMode::Last, Some(Duration::from_millis(5))).unwrap_err();
        assert_eq!(err.broker_code(), Some("_AUTHENTICATION"));
    }

    #[test]
    fn next_retries_transient_errors() {
        let broker = scripted(|s| {
            s.polls.push_back(Ok(None));
            s.polls.push_back(Err(BrokerError::new(MAX_POLL_EXCEEDED, "slow")));
            s.polls.push_back(Ok(Some(record(json!("hello")))));
        });
        let mut c = consumer(&broker, KafkaConfig::default());
        let env = c.next(&CancellationToken::new()).unwrap();
        assert_eq!(env.message, json!("hello"));
    }

    #[test]
    fn next_propagates_fatal_errors() {
        let broker = scripted(|s| s.polls.push_back(Err(BrokerError::new("_FATAL", "boom"))));
        let mut c = consumer(&broker, KafkaConfig::default());
        let err = c.next(&CancellationToken::new()).unwrap_err();
        assert_eq!(err.broker_code(), Some("_FATAL"));
    }

    #[test]
    fn transient_list_is_configurable() {
        let mut config = KafkaConfig::default();
        config.consumer.transient_error_codes.push("_TRANSPORT".into());
        let broker = scripted(|s| {
            s.polls.push_back(Err(BrokerError::new("_TRANSPORT", "flaky")));
            s.polls.push_back(Ok(Some(record(json!(1)))));
        });
        let mut c = consumer(&broker, config);
        assert_eq!(c.next(&CancellationToken::new()).unwrap().message, json!(1));
    }

    #[test]
    fn last_rejects_zero_timeout_before_touching_broker() {
        let broker = ScriptedBroker::default();
        let mut c = consumer(&broker, KafkaConfig::default());
        let err = c.last(Duration::ZERO, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, DatasetError::NonPositiveTimeout));
        let s = broker.script.lock().unwrap();
        assert_eq!(s.poll_count, 0);
        assert!(s.watermark_cached.is_empty());
    }

    #[test]
    fn cancelled_next_stops() {
        let broker = ScriptedBroker::default();
        let mut c = consumer(&broker, KafkaConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(c.next(&cancel), Err(DatasetError::Cancelled)));
    }

    #[test]
    fn consume_all_stops_at_terminator() {
        let broker = scripted(|s| {
            for m in [json!("x"), json!("y"), json!("END"), json!("z")] {
                s.polls.push_back(Ok(Some(record(m))));
                s.polls.push_back(Ok(None));
            }
        });
        let mut c = consumer(&broker, KafkaConfig::default());
        let got: Vec<_> = c
            .consume_all(&json!("END"))
            .unwrap()
            .into_iter()
            .map(Envelope::into_message)
            .collect();
        assert_eq!(got, vec![json!("x"), json!("y")]);
    }

    #[test]
    fn describe_lists_topic_and_servers() {
        let broker = ScriptedBroker::default();
        let c = consumer(&broker, KafkaConfig::default());
        let text = c.describe();
        assert!(text.contains("Dataset: ds (kafka_stream)"));
        assert!(text.contains("Kafka topic: pipe.ds"));
        assert!(text.contains("bootstrap_servers: localhost:9092"));
    }
}
