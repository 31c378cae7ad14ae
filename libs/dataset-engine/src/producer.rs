use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use dataset_api::broker::{Broker, BrokerProducer, DeliveryCallback};
use dataset_api::{DatasetAddress, DatasetConfig, DatasetError, DatasetWrite, Envelope, KafkaConfig};

/// Writes one dataset. Every `produce` is flushed before it returns.
pub struct DatasetProducer {
    dataset: String,
    source_node: String,
    source_pipeline: String,
    topic_name: String,
    kind: String,
    bootstrap_servers: String,
    config: Arc<KafkaConfig>,
    producer: Box<dyn BrokerProducer>,
    failed_deliveries: Arc<AtomicU64>,
}

impl std::fmt::Debug for DatasetProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetProducer")
            .field("topic_name", &self.topic_name)
            .field("source_node", &self.source_node)
            .finish()
    }
}

impl DatasetProducer {
    pub fn new(
        broker: &dyn Broker,
        address: &DatasetAddress,
        dataset_config: DatasetConfig,
        config: Arc<KafkaConfig>,
    ) -> Result<Self, DatasetError> {
        let dataset_config = dataset_config.with_default_type(&config);
        let kind = dataset_config.kind.clone().unwrap_or_default();
        let names = address.resolve();

        let client = config.producer_client_config(&dataset_config);
        let producer = broker
            .create_producer(&client)
            .map_err(|e| e.with_context(format!("producer for '{}'", names.topic_name)))?;

        Ok(Self {
            dataset: address.dataset.clone(),
            source_node: address.node.clone(),
            source_pipeline: address.pipeline.clone(),
            topic_name: names.topic_name,
            kind,
            bootstrap_servers: client.get("bootstrap.servers").unwrap_or_default().to_string(),
            config,
            producer,
            failed_deliveries: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Deliveries reported as failed so far.
    pub fn failed_deliveries(&self) -> u64 {
        self.failed_deliveries.load(Ordering::Relaxed)
    }

    pub fn describe(&self) -> String {
        [
            format!("Dataset: {} ({})", self.dataset, self.kind),
            format!("Kafka topic: {}", self.topic_name),
            format!("Producer: {}.{}", self.source_pipeline, self.source_node),
            format!("bootstrap_servers: {}", self.bootstrap_servers),
        ]
        .join("\n")
    }

    fn delivery_report(&self) -> DeliveryCallback {
        let failed = Arc::clone(&self.failed_deliveries);
        Box::new(move |err, record| {
            if let Some(err) = err {
                failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    topic = %record.topic,
                    error = %err,
                    "message delivery failed"
                );
            }
        })
    }
}

impl DatasetWrite for DatasetProducer {
    fn produce(&mut self, message: Value, key: Option<&str>) -> Result<(), DatasetError> {
        let envelope = Envelope::wrap(
            message,
            &self.dataset,
            &self.source_node,
            &self.source_pipeline,
            &self.config.timestamp_format,
        );
        let value = envelope.to_bytes()?;

        // Serve callbacks of earlier records first.
        self.producer.poll(Duration::ZERO);
        let on_delivery = self.delivery_report();
        self.producer
            .produce(&self.topic_name, key.map(str::as_bytes), &value, on_delivery)?;
        self.producer.flush(self.config.flush_timeout())?;
        Ok(())
    }
}
