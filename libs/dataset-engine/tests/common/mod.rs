#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use broker_memory::MemoryBroker;
use dataset_api::{DatasetAddress, DatasetConfig, KafkaConfig};
use dataset_engine::{provision_datasets, DatasetConsumer, DatasetProducer};

pub const PIPELINE: &str = "pipe";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Broker with `pipe.<dataset>` provisioned for every entry.
pub fn broker_with(config: &KafkaConfig, datasets: &[(&str, DatasetConfig)]) -> MemoryBroker {
    init_tracing();
    let broker = MemoryBroker::new();
    let datasets: BTreeMap<String, DatasetConfig> = datasets
        .iter()
        .map(|(name, cfg)| (name.to_string(), cfg.clone()))
        .collect();
    provision_datasets(&broker, config, &datasets, None, Some(PIPELINE)).unwrap();
    broker
}

pub fn address(dataset: &str, node: &str) -> DatasetAddress {
    DatasetAddress::new(dataset, PIPELINE, node).pipeline_prefixed(true)
}

pub fn consumer(broker: &MemoryBroker, config: &Arc<KafkaConfig>, dataset: &str, node: &str) -> DatasetConsumer {
    DatasetConsumer::new(
        broker,
        &address(dataset, node),
        DatasetConfig::default(),
        Arc::clone(config),
        None,
    )
    .unwrap()
}

pub fn producer(broker: &MemoryBroker, config: &Arc<KafkaConfig>, dataset: &str, node: &str) -> DatasetProducer {
    DatasetProducer::new(broker, &address(dataset, node), DatasetConfig::default(), Arc::clone(config)).unwrap()
}
