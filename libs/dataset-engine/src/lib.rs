//! Broker-backed dataset endpoints, their in-memory fakes and topic
//! provisioning.

pub mod consumer;
pub mod fake;
pub mod producer;
pub mod provision;

pub use consumer::DatasetConsumer;
pub use fake::{FakeDatasetConsumer, FakeDatasetProducer};
pub use producer::DatasetProducer;
pub use provision::provision_datasets;
