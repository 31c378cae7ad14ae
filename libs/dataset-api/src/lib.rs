pub mod broker;
pub mod config;
pub mod dataset;
pub mod envelope;
pub mod error;
pub mod naming;

pub use config::{ClientConfig, DatasetConfig, KafkaConfig};
pub use dataset::{DatasetRead, DatasetWrite, ReadMode};
pub use envelope::Envelope;
pub use error::{BrokerError, DatasetError};
pub use naming::{DatasetAddress, ResolvedNames};
