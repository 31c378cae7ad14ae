use std::collections::BTreeMap;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;

use crate::envelope::DEFAULT_TIMESTAMP_FORMAT;
use crate::error::{DatasetError, MAX_POLL_EXCEEDED};

// ═══════════════════════════════════════════════════════════════
//  KafkaConfig
// ═══════════════════════════════════════════════════════════════

/// Broker and dataset defaults, parsed from TOML.
///
/// Passed explicitly to every consumer, producer and provisioner; nothing
/// reads ambient global state.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// Dataset `type` used when a dataset config omits it.
    #[serde(default = "default_stream_type")]
    pub stream_type: String,

    /// `strftime` format of envelope timestamps.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,

    /// Dataset created for every pipeline to carry node logs.
    #[serde(default = "default_logging_dataset")]
    pub logging_dataset: String,

    /// Dataset names users may not declare.
    #[serde(default = "default_reserved_datasets")]
    pub reserved_datasets: Vec<String>,

    #[serde(default)]
    pub consumer: ConsumerSettings,

    #[serde(default)]
    pub producer: ProducerSettings,

    #[serde(default)]
    pub topic_defaults: TopicDefaults,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".into()
}
fn default_stream_type() -> String {
    "kafka_stream".into()
}
fn default_timestamp_format() -> String {
    DEFAULT_TIMESTAMP_FORMAT.into()
}
fn default_logging_dataset() -> String {
    "logging".into()
}
fn default_reserved_datasets() -> Vec<String> {
    vec![default_logging_dataset()]
}

// ═══════════════════════════════════════════════════════════════
//  ConsumerSettings
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    /// Poll timeout used when a consume call passes none.
    #[serde(default)]
    pub timeout_ms: u64,

    /// Broker error codes retried silently by blocking reads.
    #[serde(default = "default_transient_error_codes")]
    pub transient_error_codes: Vec<String>,

    /// Base client settings for every consumer.
    #[serde(default = "default_consumer_client")]
    pub client: BTreeMap<String, String>,
}

fn default_transient_error_codes() -> Vec<String> {
    vec![MAX_POLL_EXCEEDED.into()]
}
fn default_consumer_client() -> BTreeMap<String, String> {
    BTreeMap::from([("auto.offset.reset".to_string(), "earliest".to_string())])
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            transient_error_codes: default_transient_error_codes(),
            client: default_consumer_client(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  ProducerSettings
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerSettings {
    /// Dataset params a producer may take over from the dataset config.
    #[serde(default = "default_producer_overridables")]
    pub overridables: Vec<String>,

    /// Upper bound for the per-message flush. None = wait until settled.
    #[serde(default)]
    pub flush_timeout_ms: Option<u64>,

    /// Base client settings for every producer.
    #[serde(default)]
    pub client: BTreeMap<String, String>,
}

fn default_producer_overridables() -> Vec<String> {
    [
        "bootstrap.servers",
        "message.max.bytes",
        "compression.type",
        "linger.ms",
        "acks",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            overridables: default_producer_overridables(),
            flush_timeout_ms: None,
            client: BTreeMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  TopicDefaults
// ═══════════════════════════════════════════════════════════════

/// Topic parameters applied when provisioning datasets.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicDefaults {
    #[serde(default = "default_num_partitions")]
    pub num_partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    #[serde(default = "default_topic_config")]
    pub config: BTreeMap<String, String>,
}

fn default_num_partitions() -> i32 {
    1
}
fn default_replication_factor() -> i32 {
    1
}
fn default_topic_config() -> BTreeMap<String, String> {
    // one week
    BTreeMap::from([("retention.ms".to_string(), "604800000".to_string())])
}

impl Default for TopicDefaults {
    fn default() -> Self {
        Self {
            num_partitions: default_num_partitions(),
            replication_factor: default_replication_factor(),
            config: default_topic_config(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            stream_type: default_stream_type(),
            timestamp_format: default_timestamp_format(),
            logging_dataset: default_logging_dataset(),
            reserved_datasets: default_reserved_datasets(),
            consumer: ConsumerSettings::default(),
            producer: ProducerSettings::default(),
            topic_defaults: TopicDefaults::default(),
        }
    }
}

impl KafkaConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DatasetError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, DatasetError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| DatasetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, at produce time.
    pub fn validate(&self) -> Result<(), DatasetError> {
        if StrftimeItems::new(&self.timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(DatasetError::Config(format!(
                "invalid timestamp_format '{}'",
                self.timestamp_format
            )));
        }
        Ok(())
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.timeout_ms)
    }

    pub fn flush_timeout(&self) -> Option<Duration> {
        self.producer.flush_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_transient(&self, code: &str) -> bool {
        self.consumer.transient_error_codes.iter().any(|c| c == code)
    }

    /// Client settings for a consumer in group `group_id`.
    ///
    /// Order of precedence: base settings < `bootstrap_servers` override <
    /// dataset params (all passed through) < `group.id`.
    pub fn consumer_client_config(
        &self,
        dataset: &DatasetConfig,
        bootstrap_servers: Option<&str>,
        group_id: &str,
    ) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.bootstrap_servers);
        for (k, v) in &self.consumer.client {
            cfg.set(k, v);
        }
        if let Some(servers) = bootstrap_servers {
            cfg.set("bootstrap.servers", servers);
        }
        for (k, v) in &dataset.params {
            cfg.set(k, render_param(v));
        }
        cfg.set("group.id", group_id);
        cfg
    }

    /// Client settings for a producer. Only overridable dataset params apply.
    pub fn producer_client_config(&self, dataset: &DatasetConfig) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.bootstrap_servers);
        for (k, v) in &self.producer.client {
            cfg.set(k, v);
        }
        for key in &self.producer.overridables {
            if let Some(v) = dataset.params.get(key) {
                cfg.set(key, render_param(v));
            }
        }
        cfg
    }
}

// ═══════════════════════════════════════════════════════════════
//  DatasetConfig
// ═══════════════════════════════════════════════════════════════

/// Per-dataset configuration as declared in a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DatasetConfig {
    /// Transport discriminator. None = `KafkaConfig::stream_type`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Broker-specific tuning keys.
    #[serde(default)]
    pub params: BTreeMap<String, toml::Value>,
}

impl DatasetConfig {
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Fill in the default stream type when none was declared.
    pub fn with_default_type(mut self, config: &KafkaConfig) -> Self {
        if self.kind.is_none() {
            self.kind = Some(config.stream_type.clone());
        }
        self
    }
}

/// Render a config value the way broker clients expect it: plain strings,
/// everything else in its TOML form.
pub fn render_param(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  ClientConfig
// ═══════════════════════════════════════════════════════════════

/// Flat string settings handed to a broker client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    entries: BTreeMap<String, String>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
