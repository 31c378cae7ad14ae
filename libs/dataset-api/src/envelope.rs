use std::fmt::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DatasetError;

/// Default `strftime` format of [`Envelope::timestamp`].
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wire form of every message on a dataset: provenance + opaque payload.
///
/// Serialized as a JSON object with keys `timestamp`, `dataset`,
/// `source_node`, `source_pipeline`, `message`, UTF-8 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: String,
    /// Logical dataset name, not the physical topic.
    pub dataset: String,
    pub source_node: String,
    pub source_pipeline: String,
    pub message: Value,
}

impl Envelope {
    /// Wrap a payload, stamping it with the current local time.
    ///
    /// A format chrono cannot render falls back to
    /// [`DEFAULT_TIMESTAMP_FORMAT`].
    pub fn wrap(
        message: Value,
        dataset: &str,
        source_node: &str,
        source_pipeline: &str,
        timestamp_format: &str,
    ) -> Self {
        let now = chrono::Local::now();
        let mut timestamp = String::new();
        if write!(timestamp, "{}", now.format(timestamp_format)).is_err() {
            timestamp = now.format(DEFAULT_TIMESTAMP_FORMAT).to_string();
        }
        Self {
            timestamp,
            dataset: dataset.to_string(),
            source_node: source_node.to_string(),
            source_pipeline: source_pipeline.to_string(),
            message,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DatasetError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode bytes into an envelope.
    ///
    /// Fails on invalid UTF-8, invalid JSON, and on JSON that is not
    /// envelope-shaped.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatasetError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| DatasetError::Decode(format!("payload is not utf-8: {e}")))?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_message(self) -> Value {
        self.message
    }
}
