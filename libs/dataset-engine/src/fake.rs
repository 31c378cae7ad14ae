//! In-memory stand-ins for node tests.
//!
//! Both fakes wrap payloads in envelopes exactly like the broker-backed
//! types, so node logic written against [`DatasetRead`] / [`DatasetWrite`]
//! cannot tell them apart.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use dataset_api::dataset::check_last_timeout;
use dataset_api::envelope::DEFAULT_TIMESTAMP_FORMAT;
use dataset_api::{DatasetError, DatasetRead, DatasetWrite, Envelope, ReadMode};

/// Feeds a fixed sequence of payloads.
#[derive(Debug, Clone)]
pub struct FakeDatasetConsumer {
    dataset: String,
    node: String,
    pipeline: String,
    values: VecDeque<Value>,
    empty: bool,
}

impl FakeDatasetConsumer {
    pub fn new(
        dataset: impl Into<String>,
        node: impl Into<String>,
        pipeline: impl Into<String>,
        values: impl IntoIterator<Item = Value>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            node: node.into(),
            pipeline: pipeline.into(),
            values: values.into_iter().collect(),
            empty: false,
        }
    }

    /// Set once the last seeded value has been read in `next` mode.
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }

    fn wrap(&self, message: Value) -> Envelope {
        Envelope::wrap(
            message,
            &self.dataset,
            &self.node,
            &self.pipeline,
            DEFAULT_TIMESTAMP_FORMAT,
        )
    }

    fn exhausted(&self) -> DatasetError {
        DatasetError::Exhausted(self.dataset.clone())
    }
}

impl DatasetRead for FakeDatasetConsumer {
    fn consume(
        &mut self,
        how: ReadMode,
        _timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, DatasetError> {
        let message = match how {
            ReadMode::Next => {
                let message = self.values.pop_front();
                if message.is_some() && self.values.is_empty() {
                    self.empty = true;
                }
                message
            }
            ReadMode::Last => self.values.back().cloned(),
        };
        Ok(message.map(|m| self.wrap(m)))
    }

    fn next(&mut self, cancel: &CancellationToken) -> Result<Envelope, DatasetError> {
        if cancel.is_cancelled() {
            return Err(DatasetError::Cancelled);
        }
        self.consume(ReadMode::Next, None)?.ok_or_else(|| self.exhausted())
    }

    fn last(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<Envelope, DatasetError> {
        check_last_timeout(timeout)?;
        if cancel.is_cancelled() {
            return Err(DatasetError::Cancelled);
        }
        self.consume(ReadMode::Last, Some(timeout))?
            .ok_or_else(|| self.exhausted())
    }

    // Without a terminator the fake would spin forever once drained.
    fn consume_all_cancellable(
        &mut self,
        end_message: &Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, DatasetError> {
        let mut messages = Vec::new();
        loop {
            let envelope = self.next(cancel)?;
            if envelope.message == *end_message {
                return Ok(messages);
            }
            messages.push(envelope);
        }
    }
}

/// Records every envelope it is asked to publish.
#[derive(Debug, Clone)]
pub struct FakeDatasetProducer {
    dataset: String,
    node: String,
    pipeline: String,
    values: Vec<Envelope>,
}

impl FakeDatasetProducer {
    pub fn new(dataset: impl Into<String>, node: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            node: node.into(),
            pipeline: pipeline.into(),
            values: Vec::new(),
        }
    }

    pub fn values(&self) -> &[Envelope] {
        &self.values
    }

    /// Payloads only, in publish order.
    pub fn messages(&self) -> Vec<&Value> {
        self.values.iter().map(|e| &e.message).collect()
    }
}

impl DatasetWrite for FakeDatasetProducer {
    fn produce(&mut self, message: Value, _key: Option<&str>) -> Result<(), DatasetError> {
        self.values.push(Envelope::wrap(
            message,
            &self.dataset,
            &self.node,
            &self.pipeline,
            DEFAULT_TIMESTAMP_FORMAT,
        ));
        Ok(())
    }
}
