use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::DatasetError;

/// How a consumer reads from a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Next unread record. Never skips, may lag behind the producer.
    Next,
    /// Most recent record. May skip records and may repeat one.
    Last,
}

impl FromStr for ReadMode {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next" => Ok(ReadMode::Next),
            "last" => Ok(ReadMode::Last),
            other => Err(DatasetError::InvalidReadMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for ReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadMode::Next => f.write_str("next"),
            ReadMode::Last => f.write_str("last"),
        }
    }
}

/// Reject the timeouts `last` cannot work with.
///
/// Each `last` attempt seeks before polling, a zero timeout would hammer
/// the broker with offset lookups.
pub fn check_last_timeout(timeout: Duration) -> Result<(), DatasetError> {
    if timeout.is_zero() {
        return Err(DatasetError::NonPositiveTimeout);
    }
    Ok(())
}

/// Read side of a dataset. Implemented by the broker-backed consumer and
/// by the in-memory fake, so node logic is written once against this trait.
pub trait DatasetRead {
    /// One read attempt. `None` = nothing usable arrived within `timeout`.
    /// `timeout = None` uses the implementation's default.
    fn consume(
        &mut self,
        how: ReadMode,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, DatasetError>;

    /// Block until the next unread record arrives.
    fn next(&mut self, cancel: &CancellationToken) -> Result<Envelope, DatasetError>;

    /// Block until the most recent record is read. `timeout` must be > 0.
    fn last(&mut self, timeout: Duration, cancel: &CancellationToken)
        -> Result<Envelope, DatasetError>;

    /// Read in `next` mode until a record whose payload equals
    /// `end_message`; the terminator itself is not returned.
    ///
    /// Never returns if the terminator is never published.
    fn consume_all(&mut self, end_message: &Value) -> Result<Vec<Envelope>, DatasetError> {
        self.consume_all_cancellable(end_message, &CancellationToken::new())
    }

    /// [`DatasetRead::consume_all`] that gives up once `cancel` fires.
    fn consume_all_cancellable(
        &mut self,
        end_message: &Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, DatasetError> {
        let mut messages = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return Err(DatasetError::Cancelled);
            }
            let Some(envelope) = self.consume(ReadMode::Next, None)? else {
                continue;
            };
            if envelope.message == *end_message {
                return Ok(messages);
            }
            messages.push(envelope);
        }
    }
}

/// Write side of a dataset.
pub trait DatasetWrite {
    /// Wrap `message` in an envelope and publish it under `key`.
    fn produce(&mut self, message: Value, key: Option<&str>) -> Result<(), DatasetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_read_mode() {
        assert_eq!("next".parse::<ReadMode>().unwrap(), ReadMode::Next);
        assert_eq!("last".parse::<ReadMode>().unwrap(), ReadMode::Last);
        let err = "bogus".parse::<ReadMode>().unwrap_err();
        assert!(matches!(err, DatasetError::InvalidReadMode(ref s) if s == "bogus"));
    }

    #[test]
    fn display_round_trips() {
        for mode in [ReadMode::Next, ReadMode::Last] {
            assert_eq!(mode.to_string().parse::<ReadMode>().unwrap(), mode);
        }
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(matches!(
            check_last_timeout(Duration::ZERO),
            Err(DatasetError::NonPositiveTimeout)
        ));
        assert!(check_last_timeout(Duration::from_millis(1)).is_ok());
    }
}
