use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dataset_api::broker::{NewTopic, RawRecord, OFFSET_INVALID};
use dataset_api::BrokerError;

/// Where an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `poll()` returns `Err`.
    Poll,
    /// `poll()` returns a record carrying the error.
    Record,
    /// `watermark_offsets()` returns `Err`.
    Watermark,
}

pub(crate) struct StoredRecord {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

pub(crate) struct TopicLog {
    pub partitions: Vec<Vec<StoredRecord>>,
    pub config: BTreeMap<String, String>,
    /// Round-robin cursor for keyless records.
    pub next_partition: usize,
    /// Simulates a rebalance or metadata outage: watermarks are invalid.
    pub watermarks_unavailable: bool,
}

impl TopicLog {
    pub fn new(num_partitions: usize, config: BTreeMap<String, String>) -> Self {
        Self {
            partitions: (0..num_partitions).map(|_| Vec::new()).collect(),
            config,
            next_partition: 0,
            watermarks_unavailable: false,
        }
    }

    pub fn high_watermark(&self, partition: i32) -> Option<i64> {
        usize::try_from(partition)
            .ok()
            .and_then(|p| self.partitions.get(p))
            .map(|log| log.len() as i64)
    }
}

#[derive(Default)]
pub(crate) struct Group {
    /// Member ids in join order.
    pub members: Vec<u64>,
    /// Topics each member subscribed to.
    pub subscriptions: HashMap<u64, Vec<String>>,
    /// Bumped on every membership or topic change.
    pub generation: u64,
    /// Next offset to read, per (topic, partition).
    pub committed: HashMap<(String, i32), i64>,
}

impl Group {
    /// Partitions owned by `member`: every partition of the group's topics,
    /// sorted, dealt round-robin over members in join order.
    pub fn assignment_for(&self, member: u64, topics: &HashMap<String, TopicLog>) -> Vec<(String, i32)> {
        let Some(index) = self.members.iter().position(|m| *m == member) else {
            return Vec::new();
        };

        let mut wanted: Vec<&String> = self.subscriptions.values().flatten().collect();
        wanted.sort();
        wanted.dedup();

        let mut all = Vec::new();
        for name in wanted {
            if let Some(topic) = topics.get(name) {
                for p in 0..topic.partitions.len() {
                    all.push((name.clone(), p as i32));
                }
            }
        }

        all.into_iter()
            .enumerate()
            .filter(|(i, _)| i % self.members.len() == index)
            .map(|(_, tp)| tp)
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct State {
    pub topics: HashMap<String, TopicLog>,
    pub groups: HashMap<String, Group>,
    pub next_member: u64,
    pub faults: HashMap<(String, FaultPoint), VecDeque<BrokerError>>,
    pub fresh_watermark_lookups: u64,
    pub cached_watermark_lookups: u64,
}

impl State {
    pub fn create_topic(&mut self, new_topic: &NewTopic) -> Result<String, BrokerError> {
        if self.topics.contains_key(&new_topic.name) {
            return Err(BrokerError::new(
                "TOPIC_ALREADY_EXISTS",
                format!("topic '{}' already exists", new_topic.name),
            ));
        }
        if new_topic.num_partitions < 1 {
            return Err(BrokerError::new(
                "INVALID_PARTITIONS",
                format!("topic '{}': num_partitions must be >= 1", new_topic.name),
            ));
        }
        if new_topic.replication_factor < 1 {
            return Err(BrokerError::new(
                "INVALID_REPLICATION_FACTOR",
                format!("topic '{}': replication_factor must be >= 1", new_topic.name),
            ));
        }
        self.topics.insert(
            new_topic.name.clone(),
            TopicLog::new(new_topic.num_partitions as usize, new_topic.config.clone()),
        );
        self.bump_generations();
        Ok(new_topic.name.clone())
    }

    pub fn delete_topic(&mut self, name: &str) -> Result<String, BrokerError> {
        if self.topics.remove(name).is_none() {
            return Err(BrokerError::new(
                "UNKNOWN_TOPIC_OR_PART",
                format!("topic '{name}' does not exist"),
            ));
        }
        for group in self.groups.values_mut() {
            group.committed.retain(|(topic, _), _| topic != name);
        }
        self.bump_generations();
        Ok(name.to_string())
    }

    /// Force every group to rebalance on its members' next poll.
    pub fn bump_generations(&mut self) {
        for group in self.groups.values_mut() {
            group.generation += 1;
        }
    }

    pub fn take_fault(&mut self, group: &str, point: FaultPoint) -> Option<BrokerError> {
        self.faults
            .get_mut(&(group.to_string(), point))
            .and_then(VecDeque::pop_front)
    }

    pub fn watermarks(&self, topic: &str, partition: i32) -> (i64, i64) {
        match self.topics.get(topic) {
            Some(log) if !log.watermarks_unavailable => match log.high_watermark(partition) {
                Some(high) => (0, high),
                None => (OFFSET_INVALID, OFFSET_INVALID),
            },
            _ => (OFFSET_INVALID, OFFSET_INVALID),
        }
    }

    /// Offset the next record of a partition gets, regardless of whether
    /// watermarks are currently reported. 0 for unknown partitions.
    pub fn log_end(&self, topic: &str, partition: i32) -> i64 {
        self.topics
            .get(topic)
            .and_then(|log| log.high_watermark(partition))
            .unwrap_or(0)
    }

    pub fn read(&self, topic: &str, partition: i32, offset: i64) -> Option<RawRecord> {
        let log = self.topics.get(topic)?;
        let records = log.partitions.get(usize::try_from(partition).ok()?)?;
        let stored = records.get(usize::try_from(offset).ok()?)?;
        Some(RawRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: stored.key.clone(),
            value: Some(stored.value.clone()),
            error: None,
        })
    }
}

/// State behind one lock, plus the condvar consumers wait on for new records.
pub(crate) struct Shared {
    state: Mutex<State>,
    pub records_arrived: Condvar,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            records_arrived: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("memory broker lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Block until records arrive or `timeout` passes. `None` waits for
    /// the next notification only.
    pub fn wait<'a>(&self, guard: MutexGuard<'a, State>, timeout: Option<Duration>) -> MutexGuard<'a, State> {
        let woken = match timeout {
            Some(timeout) => self
                .records_arrived
                .wait_timeout(guard, timeout)
                .map(|(g, _)| g)
                .map_err(|poisoned| PoisonError::new(poisoned.into_inner().0)),
            None => self.records_arrived.wait(guard),
        };
        woken.unwrap_or_else(|poisoned| {
            tracing::warn!("memory broker lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
