use std::sync::Arc;
use std::time::{Duration, Instant};

use dataset_api::broker::{
    BrokerConsumer, RawRecord, TopicPartition, OFFSET_BEGINNING, OFFSET_END, OFFSET_INVALID,
};
use dataset_api::BrokerError;

use crate::state::{FaultPoint, Shared, State};

/// Where a partition without a committed position starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn parse(s: &str) -> Result<Self, BrokerError> {
        match s {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            other => Err(BrokerError::new(
                "_INVALID_ARG",
                format!("invalid auto.offset.reset: '{other}'"),
            )),
        }
    }
}

/// Consumer handle of a [`crate::MemoryBroker`] group member.
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    member_id: u64,
    reset: OffsetReset,
    joined: bool,
    /// Group generation the current assignment was computed for.
    generation: u64,
    /// Assigned partitions with the next offset to read.
    positions: Vec<(String, i32, i64)>,
    /// Partition to try first on the next fetch.
    cursor: usize,
}

impl MemoryConsumer {
    pub(crate) fn new(shared: Arc<Shared>, group_id: String, reset: OffsetReset) -> Self {
        let member_id = {
            let mut state = shared.lock();
            state.next_member += 1;
            state.next_member
        };
        Self {
            shared,
            group_id,
            member_id,
            reset,
            joined: false,
            generation: 0,
            positions: Vec::new(),
            cursor: 0,
        }
    }

    /// Resolve a logical or explicit offset to a concrete position.
    fn resolve_offset(&self, state: &State, topic: &str, partition: i32, offset: i64) -> i64 {
        let high = state.log_end(topic, partition);
        match offset {
            OFFSET_END => high,
            OFFSET_BEGINNING => 0,
            OFFSET_INVALID => self.start_position(state, topic, partition),
            o if o < 0 => high,
            o => o.min(high),
        }
    }

    fn start_position(&self, state: &State, topic: &str, partition: i32) -> i64 {
        let committed = state
            .groups
            .get(&self.group_id)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied());
        match (committed, self.reset) {
            (Some(offset), _) => offset,
            (None, OffsetReset::Earliest) => 0,
            (None, OffsetReset::Latest) => state.log_end(topic, partition),
        }
    }

    /// Recompute the assignment if the group changed since the last poll.
    /// Returns true when a rebalance happened.
    fn rebalance_if_needed(&mut self, state: &State) -> bool {
        if !self.joined {
            return false;
        }
        let Some(group) = state.groups.get(&self.group_id) else {
            return false;
        };
        if group.generation == self.generation {
            return false;
        }
        let assigned = group.assignment_for(self.member_id, &state.topics);
        self.generation = group.generation;
        self.positions = assigned
            .into_iter()
            .map(|(topic, partition)| {
                let offset = self.start_position(state, &topic, partition);
                (topic, partition, offset)
            })
            .collect();
        self.cursor = 0;
        tracing::debug!(
            group = %self.group_id,
            member = self.member_id,
            partitions = self.positions.len(),
            "rebalanced"
        );
        true
    }

    /// Take the next available record from the assigned partitions and
    /// commit the new position.
    fn fetch(&mut self, state: &mut State) -> Option<RawRecord> {
        let n = self.positions.len();
        for step in 0..n {
            let i = (self.cursor + step) % n;
            let (topic, partition, offset) = &self.positions[i];
            if let Some(record) = state.read(topic, *partition, *offset) {
                let next = offset + 1;
                let key = (topic.clone(), *partition);
                self.positions[i].2 = next;
                self.cursor = (i + 1) % n;
                if let Some(group) = state.groups.get_mut(&self.group_id) {
                    group.committed.insert(key, next);
                }
                return Some(record);
            }
        }
        None
    }
}

impl BrokerConsumer for MemoryConsumer {
    fn subscribe(&mut self, topics: &[&str]) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        let group = state.groups.entry(self.group_id.clone()).or_default();
        if !group.members.contains(&self.member_id) {
            group.members.push(self.member_id);
        }
        group
            .subscriptions
            .insert(self.member_id, topics.iter().map(|t| t.to_string()).collect());
        group.generation += 1;
        self.joined = true;
        self.positions.clear();
        Ok(())
    }

    fn assign(&mut self, partitions: &[TopicPartition]) -> Result<(), BrokerError> {
        let state = self.shared.lock();
        let positions = partitions
            .iter()
            .map(|tp| {
                let offset = self.resolve_offset(&state, &tp.topic, tp.partition, tp.offset);
                (tp.topic.clone(), tp.partition, offset)
            })
            .collect();
        drop(state);
        self.positions = positions;
        self.cursor = 0;
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        Ok(self
            .positions
            .iter()
            .map(|(topic, partition, offset)| TopicPartition::new(topic.clone(), *partition).with_offset(*offset))
            .collect())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<RawRecord>, BrokerError> {
        // None: the timeout overflows an Instant, wait without bound.
        let deadline = Instant::now().checked_add(timeout);
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        loop {
            if let Some(err) = state.take_fault(&self.group_id, FaultPoint::Poll) {
                return Err(err);
            }
            // The join round-trip consumes this poll, like a real group join.
            if self.rebalance_if_needed(&state) {
                return Ok(None);
            }
            if let Some(err) = state.take_fault(&self.group_id, FaultPoint::Record) {
                return Ok(Some(RawRecord {
                    error: Some(err),
                    ..RawRecord::default()
                }));
            }
            if let Some(record) = self.fetch(&mut state) {
                return Ok(Some(record));
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            state = shared.wait(state, remaining);
        }
    }

    fn watermark_offsets(
        &self,
        partition: &TopicPartition,
        cached: bool,
    ) -> Result<(i64, i64), BrokerError> {
        let mut state = self.shared.lock();
        if let Some(err) = state.take_fault(&self.group_id, FaultPoint::Watermark) {
            return Err(err);
        }
        if cached {
            state.cached_watermark_lookups += 1;
        } else {
            state.fresh_watermark_lookups += 1;
        }
        Ok(state.watermarks(&partition.topic, partition.partition))
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.joined {
            return;
        }
        let mut state = self.shared.lock();
        if let Some(group) = state.groups.get_mut(&self.group_id) {
            group.members.retain(|m| *m != self.member_id);
            group.subscriptions.remove(&self.member_id);
            group.generation += 1;
        }
    }
}
