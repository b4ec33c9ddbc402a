//! Bounded event buffer
//!
//! Fixed capacity, drop-oldest. Sequence numbers are assigned from a counter
//! that never goes backwards, not even across a cold restart, so a master
//! confirmation can never acknowledge a newer event by accident.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::points::{PointKey, PointKind, PointValue, Quality};

/// One buffered change
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub sequence: u64,
    pub kind: PointKind,
    pub index: u16,
    pub value: PointValue,
    /// Quality at the time of the change
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn key(&self) -> PointKey {
        PointKey::new(self.kind, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct EventBuffer {
    records: VecDeque<EventRecord>,
    capacity: usize,
    next_sequence: u64,
    evicted: u64,
}

impl EventBuffer {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            next_sequence: 1,
            evicted: 0,
        }
    }

    /// Append a record, evicting the oldest one when full. Returns its sequence number.
    pub fn push(
        &mut self,
        key: PointKey,
        value: PointValue,
        quality: Quality,
        timestamp: DateTime<Utc>,
    ) -> u64 {
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.evicted += 1;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.records.push_back(EventRecord {
            sequence,
            kind: key.kind,
            index: key.index,
            value,
            quality,
            timestamp,
        });
        sequence
    }

    /// Records with a sequence number greater than `after`, oldest first
    pub fn since(&self, after: u64) -> impl Iterator<Item = &EventRecord> {
        self.records.iter().filter(move |r| r.sequence > after)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter()
    }

    /// Drop every record up to and including `upto`. Returns how many were removed.
    pub fn confirm(&mut self, upto: u64) -> usize {
        let before = self.records.len();
        while self.records.front().is_some_and(|r| r.sequence <= upto) {
            self.records.pop_front();
        }
        before - self.records.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records lost to overflow since startup
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Sequence number of the newest record ever pushed (0 if none)
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }
}
