//! # Dead Letter Queue
//!
//! Bounded store for envelopes that exhausted their retry budget. Entries stay
//! inspectable and can be handed back to live delivery with a fresh retry budget.

use super::errors::{MessagingError, MessagingResult};
use super::message::{DeliveryStatus, Envelope};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;
use uuid::Uuid;

/// A dead-lettered envelope with its failure context
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub envelope: Envelope,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn message_id(&self) -> Uuid {
        self.envelope.id()
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.dead_lettered_at).num_seconds()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetterStatistics {
    pub total: usize,
    pub capacity: usize,
    pub evicted: u64,
    /// Failure reason histogram
    pub reasons: BTreeMap<String, usize>,
    pub oldest_at: Option<DateTime<Utc>>,
    pub newest_at: Option<DateTime<Utc>>,
    pub oldest_age_seconds: Option<i64>,
}

#[derive(Debug)]
struct DeadLetterState {
    entries: VecDeque<DeadLetterEntry>,
    evicted: u64,
}

/// Ring buffer of dead letters; the oldest entry is evicted at capacity
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    state: Mutex<DeadLetterState>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(DeadLetterState {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                evicted: 0,
            }),
        }
    }

    pub fn add_message(&self, mut envelope: Envelope, reason: impl Into<String>) {
        envelope.status = DeliveryStatus::DeadLetter;
        envelope.not_before = None;
        let entry = DeadLetterEntry {
            envelope,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        };

        let mut state = self.state.lock();
        if state.entries.len() >= self.capacity {
            if let Some(evicted) = state.entries.pop_front() {
                state.evicted += 1;
                warn!(
                    message_id = %evicted.message_id(),
                    capacity = self.capacity,
                    "Dead letter queue full, evicting oldest entry"
                );
            }
        }
        state.entries.push_back(entry);
    }

    /// Oldest-first view of up to `limit` entries
    pub fn get_messages(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_message(&self, message_id: Uuid) -> Option<DeadLetterEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.message_id() == message_id)
            .cloned()
    }

    /// Remove an entry and return its envelope reset for live delivery
    pub fn requeue_message(&self, message_id: Uuid) -> MessagingResult<Envelope> {
        let mut state = self.state.lock();
        let position = state
            .entries
            .iter()
            .position(|e| e.message_id() == message_id)
            .ok_or_else(|| MessagingError::dead_letter_not_found(message_id))?;

        let entry = state
            .entries
            .remove(position)
            .ok_or_else(|| MessagingError::dead_letter_not_found(message_id))?;

        let mut envelope = entry.envelope;
        envelope.retry_count = 0;
        envelope.status = DeliveryStatus::Pending;
        envelope.not_before = None;
        Ok(envelope)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn get_statistics(&self) -> DeadLetterStatistics {
        let state = self.state.lock();
        let now = Utc::now();
        let mut reasons = BTreeMap::new();
        for entry in &state.entries {
            *reasons.entry(entry.reason.clone()).or_insert(0) += 1;
        }
        let oldest = state.entries.front();

        DeadLetterStatistics {
            total: state.entries.len(),
            capacity: self.capacity,
            evicted: state.evicted,
            reasons,
            oldest_at: oldest.map(|e| e.dead_lettered_at),
            newest_at: state.entries.back().map(|e| e.dead_lettered_at),
            oldest_age_seconds: oldest.map(|e| e.age_seconds(now)),
        }
    }
}
