//! # Message Queue
//!
//! In-memory queue combining strict per-group sequencing with priority buckets.
//!
//! Ordered groups model causal conversations: an envelope stays at the head of its
//! group until it is delivered or dead-lettered, so a stuck head blocks only its own
//! group. Unordered envelopes live in one FIFO bucket per priority. `dequeue` always
//! prefers a ready ordered-group head over any priority bucket.

use super::message::{DeliveryStatus, Envelope, MessagePriority};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
struct Queued {
    /// Global enqueue order, used to pick the earliest ready group
    ticket: u64,
    envelope: Envelope,
}

#[derive(Debug, Default)]
struct OrderedGroup {
    next_sequence: u64,
    entries: VecDeque<Queued>,
}

#[derive(Debug, Default)]
struct QueueState {
    buckets: [VecDeque<Queued>; 4],
    groups: HashMap<String, OrderedGroup>,
    next_ticket: u64,
}

impl QueueState {
    fn ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

/// Priority + ordered-group queue; every mutation is serialized by one mutex
#[derive(Debug, Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the envelope's ordered group if tagged, else to its priority bucket.
    ///
    /// Returns the assigned group sequence number for grouped envelopes.
    pub fn enqueue(&self, mut envelope: Envelope) -> Option<u64> {
        let mut state = self.state.lock();
        let ticket = state.ticket();
        envelope.status = DeliveryStatus::Pending;

        match envelope.ordered_group.clone() {
            Some(group_name) => {
                let group = state.groups.entry(group_name).or_default();
                let sequence = group.next_sequence;
                group.next_sequence += 1;
                envelope.sequence_number = Some(sequence);
                group.entries.push_back(Queued { ticket, envelope });
                Some(sequence)
            }
            None => {
                let bucket = envelope.priority.bucket_index();
                state.buckets[bucket].push_back(Queued { ticket, envelope });
                None
            }
        }
    }

    /// Take the next envelope that is ready for a transport attempt.
    ///
    /// Ordered-group heads stay queued (marked SENT) until [`mark_delivered`] or
    /// [`remove`] releases them; bucket entries are popped.
    ///
    /// [`mark_delivered`]: MessageQueue::mark_delivered
    /// [`remove`]: MessageQueue::remove
    pub fn dequeue(&self) -> Option<Envelope> {
        self.dequeue_at(Instant::now())
    }

    pub(crate) fn dequeue_at(&self, now: Instant) -> Option<Envelope> {
        let mut state = self.state.lock();

        let ready_group = state
            .groups
            .iter()
            .filter_map(|(name, group)| {
                group.entries.front().and_then(|head| {
                    (head.envelope.status == DeliveryStatus::Pending && head.envelope.is_ready(now))
                        .then_some((head.ticket, name.clone()))
                })
            })
            .min_by_key(|(ticket, _)| *ticket);

        if let Some((_, name)) = ready_group {
            if let Some(head) = state
                .groups
                .get_mut(&name)
                .and_then(|group| group.entries.front_mut())
            {
                head.envelope.status = DeliveryStatus::Sent;
                return Some(head.envelope.clone());
            }
        }

        for priority in MessagePriority::DESCENDING {
            let bucket = &mut state.buckets[priority.bucket_index()];
            if let Some(position) = bucket.iter().position(|q| q.envelope.is_ready(now)) {
                if let Some(mut queued) = bucket.remove(position) {
                    queued.envelope.status = DeliveryStatus::Sent;
                    return Some(queued.envelope);
                }
            }
        }

        None
    }

    /// Return an envelope for another attempt.
    ///
    /// Grouped envelopes are updated in place so their position in the group is kept;
    /// unordered envelopes go to the back of their bucket.
    pub fn requeue(&self, envelope: Envelope) {
        let mut state = self.state.lock();

        if let Some(group_name) = envelope.ordered_group.as_deref() {
            if let Some(slot) = state
                .groups
                .get_mut(group_name)
                .and_then(|group| group.entries.iter_mut().find(|q| q.envelope.id() == envelope.id()))
            {
                slot.envelope = envelope;
                slot.envelope.status = DeliveryStatus::Pending;
                return;
            }
            // The group slot is gone (e.g. requeued from the dead letter queue): re-append.
            drop(state);
            self.enqueue(envelope);
            return;
        }

        let ticket = state.ticket();
        let bucket = envelope.priority.bucket_index();
        let mut envelope = envelope;
        envelope.status = DeliveryStatus::Pending;
        state.buckets[bucket].push_back(Queued { ticket, envelope });
    }

    /// Release a delivered ordered-group envelope so the next one in its group can go.
    pub fn mark_delivered(&self, message_id: Uuid) -> bool {
        self.remove(message_id).is_some()
    }

    /// Remove an envelope wherever it is queued.
    pub fn remove(&self, message_id: Uuid) -> Option<Envelope> {
        let mut state = self.state.lock();

        let grouped = state.groups.iter_mut().find_map(|(name, group)| {
            let position = group
                .entries
                .iter()
                .position(|q| q.envelope.id() == message_id)?;
            let removed = group.entries.remove(position).map(|q| q.envelope);
            Some((name.clone(), group.entries.is_empty(), removed))
        });
        if let Some((name, emptied, removed)) = grouped {
            // Sequences only need to increase while a group has live entries.
            if emptied {
                state.groups.remove(&name);
            }
            return removed;
        }

        for bucket in state.buckets.iter_mut() {
            if let Some(position) = bucket.iter().position(|q| q.envelope.id() == message_id) {
                return bucket.remove(position).map(|q| q.envelope);
            }
        }
        None
    }

    /// Envelopes waiting for a transport attempt (excludes in-flight group heads)
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        let grouped = state
            .groups
            .values()
            .flat_map(|g| g.entries.iter())
            .filter(|q| q.envelope.status == DeliveryStatus::Pending)
            .count();
        let bucketed: usize = state.buckets.iter().map(VecDeque::len).sum();
        grouped + bucketed
    }

    /// Number of envelopes queued in one ordered group, including an in-flight head
    pub fn group_depth(&self, group: &str) -> usize {
        self.state
            .lock()
            .groups
            .get(group)
            .map_or(0, |g| g.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.buckets.iter().all(VecDeque::is_empty)
            && state.groups.values().all(|g| g.entries.is_empty())
    }
}
