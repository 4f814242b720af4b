//! # Message Delivery Service
//!
//! Drains the [`MessageQueue`] on a background loop and turns the transport's
//! "attempted once" into reliable delivery: acknowledgment tracking with timeouts,
//! exponential-backoff retries, and escalation to the [`DeadLetterQueue`].
//!
//! ## Flow
//!
//! 1. `send_message` wraps the message in an [`Envelope`] and enqueues it.
//! 2. The delivery loop dequeues ready envelopes and calls [`Transport::send`].
//! 3. Messages that require an acknowledgment wait in the pending-ack table under a
//!    timer; acknowledgments arrive over the [`AckSender`] channel.
//! 4. Transport failures and ack timeouts retry with backoff until the budget is
//!    spent, then dead-letter.
//!
//! Every envelope ends ACKNOWLEDGED or DEAD_LETTER, and the optional callback
//! registered at send time observes that outcome exactly once. Removing an entry
//! from the pending-ack table is what claims it, so an acknowledgment racing an
//! expiry is settled by whichever removes it first.

use super::dead_letter::{DeadLetterQueue, DeadLetterStatistics};
use super::errors::{MessagingError, MessagingResult};
use super::message::{
    Acknowledgment, AttemptOutcome, DeliveryOutcome, DeliveryStatus, Envelope, Message,
    MessagePriority,
};
use super::queue::MessageQueue;
use super::transport::{AckSender, Transport};
use crate::config::DeliveryConfig;
use crate::constants::events;
use crate::logging::log_delivery_operation;
use crate::resilience::BackoffPolicy;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Invoked once with the final outcome of a message
pub type DeliveryCallback = Box<dyn FnOnce(DeliveryOutcome) + Send + 'static>;

/// Dead-letter reason when the final attempt went unacknowledged
pub const ACK_TIMEOUT_REASON: &str = "acknowledgment timed out";
pub const STALE_ACK_REASON: &str = "stale pending acknowledgment";

#[derive(Debug)]
struct PendingAck {
    envelope: Envelope,
    sent_at: Instant,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct DeliveryCounters {
    queued: u64,
    sent: u64,
    delivered: u64,
    acknowledged: u64,
    retried: u64,
    failed_attempts: u64,
    dead_lettered: u64,
    unmatched_acks: u64,
    expired_acks: u64,
    latency_samples: u64,
    average_latency_ms: f64,
}

/// Snapshot of delivery activity
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryStatistics {
    pub queued: u64,
    /// Successful transport attempts
    pub sent: u64,
    /// Messages completed without requiring an acknowledgment
    pub delivered: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    pub unmatched_acks: u64,
    pub expired_acks: u64,
    pub average_latency_ms: f64,
    pub pending_acks: usize,
    pub queue_depth: usize,
    pub dead_letter: DeadLetterStatistics,
}

struct DeliveryInner {
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    queue: MessageQueue,
    dead_letters: DeadLetterQueue,
    pending_acks: DashMap<Uuid, PendingAck>,
    callbacks: Mutex<HashMap<Uuid, DeliveryCallback>>,
    counters: Mutex<DeliveryCounters>,
    backoff: BackoffPolicy,
    ack_sender: AckSender,
    wake: Notify,
    accepting: AtomicBool,
}

/// Reliable delivery on top of a one-shot [`Transport`]
pub struct MessageDeliveryService {
    inner: Arc<DeliveryInner>,
    ack_receiver: Mutex<Option<mpsc::UnboundedReceiver<Acknowledgment>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MessageDeliveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDeliveryService")
            .field("transport", &self.inner.transport)
            .field("queue_depth", &self.inner.queue.pending_count())
            .field("pending_acks", &self.inner.pending_acks.len())
            .finish_non_exhaustive()
    }
}

impl MessageDeliveryService {
    pub fn new(config: DeliveryConfig, transport: Arc<dyn Transport>) -> Self {
        let mut backoff =
            BackoffPolicy::new(config.base_delay(), config.backoff_factor, config.max_delay());
        if config.jitter_enabled {
            backoff = backoff.with_jitter(config.jitter_max_percentage);
        }
        let (ack_sender, ack_receiver) = AckSender::channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(DeliveryInner {
                dead_letters: DeadLetterQueue::new(config.dead_letter_capacity),
                config,
                transport,
                queue: MessageQueue::new(),
                pending_acks: DashMap::new(),
                callbacks: Mutex::new(HashMap::new()),
                counters: Mutex::new(DeliveryCounters::default()),
                backoff,
                ack_sender,
                wake: Notify::new(),
                accepting: AtomicBool::new(true),
            }),
            ack_receiver: Mutex::new(Some(ack_receiver)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the delivery loop and the stale-ack sweep. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(ack_receiver) = self.ack_receiver.lock().take() else {
            debug!("Delivery service already started");
            return;
        };

        let delivery_loop = tokio::spawn(run_delivery_loop(
            Arc::clone(&self.inner),
            ack_receiver,
            self.shutdown_tx.subscribe(),
        ));
        let sweep_loop = tokio::spawn(run_ack_sweep(
            Arc::clone(&self.inner),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().extend([delivery_loop, sweep_loop]);

        info!(
            poll_interval_ms = self.inner.config.poll_interval_ms,
            ack_timeout_ms = self.inner.config.ack_timeout_ms,
            "🚀 Message delivery service started"
        );
    }

    /// Stop accepting messages, stop the background loops and cancel ack timers
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Delivery task ended abnormally");
            }
        }
        for entry in self.inner.pending_acks.iter() {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }

        info!(
            pending_acks = self.inner.pending_acks.len(),
            queue_depth = self.inner.queue.pending_count(),
            "🛑 Message delivery service stopped"
        );
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Queue a message for reliable delivery and return its id
    pub fn send_message(
        &self,
        message: Message,
        priority: MessagePriority,
        ordered_group: Option<String>,
        max_retries: u32,
        callback: Option<DeliveryCallback>,
    ) -> MessagingResult<Uuid> {
        if !self.is_accepting() {
            return Err(MessagingError::ServiceStopped);
        }

        let message_id = message.id;
        let recipient = message.recipient.clone();
        if let Some(callback) = callback {
            self.inner.callbacks.lock().insert(message_id, callback);
        }

        let envelope = Envelope::new(message, priority, ordered_group, max_retries);
        let sequence = self.inner.queue.enqueue(envelope);
        self.inner.counters.lock().queued += 1;

        debug!(
            %message_id,
            recipient = %recipient,
            ?priority,
            sequence = ?sequence,
            "Message queued"
        );
        self.inner.wake.notify_one();
        Ok(message_id)
    }

    /// Settle a pending message with the recipient's acknowledgment.
    ///
    /// Returns `false` for acknowledgments that match nothing (already settled,
    /// expired or never sent); those are logged and dropped.
    pub fn handle_acknowledgment(&self, ack: Acknowledgment) -> bool {
        self.inner.handle_acknowledgment(ack)
    }

    /// Handle recipients can use to acknowledge outside a transport call
    pub fn ack_sender(&self) -> AckSender {
        self.inner.ack_sender.clone()
    }

    /// Return a dead-lettered message to live delivery with a fresh retry budget
    pub fn requeue_dead_letter(&self, message_id: Uuid) -> MessagingResult<()> {
        let envelope = self.inner.dead_letters.requeue_message(message_id)?;
        info!(%message_id, recipient = %envelope.recipient(), "♻️ Dead letter requeued");
        self.inner.queue.requeue(envelope);
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.inner.dead_letters
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.pending_count()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.inner.pending_acks.len()
    }

    /// Expire pending acknowledgments older than the stale timeout now
    pub fn sweep_stale_acks(&self) -> usize {
        self.inner.sweep_stale()
    }

    pub fn get_statistics(&self) -> DeliveryStatistics {
        let counters = self.inner.counters.lock();
        DeliveryStatistics {
            queued: counters.queued,
            sent: counters.sent,
            delivered: counters.delivered,
            acknowledged: counters.acknowledged,
            retried: counters.retried,
            failed_attempts: counters.failed_attempts,
            dead_lettered: counters.dead_lettered,
            unmatched_acks: counters.unmatched_acks,
            expired_acks: counters.expired_acks,
            average_latency_ms: counters.average_latency_ms,
            pending_acks: self.inner.pending_acks.len(),
            queue_depth: self.inner.queue.pending_count(),
            dead_letter: self.inner.dead_letters.get_statistics(),
        }
    }
}

impl DeliveryInner {
    async fn drain(self: &Arc<Self>) {
        while let Some(envelope) = self.queue.dequeue() {
            self.attempt(envelope).await;
        }
    }

    async fn attempt(self: &Arc<Self>, mut envelope: Envelope) {
        let message_id = envelope.id();
        let requires_ack = envelope.message.requires_ack;
        let started = Instant::now();

        // Registered before sending so an acknowledgment can never outrun its entry.
        if requires_ack {
            self.pending_acks.insert(
                message_id,
                PendingAck {
                    envelope: envelope.clone(),
                    sent_at: started,
                    timer: None,
                },
            );
        }

        match self.transport.send(&envelope.message, &self.ack_sender).await {
            Ok(()) => {
                self.counters.lock().sent += 1;
                log_delivery_operation(
                    events::MESSAGE_SENT,
                    message_id,
                    envelope.recipient(),
                    "sent",
                    None,
                );

                if requires_ack {
                    if let Some(mut pending) = self.pending_acks.get_mut(&message_id) {
                        pending.envelope.record_attempt(AttemptOutcome::Sent, None);
                        pending.timer = Some(self.spawn_ack_timer(message_id));
                    }
                } else {
                    envelope.record_attempt(AttemptOutcome::Sent, None);
                    envelope.status = DeliveryStatus::Acknowledged;
                    self.complete(envelope, started.elapsed(), DeliveryOutcome::Delivered);
                }
            }
            Err(err) => {
                if requires_ack && self.pending_acks.remove(&message_id).is_none() {
                    // Settled by an acknowledgment despite the transport error.
                    return;
                }
                let reason = err.to_string();
                envelope.record_attempt(AttemptOutcome::TransportFailed, Some(reason.clone()));
                self.counters.lock().failed_attempts += 1;
                self.retry_or_dead_letter(envelope, reason);
            }
        }
    }

    fn spawn_ack_timer(self: &Arc<Self>, message_id: Uuid) -> JoinHandle<()> {
        let inner: Weak<DeliveryInner> = Arc::downgrade(self);
        let timeout = self.config.ack_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(message_id, ACK_TIMEOUT_REASON, false);
            }
        })
    }

    fn handle_acknowledgment(&self, ack: Acknowledgment) -> bool {
        let Some((_, pending)) = self.pending_acks.remove(&ack.message_id) else {
            self.counters.lock().unmatched_acks += 1;
            warn!(message_id = %ack.message_id, "Unmatched acknowledgment dropped");
            return false;
        };

        if let Some(timer) = pending.timer {
            timer.abort();
        }
        let mut envelope = pending.envelope;
        envelope.record_attempt(AttemptOutcome::Acknowledged, ack.error.clone());
        envelope.status = DeliveryStatus::Acknowledged;
        self.complete(
            envelope,
            pending.sent_at.elapsed(),
            DeliveryOutcome::Acknowledged(ack),
        );
        true
    }

    fn expire(&self, message_id: Uuid, reason: &str, abort_timer: bool) {
        let Some((_, pending)) = self.pending_acks.remove(&message_id) else {
            return;
        };
        if abort_timer {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }

        let mut envelope = pending.envelope;
        envelope.record_attempt(AttemptOutcome::AckTimeout, Some(reason.to_string()));
        {
            let mut counters = self.counters.lock();
            counters.failed_attempts += 1;
            counters.expired_acks += 1;
        }
        self.retry_or_dead_letter(envelope, reason.to_string());
    }

    fn sweep_stale(&self) -> usize {
        let stale_after = self.config.stale_pending_timeout();
        let stale: Vec<Uuid> = self
            .pending_acks
            .iter()
            .filter(|entry| entry.sent_at.elapsed() >= stale_after)
            .map(|entry| *entry.key())
            .collect();

        for message_id in &stale {
            self.expire(*message_id, STALE_ACK_REASON, true);
        }
        if !stale.is_empty() {
            info!(expired = stale.len(), "🧹 Expired stale pending acknowledgments");
        }
        stale.len()
    }

    fn retry_or_dead_letter(&self, mut envelope: Envelope, reason: String) {
        let message_id = envelope.id();

        if envelope.can_retry() {
            let delay = self.backoff.delay_for(envelope.retry_count);
            envelope.schedule_retry(delay);
            self.counters.lock().retried += 1;
            let details = format!(
                "attempt {} of {} in {}ms: {reason}",
                envelope.retry_count + 1,
                envelope.max_retries + 1,
                delay.as_millis()
            );
            log_delivery_operation(
                events::MESSAGE_RETRIED,
                message_id,
                envelope.recipient(),
                "retrying",
                Some(details.as_str()),
            );
            self.queue.requeue(envelope);
            return;
        }

        // A dead-lettered group head must leave its group so the group unblocks.
        self.queue.remove(message_id);
        warn!(
            %message_id,
            recipient = %envelope.recipient(),
            attempts = envelope.attempts.len(),
            reason = %reason,
            "☠️ Message dead-lettered"
        );
        log_delivery_operation(
            events::MESSAGE_DEAD_LETTERED,
            message_id,
            envelope.recipient(),
            "dead_letter",
            Some(reason.as_str()),
        );
        self.dead_letters.add_message(envelope, reason.clone());
        self.counters.lock().dead_lettered += 1;
        self.notify(message_id, DeliveryOutcome::DeadLettered { reason });
    }

    fn complete(&self, envelope: Envelope, latency: Duration, outcome: DeliveryOutcome) {
        let message_id = envelope.id();
        self.queue.mark_delivered(message_id);

        {
            let mut counters = self.counters.lock();
            match outcome {
                DeliveryOutcome::Delivered => counters.delivered += 1,
                _ => counters.acknowledged += 1,
            }
            let sample = latency.as_secs_f64() * 1000.0;
            counters.average_latency_ms = if counters.latency_samples == 0 {
                sample
            } else {
                let alpha = self.config.latency_smoothing;
                alpha * sample + (1.0 - alpha) * counters.average_latency_ms
            };
            counters.latency_samples += 1;
        }

        debug!(
            %message_id,
            recipient = %envelope.recipient(),
            latency_ms = latency.as_millis() as u64,
            attempts = envelope.attempts.len(),
            "✅ Message delivered"
        );
        self.notify(message_id, outcome);
    }

    fn notify(&self, message_id: Uuid, outcome: DeliveryOutcome) {
        let callback = self.callbacks.lock().remove(&message_id);
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

async fn run_delivery_loop(
    inner: Arc<DeliveryInner>,
    mut acks: mpsc::UnboundedReceiver<Acknowledgment>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut poll = tokio::time::interval(inner.config.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        inner.drain().await;

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(ack) = acks.recv() => {
                inner.handle_acknowledgment(ack);
            }
            _ = inner.wake.notified() => {}
            _ = poll.tick() => {}
        }
    }
    debug!("Delivery loop exited");
}

async fn run_ack_sweep(inner: Arc<DeliveryInner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.config.cleanup_interval();
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = sweep.tick() => {
                inner.sweep_stale();
            }
        }
    }
    debug!("Acknowledgment sweep exited");
}
