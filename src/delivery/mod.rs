//! Reliable delivery
//!
//! Tracks outbound messages that asked for an acknowledgement and decides
//! when they are retransmitted or given up on.
//!
//! The manager is passive: nothing happens between calls to [`DeliveryManager::sweep`],
//! which an external timer has to drive. A sweep never touches the
//! transport itself, it returns the frames to resend so the caller can
//! write them. Retransmissions reuse the original bytes, so the id and
//! checksum of a retried message match the first attempt.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::DeliveryConfig;
use crate::protocol::{Command, EncodedFrame};

/// An outbound message waiting for its ACK
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message_id: u16,
    /// Exact bytes of the first transmission
    pub frame: Bytes,
    pub command: Command,
    pub first_sent_at: Instant,
    pub last_sent_at: Instant,
    pub retry_count: u32,
}

/// What a sweep decided for one pending message
#[derive(Debug, Clone, PartialEq)]
pub enum SweepAction {
    /// Resend `frame`; this is attempt `retry_count` after the first send
    Retry {
        id: u16,
        retry_count: u32,
        frame: Bytes,
    },
    /// Retries exhausted, the message was dropped
    Failed { id: u16, command: Command },
}

/// Owner of the pending-acknowledgement table
pub struct DeliveryManager {
    pending: Mutex<HashMap<u16, PendingAck>>,
    ack_timeout: Duration,
    max_retries: u32,
}

impl DeliveryManager {
    pub fn new(ack_timeout: Duration, max_retries: u32) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ack_timeout,
            max_retries,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(Duration::from_millis(config.ack_timeout_ms), config.max_retries)
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record a frame that was just sent. Only frames whose message
    /// requires an ACK are tracked; returns whether this one was.
    pub async fn submit(&self, frame: &EncodedFrame, now: Instant) -> bool {
        if !frame.message.require_ack {
            return false;
        }

        let entry = PendingAck {
            message_id: frame.id(),
            frame: frame.bytes.clone(),
            command: frame.message.command.clone(),
            first_sent_at: now,
            last_sent_at: now,
            retry_count: 0,
        };

        let mut pending = self.pending.lock().await;
        if pending.insert(entry.message_id, entry).is_some() {
            tracing::warn!("Message {} was still pending and has been replaced", frame.id());
        }
        true
    }

    /// Clear the entry acknowledged by `id`.
    ///
    /// Unknown, late and duplicate ACKs are ignored. Returns whether an
    /// entry was removed.
    pub async fn on_ack(&self, id: u16) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(entry) => {
                tracing::debug!(
                    "ACK for message {} ({}) after {:?}, {} retries",
                    id,
                    entry.command,
                    entry.first_sent_at.elapsed(),
                    entry.retry_count
                );
                true
            }
            None => {
                tracing::debug!("Ignoring ACK for unknown message {}", id);
                false
            }
        }
    }

    /// Drop an entry whose first transmission never made it out
    pub async fn cancel(&self, id: u16) -> bool {
        self.pending.lock().await.remove(&id).is_some()
    }

    /// Retry or expire every entry that has waited longer than the ACK
    /// timeout since it was last sent.
    pub async fn sweep(&self, now: Instant) -> Vec<SweepAction> {
        let mut pending = self.pending.lock().await;

        let mut overdue: Vec<u16> = pending
            .values()
            .filter(|entry| now.saturating_duration_since(entry.last_sent_at) > self.ack_timeout)
            .map(|entry| entry.message_id)
            .collect();
        overdue.sort_unstable();

        let mut actions = Vec::with_capacity(overdue.len());
        for id in overdue {
            let Some(entry) = pending.get_mut(&id) else {
                continue;
            };

            if entry.retry_count < self.max_retries {
                entry.retry_count += 1;
                entry.last_sent_at = now;
                tracing::warn!(
                    "Retransmitting message {} ({}), attempt {}/{}",
                    id,
                    entry.command,
                    entry.retry_count,
                    self.max_retries
                );
                actions.push(SweepAction::Retry {
                    id,
                    retry_count: entry.retry_count,
                    frame: entry.frame.clone(),
                });
            } else if let Some(entry) = pending.remove(&id) {
                tracing::error!(
                    "Delivery of message {} ({}) failed after {} retries",
                    id,
                    entry.command,
                    self.max_retries
                );
                actions.push(SweepAction::Failed {
                    id,
                    command: entry.command,
                });
            }
        }

        actions
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, id: u16) -> bool {
        self.pending.lock().await.contains_key(&id)
    }

    /// Ids currently awaiting an ACK
    pub async fn pending_ids(&self) -> HashSet<u16> {
        self.pending.lock().await.keys().copied().collect()
    }

    /// Forget every pending entry without reporting failures
    pub async fn clear_all(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::info!("Cleared {} pending messages", pending.len());
        }
        pending.clear();
    }
}

impl Default for DeliveryManager {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameCodec, Payload};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn frame(codec: &FrameCodec, require_ack: bool) -> EncodedFrame {
        codec
            .encode(Command::MotorCommand, Payload::new(), require_ack)
            .unwrap()
    }

    #[tokio::test]
    async fn test_only_ack_required_messages_are_tracked() {
        let codec = FrameCodec::new();
        let manager = DeliveryManager::new(TIMEOUT, 3);
        let now = Instant::now();

        assert!(!manager.submit(&frame(&codec, false), now).await);
        assert!(manager.submit(&frame(&codec, true), now).await);
        assert_eq!(manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_ack_before_timeout_prevents_retry() {
        let codec = FrameCodec::starting_after(41);
        let manager = DeliveryManager::new(TIMEOUT, 3);
        let sent = Instant::now();

        let frame = frame(&codec, true);
        assert_eq!(frame.id(), 42);
        manager.submit(&frame, sent).await;

        assert!(manager.on_ack(42).await);
        let actions = manager.sweep(sent + TIMEOUT * 2).await;

        assert!(actions.is_empty());
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_noop() {
        let codec = FrameCodec::new();
        let manager = DeliveryManager::new(TIMEOUT, 3);
        let frame = frame(&codec, true);
        manager.submit(&frame, Instant::now()).await;

        assert!(manager.on_ack(frame.id()).await);
        assert!(!manager.on_ack(frame.id()).await);
        assert!(!manager.on_ack(999).await);
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_forgets_entry() {
        let codec = FrameCodec::new();
        let manager = DeliveryManager::new(TIMEOUT, 3);
        let sent = Instant::now();
        let frame = frame(&codec, true);
        manager.submit(&frame, sent).await;

        assert!(manager.cancel(frame.id()).await);
        assert!(!manager.is_pending(frame.id()).await);
        assert!(manager.sweep(sent + TIMEOUT * 2).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_retry_before_timeout() {
        let codec = FrameCodec::new();
        let manager = DeliveryManager::new(TIMEOUT, 3);
        let sent = Instant::now();
        manager.submit(&frame(&codec, true), sent).await;

        assert!(manager.sweep(sent + TIMEOUT).await.is_empty());
        assert!(manager.sweep(sent + Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let codec = FrameCodec::starting_after(6);
        let manager = DeliveryManager::new(TIMEOUT, 3);
        let sent = Instant::now();
        let frame = frame(&codec, true);
        assert_eq!(frame.id(), 7);
        manager.submit(&frame, sent).await;

        let step = TIMEOUT + Duration::from_millis(1);
        let mut retries = Vec::new();
        let mut failures = Vec::new();
        for n in 1..=10u32 {
            for action in manager.sweep(sent + step * n).await {
                match action {
                    SweepAction::Retry {
                        id,
                        retry_count,
                        frame: bytes,
                    } => {
                        assert_eq!(id, 7);
                        assert_eq!(bytes, frame.bytes);
                        retries.push(retry_count);
                    }
                    SweepAction::Failed { id, command } => failures.push((id, command)),
                }
            }
        }

        assert_eq!(retries, vec![1, 2, 3]);
        assert_eq!(failures, vec![(7, Command::MotorCommand)]);
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_retry_resets_timer() {
        let codec = FrameCodec::new();
        let manager = DeliveryManager::new(TIMEOUT, 3);
        let sent = Instant::now();
        manager.submit(&frame(&codec, true), sent).await;

        let first = sent + TIMEOUT + Duration::from_secs(1);
        assert_eq!(manager.sweep(first).await.len(), 1);
        // Only one second since the retransmission.
        assert!(manager.sweep(first + Duration::from_secs(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_retries_fails_on_first_timeout() {
        let codec = FrameCodec::new();
        let manager = DeliveryManager::new(TIMEOUT, 0);
        let sent = Instant::now();
        let frame = frame(&codec, true);
        manager.submit(&frame, sent).await;

        let actions = manager.sweep(sent + TIMEOUT * 2).await;
        assert_eq!(
            actions,
            vec![SweepAction::Failed {
                id: frame.id(),
                command: Command::MotorCommand
            }]
        );
    }

    #[tokio::test]
    async fn test_clear_all() {
        let codec = FrameCodec::new();
        let manager = DeliveryManager::default();
        let now = Instant::now();
        for _ in 0..4 {
            manager.submit(&frame(&codec, true), now).await;
        }
        assert_eq!(manager.pending_ids().await.len(), 4);

        manager.clear_all().await;
        assert_eq!(manager.pending_count().await, 0);
        assert!(manager.sweep(now + TIMEOUT * 3).await.is_empty());
    }
}
