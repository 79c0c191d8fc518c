//! Delivery tracking: ack and read-receipt correlation, partial-delivery aggregation
//! and bounded retry with backoff. All status changes go through [`DeliveryStatus::advance`].

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::protocol::{ChatMessage, DeliveryAck, ReadReceipt};

/// Tracked messages kept for late acks and receipts.
const TRACKED_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered { to: String, at: u64 },
    Read { by: String, at: u64 },
    Failed { reason: String },
    PartiallyDelivered { reached: usize, total: usize },
}

impl DeliveryStatus {
    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::PartiallyDelivered { .. } => 2,
            DeliveryStatus::Delivered { .. } => 3,
            DeliveryStatus::Read { .. } => 4,
            DeliveryStatus::Failed { .. } => 5,
        }
    }

    /// No further transition is ever applied.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered { .. } | DeliveryStatus::Read { .. } | DeliveryStatus::Failed { .. }
        )
    }

    /// Whether moving from `self` to `next` keeps the status sequence monotonic.
    pub fn allows(&self, next: &DeliveryStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_final() => false,
            (_, DeliveryStatus::Failed { .. }) => true,
            (
                DeliveryStatus::PartiallyDelivered { reached, .. },
                DeliveryStatus::PartiallyDelivered { reached: next_reached, .. },
            ) => next_reached > reached,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Apply `next` if allowed. Returns `true` when the status changed.
    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        if !self.allows(&next) {
            return false;
        }
        *self = next;
        true
    }
}

/// Who is expected to acknowledge a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    Single(PeerId),
    /// Channel send; `total` is the number of active peers at send time.
    Many { total: usize },
}

struct RetryState {
    attempts: u32,
    timeout_ms: u64,
    deadline_ms: u64,
}

struct Tracked {
    message: ChatMessage,
    status: DeliveryStatus,
    expected: Expected,
    acked: HashSet<PeerId>,
    retry: Option<RetryState>,
}

/// Work the tracker hands back from [`DeliveryTracker::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Due {
    /// Deadline passed without an ack: send the message again.
    Resend {
        message: ChatMessage,
        recipient: Option<PeerId>,
        attempt: u32,
    },
    /// Retries exhausted; terminal status to surface once.
    Finished { message_id: String, status: DeliveryStatus },
}

pub struct DeliveryTracker {
    tracked: HashMap<String, Tracked>,
    order: VecDeque<String>,
    ack_timeout_ms: u64,
    max_retries: u32,
}

impl DeliveryTracker {
    pub fn new(ack_timeout_ms: u64, max_retries: u32) -> Self {
        Self {
            tracked: HashMap::new(),
            order: VecDeque::new(),
            ack_timeout_ms,
            max_retries,
        }
    }

    /// Start tracking an outbound message in `Sending`.
    pub fn track(&mut self, message: &ChatMessage, expected: Expected) {
        if self.tracked.contains_key(&message.id) {
            return;
        }
        if let Expected::Many { total: 0 } = expected {
            return;
        }
        while self.order.len() >= TRACKED_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.tracked.remove(&old);
            }
        }
        self.order.push_back(message.id.clone());
        self.tracked.insert(
            message.id.clone(),
            Tracked {
                message: message.clone(),
                status: DeliveryStatus::Sending,
                expected,
                acked: HashSet::new(),
                retry: None,
            },
        );
    }

    pub fn is_tracked(&self, message_id: &str) -> bool {
        self.tracked.contains_key(message_id)
    }

    pub fn status(&self, message_id: &str) -> Option<&DeliveryStatus> {
        self.tracked.get(message_id).map(|t| &t.status)
    }

    /// The message was handed to the transport. Arms the ack deadline if not already armed.
    /// Returns the new status if it changed.
    pub fn mark_sent(&mut self, message_id: &str, now_ms: u64) -> Option<DeliveryStatus> {
        let ack_timeout_ms = self.ack_timeout_ms;
        let tracked = self.tracked.get_mut(message_id)?;
        if tracked.status.is_final() {
            return None;
        }
        tracked.retry.get_or_insert(RetryState {
            attempts: 1,
            timeout_ms: ack_timeout_ms,
            deadline_ms: now_ms.saturating_add(ack_timeout_ms),
        });
        tracked
            .status
            .advance(DeliveryStatus::Sent)
            .then(|| tracked.status.clone())
    }

    /// Correlate an ack. Returns the new status if it changed.
    pub fn on_ack(&mut self, ack: &DeliveryAck) -> Option<DeliveryStatus> {
        let tracked = self.tracked.get_mut(&ack.original_message_id)?;
        let next = match tracked.expected {
            Expected::Single(peer) => {
                if peer != ack.recipient_id {
                    return None;
                }
                DeliveryStatus::Delivered {
                    to: ack.recipient_nickname.clone(),
                    at: ack.timestamp,
                }
            }
            Expected::Many { total } => {
                tracked.acked.insert(ack.recipient_id);
                let reached = tracked.acked.len().min(total);
                if reached >= total {
                    DeliveryStatus::Delivered {
                        to: ack.recipient_nickname.clone(),
                        at: ack.timestamp,
                    }
                } else {
                    DeliveryStatus::PartiallyDelivered { reached, total }
                }
            }
        };
        if !tracked.status.advance(next) {
            return None;
        }
        if matches!(tracked.status, DeliveryStatus::Delivered { .. }) {
            tracked.retry = None;
        }
        Some(tracked.status.clone())
    }

    pub fn on_read_receipt(&mut self, receipt: &ReadReceipt) -> Option<DeliveryStatus> {
        let tracked = self.tracked.get_mut(&receipt.original_message_id)?;
        if let Expected::Single(peer) = tracked.expected {
            if peer != receipt.reader_id {
                return None;
            }
        }
        let changed = tracked.status.advance(DeliveryStatus::Read {
            by: receipt.reader_nickname.clone(),
            at: receipt.timestamp,
        });
        if !changed {
            return None;
        }
        tracked.retry = None;
        Some(tracked.status.clone())
    }

    /// Fire expired ack deadlines: resend with doubled timeout, or finish after the last retry.
    /// A multi-recipient send that reached anyone stays partially delivered instead of failing.
    pub fn poll(&mut self, now_ms: u64) -> Vec<Due> {
        let mut due = Vec::new();
        for (id, tracked) in self.tracked.iter_mut() {
            let Some(retry) = tracked.retry.as_mut() else {
                continue;
            };
            if now_ms < retry.deadline_ms {
                continue;
            }
            if retry.attempts > self.max_retries {
                let attempts = retry.attempts;
                tracked.retry = None;
                let next = DeliveryStatus::Failed {
                    reason: format!("not delivered after {attempts} attempts"),
                };
                if matches!(tracked.status, DeliveryStatus::PartiallyDelivered { .. }) {
                    continue;
                }
                if tracked.status.advance(next) {
                    due.push(Due::Finished {
                        message_id: id.clone(),
                        status: tracked.status.clone(),
                    });
                }
                continue;
            }
            retry.attempts += 1;
            retry.timeout_ms = retry.timeout_ms.saturating_mul(2);
            retry.deadline_ms = now_ms.saturating_add(retry.timeout_ms);
            let recipient = match tracked.expected {
                Expected::Single(peer) => Some(peer),
                Expected::Many { .. } => None,
            };
            due.push(Due::Resend {
                message: tracked.message.clone(),
                recipient,
                attempt: retry.attempts,
            });
        }
        due
    }

    /// Drop pending retries addressed solely to `peer`. Statuses are kept for late acks.
    pub fn cancel_for_peer(&mut self, peer: PeerId) -> usize {
        let mut cancelled = 0;
        for tracked in self.tracked.values_mut() {
            if tracked.expected == Expected::Single(peer) && tracked.retry.take().is_some() {
                cancelled += 1;
            }
        }
        cancelled
    }
}
