//! Shared queue of user messages awaiting injection into the loop.

use std::sync::Arc;
use std::sync::Mutex;

use pi_protocol::QueueKind;
use pi_protocol::QueueMode;
use pi_protocol::QueuedMessage;

#[derive(Default)]
struct Inner {
    steer: Vec<QueuedMessage>,
    follow_up: Vec<QueuedMessage>,
}

/// Queue shared between the session facade (producer) and the loop
/// (consumer). Clones share state.
#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text user message; returns the queued record so the
    /// caller can announce it.
    pub fn push(&self, kind: QueueKind, text: impl Into<String>) -> QueuedMessage {
        let queued = QueuedMessage::new(kind, text);
        self.push_message(queued.clone());
        queued
    }

    pub fn push_message(&self, queued: QueuedMessage) {
        let mut inner = self.lock();
        match queued.kind {
            QueueKind::Steer => inner.steer.push(queued),
            QueueKind::FollowUp => inner.follow_up.push(queued),
        }
    }

    /// Drain pending messages for a turn start: steer first, then
    /// follow-ups, honouring the drain mode.
    pub fn drain(&self, mode: QueueMode) -> Vec<QueuedMessage> {
        let mut inner = self.lock();
        let mut pending: Vec<QueuedMessage> = inner.steer.drain(..).collect();
        pending.extend(inner.follow_up.drain(..));
        drop(inner);
        self.apply_mode(pending, mode)
    }

    /// Drain only steer messages (checked between tool dispatches).
    pub fn drain_steer(&self, mode: QueueMode) -> Vec<QueuedMessage> {
        let pending: Vec<QueuedMessage> = self.lock().steer.drain(..).collect();
        self.apply_mode(pending, mode)
    }

    /// Whether any message is pending on either queue.
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.steer.is_empty() && inner.follow_up.is_empty()
    }

    /// Whether a steer message is pending (peek, no drain).
    pub fn has_steer(&self) -> bool {
        !self.lock().steer.is_empty()
    }

    fn apply_mode(&self, mut pending: Vec<QueuedMessage>, mode: QueueMode) -> Vec<QueuedMessage> {
        match mode {
            QueueMode::All => pending,
            QueueMode::OneAtATime => {
                if pending.len() > 1 {
                    // Put the rest back, preserving order.
                    let rest = pending.split_off(1);
                    let mut inner = self.lock();
                    for queued in rest.into_iter().rev() {
                        match queued.kind {
                            QueueKind::Steer => inner.steer.insert(0, queued),
                            QueueKind::FollowUp => inner.follow_up.insert(0, queued),
                        }
                    }
                }
                pending
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_steer_before_follow_up() {
        let queue = MessageQueue::new();
        queue.push(QueueKind::FollowUp, "later");
        queue.push(QueueKind::Steer, "now");
        let drained = queue.drain(QueueMode::All);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, QueueKind::Steer);
        assert_eq!(drained[1].kind, QueueKind::FollowUp);
        assert!(queue.is_empty());
    }

    #[test]
    fn one_at_a_time_keeps_the_rest() {
        let queue = MessageQueue::new();
        queue.push(QueueKind::Steer, "first");
        queue.push(QueueKind::Steer, "second");
        let drained = queue.drain(QueueMode::OneAtATime);
        assert_eq!(drained.len(), 1);
        assert!(!queue.is_empty());
        let rest = queue.drain(QueueMode::All);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].preview(10), "second");
    }

    #[test]
    fn drain_steer_leaves_follow_ups() {
        let queue = MessageQueue::new();
        queue.push(QueueKind::Steer, "s");
        queue.push(QueueKind::FollowUp, "f");
        let drained = queue.drain_steer(QueueMode::All);
        assert_eq!(drained.len(), 1);
        assert!(!queue.is_empty());
    }
}
