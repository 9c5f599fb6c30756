//! Typing indicator state machines.
//!
//! Both machines are driven with explicit instants so timing is decided by
//! the caller; they never sleep or spawn.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use pawlink_types::{TypingKind, TypingSignal, UserId};

/// Local side: `idle -> composing -> idle`, debounced on keystrokes.
#[derive(Debug)]
pub struct LocalTyping {
    quiet_period: Duration,
    /// Set while composing; when `stop_typing` is due.
    deadline: Option<Instant>,
}

impl LocalTyping {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            deadline: None,
        }
    }

    pub fn is_composing(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `Typing` on the first keystroke after idle. Every keystroke
    /// pushes the quiet deadline out.
    pub fn on_keystroke(&mut self, now: Instant) -> Option<TypingKind> {
        let started = self.deadline.is_none();
        self.deadline = Some(now + self.quiet_period);
        started.then_some(TypingKind::Typing)
    }

    /// Submitting ends composing immediately and disarms the deadline.
    pub fn on_submit(&mut self) -> Option<TypingKind> {
        self.deadline.take().map(|_| TypingKind::StopTyping)
    }

    pub fn poll_expired(&mut self, now: Instant) -> Option<TypingKind> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                Some(TypingKind::StopTyping)
            }
            _ => None,
        }
    }
}

/// Remote side: `remoteIdle -> remoteTyping -> remoteIdle`.
///
/// Cleared by `stop_typing`, by a message from the same sender, or by the
/// timeout when neither arrives.
#[derive(Debug)]
pub struct RemoteTyping {
    local_user: UserId,
    timeout: Duration,
    /// Sender -> when their indicator lapses
    typing: HashMap<UserId, Instant>,
}

impl RemoteTyping {
    pub fn new(local_user: UserId, timeout: Duration) -> Self {
        Self {
            local_user,
            timeout,
            typing: HashMap::new(),
        }
    }

    pub fn is_typing(&self) -> bool {
        !self.typing.is_empty()
    }

    pub fn typing_users(&self) -> impl Iterator<Item = &UserId> {
        self.typing.keys()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.typing.values().min().copied()
    }

    /// Returns true if the indicator flipped.
    pub fn on_signal(&mut self, signal: &TypingSignal, now: Instant) -> bool {
        if signal.sender_id == self.local_user {
            return false;
        }

        let before = self.is_typing();
        match signal.kind {
            TypingKind::Typing => {
                self.typing.insert(signal.sender_id.clone(), now + self.timeout);
            }
            TypingKind::StopTyping => {
                self.typing.remove(&signal.sender_id);
            }
        }
        before != self.is_typing()
    }

    /// A message implies its sender is done typing.
    pub fn on_message(&mut self, sender_id: &UserId) -> bool {
        let before = self.is_typing();
        self.typing.remove(sender_id);
        before != self.is_typing()
    }

    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.is_typing();
        self.typing.retain(|user, lapses_at| {
            let keep = *lapses_at > now;
            if !keep {
                trace!("Typing indicator for {} timed out", user);
            }
            keep
        });
        before != self.is_typing()
    }

    pub fn clear(&mut self) {
        self.typing.clear();
    }
}
