//! Outgoing command queue with a single-slot debounce deadline.
//!
//! At most one command per pk is pending; a newer write for the same pk
//! replaces the stale one and moves to the tail. Every enqueue pushes the
//! flush deadline out by the debounce window, so a burst of writes goes out
//! as one `set` batch once the burst stops.

use std::time::Duration;

use tokio::time::Instant;
use worlty_rpc::Command;

#[derive(Debug)]
pub struct CommandQueue {
    pending: Vec<Command>,
    deadline: Option<Instant>,
    debounce: Duration,
}

impl CommandQueue {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            pending: Vec::new(),
            deadline: None,
            debounce,
        }
    }

    pub fn enqueue(&mut self, command: Command, now: Instant) {
        self.pending.retain(|queued| queued.pk != command.pk);
        self.pending.push(command);
        self.deadline = Some(now + self.debounce);
    }

    /// When the pending batch should be flushed, if any flush is armed
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm the deadline and drain the batch once the deadline has passed.
    ///
    /// The queue is empty afterwards whether or not the batch is delivered.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<Command>> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    #[must_use]
    pub fn pending(&self) -> &[Command] {
        &self.pending
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
