//! Per-process message rings
//!
//! A bounded ring of messages with FIFO order, a drop counter for
//! rejected sends, and a bitmap of the priorities currently present.
//! Producer and consumer indices only move under the owning queue's lock.

use crate::{
    config::MAX_MESSAGES,
    ipc::{
        error::IpcError,
        message::{IpcMessage, MessageType},
    },
};

/// Fixed-capacity message ring.
pub struct MessageRing {
    messages: [IpcMessage; MAX_MESSAGES],
    head: usize,
    tail: usize,
    count: usize,
    dropped: u32,
    priority_bitmap: u32,
}

impl MessageRing {
    pub const fn new() -> Self {
        Self {
            messages: [IpcMessage::empty(); MAX_MESSAGES],
            head: 0,
            tail: 0,
            count: 0,
            dropped: 0,
            priority_bitmap: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn priority_bitmap(&self) -> u32 {
        self.priority_bitmap
    }

    /// Append a message; a full ring drops it and counts the drop.
    pub fn push(&mut self, msg: &IpcMessage) -> Result<(), IpcError> {
        if self.count == MAX_MESSAGES {
            self.dropped += 1;
            return Err(IpcError::QueueFull);
        }
        self.messages[self.tail] = *msg;
        self.tail = (self.tail + 1) % MAX_MESSAGES;
        self.count += 1;
        self.priority_bitmap |= 1 << msg.priority as u32;
        Ok(())
    }

    /// Remove the oldest message.
    pub fn pop(&mut self) -> Option<IpcMessage> {
        if self.count == 0 {
            return None;
        }
        let msg = self.messages[self.head];
        self.head = (self.head + 1) % MAX_MESSAGES;
        self.count -= 1;
        self.rebuild_priority_bitmap();
        Some(msg)
    }

    /// Remove the oldest message of `kind`, preserving the order of the
    /// rest by shifting the survivors back into place.
    pub fn take_first_of(&mut self, kind: MessageType) -> Option<IpcMessage> {
        let position = (0..self.count)
            .find(|&i| self.messages[(self.head + i) % MAX_MESSAGES].msg_type == kind)?;

        let taken = self.messages[(self.head + position) % MAX_MESSAGES];

        // Close the gap: everything behind the hole moves one slot forward.
        for i in position..self.count - 1 {
            self.messages[(self.head + i) % MAX_MESSAGES] =
                self.messages[(self.head + i + 1) % MAX_MESSAGES];
        }
        self.tail = (self.tail + MAX_MESSAGES - 1) % MAX_MESSAGES;
        self.count -= 1;
        self.rebuild_priority_bitmap();
        Some(taken)
    }

    pub fn contains_type(&self, kind: MessageType) -> bool {
        (0..self.count).any(|i| self.messages[(self.head + i) % MAX_MESSAGES].msg_type == kind)
    }

    /// Drop every queued message.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
        self.priority_bitmap = 0;
    }

    fn rebuild_priority_bitmap(&mut self) {
        self.priority_bitmap = 0;
        for i in 0..self.count {
            let msg = &self.messages[(self.head + i) % MAX_MESSAGES];
            self.priority_bitmap |= 1 << msg.priority as u32;
        }
    }
}

impl Default for MessageRing {
    fn default() -> Self {
        Self::new()
    }
}
