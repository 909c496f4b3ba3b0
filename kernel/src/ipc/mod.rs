//! Inter-process message queues
//!
//! Each process slot owns a bounded message ring guarded by its own lock.
//! Sending copies the message into the receiver's ring and, if the
//! receiver is blocked in `receive`, flips it READY so the scheduler picks
//! it up on the next tick. The BLOCKED→READY transition happens after the
//! message is enqueued, so a woken receiver always observes its message.
//!
//! Lock order: process table before any queue lock; the scheduler is never
//! locked while a queue lock is held (wakes are deferred through the
//! scheduler's wake bitmap).

pub mod error;
pub mod message;
pub mod queue;

pub use error::{IpcError, Result};
pub use message::{IpcMessage, MessagePriority, MessageType};
pub use queue::MessageRing;

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    arch,
    config::MAX_PROCESSES,
    process::{self, pcb::Pcb, ProcessState},
    sched,
    sync::SpinLock,
};

/// Global sequence ids for request/response correlation.
static SEQUENCE: AtomicU32 = AtomicU32::new(1);

pub fn next_sequence_id() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// One ring per process slot, parallel to the process table.
static QUEUES: [SpinLock<MessageRing>; MAX_PROCESSES] =
    [const { SpinLock::new(MessageRing::new()) }; MAX_PROCESSES];

/// Enqueue into a ring and wake its blocked owner. Returns whether the
/// receiver was woken; the caller is responsible for notifying the
/// scheduler.
fn deliver(ring: &SpinLock<MessageRing>, receiver: &Pcb, msg: &IpcMessage) -> Result<bool> {
    ring.lock().push(msg)?;
    Ok(receiver
        .state
        .transition(ProcessState::Blocked, ProcessState::Ready))
}

/// Send `msg` to the process identified by `target_pid`.
pub fn send(target_pid: u32, msg: &IpcMessage) -> Result<()> {
    let mut msg = *msg;
    if msg.sequence_id == 0 {
        msg.sequence_id = next_sequence_id();
    }
    msg.timestamp = sched::ticks();

    let table = process::table();
    let slot = table.slot_by_pid(target_pid).ok_or(IpcError::NoProcess)?;
    msg.sender_pid = table.slots[sched::current_slot()].pid;

    let woke = deliver(&QUEUES[slot], &table.slots[slot], &msg)?;
    drop(table);

    if woke {
        sched::note_wake(slot);
    }
    Ok(())
}

/// Block until a message arrives for the current process, then return the
/// oldest one.
pub fn receive() -> IpcMessage {
    receive_where(|ring| ring.pop())
}

/// Block until a message of `kind` arrives for the current process.
/// Earlier messages of other types stay queued in order.
pub fn receive_of(kind: MessageType) -> IpcMessage {
    receive_where(move |ring| ring.take_first_of(kind))
}

fn receive_where(mut take: impl FnMut(&mut MessageRing) -> Option<IpcMessage>) -> IpcMessage {
    loop {
        let slot = sched::current_slot();
        if let Some(msg) = take(&mut QUEUES[slot].lock()) {
            return msg;
        }

        sched::block_current();

        // A matching send may have slipped in between the failed take and
        // the BLOCKED transition; re-check before sleeping so that
        // wake-up is not lost.
        if let Some(msg) = take(&mut QUEUES[slot].lock()) {
            let table = process::table();
            if table.slots[slot]
                .state
                .transition(ProcessState::Blocked, ProcessState::Ready)
            {
                drop(table);
                sched::note_wake(slot);
            }
            return msg;
        }

        arch::halt();
    }
}

/// Send a request and return its correlation id.
pub fn send_request(target_pid: u32, data: &[u8]) -> Result<u32> {
    let request_id = next_sequence_id();
    send(target_pid, &IpcMessage::request(request_id, 0, data))?;
    Ok(request_id)
}

/// Answer a previously received request.
pub fn send_response(target_pid: u32, request_id: u32, status: i32, data: &[u8]) -> Result<()> {
    send(target_pid, &IpcMessage::response(request_id, status, data))
}

/// Messages currently queued for the running process.
pub fn pending_count() -> usize {
    QUEUES[sched::current_slot()].lock().len()
}

pub fn has_messages() -> bool {
    pending_count() > 0
}

pub fn has_message_of(kind: MessageType) -> bool {
    QUEUES[sched::current_slot()].lock().contains_type(kind)
}

/// Drop everything queued for the running process.
pub fn flush() {
    QUEUES[sched::current_slot()].lock().clear();
}

/// Reaper hook: clear a dead slot's ring.
pub(crate) fn flush_slot(slot: usize) {
    QUEUES[slot].lock().clear();
}

/// Dropped-send count for a slot, for diagnostics.
pub fn dropped_count(slot: usize) -> u32 {
    QUEUES[slot].lock().dropped()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::security::{Privilege, SecurityToken, TokenFlags};

    fn blocked_pcb() -> Pcb {
        let mut pcb = Pcb::empty();
        pcb.pid = 9;
        pcb.token = SecurityToken::issue(9, 0, Privilege::User, TokenFlags::empty(), 0);
        pcb.state.set(ProcessState::Blocked);
        pcb
    }

    #[test]
    fn deliver_wakes_blocked_receiver() {
        let ring = SpinLock::new(MessageRing::new());
        let pcb = blocked_pcb();

        let woke = deliver(&ring, &pcb, &IpcMessage::value(1)).expect("ring empty");
        assert!(woke);
        assert_eq!(pcb.state.get(), ProcessState::Ready);
        assert_eq!(ring.lock().len(), 1);
    }

    #[test]
    fn deliver_to_ready_receiver_does_not_wake() {
        let ring = SpinLock::new(MessageRing::new());
        let pcb = blocked_pcb();
        pcb.state.set(ProcessState::Ready);

        let woke = deliver(&ring, &pcb, &IpcMessage::value(1)).expect("ring empty");
        assert!(!woke);
        assert_eq!(pcb.state.get(), ProcessState::Ready);
    }

    #[test]
    fn full_ring_rejects_without_waking() {
        let ring = SpinLock::new(MessageRing::new());
        let pcb = blocked_pcb();
        for _ in 0..crate::config::MAX_MESSAGES {
            ring.lock().push(&IpcMessage::value(0)).expect("filling");
        }

        let result = deliver(&ring, &pcb, &IpcMessage::value(1));
        assert_eq!(result, Err(IpcError::QueueFull));
        assert_eq!(pcb.state.get(), ProcessState::Blocked);
        assert_eq!(ring.lock().dropped(), 1);
    }

    #[test]
    fn sequence_ids_are_unique() {
        let a = next_sequence_id();
        let b = next_sequence_id();
        assert_ne!(a, b);
    }
}
