//! IPC message format
//!
//! Fixed-size typed messages with an inline payload. The request/response
//! variants carry a correlation id and status in the first payload bytes.

use crate::config::IPC_MAX_PAYLOAD;

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Data = 0,
    Notification = 1,
    /// Request-response pattern, request side.
    Request = 2,
    /// Response to a request.
    Response = 3,
    Signal = 4,
    Broadcast = 5,
    Urgent = 6,
}

/// Delivery priority, tracked in the queue's priority bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// One IPC message.
#[derive(Clone, Copy)]
pub struct IpcMessage {
    pub sender_pid: u32,
    /// Correlates requests with responses.
    pub sequence_id: u32,
    pub msg_type: MessageType,
    pub priority: MessagePriority,
    /// Scheduler tick at send time.
    pub timestamp: u64,
    /// Valid bytes in `payload`.
    pub size: u64,
    pub payload: [u8; IPC_MAX_PAYLOAD],
}

impl IpcMessage {
    pub const fn empty() -> Self {
        Self {
            sender_pid: 0,
            sequence_id: 0,
            msg_type: MessageType::Data,
            priority: MessagePriority::Normal,
            timestamp: 0,
            size: 0,
            payload: [0; IPC_MAX_PAYLOAD],
        }
    }

    /// A data message copying `bytes` (truncated to the payload size).
    pub fn data(bytes: &[u8]) -> Self {
        let mut msg = Self::empty();
        let len = bytes.len().min(IPC_MAX_PAYLOAD);
        msg.payload[..len].copy_from_slice(&bytes[..len]);
        msg.size = len as u64;
        msg
    }

    /// A data message carrying one 64-bit value.
    pub fn value(value: u64) -> Self {
        let mut msg = Self::empty();
        msg.payload[..8].copy_from_slice(&value.to_le_bytes());
        msg.size = 8;
        msg
    }

    /// Read back the value of a `value` message.
    pub fn as_value(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.payload[..8]);
        u64::from_le_bytes(bytes)
    }

    /// A request carrying `data` after an 8-byte (id, flags) prefix.
    pub fn request(request_id: u32, flags: u32, data: &[u8]) -> Self {
        let mut msg = Self::empty();
        msg.msg_type = MessageType::Request;
        msg.priority = MessagePriority::High;
        msg.payload[..4].copy_from_slice(&request_id.to_le_bytes());
        msg.payload[4..8].copy_from_slice(&flags.to_le_bytes());
        let len = data.len().min(IPC_MAX_PAYLOAD - 8);
        msg.payload[8..8 + len].copy_from_slice(&data[..len]);
        msg.size = (8 + len) as u64;
        msg
    }

    /// A response carrying `data` after an 8-byte (id, status) prefix.
    pub fn response(request_id: u32, status: i32, data: &[u8]) -> Self {
        let mut msg = Self::empty();
        msg.msg_type = MessageType::Response;
        msg.priority = MessagePriority::High;
        msg.payload[..4].copy_from_slice(&request_id.to_le_bytes());
        msg.payload[4..8].copy_from_slice(&status.to_le_bytes());
        let len = data.len().min(IPC_MAX_PAYLOAD - 8);
        msg.payload[8..8 + len].copy_from_slice(&data[..len]);
        msg.size = (8 + len) as u64;
        msg
    }

    /// Correlation id of a request or response message.
    pub fn request_id(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.payload[..4]);
        u32::from_le_bytes(bytes)
    }

    /// Status word of a response message.
    pub fn status(&self) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.payload[4..8]);
        i32::from_le_bytes(bytes)
    }

    /// Payload bytes past the request/response prefix.
    pub fn body(&self) -> &[u8] {
        match self.msg_type {
            MessageType::Request | MessageType::Response => {
                &self.payload[8..self.size as usize]
            }
            _ => &self.payload[..self.size as usize],
        }
    }
}

impl core::fmt::Debug for IpcMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcMessage")
            .field("sender_pid", &self.sender_pid)
            .field("sequence_id", &self.sequence_id)
            .field("msg_type", &self.msg_type)
            .field("priority", &self.priority)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn value_roundtrip() {
        let msg = IpcMessage::value(0xDEAD_BEEF_1234);
        assert_eq!(msg.as_value(), 0xDEAD_BEEF_1234);
        assert_eq!(msg.size, 8);
    }

    #[test]
    fn request_response_prefix() {
        let req = IpcMessage::request(17, 0b101, b"ping");
        assert_eq!(req.msg_type, MessageType::Request);
        assert_eq!(req.request_id(), 17);
        assert_eq!(req.body(), b"ping");

        let resp = IpcMessage::response(17, -5, b"pong");
        assert_eq!(resp.request_id(), 17);
        assert_eq!(resp.status(), -5);
        assert_eq!(resp.body(), b"pong");
    }

    #[test]
    fn oversized_data_is_truncated() {
        let big = [0x55u8; IPC_MAX_PAYLOAD + 100];
        let msg = IpcMessage::data(&big);
        assert_eq!(msg.size as usize, IPC_MAX_PAYLOAD);
    }
}
