//! IPC error types

use core::fmt;

/// IPC operation result type
pub type Result<T> = core::result::Result<T, IpcError>;

/// IPC failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Target process does not exist.
    NoProcess,
    /// The receiver's ring is full; the message was dropped.
    QueueFull,
    /// Malformed message (oversized payload, bad pointer).
    InvalidMessage,
}

impl IpcError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoProcess => "target process not found",
            Self::QueueFull => "message queue full",
            Self::InvalidMessage => "invalid message",
        }
    }

    /// Numeric code surfaced through the system-call boundary.
    pub fn to_errno(self) -> i64 {
        match self {
            Self::QueueFull => -1,
            Self::NoProcess => -2,
            Self::InvalidMessage => -3,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
