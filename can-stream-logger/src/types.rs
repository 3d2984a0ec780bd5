//! Core types for the CAN stream logger
//!
//! This module defines the frame type that flows from a channel into the
//! engines, the timestamp alias used throughout the crate and the error
//! taxonomy shared by every component.

use chrono::{DateTime, Utc};
use std::fmt;

/// Timestamp type used throughout the logger
pub type Timestamp = DateTime<Utc>;

/// Result type for logger operations
pub type Result<T> = std::result::Result<T, LoggerError>;

/// Maximum payload of a classic CAN frame
pub const CLASSIC_MAX_DLC: usize = 8;

/// Maximum payload of a CAN-FD frame
pub const FD_MAX_DLC: usize = 64;

/// One inbound unit of telemetry as delivered by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Reception (or creation) time
    pub timestamp: Timestamp,
    /// CAN message ID (11-bit or 29-bit)
    pub can_id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
}

impl CanFrame {
    /// Create a classic frame stamped with the current time
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: Utc::now(),
            can_id,
            data: data.into(),
            is_extended: can_id > 0x7FF,
            is_fd: false,
        }
    }

    /// Builder method: mark the frame as CAN-FD
    pub fn with_fd(mut self, is_fd: bool) -> Self {
        self.is_fd = is_fd;
        self
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Largest payload this frame kind may carry
    pub fn max_dlc(&self) -> usize {
        if self.is_fd {
            FD_MAX_DLC
        } else {
            CLASSIC_MAX_DLC
        }
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = if self.is_extended {
            format!("{:08X}", self.can_id)
        } else {
            format!("{:03X}", self.can_id)
        };
        write!(
            f,
            "Timestamp: {}  ID: {}  DL: {}  {}",
            self.timestamp.format("%H:%M:%S%.6f"),
            id,
            self.dlc(),
            format_payload(&self.data)
        )
    }
}

/// Render a payload as space separated upper-case hex bytes
pub fn format_payload(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Failures surfaced by a channel binding
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel is closed")]
    Closed,

    #[error("Frame 0x{can_id:X} carries {len} bytes, limit is {max}")]
    FrameTooLong { can_id: u32, len: usize, max: usize },

    #[error("Transport IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed watch list or logger configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("CAN ID 0x{0:X} is listed more than once")]
    DuplicateId(u32),

    #[error("No CAN IDs are configured")]
    EmptyRegistry,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors that can occur while running the logger
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Not configured: {0} must be set first")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{engine} loop did not exit within {waited_ms} ms, detached it")]
    StopTimeout { engine: String, waited_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_basics() {
        let frame = CanFrame::new(0x123, vec![1, 2, 3]);
        assert_eq!(frame.dlc(), 3);
        assert!(!frame.is_extended);
        assert_eq!(frame.max_dlc(), CLASSIC_MAX_DLC);

        let ext = CanFrame::new(0x18FF_0001, vec![]).with_fd(true);
        assert!(ext.is_extended);
        assert_eq!(ext.max_dlc(), FD_MAX_DLC);
    }

    #[test]
    fn test_payload_formatting() {
        assert_eq!(format_payload(&[0x0A, 0xFF, 0x00]), "0A FF 00");
        assert_eq!(format_payload(&[]), "");
    }

    #[test]
    fn test_frame_display() {
        let frame = CanFrame::new(0x7E8, vec![0x10, 0x20]);
        let text = frame.to_string();
        assert!(text.contains("ID: 7E8"));
        assert!(text.contains("DL: 2"));
        assert!(text.ends_with("10 20"));
    }

    #[test]
    fn test_error_messages() {
        let err = LoggerError::NotConfigured("channel");
        assert_eq!(err.to_string(), "Not configured: channel must be set first");

        let err: LoggerError = ConfigError::DuplicateId(0x10).into();
        assert!(err.to_string().contains("0x10"));
    }
}
