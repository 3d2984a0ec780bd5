//! CAN Stream Logger Library
//!
//! Keeps a "latest value per CAN ID" view of a live CAN channel and persists
//! periodic snapshots of that view to a sink (for example a CSV file on a USB
//! stick).
//!
//! # Architecture
//!
//! ```text
//! ChannelBinding → ListenerEngine → SnapshotStore → BatchLogger.capture → BatchBuffer
//!                                                                            ↓
//!                                                   Sink ← BatchLogger.flush
//! ```
//!
//! - [`ListenerEngine`] and [`WatcherEngine`] each own one background dispatch
//!   loop with an idempotent start/stop/restart lifecycle.
//! - [`SnapshotStore`] is written by the listener and read by the capture task
//!   and status queries under a single lock.
//! - [`BatchLogger`] runs the capture and flush tickers of a logging session.
//! - [`CanClient`] ties everything together for an operator layer.
//!
//! The library does NOT:
//! - Talk to CAN hardware (bring your own [`ChannelBinding`])
//! - Decode signal values out of payloads
//! - Parse configuration files or handle keyboard input
//!
//! # Example Usage
//!
//! ```no_run
//! use can_stream_logger::{CanClient, LoggerConfig, MemorySink, VirtualBus, WatchEntry};
//!
//! let bus = VirtualBus::new("vcan0");
//! let client = CanClient::new(
//!     vec![WatchEntry::new(0x100, "speed"), WatchEntry::new(0x200, "rpm")],
//!     LoggerConfig::new().with_periods(1000, 10_000),
//!     None,
//! )
//! .unwrap();
//!
//! client.rebind(bus.connect()).unwrap();
//! client.start().unwrap();
//! client.start_logging(Box::new(MemorySink::new())).unwrap();
//!
//! // ... frames arrive on the bus ...
//!
//! client.shutdown();
//! ```

// Public modules
pub mod batch;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod listener;
pub mod publish;
pub mod registry;
pub mod sink;
pub mod snapshot;
pub mod types;
pub mod watcher;

// Re-export main types for convenience
pub use batch::{BatchBuffer, BatchLogger};
pub use channel::{ChannelBinding, VirtualBus, VirtualChannel};
pub use client::{CanClient, ClientStatus, WatchedStatus};
pub use config::{Job, LoggerConfig, WatchEntry};
pub use dispatch::{EngineState, FrameHandler, StopOutcome};
pub use listener::{ListenerEngine, ListenerJob};
pub use publish::{LogPublisher, PublishError, PublishSink};
pub use registry::WatchRegistry;
pub use sink::{CsvFileSink, MemorySink, NullSink, Sink};
pub use snapshot::{MessageRecord, SnapshotRow, SnapshotStore};
pub use types::{
    format_payload, CanFrame, ConfigError, LoggerError, Result, Timestamp, TransportError,
};
pub use watcher::{WatchReport, WatcherEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: ensure we can build a client without a channel
        let client = CanClient::new(vec![WatchEntry::new(1, "speed")], LoggerConfig::new(), None).unwrap();
        assert_eq!(client.registry().len(), 1);
        assert_eq!(client.status().listener, EngineState::Stopped);
    }
}
