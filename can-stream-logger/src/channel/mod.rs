//! Channel bindings
//!
//! A channel binding is the engines' only view of the transport: a blocking
//! receive with timeout, a send, and a shutdown. Physical reconnection and
//! bus configuration are the caller's business.

use crate::types::{CanFrame, TransportError};
use std::sync::Arc;
use std::time::Duration;

pub mod virtual_bus;

pub use virtual_bus::{VirtualBus, VirtualChannel};

/// Common trait for every transport the engines can be bound to
///
/// Implementations must tolerate `receive` and `send` being called from
/// different threads at the same time.
pub trait ChannelBinding: Send + Sync {
    /// Human readable name used in log lines
    fn name(&self) -> &str;

    /// Transmit one frame
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next frame; `Ok(None)` on timeout
    fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;

    /// Drop every frame received so far but not yet read, returning how many
    fn discard_pending(&self) -> usize;

    /// Open another handle on the same bus that receives its own copy of the traffic
    fn duplicate(&self) -> Result<Arc<dyn ChannelBinding>, TransportError>;

    /// Release the underlying transport; later calls fail with `TransportError::Closed`
    fn shutdown(&self);
}
