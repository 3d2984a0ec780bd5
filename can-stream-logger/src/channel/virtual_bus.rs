//! In-process virtual CAN bus
//!
//! Every endpoint connected to a [`VirtualBus`] receives the frames sent by
//! the other endpoints (never its own) and every frame injected through
//! [`VirtualBus::inject`]. Used by the simulator and by the test suite in
//! place of hardware.
//!
//! Each endpoint buffers at most [`RX_QUEUE_DEPTH`] frames. Frames arriving
//! at a full endpoint are dropped for that endpoint only, like a CAN
//! controller whose receive FIFO overflows.

use super::ChannelBinding;
use crate::types::{CanFrame, TransportError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receive buffer size of one endpoint, in frames
pub const RX_QUEUE_DEPTH: usize = 1024;

struct BusInner {
    name: String,
    next_endpoint: AtomicU64,
    endpoints: Mutex<Vec<(u64, Sender<CanFrame>)>>,
}

/// Shared broadcast medium; cloning yields another handle to the same bus
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

impl VirtualBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                next_endpoint: AtomicU64::new(0),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach a new endpoint to the bus
    pub fn connect(&self) -> Arc<VirtualChannel> {
        let id = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = bounded(RX_QUEUE_DEPTH);
        self.inner.endpoints.lock().push((id, sender));
        log::debug!("Endpoint #{} connected to virtual bus '{}'", id, self.inner.name);

        Arc::new(VirtualChannel {
            endpoint: id,
            name: format!("{}#{}", self.inner.name, id),
            bus: self.clone(),
            receiver,
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver `frame` to every connected endpoint, as if sent by hardware
    ///
    /// Returns the number of endpoints that received it.
    pub fn inject(&self, frame: CanFrame) -> usize {
        self.deliver(None, frame)
    }

    /// Number of endpoints currently attached
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.lock().len()
    }

    fn deliver(&self, origin: Option<u64>, frame: CanFrame) -> usize {
        let endpoints = self.inner.endpoints.lock();
        let mut delivered = 0;
        for (id, sender) in endpoints.iter() {
            if Some(*id) == origin {
                continue;
            }
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::trace!("Endpoint #{} overflowed, dropping 0x{:X}", id, frame.can_id);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        delivered
    }

    fn disconnect(&self, endpoint: u64) {
        let mut endpoints = self.inner.endpoints.lock();
        let before = endpoints.len();
        endpoints.retain(|(id, _)| *id != endpoint);
        if endpoints.len() != before {
            log::debug!(
                "Endpoint #{} disconnected from virtual bus '{}'",
                endpoint,
                self.inner.name
            );
        }
    }
}

/// One endpoint of a [`VirtualBus`]
pub struct VirtualChannel {
    endpoint: u64,
    name: String,
    bus: VirtualBus,
    receiver: Receiver<CanFrame>,
    closed: AtomicBool,
}

impl VirtualChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames waiting to be received by this endpoint
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl ChannelBinding for VirtualChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if frame.dlc() > frame.max_dlc() {
            return Err(TransportError::FrameTooLong {
                can_id: frame.can_id,
                len: frame.dlc(),
                max: frame.max_dlc(),
            });
        }

        let delivered = self.bus.deliver(Some(self.endpoint), frame.clone());
        log::trace!("{} sent 0x{:X} to {} endpoint(s)", self.name, frame.can_id, delivered);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn discard_pending(&self) -> usize {
        self.receiver.try_iter().count()
    }

    fn duplicate(&self) -> Result<Arc<dyn ChannelBinding>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sibling: Arc<dyn ChannelBinding> = self.bus.connect();
        Ok(sibling)
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.bus.disconnect(self.endpoint);
            log::info!("Channel {} is shut down", self.name);
        }
    }
}

impl Drop for VirtualChannel {
    fn drop(&mut self) {
        self.bus.disconnect(self.endpoint);
    }
}
