//! Cyclic frame simulator
//!
//! Stands in for real ECUs: each configured frame is sent periodically from
//! its own endpoint of the virtual bus until the simulator is stopped.

use crate::config::CyclicFrameConfig;
use anyhow::{Context, Result};
use can_stream_logger::{CanFrame, ChannelBinding, VirtualBus};
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Running set of periodic senders
pub struct Simulator {
    stop_tx: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
    sent: Arc<AtomicU64>,
}

impl Simulator {
    /// Spawn one sender thread per frame
    pub fn start(bus: &VirtualBus, frames: &[CyclicFrameConfig]) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let sent = Arc::new(AtomicU64::new(0));
        let mut simulator = Self {
            stop_tx: Some(stop_tx),
            handles: Vec::with_capacity(frames.len()),
            sent: Arc::clone(&sent),
        };

        for frame in frames {
            let endpoint = bus.connect();
            let stop_rx = stop_rx.clone();
            let sent = Arc::clone(&sent);
            let template = CanFrame::new(frame.id, frame.data.clone());
            let period = Duration::from_millis(frame.period_ms);

            let handle = thread::Builder::new()
                .name(format!("cyclic-{:X}", frame.id))
                .spawn(move || {
                    let ticker = tick(period);
                    loop {
                        select! {
                            recv(stop_rx) -> _ => break,
                            recv(ticker) -> _ => {
                                match endpoint.send(&CanFrame::new(template.can_id, template.data.clone())) {
                                    Ok(()) => {
                                        sent.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        log::warn!("Cyclic send of 0x{:X} failed: {}", template.can_id, e);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    endpoint.shutdown();
                })
                .with_context(|| format!("Failed to spawn cyclic sender for 0x{:X}", frame.id))?;

            log::info!(
                "Sending 0x{:X} [{}] every {}ms",
                frame.id,
                can_stream_logger::format_payload(&frame.data),
                frame.period_ms
            );
            simulator.handles.push(handle);
        }

        Ok(simulator)
    }

    /// Frames sent so far, across all senders
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stop every sender and wait for it
    pub fn stop(&mut self) {
        // dropping the sender disconnects every receiver at once
        if self.stop_tx.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Cyclic sender panicked");
            }
        }
        log::info!("Stopped cyclic send after {} frames", self.frames_sent());
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_simulator_feeds_the_bus() {
        let bus = VirtualBus::new("vcan0");
        let listener = bus.connect();
        let frames = vec![CyclicFrameConfig {
            id: 0x123,
            data: vec![1, 2, 3],
            period_ms: 5,
        }];

        let mut simulator = Simulator::start(&bus, &frames).unwrap();
        let frame = listener
            .receive(Duration::from_secs(2))
            .unwrap()
            .expect("no cyclic frame received");
        assert_eq!(frame.can_id, 0x123);
        assert_eq!(frame.data, vec![1, 2, 3]);

        simulator.stop();
        assert!(simulator.frames_sent() >= 1);
        // only the listener endpoint remains
        assert_eq!(bus.endpoint_count(), 1);
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let bus = VirtualBus::new("vcan0");
        let frames = vec![CyclicFrameConfig {
            id: 0x10,
            data: vec![],
            period_ms: 60_000,
        }];
        let mut simulator = Simulator::start(&bus, &frames).unwrap();

        let started = Instant::now();
        simulator.stop();
        simulator.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(simulator.frames_sent(), 0);
    }
}
