//! Background dispatch loop with a start/stop lifecycle
//!
//! One [`DispatchLoop`] owns at most one live loop at a time. A live loop is
//! made of two threads:
//!
//! ```text
//! reader thread:  channel.receive(poll) -> queue.send(frame)
//!                                              ↓
//! worker thread:  queue.recv() -> handler[0](frame), handler[1](frame), ...
//! ```
//!
//! Frames are handled in arrival order by the single worker. Stopping sets
//! the stop flag; the reader leaves after at most one poll interval, which
//! drops the queue sender, and the worker exits once it has handled what the
//! reader had already queued. `stop()` joins both threads before returning.

use crate::channel::ChannelBinding;
use crate::types::{CanFrame, LoggerError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A per-frame callback applied by the worker thread
pub trait FrameHandler: Send + Sync {
    fn handle(&self, frame: &CanFrame);
}

impl<F> FrameHandler for F
where
    F: Fn(&CanFrame) + Send + Sync,
{
    fn handle(&self, frame: &CanFrame) {
        self(frame)
    }
}

/// Lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Starting => write!(f, "starting"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Result of a successful `stop()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A live loop was shut down and joined
    Stopped,
    /// Nothing was running; state is unchanged
    NothingRunning,
}

struct RunningLoop {
    stop_flag: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    worker: JoinHandle<()>,
    /// Disconnects when the worker thread exits
    finished: Receiver<()>,
}

/// Owner of one background dispatch loop
pub struct DispatchLoop {
    name: String,
    poll_interval: Duration,
    stop_timeout: Option<Duration>,
    state: AtomicU8,
    running: Mutex<Option<RunningLoop>>,
    dispatched: Arc<AtomicU64>,
    live_loops: Arc<AtomicUsize>,
    loops_started: AtomicU64,
}

impl DispatchLoop {
    pub fn new(name: impl Into<String>, poll_interval: Duration, stop_timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            poll_interval,
            stop_timeout,
            state: AtomicU8::new(EngineState::Stopped as u8),
            running: Mutex::new(None),
            dispatched: Arc::new(AtomicU64::new(0)),
            live_loops: Arc::new(AtomicUsize::new(0)),
            loops_started: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Frames handed to the handlers since this loop owner was created
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Worker threads currently alive (0 or 1 outside of a detached stop)
    pub fn live_loops(&self) -> usize {
        self.live_loops.load(Ordering::Acquire)
    }

    /// Number of loops spawned since creation
    pub fn loops_started(&self) -> u64 {
        self.loops_started.load(Ordering::Acquire)
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Spawn a loop reading `channel` and applying `handlers` in order
    ///
    /// A loop that is already running is stopped first. Returns once the
    /// reader thread is receiving.
    pub fn start(
        &self,
        channel: Arc<dyn ChannelBinding>,
        handlers: Vec<Arc<dyn FrameHandler>>,
    ) -> Result<()> {
        let mut running = self.running.lock();

        if running.is_some() {
            log::info!("A {} loop is already running. Shutting it down..", self.name);
            if let Err(e) = self.shutdown_locked(&mut running) {
                log::warn!("{}", e);
            }
        }

        self.set_state(EngineState::Starting);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (queue_tx, queue_rx) = unbounded::<CanFrame>();
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let (finished_tx, finished_rx) = bounded::<()>(0);

        let reader = {
            let name = self.name.clone();
            let stop_flag = Arc::clone(&stop_flag);
            let poll = self.poll_interval;
            thread::Builder::new()
                .name(format!("{}-reader", self.name))
                .spawn(move || reader_loop(&name, channel, poll, &stop_flag, ready_tx, queue_tx))
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(EngineState::Stopped);
                return Err(LoggerError::Io(e));
            }
        };

        let worker = {
            let name = self.name.clone();
            let dispatched = Arc::clone(&self.dispatched);
            let live_loops = Arc::clone(&self.live_loops);
            // counted from spawn so a caller never observes a started loop as missing
            self.live_loops.fetch_add(1, Ordering::AcqRel);
            thread::Builder::new()
                .name(format!("{}-worker", self.name))
                .spawn(move || {
                    let _finished = finished_tx;
                    worker_loop(&name, queue_rx, &handlers, &dispatched);
                    live_loops.fetch_sub(1, Ordering::AcqRel);
                })
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                self.live_loops.fetch_sub(1, Ordering::AcqRel);
                stop_flag.store(true, Ordering::Release);
                let _ = reader.join();
                self.set_state(EngineState::Stopped);
                return Err(LoggerError::Io(e));
            }
        };

        // Err only if the reader died before signalling, it is then already gone
        let _ = ready_rx.recv();

        *running = Some(RunningLoop {
            stop_flag,
            reader,
            worker,
            finished: finished_rx,
        });
        self.loops_started.fetch_add(1, Ordering::AcqRel);
        self.set_state(EngineState::Running);
        log::info!("{} loop is running", self.name);
        Ok(())
    }

    /// Stop the live loop and wait for its threads to exit
    ///
    /// Stopping a stopped loop is a no-op reported as `NothingRunning`.
    pub fn stop(&self) -> Result<StopOutcome> {
        let mut running = self.running.lock();
        if running.is_none() {
            log::info!("No {} loops are running...", self.name);
            return Ok(StopOutcome::NothingRunning);
        }
        self.shutdown_locked(&mut running)?;
        Ok(StopOutcome::Stopped)
    }

    fn shutdown_locked(&self, slot: &mut Option<RunningLoop>) -> Result<()> {
        let Some(running) = slot.take() else {
            return Ok(());
        };

        self.set_state(EngineState::Stopping);
        log::info!("Shutting down the {} loop...", self.name);
        running.stop_flag.store(true, Ordering::Release);

        let result = match self.stop_timeout {
            None => {
                self.join(running.reader, running.worker);
                Ok(())
            }
            Some(timeout) => match running.finished.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    log::error!(
                        "{} loop is still busy after {:?}, detaching its threads",
                        self.name,
                        timeout
                    );
                    Err(LoggerError::StopTimeout {
                        engine: self.name.clone(),
                        waited_ms: timeout.as_millis() as u64,
                    })
                }
                _ => {
                    self.join(running.reader, running.worker);
                    Ok(())
                }
            },
        };

        self.set_state(EngineState::Stopped);
        log::info!("{} loop is shut down", self.name);
        result
    }

    fn join(&self, reader: JoinHandle<()>, worker: JoinHandle<()>) {
        if reader.join().is_err() {
            log::error!("{} reader thread panicked", self.name);
        }
        if worker.join().is_err() {
            log::error!("{} worker thread panicked", self.name);
        }
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        let mut running = self.running.lock();
        if let Err(e) = self.shutdown_locked(&mut running) {
            log::warn!("{}", e);
        }
    }
}

fn reader_loop(
    name: &str,
    channel: Arc<dyn ChannelBinding>,
    poll: Duration,
    stop_flag: &AtomicBool,
    ready: Sender<()>,
    queue: Sender<CanFrame>,
) {
    log::debug!("{} reader bound to {}", name, channel.name());
    // only frames received after start() are dispatched
    let stale = channel.discard_pending();
    if stale > 0 {
        log::debug!("{} discarded {} frame(s) queued before start", name, stale);
    }
    let _ = ready.send(());

    let mut failing = false;
    while !stop_flag.load(Ordering::Acquire) {
        match channel.receive(poll) {
            Ok(Some(frame)) => {
                failing = false;
                if queue.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => failing = false,
            Err(e) => {
                if failing {
                    log::debug!("{}: receive on {} still failing: {}", name, channel.name(), e);
                } else {
                    log::warn!("{}: receive on {} failed: {}", name, channel.name(), e);
                    failing = true;
                }
                thread::sleep(poll);
            }
        }
    }
    log::debug!("{} reader stopped", name);
}

fn worker_loop(
    name: &str,
    queue: Receiver<CanFrame>,
    handlers: &[Arc<dyn FrameHandler>],
    dispatched: &AtomicU64,
) {
    log::debug!("{} worker started with {} handler(s)", name, handlers.len());
    for frame in queue.iter() {
        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&frame)));
            if outcome.is_err() {
                log::error!("{}: frame handler panicked on 0x{:X}", name, frame.can_id);
            }
        }
        dispatched.fetch_add(1, Ordering::AcqRel);
    }
    log::debug!("{} worker stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::VirtualBus;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn recording() -> (Arc<Mutex<Vec<u32>>>, Arc<dyn FrameHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn FrameHandler> = Arc::new(move |frame: &CanFrame| {
            sink.lock().push(frame.can_id);
        });
        (seen, handler)
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let dispatch = DispatchLoop::new("test", Duration::from_millis(10), None);
        assert_eq!(dispatch.stop().unwrap(), StopOutcome::NothingRunning);
        assert_eq!(dispatch.stop().unwrap(), StopOutcome::NothingRunning);
        assert_eq!(dispatch.state(), EngineState::Stopped);
    }

    #[test]
    fn test_frames_handled_in_order() {
        let bus = VirtualBus::new("vcan0");
        let dispatch = DispatchLoop::new("test", Duration::from_millis(10), None);
        let (seen, handler) = recording();

        dispatch.start(bus.connect(), vec![handler]).unwrap();
        assert_eq!(dispatch.state(), EngineState::Running);

        for id in 0..50 {
            bus.inject(CanFrame::new(id, vec![]));
        }
        assert!(wait_for(|| dispatch.dispatched() == 50));
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());

        assert_eq!(dispatch.stop().unwrap(), StopOutcome::Stopped);
        assert_eq!(dispatch.state(), EngineState::Stopped);
        assert_eq!(dispatch.live_loops(), 0);
    }

    #[test]
    fn test_restart_leaves_one_loop() {
        let bus = VirtualBus::new("vcan0");
        let channel = bus.connect();
        let dispatch = DispatchLoop::new("test", Duration::from_millis(10), None);
        let (seen, handler) = recording();

        dispatch.start(channel.clone(), vec![Arc::clone(&handler)]).unwrap();
        dispatch.start(channel.clone(), vec![handler]).unwrap();
        assert_eq!(dispatch.loops_started(), 2);
        assert_eq!(dispatch.live_loops(), 1);

        for id in 0..20 {
            bus.inject(CanFrame::new(id, vec![]));
        }
        assert!(wait_for(|| dispatch.dispatched() == 20));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.lock().len(), 20);

        dispatch.stop().unwrap();
        assert_eq!(dispatch.live_loops(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_kill_loop() {
        let bus = VirtualBus::new("vcan0");
        let dispatch = DispatchLoop::new("test", Duration::from_millis(10), None);
        let bad: Arc<dyn FrameHandler> = Arc::new(|frame: &CanFrame| {
            if frame.can_id == 1 {
                panic!("boom");
            }
        });
        let (seen, good) = recording();

        dispatch.start(bus.connect(), vec![bad, good]).unwrap();
        bus.inject(CanFrame::new(1, vec![]));
        bus.inject(CanFrame::new(2, vec![]));
        assert!(wait_for(|| dispatch.dispatched() == 2));
        assert_eq!(*seen.lock(), vec![1, 2]);
        dispatch.stop().unwrap();
    }

    #[test]
    fn test_closed_channel_keeps_loop_alive() {
        let bus = VirtualBus::new("vcan0");
        let channel = bus.connect();
        let dispatch = DispatchLoop::new("test", Duration::from_millis(5), None);

        dispatch.start(channel.clone(), Vec::new()).unwrap();
        channel.shutdown();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(dispatch.state(), EngineState::Running);
        assert_eq!(dispatch.stop().unwrap(), StopOutcome::Stopped);
    }

    #[test]
    fn test_frames_queued_before_start_are_dropped() {
        let bus = VirtualBus::new("vcan0");
        let channel = bus.connect();
        let dispatch = DispatchLoop::new("test", Duration::from_millis(5), None);
        let (seen, handler) = recording();

        for id in 0..10 {
            bus.inject(CanFrame::new(id, vec![]));
        }
        dispatch.start(channel.clone(), vec![handler]).unwrap();
        bus.inject(CanFrame::new(0x99, vec![]));
        assert!(wait_for(|| dispatch.dispatched() == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(*seen.lock(), vec![0x99]);
        dispatch.stop().unwrap();
    }

    #[test]
    fn test_stop_waits_for_in_flight_handler() {
        const HANDLER_TIME: Duration = Duration::from_millis(100);

        let bus = VirtualBus::new("vcan0");
        let dispatch = Arc::new(DispatchLoop::new("test", Duration::from_millis(5), None));
        let entered_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow: Arc<dyn FrameHandler> = {
            let entered_at = Arc::clone(&entered_at);
            let finished = Arc::clone(&finished);
            let calls = Arc::clone(&calls);
            Arc::new(move |_: &CanFrame| {
                calls.fetch_add(1, Ordering::SeqCst);
                *entered_at.lock() = Some(Instant::now());
                thread::sleep(HANDLER_TIME);
                finished.store(true, Ordering::SeqCst);
            })
        };

        dispatch.start(bus.connect(), vec![slow]).unwrap();
        bus.inject(CanFrame::new(1, vec![]));
        assert!(wait_for(|| entered_at.lock().is_some()));

        let stopper = {
            let dispatch = Arc::clone(&dispatch);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let outcome = dispatch.stop().unwrap();
                (outcome, Instant::now(), finished.load(Ordering::SeqCst), dispatch.live_loops())
            })
        };
        let (outcome, returned_at, handler_done, live) = stopper.join().unwrap();

        assert_eq!(outcome, StopOutcome::Stopped);
        let entered = entered_at.lock().unwrap();
        assert!(returned_at >= entered + HANDLER_TIME);
        assert!(handler_done);
        assert_eq!(live, 0);
        assert_eq!(dispatch.state(), EngineState::Stopped);

        // nothing is handled once stop has returned
        bus.inject(CanFrame::new(2, vec![]));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bounded_stop_detaches_stuck_handler() {
        let bus = VirtualBus::new("vcan0");
        let dispatch = DispatchLoop::new(
            "test",
            Duration::from_millis(5),
            Some(Duration::from_millis(50)),
        );
        let (release_tx, release_rx) = bounded::<()>(0);
        let stuck: Arc<dyn FrameHandler> = Arc::new(move |_: &CanFrame| {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });

        dispatch.start(bus.connect(), vec![stuck]).unwrap();
        bus.inject(CanFrame::new(7, vec![]));
        assert!(wait_for(|| dispatch.live_loops() == 1));
        thread::sleep(Duration::from_millis(20));

        let err = dispatch.stop().unwrap_err();
        assert!(matches!(err, LoggerError::StopTimeout { waited_ms: 50, .. }));
        assert_eq!(dispatch.state(), EngineState::Stopped);

        drop(release_tx);
        assert!(wait_for(|| dispatch.live_loops() == 0));
    }
}
