//! Batch logger
//!
//! Two periodic tasks share one buffer:
//! - capture: every `capture_period`, append `store.snapshot(now)` to the buffer
//! - flush: every `flush_period`, hand the whole buffer to the sink in one call
//!
//! Both tasks run on their own thread driven by a `crossbeam_channel::tick`
//! ticker and leave as soon as the session's stop channel is closed.
//!
//! Lock order is sink slot, then buffer. Capture only ever takes the buffer
//! lock, so it never waits on sink I/O; flush drains the buffer while holding
//! the sink slot, which keeps batches in capture order.

use crate::snapshot::{SnapshotRow, SnapshotStore};
use crate::sink::Sink;
use crate::types::Result;
use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Rows captured but not yet flushed
#[derive(Debug, Default)]
pub struct BatchBuffer {
    rows: Mutex<Vec<SnapshotRow>>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one row, returning the new length
    pub fn push(&self, row: SnapshotRow) -> usize {
        let mut rows = self.rows.lock();
        rows.push(row);
        rows.len()
    }

    /// Take every buffered row, leaving the buffer empty
    pub fn drain(&self) -> Vec<SnapshotRow> {
        std::mem::take(&mut *self.rows.lock())
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[derive(Default)]
struct SinkSlot {
    sink: Option<Box<dyn Sink>>,
    /// Set after the first write failure; no write reaches the sink afterwards
    failed: bool,
    rows_written: u64,
    rows_dropped: u64,
}

impl SinkSlot {
    fn accepts_writes(&self) -> bool {
        self.sink.is_some() && !self.failed
    }

    fn mark_failed(&mut self, during: &str, error: std::io::Error) {
        let name = self
            .sink
            .as_ref()
            .map(|sink| sink.describe())
            .unwrap_or_default();
        log::warn!(
            "Error while writing {} to {}: {}. The sink is closed for this session",
            during,
            name,
            error
        );
        self.failed = true;
    }
}

struct Session {
    /// Dropping this closes the stop channel of both tasks
    stop_tx: Sender<()>,
    active: Arc<AtomicBool>,
    capture: JoinHandle<()>,
    flush: JoinHandle<()>,
}

/// Periodic capture of the snapshot store into a sink
pub struct BatchLogger {
    store: Arc<SnapshotStore>,
    capture_period: Duration,
    flush_period: Duration,
    buffer: Arc<BatchBuffer>,
    slot: Arc<Mutex<SinkSlot>>,
    session: Mutex<Option<Session>>,
}

impl BatchLogger {
    pub fn new(store: Arc<SnapshotStore>, capture_period: Duration, flush_period: Duration) -> Self {
        Self {
            store,
            capture_period,
            flush_period,
            buffer: Arc::new(BatchBuffer::new()),
            slot: Arc::new(Mutex::new(SinkSlot::default())),
            session: Mutex::new(None),
        }
    }

    pub fn is_logging(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffer.len()
    }

    /// True once the current session's sink has failed
    pub fn sink_failed(&self) -> bool {
        self.slot.lock().failed
    }

    pub fn rows_written(&self) -> u64 {
        self.slot.lock().rows_written
    }

    /// Rows discarded because the sink had failed
    pub fn rows_dropped(&self) -> u64 {
        self.slot.lock().rows_dropped
    }

    /// Write the header to `sink` and start both periodic tasks
    ///
    /// A running session is stopped (and its sink closed) first.
    pub fn start_logging(&self, sink: Box<dyn Sink>) -> Result<()> {
        let mut session = self.session.lock();
        if let Some(previous) = session.take() {
            log::info!("A logging session is already running. Shutting it down..");
            self.finish_session(previous);
        }

        let columns = self.store.registry().columns()?;
        {
            let mut slot = self.slot.lock();
            *slot = SinkSlot {
                sink: Some(sink),
                ..SinkSlot::default()
            };
            self.buffer.drain();

            let header = slot.sink.as_mut().map(|sink| sink.write_header(&columns));
            if let Some(Err(e)) = header {
                slot.mark_failed("the header", e);
            }
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let active = Arc::new(AtomicBool::new(true));

        let capture = {
            let store = Arc::clone(&self.store);
            let buffer = Arc::clone(&self.buffer);
            spawn_periodic(
                "capture",
                self.capture_period,
                stop_rx.clone(),
                Arc::clone(&active),
                move || {
                    capture_into(&store, &buffer);
                },
            )
        };
        let capture = match capture {
            Ok(handle) => handle,
            Err(e) => {
                self.close_sink();
                return Err(e.into());
            }
        };

        let flush = {
            let buffer = Arc::clone(&self.buffer);
            let slot = Arc::clone(&self.slot);
            spawn_periodic(
                "flush",
                self.flush_period,
                stop_rx,
                Arc::clone(&active),
                move || {
                    flush_into(&slot, &buffer);
                },
            )
        };
        let flush = match flush {
            Ok(handle) => handle,
            Err(e) => {
                active.store(false, Ordering::Release);
                drop(stop_tx);
                let _ = capture.join();
                self.close_sink();
                return Err(e.into());
            }
        };

        log::info!(
            "Logging started: capture every {:?}, flush every {:?}",
            self.capture_period,
            self.flush_period
        );
        *session = Some(Session {
            stop_tx,
            active,
            capture,
            flush,
        });
        Ok(())
    }

    /// Stop both tasks, flush what is left and close the sink
    ///
    /// Stopping without a session is a no-op.
    pub fn stop_logging(&self) {
        let mut session = self.session.lock();
        match session.take() {
            Some(previous) => self.finish_session(previous),
            None => log::info!("No logging session is running..."),
        }
    }

    /// Append one snapshot to the buffer, returning the buffer length
    pub fn capture_now(&self) -> usize {
        capture_into(&self.store, &self.buffer)
    }

    /// Hand the buffered rows to the sink, returning how many were written
    pub fn flush_now(&self) -> usize {
        flush_into(&self.slot, &self.buffer)
    }

    fn finish_session(&self, session: Session) {
        log::info!("Stopping the logging session...");
        session.active.store(false, Ordering::Release);
        drop(session.stop_tx);
        if session.capture.join().is_err() {
            log::error!("capture task panicked");
        }
        if session.flush.join().is_err() {
            log::error!("flush task panicked");
        }

        let written = flush_into(&self.slot, &self.buffer);
        log::debug!("Final flush wrote {} row(s)", written);
        self.close_sink();
    }

    fn close_sink(&self) {
        let mut slot = self.slot.lock();
        if let Some(mut sink) = slot.sink.take() {
            let name = sink.describe();
            match sink.close() {
                Ok(()) => log::info!("Closed {} after {} row(s)", name, slot.rows_written),
                Err(e) => log::warn!("Error while closing {}: {}", name, e),
            }
        }
    }
}

impl Drop for BatchLogger {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().take() {
            self.finish_session(session);
        }
    }
}

fn capture_into(store: &SnapshotStore, buffer: &BatchBuffer) -> usize {
    let len = buffer.push(store.snapshot(Utc::now()));
    log::trace!("Captured snapshot, {} row(s) buffered", len);
    len
}

fn flush_into(slot: &Mutex<SinkSlot>, buffer: &BatchBuffer) -> usize {
    let mut slot = slot.lock();
    let rows = buffer.drain();
    if rows.is_empty() {
        return 0;
    }

    if !slot.accepts_writes() {
        slot.rows_dropped += rows.len() as u64;
        return 0;
    }

    let result = match slot.sink.as_mut() {
        Some(sink) => sink.write_rows(&rows),
        None => return 0,
    };
    match result {
        Ok(()) => {
            slot.rows_written += rows.len() as u64;
            log::debug!("Flushed {} row(s)", rows.len());
            rows.len()
        }
        Err(e) => {
            slot.rows_dropped += rows.len() as u64;
            slot.mark_failed("rows", e);
            0
        }
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    stop_rx: Receiver<()>,
    active: Arc<AtomicBool>,
    mut task: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-task", name))
        .spawn(move || {
            let ticker = tick(period);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if !active.load(Ordering::Acquire) {
                            break;
                        }
                        task();
                    }
                }
            }
            log::debug!("{} task stopped", name);
        })
}
