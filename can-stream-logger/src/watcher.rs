//! Watcher engine
//!
//! A second, independent dispatch loop whose only job is to count frames and
//! time them. It has its own channel binding, so it can observe a bus without
//! the listener or the batch logger being involved.

use crate::channel::ChannelBinding;
use crate::config::LoggerConfig;
use crate::dispatch::{DispatchLoop, EngineState, FrameHandler, StopOutcome};
use crate::types::{CanFrame, LoggerError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters as of the last handled frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WatchReport {
    /// Frames seen since the last start
    pub count: u64,
    /// Time from start to the last frame, in seconds
    pub elapsed_secs: f64,
    /// Frames per second between the first and the last frame
    pub throughput: f64,
}

#[derive(Debug, Default)]
struct WatchStats {
    count: u64,
    started_at: Option<Instant>,
    first_frame_at: Option<Instant>,
    last_frame_at: Option<Instant>,
}

impl WatchStats {
    fn elapsed(&self) -> Duration {
        match (self.started_at, self.last_frame_at) {
            (Some(start), Some(last)) => last.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    fn throughput(&self) -> f64 {
        match (self.first_frame_at, self.last_frame_at) {
            (Some(first), Some(last)) => {
                let span = last.saturating_duration_since(first).as_secs_f64();
                if span > 0.0 {
                    self.count.saturating_sub(1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

struct FrameCounter {
    stats: Arc<Mutex<WatchStats>>,
    report_every: u64,
}

impl FrameHandler for FrameCounter {
    fn handle(&self, _frame: &CanFrame) {
        let now = Instant::now();
        let mut stats = self.stats.lock();
        stats.count += 1;
        stats.first_frame_at.get_or_insert(now);
        stats.last_frame_at = Some(now);

        if self.report_every > 0 && stats.count % self.report_every == 0 {
            log::info!(
                "# of messages received: {} in {:.4} secs",
                stats.count,
                stats.elapsed().as_secs_f64()
            );
        }
    }
}

/// Frame counting loop with its own lifecycle
pub struct WatcherEngine {
    channel: Mutex<Option<Arc<dyn ChannelBinding>>>,
    stats: Arc<Mutex<WatchStats>>,
    report_every: u64,
    dispatch: DispatchLoop,
    control: Mutex<()>,
}

impl WatcherEngine {
    pub fn new(config: &LoggerConfig) -> Self {
        Self {
            channel: Mutex::new(None),
            stats: Arc::new(Mutex::new(WatchStats::default())),
            report_every: config.watcher_report_every,
            dispatch: DispatchLoop::new("watcher", config.poll_interval(), config.stop_timeout()),
            control: Mutex::new(()),
        }
    }

    /// Builder method: bind a channel before the first start
    pub fn with_channel(self, channel: Arc<dyn ChannelBinding>) -> Self {
        *self.channel.lock() = Some(channel);
        self
    }

    pub fn state(&self) -> EngineState {
        self.dispatch.state()
    }

    pub fn is_running(&self) -> bool {
        self.dispatch.is_running()
    }

    pub fn live_loops(&self) -> usize {
        self.dispatch.live_loops()
    }

    pub fn channel(&self) -> Option<Arc<dyn ChannelBinding>> {
        self.channel.lock().clone()
    }

    /// Frames counted since the last start
    pub fn count(&self) -> u64 {
        self.stats.lock().count
    }

    /// Time from the last start to the last counted frame
    pub fn elapsed(&self) -> Duration {
        self.stats.lock().elapsed()
    }

    /// Frames per second between the first and the last counted frame
    pub fn throughput(&self) -> f64 {
        self.stats.lock().throughput()
    }

    pub fn report(&self) -> WatchReport {
        let stats = self.stats.lock();
        WatchReport {
            count: stats.count,
            elapsed_secs: stats.elapsed().as_secs_f64(),
            throughput: stats.throughput(),
        }
    }

    /// Reset the counters and start counting, replacing a running loop
    pub fn start(&self) -> Result<()> {
        let _control = self.control.lock();
        self.start_locked()
    }

    pub fn stop(&self) -> Result<StopOutcome> {
        let _control = self.control.lock();
        let outcome = self.dispatch.stop()?;
        if outcome == StopOutcome::Stopped {
            let report = self.report();
            log::info!(
                "Watcher stopped. # of messages received: {} in {:.4} secs",
                report.count,
                report.elapsed_secs
            );
        }
        Ok(outcome)
    }

    /// Swap the bound channel; a running watcher is restarted on the new one
    pub fn set_channel(&self, channel: Arc<dyn ChannelBinding>) -> Result<()> {
        let _control = self.control.lock();
        let was_running = self.dispatch.is_running();
        if was_running {
            if let Err(e) = self.dispatch.stop() {
                log::warn!("{}", e);
            }
        }

        log::info!("Watcher bound to {}", channel.name());
        *self.channel.lock() = Some(channel);

        if was_running {
            self.start_locked()?;
        }
        Ok(())
    }

    fn start_locked(&self) -> Result<()> {
        let Some(channel) = self.channel() else {
            log::warn!("Watcher has no channel, must set one first");
            return Err(LoggerError::NotConfigured("channel"));
        };

        // the previous loop must be gone before the counters are reset
        if let Err(e) = self.dispatch.stop() {
            log::warn!("{}", e);
        }
        *self.stats.lock() = WatchStats {
            started_at: Some(Instant::now()),
            ..WatchStats::default()
        };

        log::info!("Starting the watcher loop on {}", channel.name());
        let counter: Arc<dyn FrameHandler> = Arc::new(FrameCounter {
            stats: Arc::clone(&self.stats),
            report_every: self.report_every,
        });
        self.dispatch.start(channel, vec![counter])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::VirtualBus;
    use std::thread;

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

    fn config() -> LoggerConfig {
        LoggerConfig::new().with_poll_interval(5).with_watcher_report_every(2)
    }

    #[test]
    fn test_counts_frames() {
        let bus = VirtualBus::new("vcan0");
        let watcher = WatcherEngine::new(&config()).with_channel(bus.connect());
        assert_eq!(watcher.count(), 0);
        assert_eq!(watcher.elapsed(), Duration::ZERO);

        watcher.start().unwrap();
        for id in 0..5 {
            bus.inject(CanFrame::new(id, vec![]));
            thread::sleep(Duration::from_millis(2));
        }
        assert!(wait_for(|| watcher.count() == 5));
        assert!(watcher.elapsed() > Duration::ZERO);
        assert!(watcher.throughput() > 0.0);

        assert_eq!(watcher.stop().unwrap(), StopOutcome::Stopped);
        // counters stay readable after stop
        assert_eq!(watcher.report().count, 5);
    }

    #[test]
    fn test_restart_resets_counters() {
        let bus = VirtualBus::new("vcan0");
        let watcher = WatcherEngine::new(&config()).with_channel(bus.connect());
        watcher.start().unwrap();
        bus.inject(CanFrame::new(1, vec![]));
        assert!(wait_for(|| watcher.count() == 1));

        watcher.start().unwrap();
        assert_eq!(watcher.count(), 0);
        assert_eq!(watcher.live_loops(), 1);
        watcher.stop().unwrap();
    }

    #[test]
    fn test_stop_when_stopped() {
        let watcher = WatcherEngine::new(&config());
        assert_eq!(watcher.stop().unwrap(), StopOutcome::NothingRunning);
        assert!(matches!(watcher.start(), Err(LoggerError::NotConfigured(_))));
    }

    #[test]
    fn test_single_frame_has_no_throughput() {
        let bus = VirtualBus::new("vcan0");
        let watcher = WatcherEngine::new(&config()).with_channel(bus.connect());
        watcher.start().unwrap();
        bus.inject(CanFrame::new(1, vec![]));
        assert!(wait_for(|| watcher.count() == 1));
        assert_eq!(watcher.throughput(), 0.0);
        watcher.stop().unwrap();
    }
}
