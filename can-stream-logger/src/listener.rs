//! Listener engine
//!
//! Binds the dispatch loop to a channel and feeds every inbound frame into
//! the snapshot store, then into the job handler (log or publish), then into
//! any extra handlers registered by the caller.

use crate::channel::ChannelBinding;
use crate::config::{Job, LoggerConfig};
use crate::dispatch::{DispatchLoop, EngineState, FrameHandler, StopOutcome};
use crate::publish::PublishSink;
use crate::registry::WatchRegistry;
use crate::snapshot::SnapshotStore;
use crate::types::{CanFrame, LoggerError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Job of the listener, fixed at construction
#[derive(Clone)]
pub enum ListenerJob {
    /// Record every frame through the log facade
    Log,
    /// Forward watched frames to a publish sink
    Publish(Arc<dyn PublishSink>),
}

impl ListenerJob {
    pub fn kind(&self) -> Job {
        match self {
            ListenerJob::Log => Job::Log,
            ListenerJob::Publish(_) => Job::Publish,
        }
    }
}

struct StoreUpdate {
    store: Arc<SnapshotStore>,
}

impl FrameHandler for StoreUpdate {
    fn handle(&self, frame: &CanFrame) {
        if self.store.update(frame.can_id, &frame.data, frame.timestamp) {
            log::debug!("Updating watched CAN message: {}", frame);
        }
    }
}

struct LogJob;

impl FrameHandler for LogJob {
    fn handle(&self, frame: &CanFrame) {
        log::info!("{}", frame);
    }
}

struct PublishJob {
    registry: Arc<WatchRegistry>,
    publisher: Arc<dyn PublishSink>,
    topic_prefix: String,
}

impl FrameHandler for PublishJob {
    fn handle(&self, frame: &CanFrame) {
        let Some(description) = self.registry.description(frame.can_id) else {
            return;
        };
        let topic = format!("{}{}", self.topic_prefix, description);
        if let Err(e) = self.publisher.publish(&topic, &frame.data) {
            log::warn!("{}", e);
        }
    }
}

/// Owner of the listener's dispatch loop and its channel binding
pub struct ListenerEngine {
    store: Arc<SnapshotStore>,
    job: ListenerJob,
    topic_prefix: String,
    restart_on_rebind: bool,
    channel: Mutex<Option<Arc<dyn ChannelBinding>>>,
    extra_handlers: Mutex<Vec<Arc<dyn FrameHandler>>>,
    dispatch: DispatchLoop,
    /// Serialises start, stop and rebind
    control: Mutex<()>,
}

impl ListenerEngine {
    pub fn new(store: Arc<SnapshotStore>, job: ListenerJob, config: &LoggerConfig) -> Self {
        Self {
            store,
            job,
            topic_prefix: config.topic_prefix.clone(),
            restart_on_rebind: config.restart_on_rebind,
            channel: Mutex::new(None),
            extra_handlers: Mutex::new(Vec::new()),
            dispatch: DispatchLoop::new("listener", config.poll_interval(), config.stop_timeout()),
            control: Mutex::new(()),
        }
    }

    /// Builder method: bind a channel before the first start
    pub fn with_channel(self, channel: Arc<dyn ChannelBinding>) -> Self {
        *self.channel.lock() = Some(channel);
        self
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn job(&self) -> Job {
        self.job.kind()
    }

    pub fn state(&self) -> EngineState {
        self.dispatch.state()
    }

    pub fn is_running(&self) -> bool {
        self.dispatch.is_running()
    }

    /// Frames processed by every loop this engine has run
    pub fn frames_processed(&self) -> u64 {
        self.dispatch.dispatched()
    }

    pub fn live_loops(&self) -> usize {
        self.dispatch.live_loops()
    }

    pub fn channel(&self) -> Option<Arc<dyn ChannelBinding>> {
        self.channel.lock().clone()
    }

    /// Register an additional handler, applied after the job from the next start on
    pub fn add_handler(&self, handler: Arc<dyn FrameHandler>) {
        self.extra_handlers.lock().push(handler);
    }

    /// Start the dispatch loop, replacing a running one
    pub fn start(&self) -> Result<()> {
        let _control = self.control.lock();
        self.start_locked()
    }

    /// Stop the dispatch loop and wait for it to exit
    pub fn stop(&self) -> Result<StopOutcome> {
        let _control = self.control.lock();
        self.dispatch.stop()
    }

    /// Stop-then-start
    pub fn restart(&self) -> Result<()> {
        let _control = self.control.lock();
        if let Err(e) = self.dispatch.stop() {
            log::warn!("{}", e);
        }
        self.start_locked()
    }

    /// Swap the bound channel
    ///
    /// A running listener is stopped, rebound and restarted. A stopped one is
    /// only rebound, unless `restart_on_rebind` is set.
    pub fn set_channel(&self, channel: Arc<dyn ChannelBinding>) -> Result<()> {
        let _control = self.control.lock();
        let was_running = self.dispatch.is_running();
        if was_running {
            if let Err(e) = self.dispatch.stop() {
                log::warn!("{}", e);
            }
        }

        log::info!("Listener bound to {}", channel.name());
        *self.channel.lock() = Some(channel);

        if was_running || self.restart_on_rebind {
            self.start_locked()?;
        }
        Ok(())
    }

    /// Transmit a frame on the bound channel
    pub fn send(&self, frame: &CanFrame) -> Result<()> {
        let channel = self.channel().ok_or(LoggerError::NotConfigured("channel"))?;
        channel.send(frame).map_err(|e| {
            log::error!("Error while sending a CAN message: {}", e);
            LoggerError::from(e)
        })
    }

    fn start_locked(&self) -> Result<()> {
        let Some(channel) = self.channel() else {
            log::warn!("Listener has no channel, must set one first");
            return Err(LoggerError::NotConfigured("channel"));
        };

        let mut handlers: Vec<Arc<dyn FrameHandler>> = vec![Arc::new(StoreUpdate {
            store: Arc::clone(&self.store),
        })];
        match &self.job {
            ListenerJob::Log => handlers.push(Arc::new(LogJob)),
            ListenerJob::Publish(publisher) => handlers.push(Arc::new(PublishJob {
                registry: Arc::clone(self.store.registry()),
                publisher: Arc::clone(publisher),
                topic_prefix: self.topic_prefix.clone(),
            })),
        }
        handlers.extend(self.extra_handlers.lock().iter().cloned());

        log::info!("Starting the listener loop on {} (job: {})", channel.name(), self.job.kind());
        self.dispatch.start(channel, handlers)
    }
}
