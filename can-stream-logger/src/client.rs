//! Lifecycle control surface
//!
//! [`CanClient`] wires the registry, snapshot store, listener, watcher and
//! batch logger together and exposes the operations an operator layer needs:
//! start, stop, restart, rebind, watching, logging, sending and status.

use crate::batch::BatchLogger;
use crate::channel::ChannelBinding;
use crate::config::{Job, LoggerConfig, WatchEntry};
use crate::dispatch::{EngineState, FrameHandler, StopOutcome};
use crate::listener::{ListenerEngine, ListenerJob};
use crate::publish::PublishSink;
use crate::registry::WatchRegistry;
use crate::sink::Sink;
use crate::snapshot::{MessageRecord, SnapshotRow, SnapshotStore};
use crate::types::{CanFrame, LoggerError, Result};
use crate::watcher::{WatchReport, WatcherEngine};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Freshness of one watched ID, as reported by [`CanClient::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedStatus {
    pub id: u32,
    pub description: String,
    pub updated: bool,
    pub fresh: bool,
}

impl From<&MessageRecord> for WatchedStatus {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: record.id,
            description: record.description.clone(),
            updated: record.payload.is_some(),
            fresh: record.fresh,
        }
    }
}

/// Point-in-time summary of every engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    pub job: Job,
    pub channel: Option<String>,
    pub listener: EngineState,
    pub frames_processed: u64,
    pub watcher: EngineState,
    pub watch: WatchReport,
    pub logging: bool,
    pub buffered_rows: usize,
    pub rows_written: u64,
    pub sink_failed: bool,
    pub watched: Vec<WatchedStatus>,
}

/// Facade over the listener, watcher and batch logger
pub struct CanClient {
    config: LoggerConfig,
    store: Arc<SnapshotStore>,
    listener: ListenerEngine,
    watcher: WatcherEngine,
    batch: BatchLogger,
}

impl CanClient {
    /// Build every component from the watch list
    ///
    /// `publisher` is required when the configured job is `publish`.
    pub fn new(
        entries: Vec<WatchEntry>,
        config: LoggerConfig,
        publisher: Option<Arc<dyn PublishSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(WatchRegistry::new(entries)?);
        if registry.is_empty() {
            log::warn!("Configuration does not include any CAN messages to watch");
        }
        let store = Arc::new(SnapshotStore::new(registry));

        let job = match (config.job, publisher) {
            (Job::Log, _) => ListenerJob::Log,
            (Job::Publish, Some(publisher)) => ListenerJob::Publish(publisher),
            (Job::Publish, None) => {
                log::warn!("Listener is assigned to publish incoming messages but no publisher is set");
                return Err(LoggerError::NotConfigured("publish sink"));
            }
        };

        Ok(Self {
            listener: ListenerEngine::new(Arc::clone(&store), job, &config),
            watcher: WatcherEngine::new(&config),
            batch: BatchLogger::new(Arc::clone(&store), config.capture_period(), config.flush_period()),
            store,
            config,
        })
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        self.store.registry()
    }

    pub fn listener(&self) -> &ListenerEngine {
        &self.listener
    }

    pub fn watcher(&self) -> &WatcherEngine {
        &self.watcher
    }

    pub fn batch(&self) -> &BatchLogger {
        &self.batch
    }

    /// Register an extra per-frame handler on the listener
    pub fn add_handler(&self, handler: Arc<dyn FrameHandler>) {
        self.listener.add_handler(handler);
    }

    /// Bind the listener to `channel` and the watcher to a sibling of it
    pub fn rebind(&self, channel: Arc<dyn ChannelBinding>) -> Result<()> {
        let sibling = channel.duplicate()?;
        self.listener.set_channel(channel)?;
        self.watcher.set_channel(sibling)
    }

    pub fn start(&self) -> Result<()> {
        self.listener.start()
    }

    pub fn stop(&self) -> Result<StopOutcome> {
        self.listener.stop()
    }

    pub fn restart(&self) -> Result<()> {
        self.listener.restart()
    }

    pub fn start_watching(&self) -> Result<()> {
        self.watcher.start()
    }

    pub fn stop_watching(&self) -> Result<StopOutcome> {
        self.watcher.stop()
    }

    pub fn start_logging(&self, sink: Box<dyn Sink>) -> Result<()> {
        self.batch.start_logging(sink)
    }

    pub fn stop_logging(&self) {
        self.batch.stop_logging()
    }

    /// Send a frame on the listener's channel
    pub fn send_message(&self, can_id: u32, data: &[u8]) -> Result<()> {
        self.listener.send(&CanFrame::new(can_id, data.to_vec()))
    }

    /// Current value of every watched ID
    pub fn snapshot(&self) -> SnapshotRow {
        self.store.snapshot(Utc::now())
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            job: self.listener.job(),
            channel: self.listener.channel().map(|channel| channel.name().to_string()),
            listener: self.listener.state(),
            frames_processed: self.listener.frames_processed(),
            watcher: self.watcher.state(),
            watch: self.watcher.report(),
            logging: self.batch.is_logging(),
            buffered_rows: self.batch.buffered_rows(),
            rows_written: self.batch.rows_written(),
            sink_failed: self.batch.sink_failed(),
            watched: self.store.records().iter().map(WatchedStatus::from).collect(),
        }
    }

    /// Stop logging, watching and listening, then release the channel
    pub fn shutdown(&self) {
        log::info!("Shutting down the CAN client...");
        self.batch.stop_logging();
        if let Err(e) = self.watcher.stop() {
            log::warn!("{}", e);
        }
        if let Err(e) = self.listener.stop() {
            log::warn!("{}", e);
        }
        if let Some(channel) = self.watcher.channel() {
            channel.shutdown();
        }
        if let Some(channel) = self.listener.channel() {
            channel.shutdown();
        }
    }
}
