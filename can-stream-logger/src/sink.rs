//! Row sinks
//!
//! A sink is the durable destination of snapshot batches. The batch logger
//! writes the header once per session, then whole batches, then closes it.

use crate::snapshot::SnapshotRow;
use crate::types::format_payload;
use chrono::SecondsFormat;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Append-only row writer
pub trait Sink: Send {
    /// Short name used in log lines
    fn describe(&self) -> String;

    fn write_header(&mut self, columns: &[String]) -> io::Result<()>;

    fn write_rows(&mut self, rows: &[SnapshotRow]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

fn closed_error(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("{} is closed", what))
}

/// Quote a CSV field if it contains a separator, a quote or a line break
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Render one snapshot row as a CSV line (without the line terminator)
pub fn csv_line(row: &SnapshotRow) -> String {
    let mut fields = Vec::with_capacity(row.values.len() + 1);
    fields.push(row.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
    for value in &row.values {
        fields.push(value.as_deref().map(format_payload).unwrap_or_default());
    }
    fields.join(",")
}

/// CSV file sink, typically on removable media
pub struct CsvFileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl CsvFileSink {
    /// Create (truncate) the target file
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self::from_file(path, file))
    }

    /// Create the target file, failing with `AlreadyExists` if it is there
    pub fn create_new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        log::info!("{:?} will be used to store the log", path);
        Self {
            path,
            writer: Some(BufWriter::new(file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        let path = &self.path;
        self.writer
            .as_mut()
            .ok_or_else(|| closed_error(&path.display().to_string()))
    }
}

impl Sink for CsvFileSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn write_header(&mut self, columns: &[String]) -> io::Result<()> {
        let line = columns
            .iter()
            .map(|column| csv_field(column))
            .collect::<Vec<_>>()
            .join(",");
        let writer = self.writer()?;
        writeln!(writer, "{}", line)?;
        writer.flush()
    }

    fn write_rows(&mut self, rows: &[SnapshotRow]) -> io::Result<()> {
        let writer = self.writer()?;
        for row in rows {
            writeln!(writer, "{}", csv_line(row))?;
        }
        writer.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Sink for NullSink {
    fn describe(&self) -> String {
        "null sink".to_string()
    }

    fn write_header(&mut self, _columns: &[String]) -> io::Result<()> {
        Ok(())
    }

    fn write_rows(&mut self, _rows: &[SnapshotRow]) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    header: Option<Vec<String>>,
    header_calls: usize,
    batches: Vec<Vec<SnapshotRow>>,
    closed: bool,
    fail_writes: bool,
}

/// In-memory sink; clones share the same storage so a test can keep a handle
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following header/row write fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn header(&self) -> Option<Vec<String>> {
        self.state.lock().header.clone()
    }

    pub fn header_calls(&self) -> usize {
        self.state.lock().header_calls
    }

    /// Every `write_rows` call, one entry per call
    pub fn batches(&self) -> Vec<Vec<SnapshotRow>> {
        self.state.lock().batches.clone()
    }

    /// All rows written, flattened
    pub fn rows(&self) -> Vec<SnapshotRow> {
        self.state.lock().batches.iter().flatten().cloned().collect()
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().batches.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Sink for MemorySink {
    fn describe(&self) -> String {
        "memory sink".to_string()
    }

    fn write_header(&mut self, columns: &[String]) -> io::Result<()> {
        let mut state = self.state.lock();
        state.header_calls += 1;
        if state.closed {
            return Err(closed_error("memory sink"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected header failure"));
        }
        state.header = Some(columns.to_vec());
        Ok(())
    }

    fn write_rows(&mut self, rows: &[SnapshotRow]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error("memory sink"));
        }
        // failed calls are recorded too, so tests can count attempts
        state.batches.push(rows.to_vec());
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
