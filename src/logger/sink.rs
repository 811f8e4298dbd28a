//! Log sinks: a file sink with a batched background writer, and an
//! in-memory sink for tests and short sessions.
//!
//! The file sink serializes each record as one JSON line (UTF-8,
//! LF-terminated), optionally gzip-compressed. Writes flow through a bounded
//! queue drained by a single background thread with a 1-second poll;
//! `close()` drains the queue and joins the worker with a bounded wait.
//! Write failures degrade to a `[PSN-SINK]` stderr note — logging must never
//! crash the control loop.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;

use crate::core::errors::{PsnError, Result};
use crate::logger::intervention::{InterventionRecord, LoggerConfig};

/// Capacity of the batch queue between the hot path and the writer thread.
const QUEUE_CAPACITY: usize = 1024;

/// Poll interval of the background writer.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A destination for intervention records. Implementations must tolerate
/// concurrent writers and guarantee durability of accepted records on
/// `close`.
pub trait LogSink: Send + Sync {
    fn write(&self, record: InterventionRecord);
    fn flush(&self);
    fn close(&self) -> Result<()>;
}

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn write(&self, record: InterventionRecord) {
        (**self).write(record);
    }
    fn flush(&self) {
        (**self).flush();
    }
    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

// ──────────────────── file sink ────────────────────

/// JSONL file sink with asynchronous batched writes.
pub struct FileSink {
    path: PathBuf,
    buffer_size: usize,
    drain_timeout: Duration,
    buffer: Mutex<Vec<InterventionRecord>>,
    sender: Mutex<Option<Sender<Vec<InterventionRecord>>>>,
    done_rx: Receiver<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileSink {
    /// Spawn the sink and its background writer. The target file is opened
    /// lazily on first write; a `.gz` suffix is appended when compressing.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: &LoggerConfig) -> Self {
        let raw: PathBuf = path.into();
        let path = if config.compress && raw.extension().is_none_or(|e| e != "gz") {
            let mut name = raw.into_os_string();
            name.push(".gz");
            PathBuf::from(name)
        } else {
            raw
        };

        let (tx, rx) = bounded::<Vec<InterventionRecord>>(QUEUE_CAPACITY);
        let (done_tx, done_rx) = bounded::<()>(1);
        let worker_path = path.clone();
        let compress = config.compress;
        let worker = std::thread::Builder::new()
            .name("psn-log-writer".to_string())
            .spawn(move || {
                writer_loop(&rx, &worker_path, compress);
                let _ = done_tx.send(());
            })
            .expect("spawn log writer thread");

        Self {
            path,
            buffer_size: config.buffer_size.max(1),
            drain_timeout: Duration::from_secs(config.drain_timeout_seconds.max(1)),
            buffer: Mutex::new(Vec::new()),
            sender: Mutex::new(Some(tx)),
            done_rx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The resolved log path (including any `.gz` suffix).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn enqueue(&self, batch: Vec<InterventionRecord>) {
        if batch.is_empty() {
            return;
        }
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            eprintln!("[PSN-SINK] write after close; {} records dropped", batch.len());
            return;
        };
        // Bounded: a full queue briefly backpressures, then drops with a
        // stderr note rather than stalling the control loop.
        if let Err(err) = sender.send_timeout(batch, POLL_INTERVAL) {
            let dropped = match err {
                crossbeam_channel::SendTimeoutError::Timeout(b)
                | crossbeam_channel::SendTimeoutError::Disconnected(b) => b.len(),
            };
            eprintln!("[PSN-SINK] queue unavailable; {dropped} records dropped");
        }
    }
}

impl LogSink for FileSink {
    fn write(&self, record: InterventionRecord) {
        let batch = {
            let mut buffer = self.buffer.lock();
            buffer.push(record);
            if buffer.len() >= self.buffer_size {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.enqueue(batch);
        }
    }

    fn flush(&self) {
        let batch = std::mem::take(&mut *self.buffer.lock());
        self.enqueue(batch);
    }

    /// Flush buffered records, drop the queue sender so the worker drains
    /// and exits, then join it with the configured bounded wait.
    fn close(&self) -> Result<()> {
        self.flush();
        drop(self.sender.lock().take());

        let Some(worker) = self.worker.lock().take() else {
            return Ok(()); // already closed
        };
        match self.done_rx.recv_timeout(self.drain_timeout) {
            Ok(()) => {
                let _ = worker.join();
                Ok(())
            }
            Err(_) => Err(PsnError::Timeout {
                component: "file_sink_drain",
                seconds: self.drain_timeout.as_secs(),
            }),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn writer_loop(rx: &Receiver<Vec<InterventionRecord>>, path: &Path, compress: bool) {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(batch) => write_batch(path, compress, &batch),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn write_batch(path: &Path, compress: bool, batch: &[InterventionRecord]) {
    if let Err(err) = try_write_batch(path, compress, batch) {
        eprintln!(
            "[PSN-SINK] batch write failed ({count} records): {err}",
            count = batch.len()
        );
    }
}

fn try_write_batch(path: &Path, compress: bool, batch: &[InterventionRecord]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| PsnError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| PsnError::io(path, source))?;

    if compress {
        // Each batch is its own gzip member; readers use a multi-member
        // decoder.
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        write_lines(&mut encoder, path, batch)?;
        let writer = encoder
            .finish()
            .map_err(|source| PsnError::io(path, source))?;
        writer
            .into_inner()
            .map_err(|e| PsnError::io(path, e.into_error()))?;
    } else {
        let mut writer = BufWriter::new(file);
        write_lines(&mut writer, path, batch)?;
        writer.flush().map_err(|source| PsnError::io(path, source))?;
    }
    Ok(())
}

fn write_lines<W: Write>(
    writer: &mut W,
    path: &Path,
    batch: &[InterventionRecord],
) -> Result<()> {
    for record in batch {
        let line = serde_json::to_string(record)?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(|source| PsnError::io(path, source))?;
    }
    Ok(())
}

/// Open a log file for reading, transparently gunzipping `.gz` paths.
pub(crate) fn open_log_reader(path: &Path) -> Result<Box<dyn std::io::Read>> {
    let file = File::open(path).map_err(|source| PsnError::io(path, source))?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(flate2::read::MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

// ──────────────────── memory sink ────────────────────

/// Bounded in-memory sink for tests and short sessions.
pub struct MemorySink {
    max_records: usize,
    records: Mutex<Vec<InterventionRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the stored records.
    #[must_use]
    pub fn records(&self) -> Vec<InterventionRecord> {
        self.records.lock().clone()
    }
}

impl LogSink for MemorySink {
    fn write(&self, record: InterventionRecord) {
        let mut records = self.records.lock();
        records.push(record);
        if records.len() > self.max_records {
            records.remove(0);
        }
    }

    fn flush(&self) {}

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ──────────────────── tests ────────────────────
