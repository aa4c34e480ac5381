//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Change-only data logger and chunked log writer."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_bms_common::{CancellationToken, DataLogConfig};
use r_bms_registers::{Category, RegisterSnapshot, Subscriber, UpdateEvent};
use tracing::{debug, error, info, warn};

use crate::metrics::DataLogMetrics;
use crate::queue::BoundedQueue;
use crate::record::{serialize_into, LogRecord, LogValue};
use crate::{PersistenceError, Result};

const SHUTDOWN_ATTEMPTS: usize = 3;

/// File name of a data log started at `started`.
pub fn log_file_name(prefix: &str, started: DateTime<Utc>) -> String {
    format!("{prefix}_{}.bin", started.format("%Y-%m-%d_%H-%M-%S"))
}

/// Producer side of the data log.
///
/// Subscribed to the poller and the bridge. Keeps the last value written per
/// `(category, param)` and enqueues one record per event holding only the
/// values that changed. Never blocks the publishing thread.
pub struct DataLogger {
    queue: Arc<BoundedQueue<LogRecord>>,
    last_written: Mutex<HashMap<(Category, u8), Box<[u8]>>>,
    metrics: Option<DataLogMetrics>,
    dropped: AtomicU64,
}

impl DataLogger {
    /// Create a logger whose queue holds at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(BoundedQueue::new(capacity)),
            last_written: Mutex::new(HashMap::new()),
            metrics: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach Prometheus counters.
    pub fn with_metrics(mut self, metrics: DataLogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue drained by the [`LogWriter`].
    pub fn queue(&self) -> Arc<BoundedQueue<LogRecord>> {
        Arc::clone(&self.queue)
    }

    /// Records rejected so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue a record with the values of `snapshot` that changed since the
    /// last accepted record of `category`. Returns the number of changed
    /// values.
    ///
    /// A record is enqueued even when nothing changed so that readers can
    /// recover timing. When the queue is full the record is rejected and the
    /// category's history is forgotten, so the next accepted record carries
    /// every value again.
    pub fn set_data(
        &self,
        time: DateTime<Utc>,
        category: Category,
        snapshot: &RegisterSnapshot,
    ) -> Result<usize> {
        let mut last_written = self.last_written.lock();
        let mut values = Vec::new();
        for (param, data) in snapshot.iter() {
            let key = (category, param);
            if last_written.get(&key).map(|previous| &**previous) != Some(data) {
                last_written.insert(key, data.into());
                values.push(LogValue {
                    param,
                    data: data.to_vec(),
                });
            }
        }
        let changed = values.len();

        match self.queue.try_push(LogRecord {
            time,
            category,
            values,
        }) {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_enqueued(category);
                }
                Ok(changed)
            }
            Err(_) => {
                last_written.retain(|(known, _), _| *known != category);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_dropped(category);
                }
                Err(PersistenceError::QueueOverflow {
                    capacity: self.queue.capacity(),
                })
            }
        }
    }
}

impl Subscriber for DataLogger {
    fn on_update(&self, event: &UpdateEvent) {
        if let Err(err) = self.set_data(event.timestamp, event.category, &event.snapshot) {
            warn!(category = %event.category, error = %err, "data log record dropped");
        }
    }

    fn name(&self) -> &str {
        "datalog"
    }
}

impl std::fmt::Debug for DataLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLogger")
            .field("queue", &self.queue)
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

/// Storage the writer commits whole chunks to.
pub trait LogSink: Send {
    /// Append `bytes` completely or fail. After a failure the sink must not
    /// contain a partial copy of `bytes` once the next write succeeds.
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Force committed data to stable storage.
    fn sync(&mut self) -> io::Result<()>;

    /// Human readable location for logs.
    fn describe(&self) -> String;
}

/// Log file opened on first write.
///
/// After a failed write the handle is dropped. The next write reopens the
/// file and truncates it back to the last committed length, discarding
/// whatever part of the failed chunk reached the disk.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    committed: u64,
    opened: bool,
}

impl FileSink {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            committed: 0,
            opened: false,
        }
    }

    /// Sink for a new log in `config.directory`, named after `started`.
    pub fn for_config(config: &DataLogConfig, started: DateTime<Utc>) -> Self {
        Self::new(
            config
                .directory
                .join(log_file_name(&config.file_prefix, started)),
        )
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes known to be in the file.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    fn file(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => self.open()?,
        };
        Ok(self.file.insert(file))
    }

    fn open(&mut self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;
        if self.opened {
            file.set_len(self.committed)?;
            debug!(path = %self.path.display(), committed = self.committed, "data log reopened");
        } else {
            self.committed = file.metadata()?.len();
            self.opened = true;
            info!(path = %self.path.display(), "data log opened");
        }
        file.seek(SeekFrom::Start(self.committed))?;
        Ok(file)
    }
}

impl LogSink for FileSink {
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        let result = self.file().and_then(|file| file.write_all(bytes));
        match result {
            Ok(()) => {
                self.committed += bytes.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.file = None;
                Err(err)
            }
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Counters returned when the writer thread stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Records serialized into the buffer.
    pub records: u64,
    /// Records that could not be encoded.
    pub rejected: u64,
    /// Bytes committed to the sink.
    pub bytes: u64,
    /// Successful chunk writes, including the final partial one.
    pub chunks: u64,
    /// Failed chunk writes.
    pub failures: u64,
}

/// Consumer side of the data log. Runs on its own thread.
pub struct LogWriter<S> {
    sink: S,
    chunk_size: usize,
    buffer: Vec<u8>,
    failure_backoff: Duration,
    retry_at: Option<Instant>,
    metrics: Option<DataLogMetrics>,
    stats: WriterStats,
}

impl<S: LogSink> LogWriter<S> {
    /// Writer committing `chunk_size` bytes at a time to `sink`.
    pub fn new(sink: S, chunk_size: usize, failure_backoff: Duration) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            sink,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size * 2),
            failure_backoff,
            retry_at: None,
            metrics: None,
            stats: WriterStats::default(),
        }
    }

    /// Writer using the chunk size and backoff of `config`.
    pub fn from_config(sink: S, config: &DataLogConfig) -> Self {
        Self::new(sink, config.chunk_size, config.failure_backoff)
    }

    /// Attach Prometheus counters.
    pub fn with_metrics(mut self, metrics: DataLogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bytes waiting for the next chunk boundary.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drain `queue` until `cancel` fires and the queue is empty, then flush
    /// the remainder and sync the sink.
    pub fn run(
        mut self,
        queue: Arc<BoundedQueue<LogRecord>>,
        cancel: &CancellationToken,
    ) -> Result<WriterStats> {
        {
            let queue = Arc::clone(&queue);
            cancel.on_cancel(move || queue.wake());
        }
        info!(
            sink = %self.sink.describe(),
            chunk_size = self.chunk_size,
            "data log writer started"
        );

        while let Some(record) = queue.pop_wait(cancel) {
            self.append(&record);
            self.flush_full_chunks(cancel);
        }
        self.finish()
    }

    /// Serialize one record into the buffer.
    pub fn append(&mut self, record: &LogRecord) {
        match serialize_into(record, &mut self.buffer) {
            Ok(_) => {
                self.stats.records += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_written();
                }
            }
            Err(err) => {
                self.stats.rejected += 1;
                warn!(category = %record.category, error = %err, "record skipped");
            }
        }
    }

    /// Commit whole chunks while the buffer holds at least one.
    ///
    /// After a failure the writer keeps dequeuing while the buffer has room
    /// and retries once the backoff elapsed. With a full buffer it stops and
    /// waits out the backoff instead, so the queue bound limits memory.
    pub fn flush_full_chunks(&mut self, cancel: &CancellationToken) {
        while self.buffer.len() >= self.chunk_size {
            if let Some(retry_at) = self.retry_at {
                if !self.is_full() {
                    if Instant::now() < retry_at {
                        return;
                    }
                } else if cancel.wait_until(retry_at) {
                    return;
                }
            }
            if self.write_front(self.chunk_size).is_err() && cancel.is_cancelled() {
                return;
            }
        }
    }

    fn is_full(&self) -> bool {
        self.buffer.len() >= self.chunk_size * 2
    }

    fn write_front(&mut self, length: usize) -> io::Result<()> {
        match self.sink.write_chunk(&self.buffer[..length]) {
            Ok(()) => {
                self.buffer.drain(..length);
                self.retry_at = None;
                self.stats.bytes += length as u64;
                self.stats.chunks += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.bytes_written(length);
                }
                Ok(())
            }
            Err(err) => {
                self.retry_at = Some(Instant::now() + self.failure_backoff);
                self.stats.failures += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.write_failed();
                }
                warn!(
                    sink = %self.sink.describe(),
                    pending = self.buffer.len(),
                    error = %err,
                    "data log write failed"
                );
                Err(err)
            }
        }
    }

    fn finish(mut self) -> Result<WriterStats> {
        let mut failures = 0;
        while !self.buffer.is_empty() {
            let length = self.buffer.len().min(self.chunk_size);
            if let Err(err) = self.write_front(length) {
                failures += 1;
                if failures >= SHUTDOWN_ATTEMPTS {
                    error!(
                        sink = %self.sink.describe(),
                        lost = self.buffer.len(),
                        "giving up on final data log flush"
                    );
                    return Err(err.into());
                }
                thread::sleep(self.failure_backoff);
            }
        }
        self.sink.sync()?;
        info!(
            records = self.stats.records,
            bytes = self.stats.bytes,
            failures = self.stats.failures,
            "data log writer stopped"
        );
        Ok(self.stats)
    }
}

impl<S: LogSink> std::fmt::Debug for LogWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("sink", &self.sink.describe())
            .field("chunk_size", &self.chunk_size)
            .field("pending", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
