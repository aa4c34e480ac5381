//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Binary data log persistence."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Append-only binary log of register changes.
//!
//! A log file is a flat sequence of self-delimiting, checksummed records
//! without any header. Writers only append whole chunks; readers stop at the
//! first zero category byte, truncated record or checksum failure.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing log files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be represented in the log format.
    #[error("record encoding error: {0}")]
    Codec(#[from] record::LogCodecError),
    /// The write queue is full and the record was rejected.
    #[error("write queue full ({capacity} records)")]
    QueueOverflow {
        /// Configured queue bound.
        capacity: usize,
    },
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub mod metrics;
pub mod queue;
pub mod reader;
pub mod record;
pub mod replay;
pub mod writer;

pub use metrics::DataLogMetrics;
pub use queue::BoundedQueue;
pub use reader::{LogReader, ReadStrategy};
pub use record::{deserialize, serialize, LogCodecError, LogRecord, LogValue, MAX_RECORD_LENGTH};
pub use replay::ValueStore;
pub use writer::{log_file_name, DataLogger, FileSink, LogSink, LogWriter, WriterStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_error_names_capacity() {
        let err = PersistenceError::QueueOverflow { capacity: 8 };
        assert_eq!(format!("{err}"), "write queue full (8 records)");
    }
}
