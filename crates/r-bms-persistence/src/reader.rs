//! ---
//! bms_section: "03-persistence-logging"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Windowed data log reader."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::record::{deserialize, LogRecord, MAX_RECORD_LENGTH};
use crate::Result;

/// How the reader refills its window between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStrategy {
    /// Seek to the end of the consumed record and re-read a full window.
    Rewind,
    /// Keep a double-size window in memory and only shift it forward once
    /// less than one window of unread bytes remains.
    #[default]
    SlidingWindow,
}

/// Sequential reader over a data log.
///
/// Iteration stops at the first position where no complete valid record
/// starts: a zero-filled region, a truncated final record or corruption.
/// Bytes past the physical end of the source read as zeros.
pub struct LogReader<R> {
    source: R,
    strategy: ReadStrategy,
    window: usize,
    buffer: Vec<u8>,
    cursor: usize,
    loaded: bool,
    offset: u64,
    finished: bool,
}

impl LogReader<File> {
    /// Open a log file with the default window.
    pub fn open(path: &Path, strategy: ReadStrategy) -> Result<Self> {
        Ok(Self::new(File::open(path)?, strategy))
    }
}

impl<R: Read + Seek> LogReader<R> {
    /// Reader whose window fits the largest possible record.
    pub fn new(source: R, strategy: ReadStrategy) -> Self {
        Self::with_window(source, strategy, MAX_RECORD_LENGTH)
    }

    /// Reader with a custom window. Records longer than `window` end the
    /// iteration.
    pub fn with_window(source: R, strategy: ReadStrategy, window: usize) -> Self {
        Self {
            source,
            strategy,
            window: window.max(1),
            buffer: Vec::new(),
            cursor: 0,
            loaded: false,
            offset: 0,
            finished: false,
        }
    }

    /// Byte offset just past the last decoded record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next record, or `None` at the logical end of the log.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if self.finished {
            return Ok(None);
        }
        let (consumed, record) = match self.strategy {
            ReadStrategy::Rewind => {
                self.rewind()?;
                deserialize(&self.buffer)
            }
            ReadStrategy::SlidingWindow => {
                self.slide()?;
                deserialize(&self.buffer[self.cursor..])
            }
        };
        match record {
            Some(record) => {
                self.cursor += consumed;
                self.offset += consumed as u64;
                Ok(Some(record))
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.buffer.resize(self.window, 0);
        self.source.seek(SeekFrom::Start(self.offset))?;
        fill(&mut self.source, &mut self.buffer)
    }

    fn slide(&mut self) -> io::Result<()> {
        if !self.loaded {
            self.buffer.resize(self.window * 2, 0);
            self.loaded = true;
            self.cursor = 0;
            return fill(&mut self.source, &mut self.buffer);
        }
        if self.buffer.len() - self.cursor >= self.window {
            return Ok(());
        }
        let unread = self.buffer.len() - self.cursor;
        self.buffer.copy_within(self.cursor.., 0);
        self.cursor = 0;
        fill(&mut self.source, &mut self.buffer[unread..])
    }
}

impl<R: Read + Seek> Iterator for LogReader<R> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

impl<R> std::fmt::Debug for LogReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("strategy", &self.strategy)
            .field("window", &self.window)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Read until `buffer` is full or the source is exhausted, zero-filling the rest.
fn fill<R: Read>(source: &mut R, buffer: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buffer.len() {
        match source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    buffer[filled..].fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{serialize, LogValue};
    use chrono::{TimeZone, Utc};
    use r_bms_registers::Category;
    use std::io::Cursor;

    fn records(count: usize) -> Vec<LogRecord> {
        (0..count)
            .map(|i| LogRecord {
                time: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
                category: if i % 3 == 0 {
                    Category::BmsSlow
                } else {
                    Category::BmsFast
                },
                values: (0..(i % 4))
                    .map(|v| LogValue {
                        param: v as u8,
                        data: vec![i as u8; v * 7 + 1],
                    })
                    .collect(),
            })
            .collect()
    }

    fn encode(records: &[LogRecord]) -> Vec<u8> {
        records.iter().flat_map(|r| serialize(r).unwrap()).collect()
    }

    fn read_all(bytes: Vec<u8>, strategy: ReadStrategy, window: usize) -> (Vec<LogRecord>, u64) {
        let mut reader = LogReader::with_window(Cursor::new(bytes), strategy, window);
        let decoded = reader.by_ref().map(|r| r.unwrap()).collect();
        (decoded, reader.offset())
    }

    #[test]
    fn both_strategies_agree_with_small_window() {
        let expected = records(40);
        let bytes = encode(&expected);
        for strategy in [ReadStrategy::Rewind, ReadStrategy::SlidingWindow] {
            let (decoded, offset) = read_all(bytes.clone(), strategy, 64);
            assert_eq!(decoded, expected, "{strategy:?}");
            assert_eq!(offset, bytes.len() as u64);
        }
    }

    #[test]
    fn zero_filled_tail_ends_the_log() {
        let expected = records(5);
        let mut bytes = encode(&expected);
        let length = bytes.len();
        bytes.extend(std::iter::repeat(0).take(4096));
        let (decoded, offset) = read_all(bytes, ReadStrategy::SlidingWindow, 128);
        assert_eq!(decoded, expected);
        assert_eq!(offset, length as u64);
    }

    #[test]
    fn truncated_final_record_is_ignored() {
        let expected = records(6);
        let mut bytes = encode(&expected);
        let tail = serialize(&records(8)[7]).unwrap();
        bytes.extend_from_slice(&tail[..tail.len() - 2]);
        for strategy in [ReadStrategy::Rewind, ReadStrategy::SlidingWindow] {
            let (decoded, _) = read_all(bytes.clone(), strategy, 64);
            assert_eq!(decoded, expected, "{strategy:?}");
        }
    }

    #[test]
    fn empty_source_yields_nothing() {
        let (decoded, offset) = read_all(Vec::new(), ReadStrategy::Rewind, MAX_RECORD_LENGTH);
        assert!(decoded.is_empty());
        assert_eq!(offset, 0);
    }
}
