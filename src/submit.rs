//! Chunked submission of processed rows.
//!
//! Rows are handed to a [`RecordSink`] in fixed-size chunks with a short
//! pause between chunks. A failed chunk is counted and reported; the remaining
//! chunks are still submitted.

use std::{io::Write, thread, time::Duration};

use anyhow::{Context, Result};
use log::{error, info};
use serde::Serialize;

use crate::coerce::ProcessedRow;

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);

pub trait RecordSink {
    /// Stores `rows` in `dataset` and returns how many were accepted.
    fn import_records(&mut self, dataset: &str, rows: &[ProcessedRow]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl ImportStats {
    pub fn percent_complete(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed as f64 / self.total as f64) * 100.0).round() as u8
    }
}

pub fn submit_in_chunks<K, F>(
    sink: &mut K,
    dataset: &str,
    rows: &[ProcessedRow],
    options: SubmitOptions,
    mut progress: F,
) -> ImportStats
where
    K: RecordSink + ?Sized,
    F: FnMut(&ImportStats),
{
    let mut stats = ImportStats {
        total: rows.len(),
        ..ImportStats::default()
    };
    let chunk_size = options.chunk_size.max(1);
    let chunk_count = rows.len().div_ceil(chunk_size);
    for (idx, chunk) in rows.chunks(chunk_size).enumerate() {
        let number = idx + 1;
        match sink.import_records(dataset, chunk) {
            Ok(accepted) => stats.succeeded += accepted,
            Err(err) => {
                error!("Error importing chunk {number}: {err:#}");
                stats.failed += chunk.len();
                stats.errors.push(format!("Chunk {number}: {err:#}"));
            }
        }
        stats.processed += chunk.len();
        progress(&stats);
        if number < chunk_count && !options.chunk_delay.is_zero() {
            thread::sleep(options.chunk_delay);
        }
    }
    info!(
        "Submitted {} row(s) to '{}': {} succeeded, {} failed",
        stats.processed, dataset, stats.succeeded, stats.failed
    );
    stats
}

/// Appends each accepted row as one JSON line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn import_records(&mut self, _dataset: &str, rows: &[ProcessedRow]) -> Result<usize> {
        for row in rows {
            serde_json::to_writer(&mut self.writer, row).context("Serializing processed row")?;
            self.writer.write_all(b"\n").context("Writing processed row")?;
        }
        self.writer.flush().context("Flushing processed rows")?;
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn rows(count: usize) -> Vec<ProcessedRow> {
        (0..count)
            .map(|_| ProcessedRow {
                id: Uuid::new_v4(),
                values: BTreeMap::new(),
            })
            .collect()
    }

    struct FlakySink {
        calls: usize,
        fail_on: usize,
    }

    impl RecordSink for FlakySink {
        fn import_records(&mut self, _dataset: &str, rows: &[ProcessedRow]) -> Result<usize> {
            self.calls += 1;
            if self.calls == self.fail_on {
                bail!("server unavailable");
            }
            Ok(rows.len())
        }
    }

    #[test]
    fn failed_chunks_do_not_stop_the_batch() {
        let mut sink = FlakySink {
            calls: 0,
            fail_on: 2,
        };
        let options = SubmitOptions {
            chunk_size: 3,
            chunk_delay: Duration::ZERO,
        };
        let mut updates = Vec::new();
        let stats = submit_in_chunks(&mut sink, "habits", &rows(7), options, |s| {
            updates.push(s.percent_complete())
        });
        assert_eq!(sink.calls, 3);
        assert_eq!(stats.total, 7);
        assert_eq!(stats.processed, 7);
        assert_eq!(stats.succeeded, 4);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.errors, vec!["Chunk 2: server unavailable".to_string()]);
        assert_eq!(updates, vec![43, 86, 100]);
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_row() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let stats = submit_in_chunks(
            &mut sink,
            "habits",
            &rows(3),
            SubmitOptions::default(),
            |_| {},
        );
        assert_eq!(stats.succeeded, 3);
        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(output.lines().count(), 3);
        assert!(output.lines().all(|line| line.starts_with("{\"id\":")));
    }
}
