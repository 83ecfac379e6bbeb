use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{TimeZone, Utc};
use serde::Serialize;
use tracing::debug;

use crate::schema::kline::{Kline, SinkRow};
use crate::util::time::format_time_str_ms;

use super::{table_symbol_dir, KlineSink};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileKey {
    table: String,
    symbol: String,
    day: String,
}

#[derive(Serialize)]
struct JsonlRow<'a> {
    table: &'a str,
    symbol: &'a str,
    interval: &'a str,
    time_str: String,
    #[serde(flatten)]
    kline: &'a Kline,
}

/// Offline sink: `{dir}/{table}/{symbol}/{table}_{symbol}_{YYYYMMDD}.jsonl`, one object per row.
///
/// Days come from the candle's open time (UTC), so backfilled history lands in the
/// file for the day it describes.
pub struct JsonlSink {
    dir: PathBuf,
    writers: HashMap<FileKey, BufWriter<File>>,
    pending: usize,
    write_count: u64,
}

impl JsonlSink {
    pub fn new(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).with_context(|| format!("create output dir {}", dir.display()))?;
        Ok(Self {
            dir,
            writers: HashMap::new(),
            pending: 0,
            write_count: 0,
        })
    }

    pub fn open_file_count(&self) -> usize {
        self.writers.len()
    }

    fn writer_for(&mut self, key: FileKey) -> anyhow::Result<&mut BufWriter<File>> {
        match self.writers.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let key = entry.key();
                let symbol_dir = table_symbol_dir(&self.dir, &key.table, &key.symbol)
                    .context("create table/symbol dir")?;
                let filename = format!(
                    "{}_{}_{}.jsonl",
                    super::fs_safe_name(&key.table),
                    super::fs_safe_name(&key.symbol),
                    key.day
                );
                let path = symbol_dir.join(filename);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("open output file {}", path.display()))?;
                Ok(entry.insert(BufWriter::new(file)))
            }
        }
    }
}

fn day_str(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y%m%d").to_string(),
        None => "00000000".to_string(),
    }
}

impl KlineSink for JsonlSink {
    fn write_row(&mut self, row: SinkRow) -> anyhow::Result<()> {
        let key = FileKey {
            table: row.measurement.clone(),
            symbol: row.symbol.clone(),
            day: day_str(row.timestamp_ms()),
        };
        let line = serde_json::to_string(&JsonlRow {
            table: &row.measurement,
            symbol: &row.symbol,
            interval: &row.interval,
            time_str: format_time_str_ms(row.timestamp_ms()),
            kline: &row.kline,
        })
        .context("serialize kline row")?;
        let writer = self.writer_for(key)?;
        writer.write_all(line.as_bytes()).context("write jsonl")?;
        writer.write_all(b"\n").context("write newline")?;
        self.pending += 1;
        self.write_count += 1;
        Ok(())
    }

    fn pending_rows(&self) -> usize {
        self.pending
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush().context("flush writer")?;
        }
        // Backfill walks day after day; keep only the files touched since the last flush.
        self.writers.clear();
        if self.pending > 0 {
            debug!(
                rows = self.pending,
                total = self.write_count,
                "jsonl flush ok"
            );
        }
        self.pending = 0;
        Ok(())
    }
}
