pub mod ilp;
pub mod jsonl;

use std::fs::create_dir_all;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::{SinkConfig, SinkKind};
use crate::schema::kline::SinkRow;

use self::ilp::IlpHttpSink;
use self::jsonl::JsonlSink;

/// Append-only destination for mapped klines.
///
/// `write_row` only buffers; nothing is durable until `flush` returns `Ok`.
pub trait KlineSink: Send {
    fn write_row(&mut self, row: SinkRow) -> anyhow::Result<()>;

    /// Rows handed to `write_row` and not yet flushed.
    fn pending_rows(&self) -> usize;

    fn flush(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send {
        self.flush()
    }
}

/// The sink selected by `[sink] kind`. Each backfill driver and stream worker owns one.
pub enum ConfiguredSink {
    Questdb(IlpHttpSink),
    Jsonl(JsonlSink),
}

impl ConfiguredSink {
    pub fn from_config(cfg: &SinkConfig) -> anyhow::Result<Self> {
        Ok(match cfg.kind {
            SinkKind::Questdb => ConfiguredSink::Questdb(
                IlpHttpSink::new(&cfg.questdb_url, cfg.max_buffer_rows)
                    .context("build questdb sink")?,
            ),
            SinkKind::Jsonl => ConfiguredSink::Jsonl(
                JsonlSink::new(&cfg.jsonl_dir).context("build jsonl sink")?,
            ),
        })
    }
}

impl KlineSink for ConfiguredSink {
    fn write_row(&mut self, row: SinkRow) -> anyhow::Result<()> {
        match self {
            ConfiguredSink::Questdb(s) => s.write_row(row),
            ConfiguredSink::Jsonl(s) => s.write_row(row),
        }
    }

    fn pending_rows(&self) -> usize {
        match self {
            ConfiguredSink::Questdb(s) => s.pending_rows(),
            ConfiguredSink::Jsonl(s) => s.pending_rows(),
        }
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        match self {
            ConfiguredSink::Questdb(s) => s.flush().await,
            ConfiguredSink::Jsonl(s) => s.flush().await,
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        match self {
            ConfiguredSink::Questdb(s) => s.close().await,
            ConfiguredSink::Jsonl(s) => s.close().await,
        }
    }
}

pub fn table_symbol_dir(base: &Path, table: &str, symbol: &str) -> anyhow::Result<PathBuf> {
    let table = fs_safe_name(table);
    let symbol = fs_safe_name(symbol);
    let dir = base.join(table).join(symbol);
    create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

pub fn fs_safe_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}
