pub mod checkpoint;
pub mod retry;

use std::fmt;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::BackfillOptions;
use crate::exchange::binance_rest::{KlineFetcher, KlineRequest, SymbolCatalog};
use crate::schema::kline::{MarketType, RawKline};
use crate::schema::mapper::{IngestionWindow, MapStats, RowMapper};
use crate::util::time::format_time_str_ms;
use crate::writer::KlineSink;

use self::checkpoint::{Checkpoint, CheckpointStore};
use self::retry::{RetryError, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("list symbols: {0:#}")]
    Catalog(anyhow::Error),
    #[error("checkpoint symbol {symbol} is not in the catalog")]
    CheckpointSymbolMissing { symbol: String },
    #[error("checkpoint: {0:#}")]
    Checkpoint(anyhow::Error),
    #[error("fetch {symbol} from {start_time}: {source}")]
    Fetch {
        symbol: String,
        start_time: i64,
        source: RetryError,
    },
    #[error("sink: {0:#}")]
    Sink(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Catalog symbols ordered before the checkpointed one; already done.
    Skipping,
    /// The checkpointed symbol, continuing from its saved cursor.
    Resuming,
    Active,
    Advancing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Skipping => "skipping",
            Phase::Resuming => "resuming",
            Phase::Active => "active",
            Phase::Advancing => "advancing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a run starts within the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePlan {
    /// Number of leading catalog symbols to skip.
    pub skip: usize,
    /// Start time for the first processed symbol when resuming from a checkpoint.
    pub resume_start: Option<i64>,
}

pub fn plan_resume(
    catalog: &[String],
    checkpoint: Option<&Checkpoint>,
    window: IngestionWindow,
) -> Result<ResumePlan, BackfillError> {
    let Some(cp) = checkpoint else {
        return Ok(ResumePlan {
            skip: 0,
            resume_start: None,
        });
    };
    let idx = catalog
        .iter()
        .position(|s| s == &cp.symbol)
        .ok_or_else(|| BackfillError::CheckpointSymbolMissing {
            symbol: cp.symbol.clone(),
        })?;
    let start = cp
        .timestamp
        .map_or(window.start_ms, |ts| ts.max(window.start_ms));
    Ok(ResumePlan {
        skip: idx,
        resume_start: Some(start),
    })
}

/// Next `startTime` after a batch: the last row's close time plus one millisecond.
pub fn next_page_start(batch: &[RawKline]) -> Option<i64> {
    batch.last().map(|row| row.close_time.saturating_add(1))
}

/// What one driver run covers.
#[derive(Debug, Clone)]
pub struct BackfillJob {
    pub market: MarketType,
    pub interval: String,
    pub table: String,
    pub window: IngestionWindow,
    pub options: BackfillOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub symbols_total: usize,
    pub symbols_skipped: usize,
    pub symbols_processed: usize,
    pub batches: u64,
    pub rows: MapStats,
}

impl BackfillReport {
    pub fn rows_written(&self) -> usize {
        self.rows.kept
    }
}

/// Sequential, resumable backfill for one market.
pub struct BackfillDriver<F, C, S> {
    job: BackfillJob,
    mapper: RowMapper,
    retry: RetryPolicy,
    fetcher: F,
    checkpoints: C,
    sink: S,
}

impl<F, C, S> BackfillDriver<F, C, S>
where
    F: KlineFetcher,
    C: CheckpointStore,
    S: KlineSink,
{
    pub fn new(job: BackfillJob, fetcher: F, checkpoints: C, sink: S) -> Self {
        let mapper = RowMapper::for_backfill(
            job.table.clone(),
            job.window,
            job.options.volume_threshold,
        );
        let retry = RetryPolicy::new(job.options.max_attempts);
        Self {
            job,
            mapper,
            retry,
            fetcher,
            checkpoints,
            sink,
        }
    }

    pub async fn run<K: SymbolCatalog>(
        &mut self,
        catalog: &K,
    ) -> Result<BackfillReport, BackfillError> {
        let symbols = catalog
            .list_symbols(self.job.market)
            .await
            .map_err(BackfillError::Catalog)?;
        self.run_symbols(&symbols).await
    }

    /// Runs over an already-listed catalog, in the given order.
    pub async fn run_symbols(
        &mut self,
        symbols: &[String],
    ) -> Result<BackfillReport, BackfillError> {
        let market = self.job.market;
        let window = self.job.window;
        let checkpoint = self.checkpoints.load().map_err(BackfillError::Checkpoint)?;
        let plan = plan_resume(symbols, checkpoint.as_ref(), window)?;

        let mut report = BackfillReport {
            symbols_total: symbols.len(),
            symbols_skipped: plan.skip,
            ..BackfillReport::default()
        };
        info!(
            %market,
            symbols = symbols.len(),
            window_start = %format_time_str_ms(window.start_ms),
            window_end = %format_time_str_ms(window.end_ms),
            batch_limit = self.job.options.batch_limit,
            "backfill start"
        );
        if let Some(cp) = &checkpoint {
            info!(
                %market,
                phase = %Phase::Skipping,
                skipped = plan.skip,
                symbol = %cp.symbol,
                timestamp = ?cp.timestamp,
                "resuming from checkpoint"
            );
        }

        for (idx, symbol) in symbols.iter().enumerate().skip(plan.skip) {
            let (phase, start) = match plan.resume_start {
                Some(ts) if idx == plan.skip => (Phase::Resuming, ts),
                _ => (Phase::Active, window.start_ms),
            };
            info!(
                %market,
                %symbol,
                %phase,
                start_time = %format_time_str_ms(start),
                "backfill symbol"
            );
            let before = report.rows;
            let batches = match self.backfill_symbol(symbol, start, &mut report).await {
                Ok(batches) => batches,
                Err(err) => {
                    // Rows behind the saved cursor are still buffered; push them before halting.
                    if let Err(flush_err) = self.sink.flush().await {
                        warn!(
                            %market,
                            %symbol,
                            pending = self.sink.pending_rows(),
                            "flush after failed backfill: {flush_err:#}"
                        );
                    }
                    return Err(err);
                }
            };
            self.sink.flush().await.map_err(BackfillError::Sink)?;
            report.symbols_processed += 1;
            info!(
                %market,
                %symbol,
                phase = %Phase::Advancing,
                batches,
                rows = report.rows.kept - before.kept,
                dropped = report.rows.dropped() - before.dropped(),
                progress = %format!("{}/{}", idx + 1, symbols.len()),
                "backfill symbol done"
            );
        }

        self.sink.close().await.map_err(BackfillError::Sink)?;
        info!(
            %market,
            processed = report.symbols_processed,
            skipped = report.symbols_skipped,
            batches = report.batches,
            rows = report.rows.kept,
            out_of_window = report.rows.out_of_window,
            low_volume = report.rows.low_volume,
            malformed = report.rows.malformed,
            "backfill complete"
        );
        Ok(report)
    }

    /// Pages one symbol from `start` to the window end. Returns the number of batches.
    async fn backfill_symbol(
        &mut self,
        symbol: &str,
        start: i64,
        report: &mut BackfillReport,
    ) -> Result<u64, BackfillError> {
        let market = self.job.market;
        let window_end = self.job.window.end_ms;
        let limit = self.job.options.batch_limit;
        let flush_every = u64::from(self.job.options.flush_every_n_batches.max(1));
        let mut start_time = start;
        let mut batches = 0u64;

        while start_time <= window_end {
            let req = KlineRequest {
                symbol: symbol.to_string(),
                interval: self.job.interval.clone(),
                start_time,
                end_time: window_end,
                limit,
            };
            let fetcher = &self.fetcher;
            let req_ref = &req;
            let rows = self
                .retry
                .execute(move || fetcher.fetch(req_ref))
                .await
                .map_err(|source| BackfillError::Fetch {
                    symbol: symbol.to_string(),
                    start_time,
                    source,
                })?;
            let Some(next_start) = next_page_start(&rows) else {
                debug!(%market, symbol, start_time, "no more data");
                break;
            };

            let (mapped, stats) = self.mapper.map_batch(symbol, &self.job.interval, &rows);
            for row in mapped {
                self.sink.write_row(row).map_err(BackfillError::Sink)?;
            }
            batches += 1;
            report.batches += 1;
            report.rows.absorb(stats);
            if batches % flush_every == 0 {
                self.sink.flush().await.map_err(BackfillError::Sink)?;
            }
            // Rows past the window end never move the saved cursor beyond it.
            let cursor = next_start.min(window_end.saturating_add(1));
            self.checkpoints
                .save(symbol, cursor)
                .map_err(BackfillError::Checkpoint)?;
            debug!(
                %market,
                symbol,
                start_time,
                rows = rows.len(),
                kept = stats.kept,
                next_start,
                "batch ingested"
            );

            if rows.len() < limit as usize {
                break;
            }
            if next_start <= start_time {
                warn!(%market, symbol, start_time, next_start, "cursor did not advance, moving on");
                break;
            }
            start_time = next_start;
            if start_time > window_end {
                break;
            }
            sleep(self.job.options.request_delay).await;
        }
        Ok(batches)
    }
}
