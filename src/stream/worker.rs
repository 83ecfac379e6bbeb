use std::time::Duration;

use anyhow::Context;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::MarketConfig;
use crate::exchange::binance_kline_ws::{combined_stream_url, parse_kline_event};
use crate::schema::kline::MarketType;
use crate::schema::mapper::RowMapper;
use crate::writer::KlineSink;
use crate::ws::{Connector, FrameSource, WsFrame};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub market: MarketType,
    pub ws_endpoint: String,
    pub interval: String,
    pub table: String,
    pub reconnect_delay: Duration,
    pub flush_rows: usize,
    pub flush_interval: Duration,
    pub closed_only: bool,
    /// Wait before the first connect; lets shards ramp up instead of all at once.
    pub start_delay: Duration,
}

impl WorkerSettings {
    pub fn from_market(cfg: &MarketConfig) -> Self {
        Self {
            market: cfg.market,
            ws_endpoint: cfg.ws_endpoint().to_string(),
            interval: cfg.interval.clone(),
            table: cfg.table().to_string(),
            reconnect_delay: cfg.stream.reconnect_delay(),
            flush_rows: cfg.stream.flush_rows.max(1),
            flush_interval: Duration::from_secs(cfg.stream.flush_interval_secs),
            closed_only: cfg.stream.closed_only,
            start_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    pub written: u64,
    pub skipped_open: u64,
    pub malformed: u64,
    /// Rows the sink refused, e.g. while its buffer is full and flushes keep failing.
    pub rejected: u64,
}

/// Owns one combined-stream connection and its sink.
pub struct StreamWorker<C, S> {
    id: usize,
    symbols: Vec<String>,
    url: String,
    settings: WorkerSettings,
    connector: C,
    sink: S,
    mapper: RowMapper,
    last_flush: Instant,
}

impl<C, S> StreamWorker<C, S>
where
    C: Connector,
    S: KlineSink,
{
    pub fn new(
        id: usize,
        symbols: Vec<String>,
        settings: WorkerSettings,
        connector: C,
        sink: S,
    ) -> Self {
        let url = combined_stream_url(&settings.ws_endpoint, &symbols, &settings.interval);
        let mapper = RowMapper::passthrough(settings.table.clone());
        Self {
            id,
            symbols,
            url,
            settings,
            connector,
            sink,
            mapper,
            last_flush: Instant::now(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Connect and consume frames until the connection drops. Decode failures are
    /// logged and skipped; only connect and transport errors end the session.
    pub async fn run_session(&mut self) -> anyhow::Result<SessionSummary> {
        let mut source = self
            .connector
            .connect(&self.url)
            .await
            .with_context(|| format!("connect {}", self.url))?;
        info!(
            worker = self.id,
            market = %self.settings.market,
            symbols = self.symbols.len(),
            "stream connected"
        );
        self.last_flush = Instant::now();

        let mut summary = SessionSummary::default();
        while let Some(frame) = source.next_frame().await.context("read stream frame")? {
            summary.frames += 1;
            match frame {
                WsFrame::Text(text) => self.handle_text(&text, &mut summary),
                WsFrame::Binary(_) => {}
            }
            self.maybe_flush(false).await;
        }
        Ok(summary)
    }

    fn handle_text(&mut self, text: &str, summary: &mut SessionSummary) {
        let ev = match parse_kline_event(text) {
            Ok(Some(ev)) => ev,
            Ok(None) => return,
            Err(err) => {
                summary.malformed += 1;
                warn!(worker = self.id, "drop malformed kline event: {err:#}");
                return;
            }
        };
        if self.settings.closed_only && !ev.is_closed {
            summary.skipped_open += 1;
            return;
        }
        let Some(row) = self.mapper.map_kline(&ev.symbol, &ev.interval, ev.kline) else {
            return;
        };
        match self.sink.write_row(row) {
            Ok(()) => summary.written += 1,
            Err(err) => {
                summary.rejected += 1;
                if summary.rejected == 1 || summary.rejected % 1000 == 0 {
                    warn!(
                        worker = self.id,
                        symbol = %ev.symbol,
                        rejected = summary.rejected,
                        "write row failed: {err:#}"
                    );
                }
            }
        }
    }

    async fn maybe_flush(&mut self, force: bool) {
        let pending = self.sink.pending_rows();
        if pending == 0 {
            self.last_flush = Instant::now();
            return;
        }
        let due = force
            || pending >= self.settings.flush_rows
            || self.last_flush.elapsed() >= self.settings.flush_interval;
        if !due {
            return;
        }
        if let Err(err) = self.sink.flush().await {
            warn!(worker = self.id, pending, "stream flush failed: {err:#}");
        }
        self.last_flush = Instant::now();
    }

    /// Reconnects forever with a fixed delay. Only task abort stops it.
    pub async fn run(mut self) {
        if !self.settings.start_delay.is_zero() {
            sleep(self.settings.start_delay).await;
        }
        let delay = self.settings.reconnect_delay;
        let mut restarts = 0u64;
        loop {
            let res = self.run_session().await;
            // Reconnect boundary: nothing buffered waits for the next session.
            self.maybe_flush(true).await;
            restarts += 1;
            let throttle = restarts == 1 || restarts % 10 == 0;
            match res {
                Ok(summary) if throttle => warn!(
                    "ws ended ({}): frames={} written={} malformed={} rejected={} delay_secs={} restarts={}",
                    self.url,
                    summary.frames,
                    summary.written,
                    summary.malformed,
                    summary.rejected,
                    delay.as_secs(),
                    restarts
                ),
                Err(err) if throttle => warn!(
                    "ws ended ({}): {err:#} delay_secs={} restarts={}",
                    self.url,
                    delay.as_secs(),
                    restarts
                ),
                Ok(_) => debug!(worker = self.id, restarts, "ws ended"),
                Err(err) => debug!(worker = self.id, restarts, "ws ended: {err:#}"),
            }
            sleep(delay).await;
        }
    }
}
