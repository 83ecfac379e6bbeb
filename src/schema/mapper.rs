use rust_decimal::Decimal;
use tracing::warn;

use super::kline::{Kline, RawKline, SinkRow};

/// Inclusive `[start_ms, end_ms]` range a backfill run is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl IngestionWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> anyhow::Result<Self> {
        if start_ms > end_ms {
            anyhow::bail!("ingestion window start {start_ms} is after end {end_ms}");
        }
        Ok(Self { start_ms, end_ms })
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        self.start_ms <= ts_ms && ts_ms <= self.end_ms
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub kept: usize,
    pub out_of_window: usize,
    pub low_volume: usize,
    pub malformed: usize,
}

impl MapStats {
    pub fn dropped(&self) -> usize {
        self.out_of_window + self.low_volume + self.malformed
    }

    pub fn absorb(&mut self, other: MapStats) {
        self.kept += other.kept;
        self.out_of_window += other.out_of_window;
        self.low_volume += other.low_volume;
        self.malformed += other.malformed;
    }
}

/// Filters raw rows and maps the survivors to sink rows for one table.
///
/// Live streams use [`RowMapper::passthrough`]; backfill adds the run's window and,
/// optionally, a volume floor.
#[derive(Debug, Clone)]
pub struct RowMapper {
    measurement: String,
    window: Option<IngestionWindow>,
    volume_threshold: Option<Decimal>,
}

impl RowMapper {
    pub fn passthrough(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            window: None,
            volume_threshold: None,
        }
    }

    pub fn for_backfill(
        measurement: impl Into<String>,
        window: IngestionWindow,
        volume_threshold: Option<Decimal>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            window: Some(window),
            volume_threshold,
        }
    }

    pub fn map_batch(
        &self,
        symbol: &str,
        interval: &str,
        rows: &[RawKline],
    ) -> (Vec<SinkRow>, MapStats) {
        let mut out = Vec::with_capacity(rows.len());
        let mut stats = MapStats::default();
        for raw in rows {
            if let Some(window) = &self.window {
                // Server-side startTime/endTime are not exact at the edges.
                if !window.contains(raw.open_time) {
                    stats.out_of_window += 1;
                    continue;
                }
            }
            let kline = match Kline::try_from(raw) {
                Ok(k) => k,
                Err(err) => {
                    warn!(symbol, open_time = raw.open_time, "drop malformed kline: {err:#}");
                    stats.malformed += 1;
                    continue;
                }
            };
            if let Some(row) = self.map_kline(symbol, interval, kline) {
                out.push(row);
                stats.kept += 1;
            } else {
                stats.low_volume += 1;
            }
        }
        (out, stats)
    }

    /// Maps an already-parsed kline. Returns `None` when the volume floor rejects it.
    pub fn map_kline(&self, symbol: &str, interval: &str, kline: Kline) -> Option<SinkRow> {
        if let Some(threshold) = self.volume_threshold {
            if kline.volume <= threshold {
                return None;
            }
        }
        Some(SinkRow {
            measurement: self.measurement.clone(),
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            kline,
        })
    }
}
