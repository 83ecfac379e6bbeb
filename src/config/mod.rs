use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::schema::kline::MarketType;
use crate::schema::mapper::IngestionWindow;
use crate::util::time::parse_window_bound_ms;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub spot: MarketConfig,

    #[serde(default)]
    pub futures: MarketConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            transport: TransportConfig::default(),
            spot: MarketConfig::new(MarketType::Spot),
            futures: MarketConfig::new(MarketType::Futures),
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("load {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = toml::from_str(raw).context("parse config toml")?;
        // Market sections are keyed by name; the type is not repeated in the file.
        cfg.spot.market = MarketType::Spot;
        cfg.futures.market = MarketType::Futures;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for m in self.markets() {
            if m.backfill.enabled {
                m.backfill
                    .window()
                    .with_context(|| format!("{}.backfill window", m.market))?;
                if m.backfill_options().batch_limit == 0 {
                    anyhow::bail!("{}.backfill.batch_limit must be > 0", m.market);
                }
                if m.backfill.max_attempts == 0 {
                    anyhow::bail!("{}.backfill.max_attempts must be > 0", m.market);
                }
                let opts = m.backfill_options();
                // Rows between two backfill flushes must fit the questdb buffer.
                let rows_per_flush =
                    u64::from(opts.batch_limit) * u64::from(opts.flush_every_n_batches);
                if matches!(self.sink.kind, SinkKind::Questdb)
                    && rows_per_flush > self.sink.max_buffer_rows as u64
                {
                    anyhow::bail!(
                        "{}.backfill: batch_limit * flush_every_n_batches = {} exceeds sink.max_buffer_rows = {}",
                        m.market,
                        rows_per_flush,
                        self.sink.max_buffer_rows
                    );
                }
            }
            if m.stream.enabled && m.stream.group_size == 0 {
                anyhow::bail!("{}.stream.group_size must be > 0", m.market);
            }
            if m.interval.trim().is_empty() {
                anyhow::bail!("{}.interval must not be empty", m.market);
            }
        }
        if matches!(self.sink.kind, SinkKind::Questdb) && self.sink.questdb_url.trim().is_empty() {
            anyhow::bail!("sink.questdb_url must be set when sink.kind = \"questdb\"");
        }
        Ok(())
    }

    /// Markets in backfill order: futures first, then spot.
    pub fn markets(&self) -> [&MarketConfig; 2] {
        [&self.futures, &self.spot]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Questdb,
    Jsonl,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,

    /// QuestDB HTTP endpoint (ILP is posted to `{questdb_url}/write`).
    #[serde(default = "default_questdb_url")]
    pub questdb_url: String,

    /// Rows kept in memory while QuestDB is unreachable before the buffer is discarded.
    #[serde(default = "default_max_buffer_rows")]
    pub max_buffer_rows: usize,

    #[serde(default = "default_jsonl_dir")]
    pub jsonl_dir: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            questdb_url: default_questdb_url(),
            max_buffer_rows: default_max_buffer_rows(),
            jsonl_dir: default_jsonl_dir(),
        }
    }
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Questdb
}

fn default_questdb_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_max_buffer_rows() -> usize {
    200_000
}

fn default_jsonl_dir() -> String {
    "data".to_string()
}

/// Network behaviour of the REST client, passed in at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Bind outgoing REST connections to 0.0.0.0 so only IPv4 addresses are used.
    #[serde(default)]
    pub prefer_ipv4: bool,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefer_ipv4: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    // Spot WS handshakes without a browser-like UA are occasionally rejected.
    "Mozilla/5.0 (compatible; kline-ingest)".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    #[serde(skip, default = "default_market_type")]
    pub market: MarketType,

    #[serde(default)]
    pub rest_endpoint: Option<String>,

    #[serde(default)]
    pub ws_endpoint: Option<String>,

    /// Destination table; defaults to `spot_klines` / `futures_klines`.
    #[serde(default)]
    pub table: Option<String>,

    #[serde(default = "default_interval")]
    pub interval: String,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self::new(MarketType::Spot)
    }
}

impl MarketConfig {
    pub fn new(market: MarketType) -> Self {
        Self {
            market,
            rest_endpoint: None,
            ws_endpoint: None,
            table: None,
            interval: default_interval(),
            backfill: BackfillConfig::default(),
            stream: StreamConfig::default(),
        }
    }

    /// Paging knobs with per-market defaults filled in.
    ///
    /// Spot serves at most 1000 rows per request; the futures defaults are the
    /// conservative settings that kept the futures backfill clear of 429s.
    pub fn backfill_options(&self) -> BackfillOptions {
        let b = &self.backfill;
        let (batch_limit, request_delay_ms, flush_every) = match self.market {
            MarketType::Spot => (1000, 50, 20),
            MarketType::Futures => (500, 500, 1),
        };
        BackfillOptions {
            batch_limit: b.batch_limit.unwrap_or(batch_limit),
            request_delay: Duration::from_millis(b.request_delay_ms.unwrap_or(request_delay_ms)),
            volume_threshold: b.volume_threshold,
            flush_every_n_batches: b.flush_every_n_batches.unwrap_or(flush_every).max(1),
            max_attempts: b.max_attempts,
        }
    }

    /// Quote-asset filter for live streams. Spot rejects the whole combined-stream
    /// handshake if any symbol in the URL is not streamable, so spot filters by default.
    pub fn stream_symbol_filter(&self) -> Option<SymbolFilter> {
        let quotes = match (&self.stream.quote_suffixes, self.market) {
            (Some(q), _) => q.clone(),
            (None, MarketType::Spot) => ["USDT", "USDC", "BTC", "ETH", "BNB"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            (None, MarketType::Futures) => return None,
        };
        if quotes.is_empty() {
            return None;
        }
        Some(SymbolFilter {
            quote_suffixes: quotes,
            max_len: self.stream.max_symbol_len,
        })
    }

    pub fn rest_endpoint(&self) -> &str {
        self.rest_endpoint
            .as_deref()
            .unwrap_or_else(|| self.market.default_rest_endpoint())
    }

    pub fn ws_endpoint(&self) -> &str {
        self.ws_endpoint
            .as_deref()
            .unwrap_or_else(|| self.market.default_ws_endpoint())
    }

    pub fn table(&self) -> &str {
        self.table
            .as_deref()
            .unwrap_or_else(|| self.market.default_table())
    }

    pub fn checkpoint_path(&self) -> &str {
        self.backfill
            .checkpoint_path
            .as_deref()
            .unwrap_or_else(|| self.market.default_checkpoint_path())
    }
}

fn default_market_type() -> MarketType {
    MarketType::Spot
}

fn default_interval() -> String {
    "1m".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_date_from")]
    pub date_from: String,

    #[serde(default = "default_date_to")]
    pub date_to: String,

    /// Rows requested per REST call (spot serves at most 1000, futures 1500).
    #[serde(default)]
    pub batch_limit: Option<u32>,

    #[serde(default)]
    pub request_delay_ms: Option<u64>,

    /// Only ingest candles with `volume > volume_threshold`.
    #[serde(default)]
    pub volume_threshold: Option<Decimal>,

    #[serde(default)]
    pub flush_every_n_batches: Option<u32>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub checkpoint_path: Option<String>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            date_from: default_date_from(),
            date_to: default_date_to(),
            batch_limit: None,
            request_delay_ms: None,
            volume_threshold: None,
            flush_every_n_batches: None,
            max_attempts: default_max_attempts(),
            checkpoint_path: None,
        }
    }
}

impl BackfillConfig {
    pub fn window(&self) -> anyhow::Result<IngestionWindow> {
        let start = parse_window_bound_ms(&self.date_from, false).context("date_from")?;
        let end = parse_window_bound_ms(&self.date_to, true).context("date_to")?;
        IngestionWindow::new(start, end)
    }
}

/// The knobs that distinguish one backfill variant from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOptions {
    pub batch_limit: u32,
    pub request_delay: Duration,
    pub volume_threshold: Option<Decimal>,
    pub flush_every_n_batches: u32,
    pub max_attempts: u32,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        MarketConfig::new(MarketType::Spot).backfill_options()
    }
}

fn default_date_from() -> String {
    "2023-01-01".to_string()
}

fn default_date_to() -> String {
    "2024-12-31".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Symbols per combined-stream connection.
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Delay between starting consecutive shard connections (ms). 0 connects all at once.
    #[serde(default)]
    pub connect_stagger_ms: u64,

    #[serde(default = "default_flush_rows")]
    pub flush_rows: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Only write candles whose interval has closed (`k.x == true`).
    #[serde(default)]
    pub closed_only: bool,

    /// Restrict to symbols ending in one of these quotes. An empty list disables the
    /// filter; unset means the market default.
    #[serde(default)]
    pub quote_suffixes: Option<Vec<String>>,

    #[serde(default = "default_max_symbol_len")]
    pub max_symbol_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_size: default_group_size(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connect_stagger_ms: 0,
            flush_rows: default_flush_rows(),
            flush_interval_secs: default_flush_interval_secs(),
            closed_only: false,
            quote_suffixes: None,
            max_symbol_len: default_max_symbol_len(),
        }
    }
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn default_group_size() -> usize {
    // Kept small so one bad symbol only takes down a handful of streams.
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_flush_rows() -> usize {
    500
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_max_symbol_len() -> usize {
    12
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolFilter {
    pub quote_suffixes: Vec<String>,
    pub max_len: usize,
}

impl SymbolFilter {
    pub fn allows(&self, symbol: &str) -> bool {
        !symbol.is_empty()
            && symbol.len() <= self.max_len
            && symbol.chars().all(|c| c.is_ascii_alphabetic())
            && self
                .quote_suffixes
                .iter()
                .any(|q| symbol.ends_with(q.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.spot.market, MarketType::Spot);
        assert_eq!(cfg.futures.market, MarketType::Futures);
        assert_eq!(cfg.spot.backfill_options().batch_limit, 1000);
        assert_eq!(cfg.spot.backfill_options().flush_every_n_batches, 20);
        assert_eq!(cfg.futures.backfill_options().batch_limit, 500);
        assert_eq!(
            cfg.futures.backfill_options().request_delay,
            Duration::from_millis(500)
        );
        assert_eq!(cfg.futures.backfill_options().max_attempts, 5);
        assert_eq!(cfg.spot.stream.group_size, 5);
        assert_eq!(cfg.spot.table(), "spot_klines");
        assert_eq!(cfg.futures.ws_endpoint(), "wss://fstream.binance.com");
        assert_eq!(cfg.futures.checkpoint_path(), "future_progress.json");
        assert!(matches!(cfg.sink.kind, SinkKind::Questdb));
    }

    #[test]
    fn market_sections_override() {
        let raw = r#"
            [sink]
            kind = "jsonl"
            jsonl_dir = "/tmp/klines"

            [futures]
            table = "binance_futures_klines"

            [futures.backfill]
            enabled = true
            date_from = "2023-01-01"
            date_to = "2023-01-31"
            volume_threshold = "50000"

            [spot.stream]
            enabled = true
            quote_suffixes = ["USDT", "BTC"]
        "#;
        let cfg = Config::from_toml(raw).unwrap();
        assert!(matches!(cfg.sink.kind, SinkKind::Jsonl));
        assert_eq!(cfg.futures.table(), "binance_futures_klines");
        assert_eq!(
            cfg.futures.backfill.volume_threshold,
            Some(Decimal::from(50_000))
        );
        let window = cfg.futures.backfill.window().unwrap();
        assert_eq!(window.start_ms, 1_672_531_200_000);
        assert_eq!(window.end_ms, 1_675_209_599_999);
        // partial section keeps the futures paging defaults
        assert_eq!(cfg.futures.backfill_options().batch_limit, 500);
        let filter = cfg.spot.stream_symbol_filter().unwrap();
        assert_eq!(filter.quote_suffixes, vec!["USDT", "BTC"]);
        assert!(cfg.futures.stream_symbol_filter().is_none());
    }

    #[test]
    fn spot_symbol_filter() {
        let filter = MarketConfig::new(MarketType::Spot)
            .stream_symbol_filter()
            .unwrap();
        assert!(filter.allows("BTCUSDT"));
        assert!(filter.allows("ETHBTC"));
        assert!(!filter.allows("BTCTRY"));
        assert!(!filter.allows("1000SATSUSDT"));
        assert!(!filter.allows("VERYLONGNAMEUSDT"));
    }

    #[test]
    fn inverted_window_rejected() {
        let raw = r#"
            [spot.backfill]
            enabled = true
            date_from = "2024-01-01"
            date_to = "2023-01-01"
        "#;
        assert!(Config::from_toml(raw).is_err());
    }

    #[test]
    fn backfill_flush_span_must_fit_buffer() {
        let raw = r#"
            [sink]
            max_buffer_rows = 50000

            [spot.backfill]
            enabled = true
            flush_every_n_batches = 250
        "#;
        let err = Config::from_toml(raw).unwrap_err();
        assert!(format!("{err:#}").contains("max_buffer_rows"));

        // jsonl has no in-memory buffer to overflow
        let raw = raw.replace("[sink]", "[sink]\nkind = \"jsonl\"");
        assert!(Config::from_toml(&raw).is_ok());
    }

    #[test]
    fn zero_group_size_rejected() {
        let raw = r#"
            [futures.stream]
            enabled = true
            group_size = 0
        "#;
        assert!(Config::from_toml(raw).is_err());
    }
}
