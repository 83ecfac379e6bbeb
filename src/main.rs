use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use kline_ingest::backfill::checkpoint::FileCheckpointStore;
use kline_ingest::backfill::{BackfillDriver, BackfillJob};
use kline_ingest::config::{self, Config, MarketConfig};
use kline_ingest::exchange::binance_rest::{BinanceRestClient, SymbolCatalog};
use kline_ingest::stream::{self, worker::WorkerSettings, ShardSet};
use kline_ingest::writer::ConfiguredSink;
use kline_ingest::ws::TungsteniteConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = Config::from_path(&path)?;
    log_config_summary(&cfg);

    let any_backfill = cfg.markets().iter().any(|m| m.backfill.enabled);
    let any_stream = cfg.markets().iter().any(|m| m.stream.enabled);
    if !any_backfill && !any_stream {
        warn!("nothing enabled in {path}; set [spot|futures].backfill.enabled or .stream.enabled");
        return Ok(());
    }

    // Stream startup failures are logged and skipped; they never hold up the backfill.
    let mut shards = ShardSet::default();
    for m in cfg.markets() {
        if !m.stream.enabled {
            continue;
        }
        match BinanceRestClient::new(m.market, m.rest_endpoint(), &cfg.transport) {
            Ok(client) => shards.extend(start_streams(&cfg, m, &client).await),
            Err(err) => error!("{} streams not started: rest client: {err:#}", m.market),
        }
    }

    let backfill_cfg = cfg.clone();
    let mut backfill = tokio::spawn(async move { run_backfills(&backfill_cfg).await });

    let finished = tokio::select! {
        joined = &mut backfill => Some(joined),
        sig = wait_for_shutdown() => {
            sig?;
            None
        }
    };
    match finished {
        Some(joined) => {
            if let Err(err) = joined.context("backfill task")? {
                error!("backfill failed, restart to resume from checkpoint: {err:#}");
                shards.shutdown().await;
                return Err(err);
            }
            if shards.is_empty() {
                info!("backfill finished; no streams configured, exiting");
                return Ok(());
            }
            if any_backfill {
                info!("backfill finished; streams keep running");
            }
            wait_for_shutdown().await?;
        }
        None => {
            info!("shutdown: stopping backfill");
            backfill.abort();
        }
    }

    info!("shutdown: stopping {} stream shards", shards.len());
    shards.shutdown().await;
    Ok(())
}

/// Futures first, then spot; one market at a time so both share one REST budget.
async fn run_backfills(cfg: &Config) -> anyhow::Result<()> {
    for m in cfg.markets() {
        if !m.backfill.enabled {
            continue;
        }
        let client = BinanceRestClient::new(m.market, m.rest_endpoint(), &cfg.transport)
            .with_context(|| format!("{} rest client", m.market))?;
        let job = BackfillJob {
            market: m.market,
            interval: m.interval.clone(),
            table: m.table().to_string(),
            window: m.backfill.window()?,
            options: m.backfill_options(),
        };
        let sink = ConfiguredSink::from_config(&cfg.sink)?;
        let checkpoints = FileCheckpointStore::new(m.checkpoint_path());
        let mut driver = BackfillDriver::new(job, client.clone(), checkpoints, sink);
        let report = driver
            .run(&client)
            .await
            .with_context(|| format!("{} backfill", m.market))?;
        info!(
            "{} backfill done: symbols={} skipped={} processed={} batches={} rows={} dropped={}",
            m.market,
            report.symbols_total,
            report.symbols_skipped,
            report.symbols_processed,
            report.batches,
            report.rows_written(),
            report.rows.dropped()
        );
    }
    Ok(())
}

async fn start_streams<K: SymbolCatalog>(
    cfg: &Config,
    m: &MarketConfig,
    catalog: &K,
) -> ShardSet {
    match spawn_market_streams(cfg, m, catalog).await {
        Ok(shards) => shards,
        Err(err) => {
            error!("{} streams not started: {err:#}", m.market);
            ShardSet::default()
        }
    }
}

async fn spawn_market_streams<K: SymbolCatalog>(
    cfg: &Config,
    m: &MarketConfig,
    catalog: &K,
) -> anyhow::Result<ShardSet> {
    let listed = catalog
        .list_symbols(m.market)
        .await
        .with_context(|| format!("list {} symbols for streams", m.market))?;
    let listed_count = listed.len();
    let filter = m.stream_symbol_filter();
    let symbols = stream::filter_symbols(listed, filter.as_ref());
    if symbols.is_empty() {
        warn!(
            "{} streams: no symbols left after filter (listed={listed_count})",
            m.market
        );
        return Ok(ShardSet::default());
    }
    info!(
        "{} streams: listed={} streaming={} interval={}",
        m.market,
        listed_count,
        symbols.len(),
        m.interval
    );

    let settings = WorkerSettings::from_market(m);
    let connector = TungsteniteConnector::new(&cfg.transport.user_agent)
        .with_connect_timeout(cfg.transport.connect_timeout());
    let sink_cfg = cfg.sink.clone();
    stream::spawn_shards(
        &symbols,
        m.stream.group_size,
        Duration::from_millis(m.stream.connect_stagger_ms),
        &settings,
        connector,
        |_| ConfiguredSink::from_config(&sink_cfg),
    )
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn log_config_summary(cfg: &Config) {
    match cfg.sink.kind {
        config::SinkKind::Questdb => info!(
            "sink: questdb url={} max_buffer_rows={}",
            cfg.sink.questdb_url, cfg.sink.max_buffer_rows
        ),
        config::SinkKind::Jsonl => info!("sink: jsonl dir={}", cfg.sink.jsonl_dir),
    }
    info!(
        "transport: prefer_ipv4={} connect_timeout_secs={} request_timeout_secs={}",
        cfg.transport.prefer_ipv4,
        cfg.transport.connect_timeout_secs,
        cfg.transport.request_timeout_secs
    );

    for m in cfg.markets() {
        if m.backfill.enabled {
            let opts = m.backfill_options();
            info!(
                "backfill: {} enabled rest_endpoint={} table={} interval={} window={}..{} batch_limit={} request_delay_ms={} volume_threshold={} flush_every_n_batches={} max_attempts={} checkpoint={}",
                m.market,
                m.rest_endpoint(),
                m.table(),
                m.interval,
                m.backfill.date_from,
                m.backfill.date_to,
                opts.batch_limit,
                opts.request_delay.as_millis(),
                opts.volume_threshold
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                opts.flush_every_n_batches,
                opts.max_attempts,
                m.checkpoint_path()
            );
        }
        if m.stream.enabled {
            info!(
                "stream: {} enabled ws_endpoint={} table={} interval={} group_size={} reconnect_delay_secs={} connect_stagger_ms={} flush_rows={} flush_interval_secs={} closed_only={} symbol_filter={}",
                m.market,
                m.ws_endpoint(),
                m.table(),
                m.interval,
                m.stream.group_size,
                m.stream.reconnect_delay_secs,
                m.stream.connect_stagger_ms,
                m.stream.flush_rows,
                m.stream.flush_interval_secs,
                m.stream.closed_only,
                m.stream_symbol_filter().is_some()
            );
        }
    }
}
