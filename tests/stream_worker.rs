use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kline_ingest::schema::kline::{MarketType, SinkRow};
use kline_ingest::stream::spawn_shards;
use kline_ingest::stream::worker::{StreamWorker, WorkerSettings};
use kline_ingest::writer::KlineSink;
use kline_ingest::ws::{Connector, FrameSource, WsFrame};
use tokio::time::Instant;

enum Step {
    Text(String),
    Wait(Duration),
    Drop,
    Close,
}

/// Hands out one scripted session per connect. Once a script runs out the session
/// stays open without delivering anything.
#[derive(Clone)]
struct FakeConnector {
    origin: Instant,
    sessions: Arc<Mutex<VecDeque<Vec<Step>>>>,
    connects: Arc<Mutex<Vec<(Duration, String)>>>,
}

impl FakeConnector {
    fn new(sessions: Vec<Vec<Step>>) -> Self {
        Self {
            origin: Instant::now(),
            sessions: Arc::new(Mutex::new(sessions.into())),
            connects: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn connect_times(&self) -> Vec<Duration> {
        self.connects.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    fn urls(&self) -> Vec<String> {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .map(|(_, u)| u.clone())
            .collect()
    }
}

struct FakeSource {
    steps: VecDeque<Step>,
}

impl Connector for FakeConnector {
    type Source = FakeSource;

    async fn connect(&self, url: &str) -> anyhow::Result<FakeSource> {
        self.connects
            .lock()
            .unwrap()
            .push((self.origin.elapsed(), url.to_string()));
        let steps = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
        Ok(FakeSource {
            steps: steps.into(),
        })
    }
}

impl FrameSource for FakeSource {
    async fn next_frame(&mut self) -> anyhow::Result<Option<WsFrame>> {
        loop {
            match self.steps.pop_front() {
                Some(Step::Text(text)) => return Ok(Some(WsFrame::Text(text))),
                Some(Step::Wait(d)) => tokio::time::sleep(d).await,
                Some(Step::Drop) => anyhow::bail!("connection reset by peer"),
                Some(Step::Close) => return Ok(None),
                None => std::future::pending::<()>().await,
            }
        }
    }
}

#[derive(Clone, Default)]
struct MemorySink {
    pending: Vec<SinkRow>,
    written: Arc<Mutex<Vec<SinkRow>>>,
    /// Refuse rows once this many are pending.
    cap: Option<usize>,
}

impl MemorySink {
    fn written(&self) -> Vec<SinkRow> {
        self.written.lock().unwrap().clone()
    }
}

impl KlineSink for MemorySink {
    fn write_row(&mut self, row: SinkRow) -> anyhow::Result<()> {
        if self.cap.is_some_and(|cap| self.pending.len() >= cap) {
            anyhow::bail!("buffer full");
        }
        self.pending.push(row);
        Ok(())
    }

    fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.written.lock().unwrap().append(&mut self.pending);
        Ok(())
    }
}

fn kline_event(symbol: &str, open_time: i64, closed: bool) -> Step {
    let stream = format!("{}@kline_1m", symbol.to_ascii_lowercase());
    Step::Text(format!(
        r#"{{"stream":"{stream}","data":{{"e":"kline","E":{e},"s":"{symbol}","k":{{"t":{open_time},"T":{close_time},"s":"{symbol}","i":"1m","o":"1.0","c":"1.5","h":"2.0","l":"0.5","v":"100","n":12,"x":{closed},"q":"150","V":"40","Q":"60"}}}}}}"#,
        e = open_time + 1_000,
        close_time = open_time + 59_999,
    ))
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        market: MarketType::Spot,
        ws_endpoint: "wss://stream.binance.com:9443".to_string(),
        interval: "1m".to_string(),
        table: "spot_klines".to_string(),
        reconnect_delay: Duration::from_secs(5),
        flush_rows: 500,
        flush_interval: Duration::from_secs(5),
        closed_only: false,
        start_delay: Duration::ZERO,
    }
}

fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn malformed_event_keeps_connection() {
    let connector = FakeConnector::new(vec![vec![
        kline_event("BTCUSDT", 0, false),
        Step::Text("{not json".to_string()),
        Step::Text(r#"{"result":null,"id":1}"#.to_string()),
        kline_event("ETHUSDT", 0, true),
        Step::Close,
    ]]);
    let sink = MemorySink::default();
    let mut worker = StreamWorker::new(
        0,
        symbols(&["BTCUSDT", "ETHUSDT"]),
        settings(),
        connector.clone(),
        sink,
    );

    let summary = worker.run_session().await.unwrap();

    assert_eq!(connector.connect_times().len(), 1);
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.written, 2);
    assert_eq!(worker.sink().pending_rows(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_reconnects_once_after_fixed_delay() {
    let connector = FakeConnector::new(vec![
        vec![
            kline_event("BTCUSDT", 0, true),
            Step::Wait(Duration::from_secs(2)),
            Step::Drop,
        ],
        vec![kline_event("BTCUSDT", 60_000, false)],
    ]);
    let sink = MemorySink::default();
    let worker = StreamWorker::new(
        0,
        symbols(&["BTCUSDT"]),
        settings(),
        connector.clone(),
        sink.clone(),
    );

    let handle = tokio::spawn(worker.run());
    tokio::time::sleep(Duration::from_secs(60)).await;

    // dropped at 2s, back at 2s + 5s, then the second session stays up
    assert_eq!(
        connector.connect_times(),
        vec![Duration::ZERO, Duration::from_secs(7)]
    );
    // the forced flush at the reconnect boundary wrote the first row
    let written = sink.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].kline.open_time, 0);
    assert_eq!(written[0].measurement, "spot_klines");

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn clean_close_also_reconnects() {
    let connector = FakeConnector::new(vec![vec![Step::Close], vec![Step::Close]]);
    let worker = StreamWorker::new(
        0,
        symbols(&["BTCUSDT"]),
        settings(),
        connector.clone(),
        MemorySink::default(),
    );

    let handle = tokio::spawn(worker.run());
    tokio::time::sleep(Duration::from_secs(12)).await;

    assert_eq!(
        connector.connect_times(),
        vec![
            Duration::ZERO,
            Duration::from_secs(5),
            Duration::from_secs(10)
        ]
    );
    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn rejected_rows_keep_connection() {
    let connector = FakeConnector::new(vec![vec![
        kline_event("BTCUSDT", 0, true),
        kline_event("BTCUSDT", 60_000, true),
        kline_event("BTCUSDT", 120_000, true),
        Step::Close,
    ]]);
    let sink = MemorySink {
        cap: Some(1),
        ..MemorySink::default()
    };
    let mut worker = StreamWorker::new(
        0,
        symbols(&["BTCUSDT"]),
        settings(),
        connector.clone(),
        sink,
    );

    let summary = worker.run_session().await.unwrap();

    assert_eq!(connector.connect_times().len(), 1);
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.written, 1);
    assert_eq!(summary.rejected, 2);
    assert_eq!(worker.sink().pending_rows(), 1);
}

#[tokio::test(start_paused = true)]
async fn closed_only_skips_open_candles() {
    let connector = FakeConnector::new(vec![vec![
        kline_event("BTCUSDT", 0, false),
        kline_event("BTCUSDT", 0, true),
        Step::Close,
    ]]);
    let mut cfg = settings();
    cfg.closed_only = true;
    let mut worker = StreamWorker::new(
        0,
        symbols(&["BTCUSDT"]),
        cfg,
        connector,
        MemorySink::default(),
    );

    let summary = worker.run_session().await.unwrap();

    assert_eq!(summary.written, 1);
    assert_eq!(summary.skipped_open, 1);
}

#[tokio::test(start_paused = true)]
async fn flushes_on_row_count() {
    let connector = FakeConnector::new(vec![vec![
        kline_event("BTCUSDT", 0, true),
        kline_event("BTCUSDT", 60_000, true),
        kline_event("BTCUSDT", 120_000, false),
        Step::Close,
    ]]);
    let mut cfg = settings();
    cfg.flush_rows = 2;
    let sink = MemorySink::default();
    let mut worker = StreamWorker::new(0, symbols(&["BTCUSDT"]), cfg, connector, sink.clone());

    worker.run_session().await.unwrap();

    assert_eq!(sink.written().len(), 2);
    assert_eq!(worker.sink().pending_rows(), 1);
}

#[tokio::test(start_paused = true)]
async fn flushes_on_interval() {
    let connector = FakeConnector::new(vec![vec![
        kline_event("BTCUSDT", 0, false),
        Step::Wait(Duration::from_secs(6)),
        kline_event("BTCUSDT", 0, true),
        Step::Close,
    ]]);
    let sink = MemorySink::default();
    let mut worker = StreamWorker::new(
        0,
        symbols(&["BTCUSDT"]),
        settings(),
        connector,
        sink.clone(),
    );

    worker.run_session().await.unwrap();

    assert_eq!(sink.written().len(), 2);
    assert_eq!(worker.sink().pending_rows(), 0);
}

#[tokio::test(start_paused = true)]
async fn shards_split_symbols_and_stagger() {
    let names: Vec<String> = (0..12).map(|i| format!("SYM{i:02}USDT")).collect();
    let connector = FakeConnector::new(Vec::new());
    let mut sinks = 0;

    let shards = spawn_shards(
        &names,
        5,
        Duration::from_secs(1),
        &settings(),
        connector.clone(),
        |_| {
            sinks += 1;
            Ok(MemorySink::default())
        },
    )
    .unwrap();
    assert_eq!(shards.len(), 3);
    assert_eq!(sinks, 3);

    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut times = connector.connect_times();
    times.sort();
    assert_eq!(
        times,
        vec![
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(2)
        ]
    );
    let mut urls = connector.urls();
    urls.sort();
    assert!(urls[0].ends_with(
        "/stream?streams=sym00usdt@kline_1m/sym01usdt@kline_1m/sym02usdt@kline_1m/sym03usdt@kline_1m/sym04usdt@kline_1m"
    ));
    assert!(urls[2].ends_with("sym10usdt@kline_1m/sym11usdt@kline_1m"));

    shards.shutdown().await;
}
