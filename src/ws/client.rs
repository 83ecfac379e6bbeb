use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderName, HeaderValue};
use tungstenite::Message;
use url::Url;

use super::WsFrame;

const WS_CONNECT_TIMEOUT_SECS: u64 = 10;
const WS_ACTIVE_PING_EVERY_SECS: u64 = 20;
const WS_IDLE_DEAD_SECS: u64 = 90;
const WS_WATCHDOG_TICK_SECS: u64 = 1;

/// A connected stream of data frames.
pub trait FrameSource: Send {
    /// Next text/binary frame. `Ok(None)` means the peer closed the connection;
    /// `Err` is a transport failure. Either ends the session.
    fn next_frame(&mut self) -> impl Future<Output = anyhow::Result<Option<WsFrame>>> + Send;
}

/// Opens sessions. One connector is shared by a worker across reconnects.
pub trait Connector: Send + Sync {
    type Source: FrameSource;

    fn connect(&self, url: &str) -> impl Future<Output = anyhow::Result<Self::Source>> + Send;
}

#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
    ping_every: Duration,
    idle_dead: Duration,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            connect_timeout: Duration::from_secs(WS_CONNECT_TIMEOUT_SECS),
            ping_every: Duration::from_secs(WS_ACTIVE_PING_EVERY_SECS),
            idle_dead: Duration::from_secs(WS_IDLE_DEAD_SECS),
        }
    }
}

impl TungsteniteConnector {
    pub fn new(user_agent: &str) -> Self {
        Self::default().with_header("User-Agent", user_agent)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TungsteniteConnector {
    type Source = WsSession;

    async fn connect(&self, url: &str) -> anyhow::Result<WsSession> {
        let mut request = Url::parse(url)
            .context("parse ws url")?
            .into_client_request()
            .context("build ws request")?;
        for (name, value) in &self.headers {
            request.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes()).context("parse header name")?,
                HeaderValue::from_str(value).context("parse header value")?,
            );
        }

        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .context("connect ws: timeout")?
            .context("connect ws")?;
        let (write, read) = ws.split();

        let mut ping = interval(self.ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately.
        ping.reset();
        let mut watchdog = interval(Duration::from_secs(WS_WATCHDOG_TICK_SECS));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(WsSession {
            write,
            read,
            ping,
            watchdog,
            idle_dead: self.idle_dead,
            last_msg_ts: Instant::now(),
        })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live connection with active ping and an idle watchdog.
pub struct WsSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    ping: Interval,
    watchdog: Interval,
    idle_dead: Duration,
    last_msg_ts: Instant,
}

impl FrameSource for WsSession {
    async fn next_frame(&mut self) -> anyhow::Result<Option<WsFrame>> {
        loop {
            tokio::select! {
                _ = self.ping.tick() => {
                    self.write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("send active ping")?;
                }
                _ = self.watchdog.tick() => {
                    if self.last_msg_ts.elapsed() > self.idle_dead {
                        let _ = self.write.send(Message::Close(None)).await;
                        anyhow::bail!("ws watchdog: idle for >{}s", self.idle_dead.as_secs());
                    }
                }
                next = self.read.next() => {
                    let Some(msg) = next else { return Ok(None) };
                    let msg = msg.context("read ws msg")?;
                    self.last_msg_ts = Instant::now();
                    match msg {
                        Message::Text(text) => return Ok(Some(WsFrame::Text(text))),
                        Message::Binary(bytes) => return Ok(Some(WsFrame::Binary(bytes))),
                        Message::Ping(payload) => {
                            self.write
                                .send(Message::Pong(payload))
                                .await
                                .context("send pong")?;
                        }
                        Message::Pong(_) => {}
                        Message::Close(c) => {
                            if let Some(cf) = c {
                                tracing::warn!("ws closed by server: code={} reason={}", cf.code, cf.reason);
                            } else {
                                tracing::warn!("ws closed by server: (no info)");
                            }
                            return Ok(None);
                        }
                        Message::Frame(_) => {}
                    }
                }
            }
        }
    }
}
