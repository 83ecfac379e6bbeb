use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TransportConfig;
use crate::schema::kline::{MarketType, RawKline};

/// Failure of a single kline request, classified by what the caller can do about it.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KlineRequest {
    pub symbol: String,
    pub interval: String,
    #[serde(rename = "startTime")]
    pub start_time: i64,
    #[serde(rename = "endTime")]
    pub end_time: i64,
    pub limit: u32,
}

/// Lists the tradable symbols of a market.
pub trait SymbolCatalog: Send + Sync {
    fn list_symbols(
        &self,
        market: MarketType,
    ) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;
}

/// One bounded kline request. Empty results are `Ok(vec![])`, never an error.
pub trait KlineFetcher: Send + Sync {
    fn fetch(
        &self,
        req: &KlineRequest,
    ) -> impl Future<Output = Result<Vec<RawKline>, FetchError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "contractType")]
    #[serde(default)]
    contract_type: Option<String>,
}

/// Keep spot pairs that are trading and futures contracts that are perpetual.
/// Sorted so catalog order (and therefore checkpoint resume) is stable across runs.
fn tradable_symbols(market: MarketType, info: ExchangeInfo) -> Vec<String> {
    let mut out: Vec<String> = info
        .symbols
        .into_iter()
        .filter(|s| match market {
            MarketType::Spot => s.status.as_deref() == Some("TRADING"),
            MarketType::Futures => s.contract_type.as_deref() == Some("PERPETUAL"),
        })
        .map(|s| s.symbol.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// REST client for one Binance market (spot or USDT-M futures).
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    http: reqwest::Client,
    market: MarketType,
    base: String,
}

impl BinanceRestClient {
    pub fn new(market: MarketType, base: &str, transport: &TransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(transport.connect_timeout())
            .timeout(transport.request_timeout())
            .user_agent(transport.user_agent.clone());
        if transport.prefer_ipv4 {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        let http = builder.build().context("build binance http client")?;
        Ok(Self {
            http,
            market,
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

impl SymbolCatalog for BinanceRestClient {
    async fn list_symbols(&self, market: MarketType) -> anyhow::Result<Vec<String>> {
        if market != self.market {
            anyhow::bail!("client for {} asked for {market} symbols", self.market);
        }
        let url = format!("{}{}", self.base, market.exchange_info_path());
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("{market} exchangeInfo request"))?
            .error_for_status()
            .with_context(|| format!("{market} exchangeInfo status"))?;
        let info: ExchangeInfo = resp
            .json()
            .await
            .with_context(|| format!("{market} exchangeInfo json"))?;
        Ok(tradable_symbols(market, info))
    }
}

impl KlineFetcher for BinanceRestClient {
    async fn fetch(&self, req: &KlineRequest) -> Result<Vec<RawKline>, FetchError> {
        let url = format!("{}{}", self.base, self.market.klines_path());
        let resp = self.http.get(url).query(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            // Binance error bodies look like {"code":-1121,"msg":"Invalid symbol."}
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await?;
        let rows: Vec<RawKline> =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))?;
        debug!(
            symbol = %req.symbol,
            start_time = req.start_time,
            rows = rows.len(),
            "fetched klines"
        );
        Ok(rows)
    }
}
