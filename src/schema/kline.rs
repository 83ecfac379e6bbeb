use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    /// USDT-margined perpetual futures.
    Futures,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Futures => "futures",
        }
    }

    pub fn default_rest_endpoint(&self) -> &'static str {
        match self {
            MarketType::Spot => "https://api.binance.com",
            MarketType::Futures => "https://fapi.binance.com",
        }
    }

    pub fn default_ws_endpoint(&self) -> &'static str {
        match self {
            MarketType::Spot => "wss://stream.binance.com:9443",
            MarketType::Futures => "wss://fstream.binance.com",
        }
    }

    pub fn exchange_info_path(&self) -> &'static str {
        match self {
            MarketType::Spot => "/api/v3/exchangeInfo",
            MarketType::Futures => "/fapi/v1/exchangeInfo",
        }
    }

    pub fn klines_path(&self) -> &'static str {
        match self {
            MarketType::Spot => "/api/v3/klines",
            MarketType::Futures => "/fapi/v1/klines",
        }
    }

    pub fn default_table(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot_klines",
            MarketType::Futures => "futures_klines",
        }
    }

    pub fn default_checkpoint_path(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot_progress.json",
            MarketType::Futures => "future_progress.json",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kline row exactly as the REST API returns it.
///
/// Binance encodes klines as positional arrays:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume, trade_count,
///   taker_base_volume, taker_quote_volume, ignore]`
///
/// Decimal columns stay as strings here; [`Kline::try_from`] does the conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKline {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
    pub quote_volume: String,
    pub trade_count: u64,
    pub taker_base_volume: String,
    pub taker_quote_volume: String,
}

impl<'de> Deserialize<'de> for RawKline {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct RawKlineVisitor;

        impl<'de> serde::de::Visitor<'de> for RawKlineVisitor {
            type Value = RawKline;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a kline array with at least 11 elements")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let open_time = next_element(&mut seq, "open_time")?;
                let open = next_element(&mut seq, "open")?;
                let high = next_element(&mut seq, "high")?;
                let low = next_element(&mut seq, "low")?;
                let close = next_element(&mut seq, "close")?;
                let volume = next_element(&mut seq, "volume")?;
                let close_time = next_element(&mut seq, "close_time")?;
                let quote_volume = next_element(&mut seq, "quote_volume")?;
                let trade_count = next_element(&mut seq, "trade_count")?;
                let taker_base_volume = next_element(&mut seq, "taker_base_volume")?;
                let taker_quote_volume = next_element(&mut seq, "taker_quote_volume")?;

                // trailing "ignore" column(s)
                while seq.next_element::<serde::de::IgnoredAny>()?.is_some() {}

                Ok(RawKline {
                    open_time,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    close_time,
                    quote_volume,
                    trade_count,
                    taker_base_volume,
                    taker_quote_volume,
                })
            }
        }

        deserializer.deserialize_seq(RawKlineVisitor)
    }
}

fn next_element<'de, A, T>(seq: &mut A, field: &'static str) -> Result<T, A::Error>
where
    A: serde::de::SeqAccess<'de>,
    T: Deserialize<'de>,
{
    seq.next_element::<T>()?
        .ok_or_else(|| serde::de::Error::missing_field(field))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
    pub quote_volume: Decimal,
    pub trade_count: u64,
    pub taker_base_volume: Decimal,
    pub taker_quote_volume: Decimal,
}

impl TryFrom<&RawKline> for Kline {
    type Error = anyhow::Error;

    fn try_from(raw: &RawKline) -> Result<Self, Self::Error> {
        if raw.open_time > raw.close_time {
            anyhow::bail!(
                "open_time {} after close_time {}",
                raw.open_time,
                raw.close_time
            );
        }
        Ok(Kline {
            open_time: raw.open_time,
            open: parse_decimal("open", &raw.open)?,
            high: parse_decimal("high", &raw.high)?,
            low: parse_decimal("low", &raw.low)?,
            close: parse_decimal("close", &raw.close)?,
            volume: parse_decimal("volume", &raw.volume)?,
            close_time: raw.close_time,
            quote_volume: parse_decimal("quote_volume", &raw.quote_volume)?,
            trade_count: raw.trade_count,
            taker_base_volume: parse_decimal("taker_base_volume", &raw.taker_base_volume)?,
            taker_quote_volume: parse_decimal("taker_quote_volume", &raw.taker_quote_volume)?,
        })
    }
}

pub(crate) fn parse_decimal(field: &str, raw: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str(raw.trim()).with_context(|| format!("parse {field} {raw:?}"))
}

/// A single column value handed to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Decimal(Decimal),
    Int(i64),
    /// Epoch milliseconds; sinks render this in their own timestamp resolution.
    TimestampMs(i64),
}

/// The mapped, written form of a kline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRow {
    pub measurement: String,
    pub symbol: String,
    pub interval: String,
    pub kline: Kline,
}

impl SinkRow {
    pub fn tags(&self) -> [(&'static str, &str); 2] {
        [("symbol", self.symbol.as_str()), ("interval", self.interval.as_str())]
    }

    pub fn fields(&self) -> [(&'static str, FieldValue); 10] {
        let k = &self.kline;
        [
            ("open", FieldValue::Decimal(k.open)),
            ("high", FieldValue::Decimal(k.high)),
            ("low", FieldValue::Decimal(k.low)),
            ("close", FieldValue::Decimal(k.close)),
            ("volume", FieldValue::Decimal(k.volume)),
            ("close_time", FieldValue::TimestampMs(k.close_time)),
            ("quote_volume", FieldValue::Decimal(k.quote_volume)),
            (
                "trades",
                FieldValue::Int(i64::try_from(k.trade_count).unwrap_or(i64::MAX)),
            ),
            ("taker_base_volume", FieldValue::Decimal(k.taker_base_volume)),
            ("taker_quote_volume", FieldValue::Decimal(k.taker_quote_volume)),
        ]
    }

    /// Event timestamp: the candle's open time.
    pub fn timestamp_ms(&self) -> i64 {
        self.kline.open_time
    }

    pub fn timestamp_nanos(&self) -> i64 {
        self.kline.open_time.saturating_mul(1_000_000)
    }
}
