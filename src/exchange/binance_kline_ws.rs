use anyhow::Context;
use serde_json::Value;

use crate::schema::kline::{parse_decimal, Kline};

/// One decoded `@kline_<interval>` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveKline {
    pub symbol: String,
    pub interval: String,
    pub kline: Kline,
    /// `k.x`: the candle's interval has closed and the values are final.
    pub is_closed: bool,
}

pub fn stream_name(symbol: &str, interval: &str) -> String {
    format!("{}@kline_{interval}", symbol.to_ascii_lowercase())
}

/// Combined-stream URL for a group of symbols:
/// `{base}/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m`.
pub fn combined_stream_url(base: &str, symbols: &[String], interval: &str) -> String {
    let base = base.trim_end_matches('/');
    let streams: Vec<String> = symbols.iter().map(|s| stream_name(s, interval)).collect();
    format!("{base}/stream?streams={}", streams.join("/"))
}

pub fn symbol_from_stream_name(stream_name: &str) -> Option<String> {
    // e.g. "btcusdt@kline_1m"
    let (sym, _) = stream_name.split_once('@')?;
    if sym.is_empty() {
        return None;
    }
    Some(sym.to_ascii_uppercase())
}

pub fn parse_kline_event(text: &str) -> anyhow::Result<Option<LiveKline>> {
    let v: Value = serde_json::from_str(text).context("parse json")?;
    parse_kline_event_value(&v)
}

pub fn parse_kline_event_value(v: &Value) -> anyhow::Result<Option<LiveKline>> {
    let data = unwrap_combined_stream(v);

    // Subscription acks ({"result":null,"id":1}) and error frames share the socket.
    if data.get("result").is_some() {
        return Ok(None);
    }
    if data.get("code").is_some() && data.get("msg").is_some() {
        return Ok(None);
    }
    if get_str(data, "e") != Some("kline") {
        return Ok(None);
    }

    let k = data.get("k").context("kline event missing k")?;
    let symbol = get_str(k, "s")
        .or_else(|| get_str(data, "s"))
        .map(|s| s.to_ascii_uppercase())
        .or_else(|| {
            v.get("stream")
                .and_then(|s| s.as_str())
                .and_then(symbol_from_stream_name)
        })
        .context("kline event missing symbol")?;
    let interval = get_str(k, "i").context("kline missing i")?.to_string();

    let open_time = get_i64(k, "t").context("kline missing t")?;
    let close_time = get_i64(k, "T").context("kline missing T")?;
    if open_time > close_time {
        anyhow::bail!("kline open_time {open_time} after close_time {close_time}");
    }
    let kline = Kline {
        open_time,
        open: decimal_field(k, "o", "open")?,
        high: decimal_field(k, "h", "high")?,
        low: decimal_field(k, "l", "low")?,
        close: decimal_field(k, "c", "close")?,
        volume: decimal_field(k, "v", "volume")?,
        close_time,
        quote_volume: decimal_field(k, "q", "quote_volume")?,
        trade_count: get_u64(k, "n").context("kline missing n")?,
        taker_base_volume: decimal_field(k, "V", "taker_base_volume")?,
        taker_quote_volume: decimal_field(k, "Q", "taker_quote_volume")?,
    };
    let is_closed = k
        .get("x")
        .and_then(|v| v.as_bool())
        .context("kline missing boolean field x")?;

    Ok(Some(LiveKline {
        symbol,
        interval,
        kline,
        is_closed,
    }))
}

fn unwrap_combined_stream(v: &Value) -> &Value {
    // Combined streams: { "stream": "...", "data": { ... } }
    v.get("data").unwrap_or(v)
}

fn decimal_field(obj: &Value, key: &str, field: &str) -> anyhow::Result<rust_decimal::Decimal> {
    let raw = get_str(obj, key).with_context(|| format!("kline missing {key}"))?;
    parse_decimal(field, raw)
}

fn get_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(|v| v.as_str())
}

fn get_u64(obj: &Value, key: &str) -> Option<u64> {
    obj.get(key).and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    })
}

fn get_i64(obj: &Value, key: &str) -> Option<i64> {
    obj.get(key).and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    })
}
