use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use crate::schema::kline::{FieldValue, SinkRow};

use super::KlineSink;

const QUESTDB_HTTP_TIMEOUT_SECS: u64 = 30;

/// QuestDB sink speaking InfluxDB line protocol over HTTP (`POST /write?precision=n`).
///
/// Rows are encoded on `write_row` and posted as one body on `flush`. A failed flush
/// keeps the buffer for the next attempt. Once `max_buffer_rows` rows are pending,
/// `write_row` refuses new rows until a flush succeeds.
pub struct IlpHttpSink {
    http: reqwest::Client,
    write_url: String,
    buf: String,
    rows: usize,
    max_buffer_rows: usize,
    flushed_rows: u64,
}

impl IlpHttpSink {
    pub fn new(base_url: &str, max_buffer_rows: usize) -> anyhow::Result<Self> {
        let base = base_url.trim_end_matches('/');
        if base.is_empty() {
            anyhow::bail!("questdb url is empty");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(QUESTDB_HTTP_TIMEOUT_SECS))
            .build()
            .context("build questdb http client")?;
        Ok(Self {
            http,
            write_url: format!("{base}/write?precision=n"),
            buf: String::new(),
            rows: 0,
            max_buffer_rows: max_buffer_rows.max(1),
            flushed_rows: 0,
        })
    }

    pub fn flushed_rows(&self) -> u64 {
        self.flushed_rows
    }
}

impl KlineSink for IlpHttpSink {
    fn write_row(&mut self, row: SinkRow) -> anyhow::Result<()> {
        if self.rows >= self.max_buffer_rows {
            anyhow::bail!(
                "questdb buffer full ({} rows pending, max_buffer_rows={}), row for {} {} rejected",
                self.rows,
                self.max_buffer_rows,
                row.symbol,
                row.kline.open_time
            );
        }
        encode_line(&mut self.buf, &row);
        self.rows += 1;
        Ok(())
    }

    fn pending_rows(&self) -> usize {
        self.rows
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.rows == 0 {
            return Ok(());
        }
        let resp = self
            .http
            .post(&self.write_url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(self.buf.clone())
            .send()
            .await
            .context("questdb write request")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "questdb write HTTP error: {}: {} (rows kept: {})",
                status.as_u16(),
                body.trim(),
                self.rows
            );
        }
        debug!(rows = self.rows, "questdb flush ok");
        self.flushed_rows += self.rows as u64;
        self.buf.clear();
        self.rows = 0;
        Ok(())
    }
}

/// Append one ILP line:
/// `table,symbol=BTCUSDT,interval=1m open=1.0,...,close_time=...t,...,trades=5i <ns>\n`
pub fn encode_line(out: &mut String, row: &SinkRow) {
    escape_into(out, &row.measurement, &[',', ' ']);
    for (key, value) in row.tags() {
        out.push(',');
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        escape_into(out, value, &[',', '=', ' ']);
    }
    out.push(' ');
    for (i, (key, value)) in row.fields().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        // Writing into a String cannot fail.
        let _ = match value {
            FieldValue::Decimal(d) => write!(out, "{d}"),
            FieldValue::Int(v) => write!(out, "{v}i"),
            // ILP timestamp fields are microseconds.
            FieldValue::TimestampMs(ms) => write!(out, "{}t", ms.saturating_mul(1_000)),
        };
    }
    let _ = writeln!(out, " {}", row.timestamp_nanos());
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        if c == '\n' || c == '\r' {
            out.push(' ');
            continue;
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::kline::Kline;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn row(measurement: &str, symbol: &str) -> SinkRow {
        SinkRow {
            measurement: measurement.to_string(),
            symbol: symbol.to_string(),
            interval: "1m".to_string(),
            kline: Kline {
                open_time: 1_700_000_000_000,
                open: dec("37000.10"),
                high: dec("37020.55"),
                low: dec("36990"),
                close: dec("37010.00"),
                volume: dec("12.345"),
                close_time: 1_700_000_059_999,
                quote_volume: dec("456789.12"),
                trade_count: 101,
                taker_base_volume: dec("6.1"),
                taker_quote_volume: dec("225000.5"),
            },
        }
    }

    #[test]
    fn encode_line_ok() {
        let mut out = String::new();
        encode_line(&mut out, &row("spot_klines", "BTCUSDT"));
        assert_eq!(
            out,
            "spot_klines,symbol=BTCUSDT,interval=1m \
             open=37000.10,high=37020.55,low=36990,close=37010.00,volume=12.345,\
             close_time=1700000059999000t,quote_volume=456789.12,trades=101i,\
             taker_base_volume=6.1,taker_quote_volume=225000.5 \
             1700000000000000000\n"
        );
    }

    #[test]
    fn encode_escapes_tags() {
        let mut out = String::new();
        encode_line(&mut out, &row("my table", "A,B=C"));
        assert!(out.starts_with("my\\ table,symbol=A\\,B\\=C,interval=1m "));
    }

    #[test]
    fn buffer_cap_rejects_new_rows() {
        let mut sink = IlpHttpSink::new("http://127.0.0.1:9000", 2).unwrap();
        sink.write_row(row("t", "A")).unwrap();
        sink.write_row(row("t", "B")).unwrap();
        assert_eq!(sink.pending_rows(), 2);
        let err = sink.write_row(row("t", "C")).unwrap_err();
        assert!(err.to_string().contains("buffer full"));
        assert_eq!(sink.pending_rows(), 2);
        assert!(sink.buf.contains("symbol=A"));
        assert!(sink.buf.contains("symbol=B"));
        assert!(!sink.buf.contains("symbol=C"));
    }

    #[tokio::test]
    async fn flush_posts_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write"))
            .and(query_param("precision", "n"))
            .and(body_string_contains("futures_klines,symbol=ETHUSDT"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut sink = IlpHttpSink::new(&server.uri(), 100).unwrap();
        sink.write_row(row("futures_klines", "ETHUSDT")).unwrap();
        sink.flush().await.unwrap();
        assert_eq!(sink.pending_rows(), 0);
        assert_eq!(sink.flushed_rows(), 1);
        // empty flush is a no-op
        sink.flush().await.unwrap();
    }

    #[tokio::test]
    async fn failed_flush_keeps_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/write"))
            .respond_with(ResponseTemplate::new(400).set_body_string("{\"message\":\"bad\"}"))
            .mount(&server)
            .await;

        let mut sink = IlpHttpSink::new(&server.uri(), 100).unwrap();
        sink.write_row(row("t", "BTCUSDT")).unwrap();
        let err = sink.flush().await.unwrap_err();
        assert!(err.to_string().contains("400"));
        assert_eq!(sink.pending_rows(), 1);
    }
}
