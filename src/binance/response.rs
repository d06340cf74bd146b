use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::model::{Candle, DownloadError, Result, is_valid_open_time};

// Kline rows are heterogeneous arrays:
// [openTime, "open", "high", "low", "close", "volume", closeTime, "quoteVolume", trades, ...]
pub type KlineRow = Vec<Value>;

const MIN_ROW_LEN: usize = 6;

/// Converts raw kline rows into candles, failing on the first row that does
/// not match the expected schema.
pub fn parse_klines(rows: &[KlineRow]) -> Result<Vec<Candle>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| parse_row(i, row))
        .collect()
}

fn parse_row(index: usize, row: &[Value]) -> Result<Candle> {
    if row.len() < MIN_ROW_LEN {
        return Err(malformed(index, format!("expected at least {MIN_ROW_LEN} fields, got {}", row.len())));
    }

    let open_time_ms = row[0]
        .as_i64()
        .ok_or_else(|| malformed(index, format!("open time {} is not an integer", row[0])))?;
    if !is_valid_open_time(open_time_ms) {
        return Err(malformed(index, format!("open time {open_time_ms} out of range")));
    }

    Ok(Candle {
        open_time_ms,
        open: decimal_field(index, "open", &row[1])?,
        high: decimal_field(index, "high", &row[2])?,
        low: decimal_field(index, "low", &row[3])?,
        close: decimal_field(index, "close", &row[4])?,
        volume: decimal_field(index, "volume", &row[5])?,
    })
}

// Prices arrive as strings; plain numbers are accepted as well.
fn decimal_field(index: usize, name: &str, value: &Value) -> Result<Decimal> {
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    };
    parsed.ok_or_else(|| malformed(index, format!("{name} {value} is not a decimal")))
}

fn malformed(index: usize, detail: String) -> DownloadError {
    DownloadError::MalformedPage(format!("row {index}: {detail}"))
}
