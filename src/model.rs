use std::{
    fmt::{self, Display},
    io,
    path::PathBuf,
    str::FromStr,
};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::http::client::RequestError;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Errors raised while downloading and saving klines.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Unsupported timeframe: {0}. Supported: {}", Timeframe::supported_codes())]
    UnsupportedTimeframe(String),
    #[error("Invalid start date {0:?}, expected YYYY-MM-DD")]
    InvalidStartDate(String),
    #[error("Invalid symbol {0:?}, expected a pair such as BTC/USDT")]
    InvalidSymbol(String),
    #[error("Invalid value {value:?} for setting '{key}'")]
    InvalidSetting { key: &'static str, value: String },
    #[error("Transport error: {0}")]
    Transport(#[from] RequestError),
    #[error("Malformed page: {0}")]
    MalformedPage(String),
    #[error("No data to write")]
    NoDataToWrite,
    #[error("Failed to write {}: {source}", .path.display())]
    WriteFailure { path: PathBuf, source: io::Error },
}

/// Candle granularities supported by the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    OneDay,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::OneDay,
        Timeframe::OneHour,
        Timeframe::ThirtyMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::FiveMinutes,
        Timeframe::OneMinute,
    ];

    /// Interval code understood by the exchange and accepted on the command line.
    pub fn code(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::OneDay => "1d",
        }
    }

    /// Label used in output file names. The charting tool looks files up by
    /// this label, so the mapping must stay fixed.
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "60m",
            Timeframe::OneDay => "day",
        }
    }

    fn supported_codes() -> String {
        Timeframe::ALL
            .iter()
            .map(|tf| tf.code())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for Timeframe {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.code() == s)
            .ok_or_else(|| DownloadError::UnsupportedTimeframe(s.into()))
    }
}

impl Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One download run: which pair, which granularity, from when, and where to.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub symbol: String,              // Pair symbol, e.g. BTC/USDT.
    pub timeframe: Timeframe,        // Candle granularity.
    pub start_ms: i64,               // UTC midnight of the start date, in ms.
    pub output_dir: Option<PathBuf>, // Directory of the output file.
}

impl FetchRequest {
    /// Validates raw caller input. Nothing here touches the network or disk.
    pub fn new(
        symbol: &str,
        timeframe: &str,
        start_date: &str,
        output_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let timeframe = timeframe.parse::<Timeframe>()?;

        let symbol = symbol.trim();
        if symbol.is_empty() || symbol.replace('/', "").is_empty() {
            return Err(DownloadError::InvalidSymbol(symbol.into()));
        }

        let start = NaiveDate::parse_from_str(start_date, "%Y-%m-%d")
            .map_err(|_| DownloadError::InvalidStartDate(start_date.into()))?;
        let start_ms = start
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| DownloadError::InvalidStartDate(start_date.into()))?
            .and_utc()
            .timestamp_millis();

        Ok(FetchRequest {
            symbol: symbol.into(),
            timeframe,
            start_ms,
            output_dir,
        })
    }
}

/// Structure representing a candle (OHLCV data).
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub open_time_ms: i64, // Open time, ms since epoch.
    pub open: Decimal,     // Opening price.
    pub high: Decimal,     // Highest price.
    pub low: Decimal,      // Lowest price.
    pub close: Decimal,    // Closing price.
    pub volume: Decimal,   // Trading volume.
}

impl Candle {
    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.open_time_ms)
    }
}

/// Open times before the epoch or beyond what a UTC timestamp can hold are
/// rejected; they could not be written out.
pub fn is_valid_open_time(open_time_ms: i64) -> bool {
    open_time_ms >= 0 && DateTime::from_timestamp_millis(open_time_ms).is_some()
}

/// Candles ordered strictly ascending by open time, without duplicates.
#[derive(Debug, Default)]
pub struct Series {
    candles: Vec<Candle>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Appends a page requested at `cursor`. The page is checked as a whole
    /// first; on a violation the series is left untouched.
    pub fn merge_page(&mut self, page: Vec<Candle>, cursor: i64) -> Result<()> {
        let mut previous = self.candles.last().map(|c| c.open_time_ms);
        for (i, candle) in page.iter().enumerate() {
            if !is_valid_open_time(candle.open_time_ms) {
                return Err(DownloadError::MalformedPage(format!(
                    "row {} open time {} out of range",
                    i, candle.open_time_ms
                )));
            }
            if candle.open_time_ms < cursor {
                return Err(DownloadError::MalformedPage(format!(
                    "row {} opens at {} before requested start {}",
                    i, candle.open_time_ms, cursor
                )));
            }
            if let Some(prev) = previous {
                if candle.open_time_ms <= prev {
                    return Err(DownloadError::MalformedPage(format!(
                        "row {} opens at {}, not after {}",
                        i, candle.open_time_ms, prev
                    )));
                }
            }
            previous = Some(candle.open_time_ms);
        }

        self.candles.extend(page);
        Ok(())
    }
}
