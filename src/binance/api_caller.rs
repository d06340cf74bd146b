use std::time::Duration;

use super::response::{self, KlineRow};
use crate::{
    fetcher::CandleSource,
    http::client,
    model::{Candle, DownloadError, Timeframe},
};

// Spot klines endpoint, relative to the base URL.
const KLINES_PATH: &str = "api/v3/klines";

/// Binance spot market data client.
pub struct BinanceApi {
    base_url: String,
    timeout: Duration, // Per-call timeout.
}

impl BinanceApi {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        BinanceApi {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn klines_url(&self) -> String {
        format!("{}/{}", self.base_url, KLINES_PATH)
    }
}

/// Converts a pair like `BTC/USDT` to the exchange symbol `BTCUSDT`.
pub fn exchange_symbol(pair: &str) -> String {
    pair.replace('/', "").to_uppercase()
}

impl CandleSource for BinanceApi {
    /// Fetches one page of klines opening at or after `since_ms`.
    async fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, DownloadError> {
        let rows = client::get_json::<Vec<KlineRow>>(
            &self.klines_url(),
            &[
                ("symbol", exchange_symbol(symbol)),
                ("interval", timeframe.code().to_string()),
                ("startTime", since_ms.to_string()),
                ("limit", limit.to_string()),
            ],
            self.timeout,
        )
        .await?;

        if rows.len() > limit as usize {
            return Err(DownloadError::MalformedPage(format!(
                "{} rows returned for a limit of {}",
                rows.len(),
                limit
            )));
        }

        response::parse_klines(&rows)
    }
}
