use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    constants,
    model::{Candle, DownloadError, FetchRequest, Series, Timeframe},
};

/// Source of historical candles, one bounded page at a time.
pub trait CandleSource {
    /// Returns at most `limit` candles with open time `>= since_ms`, ascending.
    async fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>, DownloadError>;
}

/// Decides whether a failed page request is attempted again.
pub trait RetryPolicy {
    /// `attempt` is the number of attempts already made for the page.
    fn should_retry(&self, error: &DownloadError, attempt: u32) -> bool;

    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Receives the running row count after each merged page.
pub trait ProgressSink {
    fn on_progress(&self, rows_so_far: usize);
}

/// Single attempt per page.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _error: &DownloadError, _attempt: u32) -> bool {
        false
    }
}

/// Retries retryable transport errors up to `max_retries` extra times, waiting
/// `backoff * attempt` in between. Malformed pages are never retried.
pub struct BoundedRetry {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy for BoundedRetry {
    fn should_retry(&self, error: &DownloadError, attempt: u32) -> bool {
        match error {
            DownloadError::Transport(err) => err.is_retryable() && attempt <= self.max_retries,
            _ => false,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

/// Reports progress through the log.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&self, rows_so_far: usize) {
        log::info!("Downloaded {} klines...", rows_so_far);
    }
}

/// Why the page loop ended.
#[derive(Debug)]
pub enum StopReason {
    // An empty page: no more history.
    Exhausted,
    // A page failed; the series holds everything before it.
    Truncated(DownloadError),
    Cancelled,
}

#[derive(Debug)]
pub struct Fetched {
    pub series: Series,
    pub stop: StopReason,
}

/// Drives the paginated download, advancing the cursor past the last candle
/// of every page.
pub struct Fetcher<S, R, P> {
    source: S,
    retry: R,
    progress: P,
    page_size: u32,
    cancel: Option<Arc<AtomicBool>>,
}

impl<S: CandleSource, R: RetryPolicy, P: ProgressSink> Fetcher<S, R, P> {
    pub fn new(source: S, retry: R, progress: P) -> Self {
        Fetcher {
            source,
            retry,
            progress,
            page_size: constants::PAGE_SIZE,
            cancel: None,
        }
    }

    /// Stops the loop at the next page boundary once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Downloads everything from `request.start_ms` on. Page failures end the
    /// loop and keep what was collected; they are never returned as errors.
    pub async fn fetch(&self, request: &FetchRequest) -> Fetched {
        let mut series = Series::new();
        let mut cursor = request.start_ms;

        let stop = loop {
            if self.is_cancelled() {
                log::warn!("Download cancelled with {} klines collected", series.len());
                break StopReason::Cancelled;
            }

            let page = match self.fetch_with_retry(request, cursor).await {
                Ok(page) => page,
                Err(err) => {
                    log::error!("Error fetching page at {}: {}", cursor, err);
                    break StopReason::Truncated(err);
                }
            };

            let Some(last_open) = page.last().map(|c| c.open_time_ms) else {
                break StopReason::Exhausted;
            };

            if let Err(err) = series.merge_page(page, cursor) {
                log::error!("Discarding page at {}: {}", cursor, err);
                break StopReason::Truncated(err);
            }

            self.progress.on_progress(series.len());
            cursor = match last_open.checked_add(1) {
                Some(next) => next,
                None => {
                    let err = DownloadError::MalformedPage(format!(
                        "cursor cannot advance past open time {}",
                        last_open
                    ));
                    log::error!("{}", err);
                    break StopReason::Truncated(err);
                }
            };
        };

        log::info!("Total downloaded: {} klines", series.len());
        Fetched { series, stop }
    }

    async fn fetch_with_retry(
        &self,
        request: &FetchRequest,
        cursor: i64,
    ) -> Result<Vec<Candle>, DownloadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .source
                .fetch_page(&request.symbol, request.timeframe, cursor, self.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.backoff(attempt);
                    log::warn!("Attempt {} at {} failed, retrying in {:?}: {}", attempt, cursor, delay, err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::client::RequestError;
    use rust_decimal::Decimal;
    use std::{
        collections::VecDeque,
        sync::{Mutex, atomic::AtomicUsize},
    };

    const HOUR_MS: i64 = 3_600_000;
    const START_MS: i64 = 1_577_836_800_000; // 2020-01-01

    fn candle(open_time_ms: i64) -> Candle {
        Candle {
            open_time_ms,
            open: Decimal::new(720_000, 2),
            high: Decimal::new(725_000, 2),
            low: Decimal::new(710_000, 2),
            close: Decimal::new(722_050, 2),
            volume: Decimal::new(15, 1),
        }
    }

    /// An exchange holding `history_len` hourly candles from START_MS. Scripted
    /// failures are consumed one per call before the history is served.
    struct FakeExchange {
        history: Vec<Candle>,
        failures: Mutex<VecDeque<Option<DownloadError>>>,
        calls: AtomicUsize,
        cursors: Mutex<Vec<i64>>,
    }

    impl FakeExchange {
        fn new(history_len: usize) -> Self {
            FakeExchange {
                history: (0..history_len as i64).map(|i| candle(START_MS + i * HOUR_MS)).collect(),
                failures: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                cursors: Mutex::new(Vec::new()),
            }
        }

        // `None` entries let the call through.
        fn with_script(self, script: Vec<Option<DownloadError>>) -> Self {
            *self.failures.lock().unwrap() = script.into();
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CandleSource for &FakeExchange {
        async fn fetch_page(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            since_ms: i64,
            limit: u32,
        ) -> Result<Vec<Candle>, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cursors.lock().unwrap().push(since_ms);
            if let Some(Some(err)) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(self
                .history
                .iter()
                .filter(|c| c.open_time_ms >= since_ms)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    /// Serves fixed pages regardless of the cursor.
    struct FixedPages {
        pages: Mutex<VecDeque<Vec<Candle>>>,
    }

    impl CandleSource for FixedPages {
        async fn fetch_page(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _since_ms: i64,
            _limit: u32,
        ) -> Result<Vec<Candle>, DownloadError> {
            Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    struct CountingProgress(Mutex<Vec<usize>>);

    impl ProgressSink for &CountingProgress {
        fn on_progress(&self, rows_so_far: usize) {
            self.0.lock().unwrap().push(rows_so_far);
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::new("BTC/USDT", "1h", "2020-01-01", None).unwrap()
    }

    fn timeout() -> DownloadError {
        DownloadError::Transport(RequestError::Timeout(Duration::from_secs(10)))
    }

    fn assert_strictly_ascending(series: &Series) {
        assert!(
            series
                .candles()
                .windows(2)
                .all(|w| w[0].open_time_ms < w[1].open_time_ms)
        );
    }

    #[tokio::test]
    async fn test_pages_until_empty() {
        let exchange = FakeExchange::new(2437);
        let progress = CountingProgress(Mutex::new(Vec::new()));
        let fetcher = Fetcher::new(&exchange, NoRetry, &progress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 2437);
        assert!(matches!(fetched.stop, StopReason::Exhausted));
        assert_eq!(exchange.calls(), 4);
        assert_strictly_ascending(&fetched.series);
        assert_eq!(*progress.0.lock().unwrap(), vec![1000, 2000, 2437]);
    }

    #[tokio::test]
    async fn test_cursor_advances_past_last_candle() {
        let exchange = FakeExchange::new(2437);
        let fetcher = Fetcher::new(&exchange, NoRetry, LogProgress);

        fetcher.fetch(&request()).await;

        let cursors = exchange.cursors.lock().unwrap().clone();
        assert_eq!(
            cursors,
            vec![
                START_MS,
                START_MS + 999 * HOUR_MS + 1,
                START_MS + 1999 * HOUR_MS + 1,
                START_MS + 2436 * HOUR_MS + 1,
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_keeps_partial_series() {
        let exchange = FakeExchange::new(2437).with_script(vec![None, Some(timeout())]);
        let fetcher = Fetcher::new(&exchange, NoRetry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 1000);
        assert!(matches!(
            fetched.stop,
            StopReason::Truncated(DownloadError::Transport(RequestError::Timeout(_)))
        ));
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let exchange = FakeExchange::new(1500).with_script(vec![None, Some(timeout()), Some(timeout())]);
        let retry = BoundedRetry {
            max_retries: 2,
            backoff: Duration::ZERO,
        };
        let fetcher = Fetcher::new(&exchange, retry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 1500);
        assert!(matches!(fetched.stop, StopReason::Exhausted));
        // page 1, two failures, page 2, empty page
        assert_eq!(exchange.calls(), 5);
        assert_strictly_ascending(&fetched.series);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_bound() {
        let exchange = FakeExchange::new(1500)
            .with_script(vec![None, Some(timeout()), Some(timeout()), Some(timeout())]);
        let retry = BoundedRetry {
            max_retries: 2,
            backoff: Duration::ZERO,
        };
        let fetcher = Fetcher::new(&exchange, retry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 1000);
        assert!(matches!(fetched.stop, StopReason::Truncated(_)));
        assert_eq!(exchange.calls(), 4);
    }

    #[tokio::test]
    async fn test_malformed_page_is_not_retried() {
        let exchange = FakeExchange::new(1500)
            .with_script(vec![None, Some(DownloadError::MalformedPage("row 3".into()))]);
        let retry = BoundedRetry {
            max_retries: 5,
            backoff: Duration::ZERO,
        };
        let fetcher = Fetcher::new(&exchange, retry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 1000);
        assert!(matches!(fetched.stop, StopReason::Truncated(DownloadError::MalformedPage(_))));
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_page_truncates() {
        let start = request().start_ms;
        let source = FixedPages {
            pages: Mutex::new(VecDeque::from(vec![
                vec![candle(start), candle(start + HOUR_MS)],
                vec![candle(start + 3 * HOUR_MS), candle(start + 2 * HOUR_MS)],
                vec![candle(start + 4 * HOUR_MS)],
            ])),
        };
        let fetcher = Fetcher::new(source, NoRetry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 2);
        assert!(matches!(fetched.stop, StopReason::Truncated(DownloadError::MalformedPage(_))));
    }

    #[tokio::test]
    async fn test_repeated_boundary_row_truncates() {
        let start = request().start_ms;
        let source = FixedPages {
            pages: Mutex::new(VecDeque::from(vec![
                vec![candle(start), candle(start + HOUR_MS)],
                vec![candle(start + HOUR_MS), candle(start + 2 * HOUR_MS)],
            ])),
        };
        let fetcher = Fetcher::new(source, NoRetry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 2);
        assert!(matches!(fetched.stop, StopReason::Truncated(DownloadError::MalformedPage(_))));
    }

    #[tokio::test]
    async fn test_unsupported_timeframe_makes_no_request() {
        let exchange = FakeExchange::new(10);

        let result = FetchRequest::new("BTC/USDT", "2h", "2020-01-01", None);
        if let Ok(request) = &result {
            Fetcher::new(&exchange, NoRetry, LogProgress).fetch(request).await;
        }

        assert!(matches!(result, Err(DownloadError::UnsupportedTimeframe(_))));
        assert_eq!(exchange.calls(), 0);
    }

    #[tokio::test]
    async fn test_open_time_out_of_range_keeps_earlier_pages() {
        let start = request().start_ms;
        let source = FixedPages {
            pages: Mutex::new(VecDeque::from(vec![
                vec![candle(start), candle(start + 1)],
                vec![candle(i64::MAX / 2)],
            ])),
        };
        let fetcher = Fetcher::new(source, NoRetry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 2);
        assert!(matches!(fetched.stop, StopReason::Truncated(DownloadError::MalformedPage(_))));
        assert!(fetched.series.candles().iter().all(|c| c.open_time().is_some()));
    }

    #[tokio::test]
    async fn test_max_open_time_does_not_overflow_cursor() {
        let start = request().start_ms;
        let source = FixedPages {
            pages: Mutex::new(VecDeque::from(vec![vec![candle(start)], vec![candle(i64::MAX)]])),
        };
        let fetcher = Fetcher::new(source, NoRetry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 1);
        assert!(matches!(fetched.stop, StopReason::Truncated(DownloadError::MalformedPage(_))));
    }

    #[tokio::test]
    async fn test_empty_history() {
        let exchange = FakeExchange::new(0);
        let fetcher = Fetcher::new(&exchange, NoRetry, LogProgress);

        let fetched = fetcher.fetch(&request()).await;

        assert!(fetched.series.is_empty());
        assert!(matches!(fetched.stop, StopReason::Exhausted));
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_first_page() {
        let exchange = FakeExchange::new(2437);
        let flag = Arc::new(AtomicBool::new(true));
        let fetcher = Fetcher::new(&exchange, NoRetry, LogProgress).with_cancel(flag);

        let fetched = fetcher.fetch(&request()).await;

        assert!(fetched.series.is_empty());
        assert!(matches!(fetched.stop, StopReason::Cancelled));
        assert_eq!(exchange.calls(), 0);
    }

    /// Sets the cancel flag once the first page has been merged.
    struct CancelAfterFirstPage(Arc<AtomicBool>);

    impl ProgressSink for CancelAfterFirstPage {
        fn on_progress(&self, _rows_so_far: usize) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_cancel_at_page_boundary() {
        let exchange = FakeExchange::new(2437);
        let flag = Arc::new(AtomicBool::new(false));
        let fetcher = Fetcher::new(&exchange, NoRetry, CancelAfterFirstPage(flag.clone()))
            .with_cancel(flag);

        let fetched = fetcher.fetch(&request()).await;

        assert_eq!(fetched.series.len(), 1000);
        assert!(matches!(fetched.stop, StopReason::Cancelled));
        assert_eq!(exchange.calls(), 1);
    }

    #[test]
    fn test_bounded_retry_policy() {
        let retry = BoundedRetry {
            max_retries: 2,
            backoff: Duration::from_millis(100),
        };
        assert!(retry.should_retry(&timeout(), 1));
        assert!(retry.should_retry(&timeout(), 2));
        assert!(!retry.should_retry(&timeout(), 3));
        assert!(!retry.should_retry(
            &DownloadError::Transport(RequestError::JsonError("eof".into())),
            1
        ));
        assert_eq!(retry.backoff(3), Duration::from_millis(300));
        assert!(!NoRetry.should_retry(&timeout(), 1));
    }
}
