// Maximum number of candles requested per page. Binance caps klines at 1000.
pub const PAGE_SIZE: u32 = 1000;

// Base URL for the Binance spot REST API.
pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

// Per-call timeout applied to every page request.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

// Extra attempts per page on retryable transport errors.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

// Base delay between retries, multiplied by the attempt number.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

// Header row of the output file, consumed by the charting tool.
pub const CSV_HEADER: [&str; 5] = ["timestamp", "open", "high", "low", "close"];

// Timestamp format of the output file.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
