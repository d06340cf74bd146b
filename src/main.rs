// Binance exchange adapter.
mod binance {
    // Klines endpoint client.
    pub mod api_caller;
    // Raw kline rows and their conversion to candles.
    pub mod response;
}
// HTTP client module.
mod http {
    // HTTP client implementation.
    pub mod client;
}
// Settings read from the environment.
mod config;
// module storing defaults
mod constants;
// Paginated kline download.
mod fetcher;
// Data models.
mod model;
// Output storage module.
mod store {
    /// CSV output file.
    pub mod csv_file;
}

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use dotenv::dotenv;

use binance::api_caller::BinanceApi;
use fetcher::{BoundedRetry, Fetcher, LogProgress, StopReason};
use model::{DownloadError, FetchRequest};

// Command-line argument parser.
#[derive(Parser, Debug)]
#[command(
    about = "Download Binance klines into a CSV file",
    after_help = "Example: kline_dl BTC/USDT 1d 2020-01-01"
)]
struct Args {
    /// Trading pair, e.g. BTC/USDT.
    symbol: String,
    /// Kline timeframe: 1m, 5m, 15m, 30m, 1h or 1d.
    timeframe: String,
    /// First day to download, YYYY-MM-DD (UTC).
    start_date: String,
    /// Directory of the output file. Defaults to $output_dir, then the current directory.
    output_dir: Option<PathBuf>,
}

#[tokio::main]
// Main function entry point.
async fn main() -> ExitCode {
    dotenv().ok();

    env_logger::init();

    let args = Args::parse();

    match run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> model::Result<()> {
    let settings = config::Settings::from_env()?;

    let request = FetchRequest::new(
        &args.symbol,
        &args.timeframe,
        &args.start_date,
        args.output_dir.or(settings.output_dir),
    )?;

    log::info!(
        "Downloading {} {} klines from {}...",
        request.symbol,
        request.timeframe,
        args.start_date
    );

    let cancel = Arc::new(AtomicBool::new(false));
    watch_ctrl_c(cancel.clone());

    let fetcher = Fetcher::new(
        BinanceApi::new(&settings.base_url, settings.request_timeout),
        BoundedRetry {
            max_retries: settings.max_retries,
            backoff: settings.retry_backoff,
        },
        LogProgress,
    )
    .with_cancel(cancel);

    let fetched = fetcher.fetch(&request).await;
    match &fetched.stop {
        StopReason::Exhausted => {}
        StopReason::Truncated(err) => {
            log::warn!("Download stopped early ({}), saving partial data", err)
        }
        StopReason::Cancelled => log::warn!("Download interrupted, saving partial data"),
    }

    match store::csv_file::write(&fetched.series, &request) {
        Ok(_) => Ok(()),
        Err(DownloadError::NoDataToWrite) => {
            log::warn!("No data downloaded");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

// Sets `cancel` on Ctrl-C; the fetcher stops at the next page boundary.
fn watch_ctrl_c(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current page");
            cancel.store(true, Ordering::Relaxed);
        }
    });
}
