use std::{
    fs, io,
    path::{Path, PathBuf},
};

use csv::Writer;

use crate::{
    constants,
    model::{Candle, DownloadError, FetchRequest, Result, Series},
};

/// Output file for a request: `{dir}/{symbol lowercased without '/'}_{label}.csv`.
pub fn output_path(request: &FetchRequest) -> PathBuf {
    let dir = request
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let symbol = request.symbol.to_lowercase().replace('/', "");
    dir.join(format!("{}_{}.csv", symbol, request.timeframe.label()))
}

/// Writes the series as `timestamp,open,high,low,close` rows, replacing any
/// existing file. The rows go to a sibling temp file that is then renamed
/// into place, so a crash never leaves a half-written file behind.
///
/// Prices are written normalized (`7255.00000000` becomes `7255`, not
/// `7255.0`); the charting tool reads any plain decimal notation.
pub fn write(series: &Series, request: &FetchRequest) -> Result<PathBuf> {
    if series.is_empty() {
        return Err(DownloadError::NoDataToWrite);
    }

    let path = output_path(request);
    let tmp_path = temp_path(&path);

    let written = write_rows(series.candles(), &tmp_path).and_then(|_| fs::rename(&tmp_path, &path));
    if let Err(source) = written {
        fs::remove_file(&tmp_path).ok();
        return Err(DownloadError::WriteFailure { path, source });
    }

    log::info!("Data saved to {}", path.display());
    Ok(path)
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", file_name))
}

fn write_rows(candles: &[Candle], path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut writer = Writer::from_path(path)?;
    writer.write_record(constants::CSV_HEADER)?;

    for candle in candles {
        let timestamp = candle.open_time().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("open time {} out of range", candle.open_time_ms),
            )
        })?;

        writer.write_record([
            &timestamp.format(constants::TIMESTAMP_FORMAT).to_string(),
            &candle.open.normalize().to_string(),
            &candle.high.normalize().to_string(),
            &candle.low.normalize().to_string(),
            &candle.close.normalize().to_string(),
        ])?;
    }

    writer.flush()
}
