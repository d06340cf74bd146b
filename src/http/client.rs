use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

// Shared HTTP client instance.
lazy_static::lazy_static! {
    static ref CLIENT: Arc<reqwest::Client> = Arc::new(reqwest::Client::new());
}

/// Custom error type for HTTP requests.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error: {0} ({1}). Response body: {2}")]
    HttpError(reqwest::Url, u16, String),
    #[error("Error deserializing JSON: {0}")]
    JsonError(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl RequestError {
    /// Whether another attempt at the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::Timeout(_) | RequestError::Other(_) => true,
            RequestError::HttpError(_, status, _) => *status == 429 || *status >= 500,
            RequestError::JsonError(_) => false,
        }
    }
}

/// Sends a GET request to `path` with query parameters and decodes the JSON body.
pub async fn get_json<T: DeserializeOwned>(
    path: &str,                 // Absolute API URL.
    params: &[(&str, String)],  // Query parameters.
    timeout: Duration,          // Per-call timeout.
) -> Result<T, RequestError> {
    // Construct the URL.
    let url = if !params.is_empty() {
        reqwest::Url::parse_with_params(path, params)
            .map_err(|e| RequestError::Other(e.to_string()))?
    } else {
        reqwest::Url::parse(path).map_err(|e| RequestError::Other(e.to_string()))?
    };

    let response = CLIENT
        .get(url.as_str())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

    // Get the response status code.
    let status = response.status();

    // Handle non-success status codes.
    if !status.is_success() {
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        return Err(RequestError::HttpError(url, status.as_u16(), body));
    }

    // The body is read before decoding so a stalled stream surfaces as a timeout.
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(e, timeout))?;
    serde_json::from_slice(&body).map_err(|e| RequestError::JsonError(e.to_string()))
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> RequestError {
    if err.is_timeout() {
        RequestError::Timeout(timeout)
    } else {
        RequestError::Other(err.to_string())
    }
}
