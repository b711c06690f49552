//! Shared HTTP plumbing for the secondary-lookup clients.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::time::Duration;

use crate::error::FetchError;

// Shared client with connection pooling; per-request deadlines come
// from the caller's configuration.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(8)
        .build()
        .expect("Failed to build HTTP client")
});

/// Issue exactly one GET and parse the body as JSON.
///
/// No retries happen here; a failure aborts processing of the current
/// message only, and [`FetchError::is_transient`] decides whether that
/// message is redelivered.
pub(crate) async fn get_json(url: &str, timeout_secs: u64) -> Result<Value, FetchError> {
    let response = HTTP_CLIENT
        .get(url)
        .timeout(Duration::from_secs(timeout_secs))
        .send()
        .await
        .map_err(|e| classify_send_error(url, timeout_secs, e))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
            body,
        });
    }

    response.json::<Value>().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_secs,
            }
        } else {
            FetchError::InvalidJson {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })
}

fn classify_send_error(url: &str, timeout_secs: u64, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
            timeout_secs,
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}
