//! CLI subcommands

pub mod conf_device;
pub mod conf_sensor;
pub mod mqtt_sim;
pub mod simulate;

use anyhow::{bail, Context, Result};
use iotedge_shared::protocol::http::Output;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Base URL of a server running with default settings
pub const DEFAULT_URL: &str = "http://localhost:3004";

/// Join a base URL and a route path.
pub fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// POST `body` as JSON and decode the answer as `T`.
///
/// Error envelopes (`{"Status": "Error" | "Busy", ...}`) become `Err`.
pub async fn post_json<B, T>(url: &str, body: &B, timeout: Duration) -> Result<T>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("Request to {} failed", url))?;
    let status = response.status();
    let text = response.text().await.context("Failed to read response")?;

    if !status.is_success() {
        match serde_json::from_str::<Output>(&text) {
            Ok(output) => bail!("{} ({}): {}", output.status, status, output.answer),
            Err(_) => bail!("Server returned {}: {}", status, text.trim()),
        }
    }
    serde_json::from_str(&text).with_context(|| format!("Unexpected response: {}", text.trim()))
}

/// Fail unless the envelope reports success.
pub fn expect_ok(output: Output) -> Result<Output> {
    if !output.is_ok() {
        bail!("{}: {}", output.status, output.answer);
    }
    Ok(output)
}
