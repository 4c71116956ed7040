//! `iotedge simulate`: a dummy device talking HTTP
//!
//! Registers itself through `/init-device`, then samples a random
//! temperature (in kelvin) every `interval_ms` and posts each batch of
//! `batch_size` samples to `/timeseries/save`.

use crate::output;
use crate::retry::Backoff;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use iotedge_shared::protocol::http::{Output, URI_INIT_DEVICE, URI_SAVE_TIMESERIES};
use iotedge_shared::{Device, DeviceDesc, InitDeviceRequest, Series};
use rand::Rng;
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, info};

const VALUE_RANGE: Range<f64> = 283.0..298.0;
const SAMPLE_COMMENT: &str = "dummy";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Server base URL
    #[arg(long, default_value = super::DEFAULT_URL, env = "IOTEDGE_URL")]
    pub url: String,

    /// Device name; also used as the tag of the posted series
    #[arg(long, default_value = "DummyDevice")]
    pub name: String,

    /// Sensor names announced at registration (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "DummyDeviceTemperature")]
    pub sensors: Vec<String>,

    /// Number of batches to post (0 runs until interrupted)
    #[arg(long, default_value_t = 10)]
    pub batches: u32,

    /// Samples per batch
    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,

    /// Delay between samples in milliseconds
    #[arg(long, default_value_t = 50)]
    pub interval_ms: u64,

    /// Attempts per request before giving up
    #[arg(long, default_value_t = 5)]
    pub retries: u32,
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    let init_url = super::endpoint(&args.url, URI_INIT_DEVICE);
    let save_url = super::endpoint(&args.url, URI_SAVE_TIMESERIES);

    let request = InitDeviceRequest {
        device: DeviceDesc {
            name: args.name.clone(),
            sensors: args.sensors.clone(),
            description: format!("{} simulator", args.name),
        },
    };
    let device: Device = Backoff::new(args.retries, Duration::from_millis(500))
        .send("init-device", || super::post_json(&init_url, &request, REQUEST_TIMEOUT))
        .await
        .context("Device registration failed")?;
    output::info(&format!("Registered {}", output::device_summary(&device)));

    let interval = Duration::from_millis(args.interval_ms);
    let save_backoff = Backoff::new(args.retries, Duration::from_millis(200));
    let mut sent = 0u32;
    while args.batches == 0 || sent < args.batches {
        let batch = sample_batch(&args.name, args.batch_size, interval).await;
        let body = [batch];
        let (save_url, body) = (&save_url, &body);
        save_backoff
            .send("timeseries/save", move || async move {
                let output: Output = super::post_json(save_url, body, REQUEST_TIMEOUT).await?;
                super::expect_ok(output)
            })
            .await
            .with_context(|| format!("Batch {} was not accepted", sent + 1))?;

        sent += 1;
        debug!(batch = sent, samples = args.batch_size, "batch accepted");
    }

    info!("posted {} batches", sent);
    output::success(&format!(
        "Posted {} batches of {} samples as {}",
        sent, args.batch_size, args.name
    ));
    Ok(())
}

/// Collect `size` random samples, one per `interval`.
async fn sample_batch(tag: &str, size: usize, interval: Duration) -> Series {
    let mut series = Series::new(tag);
    for _ in 0..size {
        let value = rand::thread_rng().gen_range(VALUE_RANGE);
        series.push(Utc::now(), value);
        series.comments.push(SAMPLE_COMMENT.to_string());
        tokio::time::sleep(interval).await;
    }
    series
}
