//! `iotedge conf-device`: change a device's sampling interval and buffer size

use crate::output;
use anyhow::Result;
use clap::Args;
use iotedge_shared::protocol::http::URI_DEVICE_CONFIGURE;
use iotedge_shared::{ConfigureDeviceRequest, Device};
use std::time::Duration;

/// Administrative calls may wait on a slow registry
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Args, Debug)]
pub struct ConfDeviceArgs {
    /// Registered device name
    pub device: String,

    /// Sampling interval in seconds
    pub interval: f32,

    /// Number of samples the device buffers before uploading
    pub buffer: i32,

    /// Server base URL
    #[arg(long, default_value = super::DEFAULT_URL, env = "IOTEDGE_URL")]
    pub url: String,
}

pub async fn run(args: ConfDeviceArgs) -> Result<()> {
    let request = ConfigureDeviceRequest {
        name: args.device,
        interval: args.interval,
        buffer: args.buffer,
    };
    let device = configure(&args.url, &request).await?;
    output::success(&format!("Configured {}", output::device_summary(&device)));
    Ok(())
}

async fn configure(base: &str, request: &ConfigureDeviceRequest) -> Result<Device> {
    let url = super::endpoint(base, URI_DEVICE_CONFIGURE);
    super::post_json(&url, request, ADMIN_TIMEOUT).await
}
