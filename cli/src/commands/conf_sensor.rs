//! `iotedge conf-sensor`: set a sensor's calibration offset

use super::conf_device::ADMIN_TIMEOUT;
use crate::output;
use anyhow::Result;
use clap::Args;
use iotedge_shared::protocol::http::URI_SENSOR_CONFIGURE;
use iotedge_shared::{ConfigureSensorRequest, Device};

#[derive(Args, Debug)]
pub struct ConfSensorArgs {
    /// Device the sensor belongs to
    pub device: String,

    /// Sensor name as registered by the device
    pub sensor: String,

    /// Offset added to every value the sensor reports
    #[arg(allow_hyphen_values = true)]
    pub offset: f32,

    /// Server base URL
    #[arg(long, default_value = super::DEFAULT_URL, env = "IOTEDGE_URL")]
    pub url: String,
}

pub async fn run(args: ConfSensorArgs) -> Result<()> {
    let request = ConfigureSensorRequest {
        name: args.device,
        sensor_name: args.sensor,
        offset: args.offset,
    };
    let url = super::endpoint(&args.url, URI_SENSOR_CONFIGURE);
    let device: Device = super::post_json(&url, &request, ADMIN_TIMEOUT).await?;
    output::success(&format!(
        "Sensor {} offset set to {} on {}",
        request.sensor_name,
        request.offset,
        output::device_summary(&device)
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        args: ConfSensorArgs,
    }

    #[test]
    fn test_negative_offset_parses() {
        let cli = Cli::parse_from(["iotedge", "Basel3", "Basel3Temperature", "-2.5"]);
        assert_eq!(cli.args.offset, -2.5);
        assert_eq!(cli.args.sensor, "Basel3Temperature");
        assert_eq!(cli.args.url, crate::commands::DEFAULT_URL);
    }
}
