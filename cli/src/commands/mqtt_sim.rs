//! `iotedge mqtt-sim`: publish numeric samples to the broker

use crate::output;
use anyhow::{Context, Result};
use clap::Args;
use iotedge_shared::protocol::mqtt::{data_topic, MQTT_PORT};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tracing::{debug, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args, Debug)]
pub struct MqttSimArgs {
    /// Broker host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Broker port
    #[arg(long, default_value_t = MQTT_PORT)]
    pub port: u16,

    /// Topic segments placed before `<tag>/data`
    #[arg(long, default_value = "sim/device")]
    pub topic_prefix: String,

    /// Tags to publish (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "temperature")]
    pub tags: Vec<String>,

    /// Samples to publish per tag
    #[arg(long, default_value_t = 10)]
    pub count: u32,

    /// Delay between rounds in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    /// Lower bound of the random values
    #[arg(long, default_value_t = 15.0, allow_hyphen_values = true)]
    pub min: f64,

    /// Upper bound of the random values
    #[arg(long, default_value_t = 25.0, allow_hyphen_values = true)]
    pub max: f64,
}

pub async fn run(args: MqttSimArgs) -> Result<()> {
    anyhow::ensure!(args.min < args.max, "--min must be below --max");

    let client_id = format!("iotedge-sim-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, &args.host, args.port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let events = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(event) => debug!("MQTT event: {:?}", event),
                Err(e) => {
                    warn!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    });

    let interval = Duration::from_millis(args.interval_ms);
    let mut published = 0u32;
    for round in 0..args.count {
        if round > 0 {
            tokio::time::sleep(interval).await;
        }
        for tag in &args.tags {
            let topic = data_topic(&args.topic_prefix, tag);
            let payload = sample_payload(args.min, args.max);
            debug!(%topic, %payload, "publishing");
            client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .context("Failed to queue publish")?;
            published += 1;
        }
    }

    client.disconnect().await.context("Failed to disconnect")?;
    if tokio::time::timeout(DRAIN_TIMEOUT, events).await.is_err() {
        output::warning("Broker did not acknowledge the disconnect in time");
    }
    output::success(&format!(
        "Published {} samples to {}:{}",
        published, args.host, args.port
    ));
    Ok(())
}

/// A random value in `min..max` formatted the way devices send it.
fn sample_payload(min: f64, max: f64) -> String {
    let value = rand::thread_rng().gen_range(min..max);
    format!("{:.2}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_payload_is_numeric_and_in_range() {
        for _ in 0..100 {
            let value: f64 = sample_payload(-5.0, 5.0).parse().unwrap();
            assert!((-5.0..=5.0).contains(&value));
        }
    }

    #[test]
    fn test_topics_end_in_data_segment() {
        assert_eq!(data_topic("sim/device", "temperature"), "sim/device/temperature/data");
    }
}
