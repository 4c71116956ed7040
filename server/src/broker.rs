//! Broker gateway: embedded MQTT broker plus the co-located subscriber that
//! feeds every data publication into the topic router.

use crate::config::BrokerConfig;
use crate::metrics;
use crate::router::TopicRouter;
use iotedge_shared::protocol::mqtt::{DATA_TOPIC_FILTERS, PING_PAYLOAD, PING_TOPIC};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SUBSCRIBER_ID: &str = "iotedge-subscriber";
const CLIENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("cannot bind MQTT listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid broker configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("broker failed: {0}")]
    Broker(String),
}

pub struct BrokerGateway {
    port: u16,
    config: BrokerConfig,
    router: TopicRouter,
}

impl BrokerGateway {
    pub fn new(port: u16, config: BrokerConfig, router: TopicRouter) -> Self {
        Self {
            port,
            config,
            router,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Broker settings: one MQTT v4 listener on the configured port.
    pub fn broker_config(&self) -> Result<rumqttd::Config, GatewayError> {
        let toml = format!(
            r#"
id = 0

[router]
max_connections = {max_connections}
max_outgoing_packet_count = 200
max_segment_size = 104857600
max_segment_count = 10

[v4.1]
name = "iotedge-v4"
listen = "{listen}"
next_connection_delay_ms = 1

[v4.1.connections]
connection_timeout_ms = 60000
max_payload_size = {max_payload_size}
max_inflight_count = 100
dynamic_filters = true
"#,
            max_connections = self.config.max_connections,
            listen = self.listen_addr(),
            max_payload_size = self.config.max_payload_size,
        );

        let settings = config::Config::builder()
            .add_source(config::File::from_str(&toml, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Check the listener port is free, then run the broker on its own thread.
    ///
    /// The broker only logs bind failures from inside its threads, so the port
    /// is probed here first and a conflict is returned to the caller.
    pub fn start_broker(&self) -> Result<std::thread::JoinHandle<()>, GatewayError> {
        let addr = self.listen_addr();
        let probe = TcpListener::bind(addr).map_err(|source| GatewayError::Bind { addr, source })?;
        drop(probe);

        let mut broker = rumqttd::Broker::new(self.broker_config()?);
        tracing::info!("MQTT broker listening on {}", addr);
        std::thread::Builder::new()
            .name("mqtt-broker".into())
            .spawn(move || {
                if let Err(e) = broker.start() {
                    tracing::error!("MQTT broker stopped: {}", e);
                }
            })
            .map_err(|e| GatewayError::Broker(e.to_string()))
    }

    /// Start the broker and run the subscriber until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let _broker = self.start_broker()?;

        let mut options = MqttOptions::new(SUBSCRIBER_ID, "127.0.0.1", self.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        options.set_max_packet_size(self.config.max_payload_size, self.config.max_payload_size);
        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);

        let ping = tokio::spawn(publish_ping(
            client.clone(),
            self.config.ping_interval(),
            cancel.clone(),
        ));

        let inflight = Arc::new(Semaphore::new(self.config.max_inflight_routes));
        loop {
            let event = tokio::select! {
                event = eventloop.poll() => event,
                _ = cancel.cancelled() => break,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("subscriber connected to broker");
                    subscribe_all(&client);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // waiting here stalls the event loop, which is the back-pressure
                    if dispatch_bounded(&inflight, &self.router, publish).await.is_none() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("MQTT subscriber connection error: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.connect_retry()) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        let _ = client.try_disconnect();
        drop(eventloop);
        let _ = ping.await;
        tracing::info!("MQTT subscriber stopped");
        Ok(())
    }
}

/// Route one publication on its own task once an in-flight slot is free.
///
/// Returns `None` if the semaphore was closed.
async fn dispatch_bounded(
    inflight: &Arc<Semaphore>,
    router: &TopicRouter,
    publish: Publish,
) -> Option<JoinHandle<()>> {
    let permit = inflight.clone().acquire_owned().await.ok()?;
    let router = router.clone();
    metrics::INFLIGHT_ROUTES.inc();
    Some(tokio::spawn(async move {
        router.dispatch(&publish.topic, &publish.payload);
        metrics::INFLIGHT_ROUTES.dec();
        drop(permit);
    }))
}

/// Issue every data subscription; called on each connection acknowledgement.
fn subscribe_all(client: &AsyncClient) {
    for filter in DATA_TOPIC_FILTERS {
        if let Err(e) = client.try_subscribe(filter, QoS::AtLeastOnce) {
            tracing::error!(filter = %filter, "failed to subscribe: {}", e);
        }
    }
}

/// Heartbeat publication; failures are logged and ignored.
async fn publish_ping(client: AsyncClient, every: std::time::Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }
        if let Err(e) = client
            .publish(PING_TOPIC, QoS::AtMostOnce, false, PING_PAYLOAD)
            .await
        {
            tracing::warn!("ping publish failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AggregationBuffer;

    fn gateway(port: u16) -> BrokerGateway {
        let router = TopicRouter::new(Arc::new(AggregationBuffer::new()));
        BrokerGateway::new(port, BrokerConfig::default(), router)
    }

    #[test]
    fn test_broker_config_has_single_listener() {
        let config = gateway(18830).broker_config().unwrap();
        let v4 = config.v4.expect("v4 listeners");
        assert_eq!(v4.len(), 1);
        let server = v4.values().next().unwrap();
        assert_eq!(server.listen, "0.0.0.0:18830".parse::<SocketAddr>().unwrap());
        assert_eq!(server.connections.max_payload_size, 20 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_waits_for_a_free_slot() {
        let buffer = Arc::new(AggregationBuffer::new());
        let router = TopicRouter::new(buffer.clone());
        let inflight = Arc::new(Semaphore::new(1));
        let publish = || Publish::new("site/dev1/temp/data", QoS::AtMostOnce, b"21.5".to_vec());

        let held = inflight.clone().acquire_owned().await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            dispatch_bounded(&inflight, &router, publish()),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(buffer.sample_count(), 0);

        drop(held);
        let task = dispatch_bounded(&inflight, &router, publish()).await.unwrap();
        task.await.unwrap();
        assert_eq!(buffer.sample_count(), 1);
        assert_eq!(inflight.available_permits(), 1);

        inflight.close();
        assert!(dispatch_bounded(&inflight, &router, publish()).await.is_none());
    }

    #[test]
    fn test_port_in_use_is_bind_error() {
        let held = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let err = gateway(port).start_broker().unwrap_err();
        assert!(matches!(err, GatewayError::Bind { .. }));
    }
}
