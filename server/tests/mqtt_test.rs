use iotedge_server::broker::BrokerGateway;
use iotedge_server::buffer::AggregationBuffer;
use iotedge_server::config::BrokerConfig;
use iotedge_server::router::TopicRouter;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn free_port() -> u16 {
    TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_published_samples_reach_the_buffer() {
    let port = free_port();
    let buffer = Arc::new(AggregationBuffer::new());
    let config = BrokerConfig {
        connect_retry_ms: 100,
        ..BrokerConfig::default()
    };
    let cancel = CancellationToken::new();
    let gateway = BrokerGateway::new(port, config, TopicRouter::new(buffer.clone()));
    let gateway_task = tokio::spawn(gateway.run(cancel.clone()));

    let mut options = MqttOptions::new("test-device", "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(options, 16);
    tokio::spawn(async move {
        loop {
            if eventloop.poll().await.is_err() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    });

    // keep publishing until the subscriber has caught up
    let mut routed = false;
    for _ in 0..100 {
        let _ = client
            .publish("site/dev1/temp/data", QoS::AtLeastOnce, false, "21.5")
            .await;
        let _ = client
            .publish("site/dev1/temp/data", QoS::AtLeastOnce, false, "not a number")
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if buffer.sample_count() > 0 {
            routed = true;
            break;
        }
    }
    assert!(routed, "no sample was routed into the buffer");

    let drained = buffer.drain_and_clear();
    let temp = drained.iter().find(|s| s.tag == "temp").unwrap();
    assert!(temp.values.iter().all(|v| *v == 21.5));

    cancel.cancel();
    gateway_task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_heartbeat_reaches_the_buffer() {
    let port = free_port();
    let buffer = Arc::new(AggregationBuffer::new());
    let config = BrokerConfig {
        ping_interval_secs: 1,
        connect_retry_ms: 100,
        ..BrokerConfig::default()
    };
    let cancel = CancellationToken::new();
    let gateway = BrokerGateway::new(port, config, TopicRouter::new(buffer.clone()));
    let gateway_task = tokio::spawn(gateway.run(cancel.clone()));

    // the first tick can fire before the subscriptions are in place
    let mut ping = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if buffer.sample_count() > 0 {
            ping = buffer.drain_and_clear().into_iter().find(|s| s.tag == "ping");
            if ping.is_some() {
                break;
            }
        }
    }
    let ping = ping.expect("no heartbeat was routed into the buffer");
    assert!(ping.values.iter().all(|v| *v == -10.0));

    cancel.cancel();
    gateway_task.await.unwrap().unwrap();
}
