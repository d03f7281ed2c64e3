//! Bridge Integration Tests
//!
//! Runs the bridge against in-process fake brokers and checks what reaches
//! the delivery sink.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use common::FakeBroker;
use mqtt_notify::protocol::{ProtocolVersion, QoS, ReasonCode};
use mqtt_notify::{
    Bridge, BridgeConfig, BridgeError, BrokerConfig, ChannelSink, ConnectError, ManagerState,
    NormalizedMessage, SessionStatus, ValidationError,
};

fn broker_config(broker: &FakeBroker, topics: &[&str]) -> BrokerConfig {
    let mut config = BrokerConfig::new(broker.address()).with_topics(topics.iter().copied());
    config.reconnect_interval = Duration::from_millis(50);
    config.max_reconnect_interval = Duration::from_millis(200);
    config.connect_timeout = Duration::from_secs(2);
    config
}

fn unreachable_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

async fn bridge_with(
    config: BridgeConfig,
) -> (Bridge, UnboundedReceiver<NormalizedMessage>) {
    let (sink, rx) = ChannelSink::channel();
    let bridge = Bridge::new(Arc::new(sink), config).await.unwrap();
    (bridge, rx)
}

async fn next_message(rx: &mut UnboundedReceiver<NormalizedMessage>) -> NormalizedMessage {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("sink channel closed")
}

async fn assert_no_message(rx: &mut UnboundedReceiver<NormalizedMessage>) {
    if let Ok(Some(message)) = timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected notification: {:?}", message);
    }
}

#[tokio::test]
async fn test_plain_text_delivered() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["*"])])).await;

    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    assert_eq!(broker.publish_to_all("x", b"hello"), 1);
    assert_eq!(next_message(&mut rx).await, NormalizedMessage::text("hello"));
}

#[tokio::test]
async fn test_json_payload_delivered() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["alerts/#"])])).await;

    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    broker.publish("alerts/door", br#"{"message":"m","priority":5}"#);
    let message = next_message(&mut rx).await;
    assert_eq!(message.message, "m");
    assert_eq!(message.priority, Some(5));
    assert_eq!(message.title, None);
}

#[tokio::test]
async fn test_malformed_json_dropped() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;

    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    broker.publish("t", b"{bad");
    broker.publish("t", b"after");
    // The malformed payload produced nothing, so the next one comes first
    assert_eq!(next_message(&mut rx).await, NormalizedMessage::text("after"));
    assert_no_message(&mut rx).await;
}

#[tokio::test]
async fn test_connect_sends_client_id_and_subscriptions() {
    let broker = FakeBroker::start().await;
    let config = broker_config(&broker, &["a/+", "b/#", "*"]);
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![config])).await;

    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    let connects = broker.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].client_id, "gotify");
    assert_eq!(connects[0].username, None);
    assert_eq!(connects[0].password, None);
    assert_eq!(connects[0].protocol_version, ProtocolVersion::V311);

    let subscribes = broker.subscribes();
    assert_eq!(subscribes.len(), 1);
    let filters: Vec<_> = subscribes[0]
        .subscriptions
        .iter()
        .map(|s| (s.filter.as_str(), s.qos))
        .collect();
    assert_eq!(
        filters,
        vec![
            ("a/+", QoS::AtMostOnce),
            ("b/#", QoS::AtMostOnce),
            ("*", QoS::AtMostOnce),
        ]
    );
}

#[tokio::test]
async fn test_credentials_sent_only_when_set() {
    let broker = FakeBroker::start().await;
    let with_creds = broker_config(&broker, &["t"]).with_credentials("alice", "s3cret");
    let empty_creds = broker_config(&broker, &["t"]).with_credentials("", "");
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![with_creds, empty_creds])).await;

    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(2).await;

    let connects = broker.connects();
    assert_eq!(connects[0].username.as_deref(), Some("alice"));
    assert_eq!(connects[0].password.as_deref(), Some(&b"s3cret"[..]));
    assert_eq!(connects[1].username, None);
    assert_eq!(connects[1].password, None);
}

#[tokio::test]
async fn test_no_topics_means_no_subscribe() {
    let broker = FakeBroker::start().await;
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![broker_config(&broker, &[])])).await;

    bridge.enable().await.unwrap();
    broker.wait_until("client", |b| b.client_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.subscribes().is_empty());
}

#[tokio::test]
async fn test_messages_from_all_brokers_reach_one_sink() {
    let a = FakeBroker::start().await;
    let b = FakeBroker::start().await;
    let (bridge, mut rx) = bridge_with(BridgeConfig::new(vec![
        broker_config(&a, &["a"]),
        broker_config(&b, &["b"]),
    ]))
    .await;

    bridge.enable().await.unwrap();
    a.wait_for_subscribers(1).await;
    b.wait_for_subscribers(1).await;

    a.publish("a", b"from a");
    assert_eq!(next_message(&mut rx).await.message, "from a");
    b.publish("b", b"from b");
    assert_eq!(next_message(&mut rx).await.message, "from b");
}

#[tokio::test]
async fn test_partial_connect_failure_keeps_earlier_sessions() {
    let broker = FakeBroker::start().await;
    let missing = unreachable_address();
    let (bridge, mut rx) = bridge_with(BridgeConfig::new(vec![
        broker_config(&broker, &["t"]),
        BrokerConfig::new(missing.clone()).with_topics(["t"]),
    ]))
    .await;

    match bridge.enable().await {
        Err(BridgeError::Connect { address, source }) => {
            assert_eq!(address, missing);
            assert!(matches!(source, ConnectError::Io(_)));
        }
        other => panic!("expected connect error, got {:?}", other),
    }

    assert_eq!(bridge.status().await.len(), 1);
    broker.wait_for_subscribers(1).await;
    broker.publish("t", b"still here");
    assert_eq!(next_message(&mut rx).await.message, "still here");
}

#[tokio::test]
async fn test_refused_connection_reports_reason() {
    let broker = FakeBroker::start().await;
    broker.refuse_with(ReasonCode::BadUserNameOrPassword);
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;

    match bridge.enable().await {
        Err(BridgeError::Connect {
            source: ConnectError::Refused(code),
            ..
        }) => assert_eq!(code, ReasonCode::BadUserNameOrPassword),
        other => panic!("expected refused connection, got {:?}", other),
    }
    assert_eq!(bridge.state().await, ManagerState::Configured);
}

#[tokio::test]
async fn test_invalid_config_leaves_sessions_running() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    let bad = BridgeConfig::new(vec![BrokerConfig::new("")]);
    match bridge.apply_config(bad).await {
        Err(BridgeError::InvalidConfig(ValidationError::InvalidAddress { index, .. })) => {
            assert_eq!(index, 0)
        }
        other => panic!("expected invalid config, got {:?}", other),
    }

    assert_eq!(bridge.state().await, ManagerState::Connected);
    assert_eq!(broker.disconnect_count(), 0);
    broker.publish("t", b"unaffected");
    assert_eq!(next_message(&mut rx).await.message, "unaffected");
}

#[tokio::test]
async fn test_reconfigure_replaces_brokers() {
    let a = FakeBroker::start().await;
    let b = FakeBroker::start().await;
    let (bridge, mut rx) = bridge_with(BridgeConfig::new(vec![broker_config(&a, &["t"])])).await;
    bridge.enable().await.unwrap();
    a.wait_for_subscribers(1).await;

    bridge
        .apply_config(BridgeConfig::new(vec![broker_config(&b, &["t"])]))
        .await
        .unwrap();

    a.wait_until("disconnect from A", |a| a.disconnect_count() == 1)
        .await;
    b.wait_for_subscribers(1).await;

    let status = bridge.status().await;
    assert_eq!(status, vec![(b.address(), SessionStatus::Connected)]);

    assert_eq!(a.publish("t", b"old"), 0);
    b.publish("t", b"new");
    assert_eq!(next_message(&mut rx).await.message, "new");
}

#[tokio::test]
async fn test_apply_config_while_disabled_defers_connect() {
    let broker = FakeBroker::start().await;
    let (bridge, _rx) = bridge_with(BridgeConfig::empty()).await;

    bridge
        .apply_config(BridgeConfig::new(vec![broker_config(&broker, &["t"])]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.connects().is_empty());

    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_disable_twice_closes_everything() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    bridge.disable().await;
    bridge.disable().await;

    assert!(bridge.status().await.is_empty());
    assert_eq!(bridge.state().await, ManagerState::Disabled);
    broker
        .wait_until("DISCONNECT", |b| b.disconnect_count() == 1)
        .await;
    broker.wait_until("no clients", |b| b.client_count() == 0).await;

    assert_eq!(broker.publish("t", b"nobody listening"), 0);
    assert_no_message(&mut rx).await;
}

#[tokio::test]
async fn test_disable_does_not_wait_for_grace() {
    let broker = FakeBroker::start().await;
    let mut config = broker_config(&broker, &["t"]);
    config.disconnect_grace = Duration::from_secs(10);
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![config])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    let started = std::time::Instant::now();
    bridge.disable().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_enable_twice_reconnects() {
    let broker = FakeBroker::start().await;
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;

    bridge.enable().await.unwrap();
    bridge.enable().await.unwrap();

    assert_eq!(bridge.status().await.len(), 1);
    broker.wait_until("second connect", |b| b.connects().len() == 2).await;
    broker.wait_until("one client", |b| b.client_count() == 1).await;
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    broker.kick_all();
    broker
        .wait_until("reconnect", |b| b.subscribes().len() == 2 && b.subscriber_count() == 1)
        .await;

    broker.publish("t", b"after reconnect");
    assert_eq!(next_message(&mut rx).await.message, "after reconnect");
    assert_eq!(bridge.status().await[0].1, SessionStatus::Connected);
}

#[tokio::test]
async fn test_no_reconnect_when_disabled_in_config() {
    let broker = FakeBroker::start().await;
    let mut config = broker_config(&broker, &["t"]);
    config.auto_reconnect = false;
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![config])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    broker.kick_all();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bridge.status().await[0].1 != SessionStatus::Disconnected {
        assert!(tokio::time::Instant::now() < deadline, "session never noticed the drop");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_qos1_publish_is_acknowledged() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    broker.publish_qos1("t", b"acked", 42);
    assert_eq!(next_message(&mut rx).await.message, "acked");
    broker.wait_until("PUBACK", |b| b.pubacks() == vec![42]).await;
}

#[tokio::test]
async fn test_mqtt_v5_session() {
    let broker = FakeBroker::start().await;
    let mut config = broker_config(&broker, &["v5/#"]);
    config.protocol_version = ProtocolVersion::V5;
    let (bridge, mut rx) = bridge_with(BridgeConfig::new(vec![config])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    assert_eq!(broker.connects()[0].protocol_version, ProtocolVersion::V5);
    broker.publish("v5/x", br#"{"title":"t","message":"five"}"#);
    let message = next_message(&mut rx).await;
    assert_eq!(message.title.as_deref(), Some("t"));
    assert_eq!(message.message, "five");
}

#[tokio::test]
async fn test_large_payload_delivered_by_default() {
    let broker = FakeBroker::start().await;
    let (bridge, mut rx) =
        bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    let payload = vec![b'a'; 2 * 1024 * 1024];
    broker.publish("t", &payload);
    assert_eq!(next_message(&mut rx).await.message.len(), payload.len());
    assert_eq!(broker.connects().len(), 1);
}

#[tokio::test]
async fn test_oversized_packet_skipped_without_reconnect() {
    let broker = FakeBroker::start().await;
    let mut config = broker_config(&broker, &["t"]);
    config.protocol_version = ProtocolVersion::V5;
    config.max_packet_size = 1024;
    let (bridge, mut rx) = bridge_with(BridgeConfig::new(vec![config])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    assert_eq!(broker.connects()[0].max_packet_size, Some(1024));

    broker.publish("t", &vec![b'a'; 64 * 1024]);
    broker.publish("t", b"small");
    assert_eq!(next_message(&mut rx).await.message, "small");
    assert_eq!(broker.connects().len(), 1);
    assert_eq!(bridge.status().await[0].1, SessionStatus::Connected);
}

#[tokio::test]
async fn test_zero_reconnect_interval_is_throttled() {
    let broker = FakeBroker::start().await;
    let mut config = broker_config(&broker, &["t"]);
    config.reconnect_interval = Duration::ZERO;
    config.max_reconnect_interval = Duration::ZERO;
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![config])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    broker.refuse_with(ReasonCode::NotAuthorized);
    broker.kick_all();
    broker.wait_until("first retry", |b| b.connects().len() >= 2).await;

    let before = broker.connects().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let attempts = broker.connects().len() - before;
    assert!(attempts < 10, "{} reconnect attempts in 500ms", attempts);

    bridge.disable().await;
}

#[tokio::test]
async fn test_disable_during_backoff_stops_retries() {
    let broker = FakeBroker::start().await;
    let (bridge, _rx) = bridge_with(BridgeConfig::new(vec![broker_config(&broker, &["t"])])).await;
    bridge.enable().await.unwrap();
    broker.wait_for_subscribers(1).await;

    broker.refuse_with(ReasonCode::NotAuthorized);
    broker.kick_all();
    broker.wait_until("refused retries", |b| b.connects().len() >= 3).await;
    assert_eq!(bridge.status().await[0].1, SessionStatus::Reconnecting);

    bridge.disable().await;
    // Let an attempt already on the wire land before counting
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_disable = broker.connects().len();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(broker.connects().len(), after_disable);
    assert_eq!(broker.client_count(), 0);
}
