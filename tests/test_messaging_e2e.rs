//! End-to-end flows over the in-memory broker
//!
//! Device traffic is injected at the broker as another client would publish
//! it, and travels through the connection manager, router and handlers.

use chrono::Utc;
use ems_messaging::commands::{CommandCorrelator, CommandOutcome, CommandTarget};
use ems_messaging::config::GatewaysSection;
use ems_messaging::gateway::{
    GatewayEndpoint, GatewayManager, GatewayProtocol, GatewayStatus, NewGateway,
    HEARTBEAT_TIMEOUT_REASON,
};
use ems_messaging::handlers::{register_all, HandlerContext};
use ems_messaging::protocol::{CommandEnvelope, TopicBuilder};
use ems_messaging::routing::{handler_fn, InboundMessage, MessageRouter};
use ems_messaging::testing::{InMemoryPersistence, MemoryAuditLog, RecordingBroadcaster};
use ems_messaging::transport::{
    ConnectionManager, MemoryBroker, PublishOptions, QoS, ReconnectConfig,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    broker: Arc<MemoryBroker>,
    connection: Arc<ConnectionManager>,
    router: Arc<MessageRouter>,
    persistence: Arc<InMemoryPersistence>,
    broadcaster: Arc<RecordingBroadcaster>,
    gateways: Arc<GatewayManager>,
    topics: TopicBuilder,
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: None,
        backoff_pattern: vec![10, 20],
        sustained_delay: 50,
    }
}

async fn harness() -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let connection = ConnectionManager::new(broker.clone(), fast_reconnect(), 256).unwrap();
    let router = MessageRouter::new(connection.clone());
    router.start();

    let persistence = Arc::new(InMemoryPersistence::new());
    persistence.insert_device("9", "3", "Home battery");
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let topics = TopicBuilder::new("ems");
    let gateways = Arc::new(GatewayManager::new(
        persistence.clone(),
        Arc::new(MemoryAuditLog::new()),
        topics.clone(),
        &GatewaysSection::default(),
        None,
    ));

    register_all(
        &router,
        &topics,
        HandlerContext::new(persistence.clone(), broadcaster.clone()),
        gateways.clone(),
    )
    .await
    .unwrap();
    connection.connect().await.unwrap();

    Harness {
        broker,
        connection,
        router,
        persistence,
        broadcaster,
        gateways,
        topics,
    }
}

/// Poll until `condition` holds or a second has passed
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_telemetry_reaches_handler_with_params_and_is_stored_once() {
    let h = harness().await;
    let seen: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    h.router
        .add_handler(
            &h.topics.telemetry_pattern(),
            handler_fn("telemetry-recorder", move |message| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(message);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    h.broker.inject(
        "ems/3/devices/9/telemetry",
        json!({"power": 1500, "timestamp": "2024-05-01T12:00:00Z"}).to_string(),
        false,
    );

    assert!(eventually(|| h.persistence.readings().len() == 1).await);
    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);

    let message = seen.lock().unwrap()[0].clone();
    assert_eq!(message.param("siteId"), Some("3"));
    assert_eq!(message.param("deviceId"), Some("9"));
    assert_eq!(message.payload.as_json().unwrap()["power"], 1500);

    assert_eq!(h.persistence.create_reading_calls(), 1);
    assert_eq!(h.broadcaster.device_readings().len(), 1);
}

#[tokio::test]
async fn test_malformed_telemetry_does_not_stop_later_messages() {
    let h = harness().await;

    h.broker
        .inject(&h.topics.device_telemetry("3", "9"), "not json at all", false);
    h.broker.inject(
        &h.topics.device_telemetry("3", "9"),
        json!({"power": 250}).to_string(),
        false,
    );

    assert!(eventually(|| h.persistence.readings().len() == 1).await);
    assert_eq!(h.persistence.readings()[0].power, 250.0);
}

#[tokio::test]
async fn test_shared_subscription_topic_subscribed_once() {
    let broker = Arc::new(MemoryBroker::new());
    let connection =
        ConnectionManager::new(broker.clone(), ReconnectConfig::default(), 16).unwrap();
    connection.connect().await.unwrap();
    let router = MessageRouter::new(connection.clone());

    router
        .add_handler("a/+/b", handler_fn("first", |_| async { Ok(()) }))
        .await
        .unwrap();
    router
        .add_handler("a/:x/b", handler_fn("second", |_| async { Ok(()) }))
        .await
        .unwrap();

    assert_eq!(broker.subscribe_calls(), 1);
    assert_eq!(broker.active_filters(), vec!["a/+/b".to_string()]);
    assert_eq!(router.handler_count(), 2);
}

#[tokio::test]
async fn test_concurrent_connects_make_one_attempt() {
    let broker = Arc::new(MemoryBroker::new());
    let connection =
        ConnectionManager::new(broker.clone(), ReconnectConfig::default(), 16).unwrap();

    let (first, second) = tokio::join!(connection.connect(), connection.connect());

    assert!(first.is_ok() && second.is_ok());
    assert_eq!(broker.connect_attempts(), 1);
    connection.connect().await.unwrap();
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_subscriptions_replayed_after_connection_loss() {
    let h = harness().await;
    let before = h.broker.active_filters();

    h.broker.drop_connection("network partition");
    assert!(eventually(|| h.broker.connect_attempts() >= 2 && h.connection.is_connected()).await);

    assert_eq!(h.broker.active_filters(), before);
    h.broker.inject(
        &h.topics.device_telemetry("3", "9"),
        json!({"power": 42}).to_string(),
        false,
    );
    assert!(eventually(|| h.persistence.readings().len() == 1).await);
}

#[tokio::test]
async fn test_command_round_trip_resolves_exactly_once() {
    let h = harness().await;
    let correlator = CommandCorrelator::new(
        h.connection.clone(),
        h.topics.clone(),
        Duration::from_secs(5),
    );
    correlator.register_response_handler(&h.router).await.unwrap();

    // Act as the device: answer every command twice
    let broker = h.broker.clone();
    let topics = h.topics.clone();
    h.router
        .add_handler(
            &h.topics.device_commands("3", "9"),
            handler_fn("fake-device", move |message| {
                let broker = broker.clone();
                let topics = topics.clone();
                async move {
                    let envelope: CommandEnvelope = message.payload.parse().unwrap();
                    let reply = json!({
                        "commandId": envelope.command_id,
                        "success": true,
                        "appliedLimit": envelope.parameters["limit"]
                    })
                    .to_string();
                    let topic = topics.device_command_response("3", "9");
                    broker.inject(&topic, reply.clone(), false);
                    broker.inject(&topic, reply, false);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    let outcome = correlator
        .send_command(
            CommandTarget::device("3", "9"),
            "setChargeLimit",
            json!({"limit": 80}),
            None,
        )
        .await;

    assert_eq!(
        outcome,
        CommandOutcome::Completed {
            success: true,
            response: json!({"appliedLimit": 80}),
        }
    );
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_command_publish_failure_when_disconnected() {
    let h = harness().await;
    let correlator = CommandCorrelator::new(
        h.connection.clone(),
        h.topics.clone(),
        Duration::from_secs(5),
    );
    h.connection.disconnect().await.unwrap();

    let outcome = correlator
        .send_command(CommandTarget::device("3", "9"), "reboot", json!({}), None)
        .await;

    assert!(matches!(outcome, CommandOutcome::PublishFailed { .. }));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_gateway_heartbeat_and_timeout() {
    let h = harness().await;
    h.gateways
        .register_gateway(NewGateway {
            id: "gw-1".to_string(),
            name: "Roof gateway".to_string(),
            site_id: "3".to_string(),
            protocol: GatewayProtocol::MessageBroker,
            endpoint: GatewayEndpoint::new("10.0.0.5", 1883),
            heartbeat_interval_secs: 60,
        })
        .await
        .unwrap();

    h.broker.inject(
        &h.topics.gateway_heartbeat("gw-1"),
        json!({"uptimeSecs": 12}).to_string(),
        false,
    );

    let gateways = h.gateways.clone();
    assert!(
        eventually(|| gateways
            .list_gateways()
            .iter()
            .any(|g| g.id == "gw-1" && g.status == GatewayStatus::Connected))
        .await
    );

    let now = Utc::now();
    assert!(h
        .gateways
        .check_heartbeats(now + chrono::Duration::seconds(65))
        .await
        .is_empty());
    assert_eq!(
        h.gateways
            .check_heartbeats(now + chrono::Duration::seconds(71))
            .await,
        vec!["gw-1".to_string()]
    );

    let gateway = h.gateways.get_gateway("gw-1").await.unwrap();
    assert_eq!(gateway.status, GatewayStatus::Disconnected);
    assert_eq!(gateway.status_reason.as_deref(), Some(HEARTBEAT_TIMEOUT_REASON));
}

#[tokio::test]
async fn test_retained_publish_replayed_to_late_handler() {
    let h = harness().await;
    h.connection
        .publish(
            "ems/3/config",
            b"{\"tariff\":\"night\"}".to_vec(),
            PublishOptions::retained(QoS::AtLeastOnce),
        )
        .await
        .unwrap();
    assert_eq!(
        h.connection.retained("ems/3/config").unwrap().as_ref(),
        b"{\"tariff\":\"night\"}"
    );

    let seen: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    h.router
        .add_handler(
            "ems/:siteId/config",
            handler_fn("site-config", move |message| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(message);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    let message = seen.lock().unwrap()[0].clone();
    assert!(message.retained);
    assert_eq!(message.param("siteId"), Some("3"));
    assert_eq!(message.payload.as_json().unwrap()["tariff"], "night");
}
