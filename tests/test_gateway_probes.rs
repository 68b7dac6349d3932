//! Gateway connection tests against real sockets
//!
//! HTTP gateways are stood in for by a wiremock server, raw-TCP gateways by a
//! local listener. Each outcome must be reflected in the gateway's status.

use ems_messaging::config::GatewaysSection;
use ems_messaging::gateway::{
    GatewayCredentials, GatewayEndpoint, GatewayManager, GatewayProtocol, GatewayStatus,
    NewGateway, ProbeFailure,
};
use ems_messaging::protocol::TopicBuilder;
use ems_messaging::testing::{InMemoryPersistence, MemoryAuditLog};
use std::net::SocketAddr;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn manager() -> (GatewayManager, Arc<InMemoryPersistence>) {
    let persistence = Arc::new(InMemoryPersistence::new());
    let settings = GatewaysSection {
        probe_timeout_ms: 2000,
        ..GatewaysSection::default()
    };
    let manager = GatewayManager::new(
        persistence.clone(),
        Arc::new(MemoryAuditLog::new()),
        TopicBuilder::new("ems"),
        &settings,
        None,
    );
    (manager, persistence)
}

async fn register(manager: &GatewayManager, protocol: GatewayProtocol, address: SocketAddr) {
    let mut endpoint = GatewayEndpoint::new(&address.ip().to_string(), address.port());
    if protocol == GatewayProtocol::Http {
        endpoint.path = Some("/status".to_string());
    }
    manager
        .register_gateway(NewGateway {
            id: "gw-1".to_string(),
            name: "Inverter bridge".to_string(),
            site_id: "3".to_string(),
            protocol,
            endpoint,
            heartbeat_interval_secs: 60,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_http_gateway_reachable_becomes_connected() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (manager, persistence) = manager();
    register(&manager, GatewayProtocol::Http, *mock_server.address()).await;

    let outcome = manager.test_connection("gw-1").await.unwrap();

    assert!(outcome.success);
    assert!(outcome.latency_ms.is_some());
    let gateway = manager.get_gateway("gw-1").await.unwrap();
    assert_eq!(gateway.status, GatewayStatus::Connected);
    assert!(gateway.last_heartbeat.is_some());
    assert_eq!(
        persistence.gateway_status("gw-1"),
        Some((GatewayStatus::Connected, None))
    );
}

#[tokio::test]
async fn test_http_gateway_rejecting_credentials_is_auth_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let (manager, _) = manager();
    register(&manager, GatewayProtocol::Http, *mock_server.address()).await;

    let outcome = manager.test_connection("gw-1").await.unwrap();

    assert!(!outcome.success);
    assert!(matches!(outcome.failure, Some(ProbeFailure::Auth(_))));
    let gateway = manager.get_gateway("gw-1").await.unwrap();
    assert_eq!(gateway.status, GatewayStatus::Error);
    assert!(gateway
        .status_reason
        .as_deref()
        .unwrap()
        .starts_with("authentication rejected"));
}

#[tokio::test]
async fn test_http_gateway_server_error_reported_with_status() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let (manager, _) = manager();
    register(&manager, GatewayProtocol::Http, *mock_server.address()).await;

    let outcome = manager.test_connection("gw-1").await.unwrap();

    assert_eq!(outcome.failure, Some(ProbeFailure::HttpStatus(503)));
    assert_eq!(
        manager.get_gateway("gw-1").await.unwrap().status_reason.as_deref(),
        Some("HTTP status 503")
    );
}

#[tokio::test]
async fn test_http_probe_sends_issued_api_key() {
    let mock_server = MockServer::start().await;
    let (manager, _) = manager();
    register(&manager, GatewayProtocol::Http, *mock_server.address()).await;

    let GatewayCredentials::Http { api_key } = manager.issue_credentials("gw-1").await.unwrap()
    else {
        panic!("http gateway should receive an api key");
    };

    Mock::given(method("GET"))
        .and(path("/status"))
        .and(header("X-API-Key", api_key.as_str()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    assert!(manager.test_connection("gw-1").await.unwrap().success);
}

#[tokio::test]
async fn test_tcp_gateway_listening_becomes_connected() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let (manager, _) = manager();
    register(&manager, GatewayProtocol::RawTcp, address).await;

    let outcome = manager.test_connection("gw-1").await.unwrap();

    assert!(outcome.success);
    assert_eq!(
        manager.get_gateway("gw-1").await.unwrap().status,
        GatewayStatus::Connected
    );
    accept.abort();
}

#[tokio::test]
async fn test_tcp_gateway_closed_port_is_refused() {
    // Bind then drop to get a port nothing listens on
    let address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (manager, _) = manager();
    register(&manager, GatewayProtocol::RawTcp, address).await;

    let outcome = manager.test_connection("gw-1").await.unwrap();

    assert_eq!(outcome.failure, Some(ProbeFailure::Refused));
    let gateway = manager.get_gateway("gw-1").await.unwrap();
    assert_eq!(gateway.status, GatewayStatus::Error);
    assert_eq!(gateway.status_reason.as_deref(), Some("connection refused"));
}
