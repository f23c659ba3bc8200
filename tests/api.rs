mod common;

use actix_web::{App, http::StatusCode, test, web::Data};
use common::FakeInterface;
use device_bringup::{
    api::Api,
    services::{
        network::{
            AcquisitionMode, AddressAcquisitionEngine, AddressingMode, NetworkConfig,
            StaticAddressing,
        },
        store::{ConfigStore, FileKeyValueStore, StoreError},
    },
};
use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::sync::broadcast;

type TestApi = Api<FakeInterface, FileKeyValueStore>;

const PAYLOAD: &str = r#"{"DHCP":"off","IP4Address":"192.0.2.1","NetMask":"255.255.255.0","isEnabled_CAN_1_0":1,"isEnabled_CAN_1_1":0,"isEnabled_CAN_1_2":0,"isEnabled_CAN_1_3":0,"isEnabled_CAN_2_0":0,"isEnabled_CAN_2_1":0,"isEnabled_CAN_2_2":0,"isEnabled_CAN_2_3":0}"#;

struct Fixture {
    _dir: TempDir,
    api: TestApi,
    restart_rx: broadcast::Receiver<()>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = ConfigStore::new(
        FileKeyValueStore::new(dir.path().join("nvs")).expect("failed to create store"),
    );
    std::fs::write(dir.path().join("index.html"), "<html></html>").expect("failed to write index");

    let (restart_tx, restart_rx) = broadcast::channel(1);
    let api = Api::new(
        Arc::new(AddressAcquisitionEngine::new(FakeInterface::new())),
        Arc::new(store),
        restart_tx,
        dir.path().to_path_buf(),
    );

    Fixture {
        _dir: dir,
        api,
        restart_rx,
    }
}

async fn bind_static(api: &TestApi) {
    api.engine
        .acquire(
            AcquisitionMode::Static(StaticAddressing::new("10.0.0.17", "255.255.255.0", None)),
            Duration::from_secs(30),
        )
        .await
        .expect("static bring-up failed");
}

#[actix_web::test]
async fn index_serves_static_page() {
    let fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(Data::new(fixture.api.clone()))
            .configure(TestApi::routes),
    )
    .await;

    let response = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_web::test]
async fn healthcheck_reports_bring_up_state() {
    let fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(Data::new(fixture.api.clone()))
            .configure(TestApi::routes),
    )
    .await;

    let request = test::TestRequest::get().uri("/healthcheck").to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = test::read_body_json(response).await;
    assert_eq!(body["state"], "UNCONFIGURED");

    bind_static(&fixture.api).await;

    let request = test::TestRequest::get().uri("/healthcheck").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(body["state"], "BOUND");
    assert_eq!(body["address"], "10.0.0.17");
}

#[actix_web::test]
async fn network_config_requires_binding() {
    let fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(Data::new(fixture.api.clone()))
            .configure(TestApi::routes),
    )
    .await;

    let request = test::TestRequest::get().uri("/network").to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    bind_static(&fixture.api).await;

    let request = test::TestRequest::get().uri("/network").to_request();
    let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(body["mode"], "static");
    assert_eq!(body["ipv4"]["address"], "10.0.0.17");
    assert_eq!(body["ipv4"]["netmask"], "255.255.255.0");
}

#[actix_web::test]
async fn set_network_config_persists_and_restarts() {
    let mut fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(Data::new(fixture.api.clone()))
            .configure(TestApi::routes),
    )
    .await;

    let request = test::TestRequest::post()
        .uri("/network")
        .insert_header(("content-type", "application/json"))
        .set_payload(PAYLOAD)
        .to_request();
    let response = test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(fixture.restart_rx.try_recv().is_ok());

    let stored = fixture.api.store.load().expect("config not stored");
    assert_eq!(stored.mode, AddressingMode::Static);
    assert_eq!(stored.address(), Some(Ipv4Addr::new(192, 0, 2, 1)));
}

#[actix_web::test]
async fn malformed_payload_is_bad_request() {
    let mut fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(Data::new(fixture.api.clone()))
            .configure(TestApi::routes),
    )
    .await;

    let request = test::TestRequest::post()
        .uri("/network")
        .insert_header(("content-type", "application/json"))
        .set_payload(r#"{"DHCP":"on","IP4Address":"192.0.2.1"}"#)
        .to_request();
    let response = test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(fixture.restart_rx.try_recv().is_err());
    assert!(matches!(
        fixture.api.store.load(),
        Err(StoreError::NotFound)
    ));
}

#[actix_web::test]
async fn dhcp_payload_stores_unbound_dhcp() {
    let fixture = fixture();
    let app = test::init_service(
        App::new()
            .app_data(Data::new(fixture.api.clone()))
            .configure(TestApi::routes),
    )
    .await;

    let request = test::TestRequest::post()
        .uri("/network")
        .set_payload(PAYLOAD.replace(r#""DHCP":"off""#, r#""DHCP":"on""#))
        .to_request();
    let response = test::call_service(&app, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        fixture.api.store.load().expect("config not stored"),
        NetworkConfig::dhcp_unbound()
    );
}
