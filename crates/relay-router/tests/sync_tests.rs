//! Configuration client and sync service against a mock control plane.

mod support;

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_common::{WarningCode, WarningSeverity};
use relay_router::{ConfigClient, ConfigSyncConfig, ConfigSyncService};

use support::{manager_with_pool_factory, MockPoolFactory};

fn sync_config(url: String, attempts: u32) -> ConfigSyncConfig {
    ConfigSyncConfig {
        config_url: url,
        sync_interval: Duration::from_secs(300),
        initial_delay: Duration::from_millis(10),
        max_retry_attempts: attempts,
        retry_delay: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
    }
}

const CONFIG_BODY: &str = r#"{
    "queues": [
        { "queueName": "orders", "queueUri": "https://broker.example/orders", "connections": 2 }
    ],
    "connections": 1,
    "processingPools": [
        { "code": "POOL-A", "concurrency": 10, "rateLimitPerMinute": 600 },
        { "code": "POOL-B", "concurrency": 5 }
    ]
}"#;

#[tokio::test]
async fn initial_sync_applies_pools_and_consumers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CONFIG_BODY, "application/json"))
        .mount(&server)
        .await;

    let harness = manager_with_pool_factory(MockPoolFactory::new());
    let sync = ConfigSyncService::new(
        sync_config(format!("{}/config", server.uri()), 3),
        harness.manager.clone(),
        harness.warnings.clone(),
        None,
    );

    let config = sync.initial_sync().await.expect("initial sync");
    assert_eq!(config.processing_pools.len(), 2);

    let mut codes = harness.manager.pool_codes();
    codes.sort();
    assert_eq!(codes, vec!["POOL-A", "POOL-B"]);
    assert_eq!(harness.manager.consumer_ids().await, vec!["orders"]);
}

#[tokio::test]
async fn fetch_retries_before_succeeding() {
    let server = MockServer::start().await;
    // Two failures, then success.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CONFIG_BODY, "application/json"))
        .mount(&server)
        .await;

    let client = ConfigClient::new(sync_config(server.uri(), 5));
    let config = client.fetch().await.expect("fetch should recover");
    assert_eq!(config.processing_pools.len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn initial_sync_failure_is_fatal_after_all_retries() {
    // S7: the control plane never answers; the router must give up with a
    // critical warning so the process can exit non-zero.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let harness = manager_with_pool_factory(MockPoolFactory::new());
    let sync = ConfigSyncService::new(
        sync_config(format!("{}/config", server.uri()), 3),
        harness.manager.clone(),
        harness.warnings.clone(),
        None,
    );

    let result = sync.initial_sync().await;
    assert!(result.is_err());

    let warnings = harness.warnings.by_code(WarningCode::ConfigSyncFailed);
    assert!(warnings
        .iter()
        .any(|w| w.severity == WarningSeverity::Critical));
}

#[tokio::test]
async fn scheduled_sync_failure_keeps_last_known_good_config() {
    let server = MockServer::start().await;
    {
        let _ok = Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(CONFIG_BODY, "application/json"))
            .expect(1)
            .mount_as_scoped(&server)
            .await;

        let harness = manager_with_pool_factory(MockPoolFactory::new());
        let sync = ConfigSyncService::new(
            sync_config(format!("{}", server.uri()), 1),
            harness.manager.clone(),
            harness.warnings.clone(),
            None,
        );
        sync.initial_sync().await.expect("initial sync");

        // The control plane goes away; the scheduled sync only warns.
        drop(_ok);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        sync.sync().await;

        let mut codes = harness.manager.pool_codes();
        codes.sort();
        assert_eq!(codes, vec!["POOL-A", "POOL-B"], "pools survive the failed sync");
        let warnings = harness.warnings.by_code(WarningCode::ConfigSyncFailed);
        assert!(warnings.iter().any(|w| w.severity == WarningSeverity::Warn));
        assert!(harness.manager.is_running());
    }
}

#[tokio::test]
async fn unchanged_config_skips_reconcile_changed_config_applies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CONFIG_BODY, "application/json"))
        .mount(&server)
        .await;

    let harness = manager_with_pool_factory(MockPoolFactory::new());
    let sync = ConfigSyncService::new(
        sync_config(server.uri(), 1),
        harness.manager.clone(),
        harness.warnings.clone(),
        None,
    );
    sync.initial_sync().await.expect("initial sync");

    // Same payload: nothing changes.
    sync.sync().await;
    let mut codes = harness.manager.pool_codes();
    codes.sort();
    assert_eq!(codes, vec!["POOL-A", "POOL-B"]);

    // New payload: POOL-B retired, POOL-C added.
    server.reset().await;
    let changed = r#"{
        "queues": [],
        "processingPools": [
            { "code": "POOL-A", "concurrency": 10, "rateLimitPerMinute": 600 },
            { "code": "POOL-C", "concurrency": 2 }
        ]
    }"#;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(changed, "application/json"))
        .mount(&server)
        .await;

    sync.sync().await;
    let mut codes = harness.manager.pool_codes();
    codes.sort();
    assert_eq!(codes, vec!["POOL-A", "POOL-C"]);
}
