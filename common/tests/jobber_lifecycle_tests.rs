// Integration tests for jobber start/stop, dispatch and drain over the memory broker

mod support;

use common::errors::{MqError, QueueError};
use common::forward::HttpForwarder;
use common::mq::JobberState;
use std::sync::Arc;
use std::time::Duration;
use support::{definition, wait_until, Harness, StubForwarder, PANIC_MARKER};
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_start_declares_topology_and_matches_prefetch() {
    let forwarder = Arc::new(StubForwarder::ok(Duration::ZERO));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 4, Some("orders.x"))).unwrap();
    jobber.start().await.unwrap();

    assert_eq!(jobber.state(), JobberState::Running);
    assert!(harness.broker.queue_exists("orders.q"));
    assert_eq!(harness.broker.exchange_kind("orders.x").as_deref(), Some("direct"));
    assert!(harness.broker.is_bound("orders.q", "orders.x", "orders.key"));
    assert_eq!(harness.broker.prefetch("orders.q"), Some(4));
    assert!(jobber.status().started_at.is_some());
}

#[tokio::test]
async fn test_every_delivery_is_forwarded_and_acked_once() {
    let forwarder = Arc::new(StubForwarder::ok(Duration::from_millis(2)));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 3, None)).unwrap();
    jobber.start().await.unwrap();
    for i in 0..25 {
        harness.broker.publish("orders.q", format!(r#"{{"id":{}}}"#, i));
    }

    assert!(wait_until(WAIT, || harness.broker.acked("orders.q") == 25).await);
    let acks = harness.broker.ack_counts("orders.q");
    assert_eq!(acks.len(), 25);
    assert!(acks.values().all(|n| *n == 1));
    assert_eq!(forwarder.calls(), 25);
    assert!(forwarder.urls().iter().all(|u| u == "http://stub.invalid/orders"));
}

#[tokio::test]
async fn test_in_flight_never_exceeds_worker_num() {
    let forwarder = Arc::new(StubForwarder::ok(Duration::from_millis(20)));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 3, None)).unwrap();
    jobber.start().await.unwrap();
    for i in 0..15 {
        harness.broker.publish("orders.q", format!("{}", i));
    }

    assert!(wait_until(WAIT, || harness.broker.acked("orders.q") == 15).await);
    assert!(forwarder.max_concurrency() <= 3);
    assert!(forwarder.max_concurrency() >= 1);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_deliveries() {
    let forwarder = Arc::new(StubForwarder::ok(Duration::from_millis(100)));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 2, None)).unwrap();
    jobber.start().await.unwrap();
    harness.broker.publish("orders.q", "a");
    harness.broker.publish("orders.q", "b");

    assert!(wait_until(WAIT, || forwarder.current() == 2).await);
    jobber.stop().await;

    assert_eq!(jobber.state(), JobberState::Stopped);
    assert_eq!(forwarder.current(), 0);
    assert_eq!(forwarder.completed(), forwarder.calls());
    assert_eq!(harness.broker.acked("orders.q"), 2);
    assert_eq!(harness.broker.consumer_count("orders.q"), 0);
    assert!(jobber.status().stopped_at.is_some());
}

#[tokio::test]
async fn test_stop_on_stopped_jobber_returns_immediately() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    let jobber = harness.registry.insert(definition("idle", 1, None)).unwrap();

    tokio::time::timeout(Duration::from_millis(200), jobber.stop())
        .await
        .expect("stop on a stopped jobber must not block");
    assert_eq!(jobber.state(), JobberState::Stopped);
}

#[tokio::test]
async fn test_new_jobber_reports_creation_time() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    let before = chrono::Local::now();
    let jobber = harness.registry.insert(definition("fresh", 1, None)).unwrap();

    let status = jobber.status();
    assert_eq!(status.state, JobberState::Stopped);
    assert!(status.started_at.is_none());
    let shown = status.status_time().expect("never-started jobber shows a time");
    assert!(shown >= before);
}

#[tokio::test]
async fn test_concurrent_stops_all_complete() {
    let forwarder = Arc::new(StubForwarder::ok(Duration::from_millis(50)));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 1, None)).unwrap();
    jobber.start().await.unwrap();
    harness.broker.publish("orders.q", "a");
    assert!(wait_until(WAIT, || forwarder.current() == 1).await);

    let stops = (0..4).map(|_| {
        let jobber = jobber.clone();
        tokio::spawn(async move { jobber.stop().await })
    });
    for stop in futures::future::join_all(stops).await {
        stop.unwrap();
    }
    assert_eq!(jobber.state(), JobberState::Stopped);
    assert_eq!(harness.broker.acked("orders.q"), 1);
}

#[tokio::test]
async fn test_start_on_running_jobber_keeps_single_loop() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 2, None)).unwrap();
    jobber.start().await.unwrap();
    let err = jobber.start().await.unwrap_err();

    assert!(matches!(err, MqError::AlreadyRunning(ref name) if name == "orders"));
    assert_eq!(err.to_string(), "Jobber orders has started");
    assert_eq!(harness.broker.consumer_count("orders.q"), 1);
    assert_eq!(jobber.state(), JobberState::Running);
}

#[tokio::test]
async fn test_failed_forward_is_still_acked() {
    let forwarder = Arc::new(StubForwarder::new(Duration::ZERO, 500));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 2, None)).unwrap();
    jobber.start().await.unwrap();
    for _ in 0..5 {
        harness.broker.publish("orders.q", "{}");
    }

    assert!(wait_until(WAIT, || harness.broker.acked("orders.q") == 5).await);
    assert_eq!(harness.broker.pending("orders.q"), 0);
    assert_eq!(jobber.state(), JobberState::Running);
}

#[tokio::test]
async fn test_panicking_forward_does_not_kill_the_jobber() {
    let forwarder = Arc::new(StubForwarder::ok(Duration::ZERO));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 1, None)).unwrap();
    jobber.start().await.unwrap();
    harness.broker.publish("orders.q", PANIC_MARKER);
    harness.broker.publish("orders.q", "fine");

    assert!(wait_until(WAIT, || harness.broker.acked("orders.q") == 2).await);
    assert_eq!(jobber.state(), JobberState::Running);
    assert_eq!(jobber.status().in_flight, 0);
}

#[tokio::test]
async fn test_declaration_failure_leaves_jobber_stopped() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    harness.connect().await;
    harness.broker.reject_exchange("bad.x");

    let jobber = harness.registry.insert(definition("orders", 1, Some("bad.x"))).unwrap();
    let err = jobber.start().await.unwrap_err();

    assert!(matches!(
        err,
        MqError::StartFailed {
            source: QueueError::Declaration { entity: "exchange", .. },
            ..
        }
    ));
    assert_eq!(jobber.state(), JobberState::Stopped);
    assert_eq!(harness.broker.consumer_count("orders.q"), 0);
}

#[tokio::test]
async fn test_start_without_connection_fails() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    let jobber = harness.registry.insert(definition("orders", 1, None)).unwrap();

    let err = jobber.start().await.unwrap_err();
    assert!(matches!(
        err,
        MqError::StartFailed {
            source: QueueError::NotConnected,
            ..
        }
    ));
    assert_eq!(jobber.state(), JobberState::Stopped);
}

#[tokio::test]
async fn test_channel_failure_marks_jobber_fatal() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 1, None)).unwrap();
    jobber.start().await.unwrap();
    harness.broker.drop_connections(Some("CONNECTION_FORCED"));

    assert!(wait_until(WAIT, || jobber.state() == JobberState::Fatal).await);
}

#[tokio::test]
async fn test_graceful_channel_close_marks_jobber_stopped() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 1, None)).unwrap();
    jobber.start().await.unwrap();
    harness.broker.drop_connections(None);

    assert!(wait_until(WAIT, || jobber.state() == JobberState::Stopped).await);
}

#[tokio::test]
async fn test_restart_resumes_consumption() {
    let forwarder = Arc::new(StubForwarder::ok(Duration::ZERO));
    let harness = Harness::new(forwarder.clone());
    harness.connect().await;

    let jobber = harness.registry.insert(definition("orders", 2, None)).unwrap();
    jobber.start().await.unwrap();
    jobber.restart().await.unwrap();
    assert_eq!(jobber.state(), JobberState::Running);
    assert_eq!(harness.broker.consumer_count("orders.q"), 1);

    harness.broker.publish("orders.q", "after-restart");
    assert!(wait_until(WAIT, || harness.broker.acked("orders.q") == 1).await);
}

#[tokio::test]
async fn test_delivery_records_go_to_jobber_log() {
    let harness = Harness::new(Arc::new(StubForwarder::ok(Duration::ZERO)));
    harness.connect().await;

    let log_path = harness.dir.path().join("logs/orders.log");
    let yaml = support::definition_yaml("orders", 1, None, Some(&log_path));
    let definition =
        common::mq::JobberDefinition::from_yaml(std::path::Path::new("orders.yaml"), &yaml).unwrap();
    let jobber = harness.registry.insert(definition).unwrap();
    jobber.start().await.unwrap();

    harness.broker.publish("orders.q", r#"{"order":7}"#);
    assert!(wait_until(WAIT, || harness.broker.acked("orders.q") == 1).await);
    jobber.stop().await;

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let record = contents
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|record| record["fields"]["message"] == "end request")
        .expect("delivery record");
    assert_eq!(record["fields"]["http_code"], 200);
    assert_eq!(record["fields"]["worker_id"], 0);
    assert_eq!(record["fields"]["delivery"], r#"{"order":7}"#);
    assert_eq!(record["fields"]["url"], "http://stub.invalid/orders");
}

#[tokio::test]
async fn test_forwards_to_http_target() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_string(r#"{"id":1}"#))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let harness = Harness::new(Arc::new(HttpForwarder::new(5).unwrap()));
    harness.connect().await;

    let mut def = definition("orders", 2, None);
    def.target_url = format!("{}/orders", server.uri());
    let jobber = harness.registry.insert(def).unwrap();
    jobber.start().await.unwrap();

    for _ in 0..3 {
        harness.broker.publish("orders.q", r#"{"id":1}"#);
    }
    assert!(wait_until(WAIT, || harness.broker.acked("orders.q") == 3).await);
    jobber.stop().await;
}
