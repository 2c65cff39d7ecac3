// Tests for the HTTP control surface over a memory broker

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::config::Settings;
use common::errors::ForwardError;
use common::forward::{ForwardResponse, Forwarder};
use common::mq::{MemoryBroker, MqContext};
use serde_json::Value;
use server::routes::create_router;
use server::state::AppState;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct AcceptAll;

#[async_trait]
impl Forwarder for AcceptAll {
    async fn forward(&self, _url: &str, _body: &[u8]) -> Result<ForwardResponse, ForwardError> {
        Ok(ForwardResponse {
            status: 200,
            body: String::new(),
        })
    }
}

struct TestApp {
    state: AppState,
    dir: TempDir,
}

impl TestApp {
    async fn new(jobbers: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for name in jobbers {
            write_definition(&dir, name);
        }

        let mut settings = Settings::default();
        settings.include = format!("{}/*.yaml", dir.path().display());
        settings.rabbitmq.autostart = false;
        let mq = MqContext::new(&settings, Arc::new(MemoryBroker::new()), Arc::new(AcceptAll));
        mq.load_definitions().unwrap();
        mq.connection.connect(&mq.registry).await.unwrap();

        Self {
            state: AppState::new(mq),
            dir,
        }
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = create_router(self.state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }
}

fn write_definition(dir: &TempDir, name: &str) {
    std::fs::write(
        dir.path().join(format!("{}.yaml", name)),
        format!("name: {name}\nqueue: {name}.q\nworkernum: 1\nurl: http://stub.invalid/{name}\n"),
    )
    .unwrap();
}

fn status_of<'a>(listing: &'a Value, name: &str) -> &'a Value {
    listing["attachment"]
        .as_array()
        .unwrap()
        .iter()
        .find(|row| row["name"] == name)
        .unwrap()
}

#[tokio::test]
async fn test_index_and_health() {
    let app = TestApp::new(&[]).await;

    let (status, body) = app.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg_code"], 200);
    assert_eq!(body["message"], "Success");
    assert_eq!(body["attachment"], "Hello World!");

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = TestApp::new(&[]).await;
    let (status, body) = app.get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
    assert!(body["data"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_name_param() {
    let app = TestApp::new(&["alpha"]).await;
    for uri in ["/mq/start", "/mq/stop", "/mq/restart", "/mq/remove", "/mq/start?name="] {
        let (status, body) = app.get(uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["msg_code"], 10003, "{}", uri);
        assert_eq!(body["message"], "Missing param: name");
    }
}

#[tokio::test]
async fn test_unknown_jobber_is_internal_error() {
    let app = TestApp::new(&[]).await;
    let (_, body) = app.get("/mq/start?name=ghost").await;
    assert_eq!(body["msg_code"], 10001);
    assert_eq!(body["message"], "Internal server error. Not found jobber ghost");
    assert!(body["attachment"].is_null());
}

#[tokio::test]
async fn test_start_stop_and_status() {
    let app = TestApp::new(&["alpha", "beta"]).await;

    let (_, body) = app.get("/mq/start?name=alpha").await;
    assert_eq!(body["msg_code"], 200);
    assert_eq!(body["attachment"], "alpha started.");

    let (_, listing) = app.get("/mq/status").await;
    let names: Vec<&str> = listing["attachment"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    let alpha = status_of(&listing, "alpha");
    assert_eq!(alpha["status"], "RUNNING");
    assert_eq!(alpha["queue_name"], "alpha.q");
    assert_eq!(alpha["status_time"].as_str().unwrap().len(), "2006-01-02 15:04:05".len());
    let beta = status_of(&listing, "beta");
    assert_eq!(beta["status"], "STOPPED");
    assert_eq!(beta["status_time"].as_str().unwrap().len(), "2006-01-02 15:04:05".len());

    let (_, body) = app.get("/mq/start?name=alpha").await;
    assert_eq!(body["msg_code"], 10001);
    assert_eq!(body["message"], "Internal server error. Jobber alpha has started");

    let (_, body) = app.get("/mq/stop?name=alpha").await;
    assert_eq!(body["attachment"], "alpha stopped");
    let (_, listing) = app.get("/mq/status").await;
    assert_eq!(status_of(&listing, "alpha")["status"], "STOPPED");
}

#[tokio::test]
async fn test_all_operations() {
    let app = TestApp::new(&["alpha", "beta"]).await;

    let (_, body) = app.get("/mq/start?name=all").await;
    assert_eq!(body["attachment"], "All started.");
    let (_, body) = app.get("/mq/restart?name=all").await;
    assert_eq!(body["attachment"], "All restarted.");
    let (_, body) = app.get("/mq/restart?name=beta").await;
    assert_eq!(body["attachment"], "beta restarted");
    let (_, body) = app.get("/mq/stop?name=all").await;
    assert_eq!(body["attachment"], "All stopped.");

    let (_, listing) = app.get("/mq/status").await;
    assert!(listing["attachment"]
        .as_array()
        .unwrap()
        .iter()
        .all(|row| row["status"] == "STOPPED"));
}

#[tokio::test]
async fn test_reread_update_and_remove() {
    let app = TestApp::new(&["alpha", "beta"]).await;

    write_definition(&app.dir, "gamma");
    std::fs::remove_file(app.dir.path().join("beta.yaml")).unwrap();

    let (_, body) = app.get("/mq/reread").await;
    assert_eq!(body["msg_code"], 200);
    assert_eq!(body["attachment"]["changes"], serde_json::json!(["gamma"]));
    assert_eq!(body["attachment"]["removes"], serde_json::json!(["beta"]));

    let (_, body) = app.get("/mq/update").await;
    assert_eq!(body["msg_code"], 200);
    assert_eq!(body["attachment"], "");

    let (_, listing) = app.get("/mq/status").await;
    assert_eq!(status_of(&listing, "gamma")["status"], "RUNNING");
    assert_eq!(listing["attachment"].as_array().unwrap().len(), 2);

    let (_, body) = app.get("/mq/remove?name=alpha").await;
    assert_eq!(body["attachment"], "Jobber alpha removed");
    let (_, body) = app.get("/mq/remove?name=alpha").await;
    assert_eq!(body["msg_code"], 10001);
}
