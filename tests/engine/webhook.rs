use crate::harness::Harness;
use evergreen::error::RunError;
use evergreen::orchestrator::{LockLease, RunState, RunStatus};
use evergreen::server::{AppState, run_server_with_listener};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "hook-secret";

struct TriggerServer {
    base: String,
    state: AppState,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TriggerServer {
    async fn start(h: &Harness) -> Self {
        let mut config = h.config();
        config.policy.tag_pattern = r"^\d+\.\d+-slim$".into();
        let orchestrator = Arc::new(h.orchestrator(config));
        let state = AppState::new(orchestrator, Some(SECRET), CancellationToken::new());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral listener should bind");
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(run_server_with_listener(listener, state.clone()));

        Self {
            base: format!("http://127.0.0.1:{port}"),
            state,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn trigger(&self, secret: Option<&str>) -> reqwest::Response {
        let mut request = reqwest::Client::new().post(self.url("/trigger"));
        if let Some(secret) = secret {
            request = request.header("X-Webhook-Secret", secret);
        }
        request.send().await.unwrap()
    }

    /// Poll the state file until a run has been recorded.
    async fn wait_for_history(&self) -> RunState {
        for _ in 0..200 {
            let state = self.state.orchestrator.store().load().unwrap();
            if !state.history.is_empty() && !state.is_locked() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("triggered run never finished");
    }

    async fn stop(self) {
        self.state.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn webhook_trigger_runs_the_full_pipeline() {
    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.11-slim"], 1).await;
    let server = TriggerServer::start(&h).await;

    assert_eq!(server.trigger(None).await.status(), StatusCode::UNAUTHORIZED);

    let response = server.trigger(Some(SECRET)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let state = server.wait_for_history().await;
    assert_eq!(state.history[0].run_id, run_id);
    assert_eq!(state.history[0].status, RunStatus::Succeeded);
    assert_eq!(h.gitlab.created().len(), 1);
    assert!(
        h.remote_branches()
            .iter()
            .any(|b| b.starts_with("evergreen/update-base-images-"))
    );

    let health: Value = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["run_active"], false);

    let status = reqwest::get(server.url("/status"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(status.contains("Lock         free"));
    assert!(status.contains("succeeded"));
    assert!(status.contains("!1"));

    server.stop().await;
}

#[tokio::test]
async fn webhook_trigger_conflicts_with_a_held_lock() {
    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.11-slim"], 0).await;
    let server = TriggerServer::start(&h).await;
    server
        .state
        .orchestrator
        .store()
        .update(|state| {
            state.active_lock = Some(LockLease {
                holder_id: "ci-runner:99:other".into(),
                run_id: "r-elsewhere".into(),
                acquired_at: chrono::Utc::now(),
            });
            Ok::<_, RunError>(())
        })
        .await
        .unwrap();

    let response = server.trigger(Some(SECRET)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["holder"], "ci-runner:99:other");

    let state = server.state.orchestrator.store().load().unwrap();
    assert_eq!(state.active_lock.unwrap().run_id, "r-elsewhere");
    assert!(state.history.is_empty());
    assert!(h.gitlab.created().is_empty());

    server.stop().await;
}
