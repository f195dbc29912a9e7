#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use evergreen::config::RegistryFlavor;
use evergreen::{Config, Orchestrator};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const PROJECT_PATH: &str = "/api/v4/projects/group%2Fapp/merge_requests";

/// Run git in `dir`, panicking on failure, and return trimmed stdout.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("git is installed");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// In-memory merge request store behind the GitLab endpoints.
#[derive(Clone, Default)]
pub struct FakeGitLab {
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeGitLab {
    pub fn created(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

struct ListRequests(FakeGitLab);

impl Respond for ListRequests {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let branch = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "source_branch")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        let matching: Vec<Value> = self
            .0
            .created()
            .into_iter()
            .filter(|mr| mr["source_branch"] == branch.as_str())
            .collect();
        ResponseTemplate::new(200).set_body_json(Value::Array(matching))
    }
}

struct CreateRequest(FakeGitLab);

impl Respond for CreateRequest {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = request.body_json().unwrap();
        let mut requests = self.0.requests.lock().unwrap();
        let iid = requests.len() + 1;
        let created = json!({
            "iid": iid,
            "title": body["title"],
            "description": body["description"],
            "state": "opened",
            "source_branch": body["source_branch"],
            "web_url": format!("https://gitlab.example/group/app/-/merge_requests/{iid}"),
        });
        requests.push(created.clone());
        ResponseTemplate::new(201).set_body_json(created)
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub work: PathBuf,
    pub remote: PathBuf,
    pub registry: MockServer,
    pub gitlab_server: MockServer,
    pub gitlab: FakeGitLab,
}

impl Harness {
    /// A working copy on `main` holding `files`, pushed to a bare remote.
    pub async fn new(files: &[(&str, &str)]) -> Self {
        let tmp = TempDir::new().unwrap();
        let remote = tmp.path().join("remote.git");
        let work = tmp.path().join("work");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&work).unwrap();

        run_git(&remote, &["init", "--quiet", "--bare", "--initial-branch=main"]);
        run_git(&remote, &["config", "receive.advertisePushOptions", "true"]);
        run_git(&work, &["init", "--quiet", "--initial-branch=main"]);
        run_git(&work, &["config", "user.name", "Maintainer"]);
        run_git(&work, &["config", "user.email", "maintainer@example.com"]);
        run_git(&work, &["config", "commit.gpgsign", "false"]);
        for (rel, content) in files {
            let path = work.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        run_git(&work, &["add", "-A"]);
        run_git(&work, &["commit", "--quiet", "-m", "initial"]);
        run_git(&work, &["remote", "add", "origin", remote.to_str().unwrap()]);
        run_git(&work, &["push", "--quiet", "origin", "main"]);

        let registry = MockServer::start().await;
        let gitlab_server = MockServer::start().await;
        let gitlab = FakeGitLab::default();
        Mock::given(method("GET"))
            .and(path(PROJECT_PATH))
            .respond_with(ListRequests(gitlab.clone()))
            .mount(&gitlab_server)
            .await;
        Mock::given(method("POST"))
            .and(path(PROJECT_PATH))
            .respond_with(CreateRequest(gitlab.clone()))
            .mount(&gitlab_server)
            .await;

        Self {
            tmp,
            work,
            remote,
            registry,
            gitlab_server,
            gitlab,
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config {
            config_path: self.tmp.path().join("config.toml"),
            state_path: Some(self.tmp.path().join("state").join("state.json")),
            ..Config::default()
        };
        config.scanner.root = self.work.clone();
        config.registry.base_url = self.registry.uri();
        config.registry.flavor = RegistryFlavor::Hub;
        config.registry.backoff_base_ms = 1;
        config.host.api_url = format!("{}/api/v4", self.gitlab_server.uri());
        config.host.project_id = "group/app".into();
        config.host.token = Some("glpat-test".into());
        config
    }

    pub fn orchestrator(&self, config: Config) -> Orchestrator {
        Orchestrator::from_config(config).unwrap()
    }

    /// Serve `tags` for an official image, expecting `calls` listings.
    pub async fn serve_tags(&self, image: &str, tags: &[&str], calls: u64) {
        let results: Vec<Value> = tags.iter().map(|t| json!({ "name": t })).collect();
        Mock::given(method("GET"))
            .and(path(format!("/v2/repositories/library/{image}/tags")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "results": results, "next": null })),
            )
            .expect(calls)
            .mount(&self.registry)
            .await;
    }

    /// Branch names on the bare remote.
    pub fn remote_branches(&self) -> Vec<String> {
        run_git(
            &self.remote,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
        )
        .lines()
        .map(str::to_string)
        .collect()
    }

    pub fn remote_file(&self, branch: &str, file: &str) -> String {
        run_git(&self.remote, &["show", &format!("{branch}:{file}")])
    }

    pub fn work_file(&self, file: &str) -> String {
        std::fs::read_to_string(self.work.join(file)).unwrap()
    }

    /// Fast-forward local `main` to a proposed branch, as if it was merged.
    pub fn merge_proposal(&self, branch: &str) {
        run_git(&self.work, &["fetch", "--quiet", "origin", branch]);
        run_git(&self.work, &["merge", "--quiet", "--ff-only", "FETCH_HEAD"]);
        run_git(&self.work, &["push", "--quiet", "origin", "main"]);
    }
}
