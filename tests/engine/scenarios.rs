use crate::harness::{Harness, run_git};
use evergreen::error::{BranchError, EXIT_FAILED, RunError};
use evergreen::orchestrator::RunStatus;
use evergreen::publisher::PublishOutcome;
use evergreen::vcs::BranchOutcome;
use evergreen::{Config, RunOptions};
use tokio_util::sync::CancellationToken;

fn python_slim(config: &mut Config) {
    config.policy.tag_pattern = r"^\d+\.\d+-slim$".into();
}

#[tokio::test]
async fn proposes_newest_matching_semver_tag() {
    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\nRUN pip install flask\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.10-slim", "3.11-slim", "3.12-alpine"], 1)
        .await;
    let mut config = h.config();
    python_slim(&mut config);

    let summary = h
        .orchestrator(config)
        .run(RunOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    let edits: Vec<_> = summary.plan.edits().collect();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].target_tag, "3.11-slim");

    let branch = summary.branch.unwrap();
    assert_eq!(branch.outcome, BranchOutcome::Created);
    assert!(branch.name.starts_with("evergreen/update-base-images-"));
    assert_eq!(
        h.remote_file(&branch.name, "Dockerfile"),
        "FROM python:3.11-slim\nRUN pip install flask"
    );
    // The working copy is back on main, untouched.
    assert_eq!(run_git(&h.work, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    assert_eq!(h.work_file("Dockerfile"), "FROM python:3.9-slim\nRUN pip install flask\n");

    let mr = summary.merge_request.unwrap();
    assert_eq!(mr.outcome, PublishOutcome::Created);
    assert_eq!(mr.branch_name, branch.name);
    let created = h.gitlab.created();
    assert_eq!(created.len(), 1);
    assert!(
        created[0]["description"]
            .as_str()
            .unwrap()
            .contains("python: `3.9-slim` -> `3.11-slim`")
    );

    let subject = run_git(&h.remote, &["log", "-1", "--format=%B", &branch.name]);
    assert!(subject.starts_with("chore: update 1 base image(s)"));
    assert!(subject.contains("[skip ci]"));
}

#[tokio::test]
async fn rerun_after_merge_has_nothing_to_do() {
    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.10-slim", "3.11-slim"], 2)
        .await;
    let mut config = h.config();
    python_slim(&mut config);
    let orchestrator = h.orchestrator(config);
    let cancel = CancellationToken::new();

    let first = orchestrator.run(RunOptions::default(), &cancel).await.unwrap();
    let branch = first.branch.unwrap().name;
    h.merge_proposal(&branch);
    assert_eq!(h.work_file("Dockerfile"), "FROM python:3.11-slim\n");

    let second = orchestrator.run(RunOptions::default(), &cancel).await.unwrap();
    assert_eq!(second.status, RunStatus::NoChanges);
    assert!(second.plan.is_empty());
    assert!(second.branch.is_none());
    assert_eq!(h.remote_branches(), vec![branch.clone(), "main".to_string()]);
    assert_eq!(h.gitlab.created().len(), 1);

    let state = orchestrator.store().load().unwrap();
    assert!(!state.is_locked());
    assert_eq!(state.history.len(), 2);
    assert_eq!(
        state.last_processed_commit.as_deref(),
        Some(run_git(&h.work, &["rev-parse", "HEAD"]).as_str())
    );
}

#[tokio::test]
async fn shared_image_is_fetched_once_and_committed_together() {
    let h = Harness::new(&[
        ("api/Dockerfile", "FROM node:16 AS build\n"),
        ("web/Dockerfile", "FROM node:16\n"),
    ])
    .await;
    h.serve_tags("node", &["14", "16", "17", "18"], 1).await;
    let mut config = h.config();
    config.policy.tag_pattern = r"^\d+$".into();

    let summary = h
        .orchestrator(config)
        .run(RunOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.plan.len(), 2);
    let branch = summary.branch.unwrap().name;
    assert_eq!(h.remote_branches(), vec![branch.clone(), "main".to_string()]);
    assert_eq!(
        run_git(&h.remote, &["rev-list", "--count", &format!("main..{branch}")]),
        "1"
    );
    let touched = run_git(
        &h.remote,
        &["diff-tree", "--no-commit-id", "--name-only", "-r", &branch],
    );
    assert_eq!(touched.lines().collect::<Vec<_>>(), vec!["api/Dockerfile", "web/Dockerfile"]);
    assert_eq!(h.remote_file(&branch, "api/Dockerfile"), "FROM node:18 AS build");
    assert_eq!(h.gitlab.created().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn failed_push_cleans_up_and_forgets_the_branch() {
    use std::os::unix::fs::PermissionsExt;

    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.11-slim"], 1).await;
    let hooks = h.remote.join("hooks");
    std::fs::create_dir_all(&hooks).unwrap();
    let hook = hooks.join("pre-receive");
    std::fs::write(&hook, "#!/bin/sh\necho 'remote unavailable' >&2\nexit 1\n").unwrap();
    std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = h.config();
    python_slim(&mut config);
    let orchestrator = h.orchestrator(config);
    let err = orchestrator
        .run(RunOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Branch(BranchError::PushFailed { .. })));
    assert_eq!(err.exit_code(), EXIT_FAILED);
    assert_eq!(run_git(&h.work, &["branch", "--list", "evergreen/*"]), "");
    assert_eq!(run_git(&h.work, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    assert_eq!(h.work_file("Dockerfile"), "FROM python:3.9-slim\n");
    assert_eq!(h.remote_branches(), vec!["main".to_string()]);
    assert!(h.gitlab.created().is_empty());

    let state = orchestrator.store().load().unwrap();
    assert!(!state.is_locked());
    assert!(state.known_branches.is_empty());
    assert!(state.last_run_timestamp.is_none());
    assert_eq!(state.history[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn repeated_runs_reuse_branch_and_merge_request() {
    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.11-slim"], 2).await;
    let mut config = h.config();
    python_slim(&mut config);
    let orchestrator = h.orchestrator(config);
    let cancel = CancellationToken::new();

    let first = orchestrator.run(RunOptions::default(), &cancel).await.unwrap();
    let second = orchestrator.run(RunOptions::default(), &cancel).await.unwrap();

    let (first_branch, second_branch) = (first.branch.unwrap(), second.branch.unwrap());
    assert_eq!(first_branch.name, second_branch.name);
    assert_eq!(second_branch.outcome, BranchOutcome::AlreadyProposed);
    assert_eq!(first_branch.commit, second_branch.commit);

    let (first_mr, second_mr) = (first.merge_request.unwrap(), second.merge_request.unwrap());
    assert_eq!(second_mr.outcome, PublishOutcome::Existing);
    assert_eq!(first_mr.mr_id, second_mr.mr_id);
    assert_eq!(h.gitlab.created().len(), 1);

    let state = orchestrator.store().load().unwrap();
    assert_eq!(state.known_branches.len(), 1);
    assert_eq!(state.history.len(), 2);
    assert!(state.history.iter().all(|r| r.status == RunStatus::Succeeded));
}

#[tokio::test]
async fn unreachable_image_is_skipped_without_blocking_others() {
    let h = Harness::new(&[(
        "Dockerfile",
        "FROM python:3.9-slim AS base\nFROM ghcr.io/acme/tool:1.0-slim\n",
    )])
    .await;
    h.serve_tags("python", &["3.9-slim", "3.10-slim"], 1).await;
    let mut config = h.config();
    python_slim(&mut config);

    let summary = h
        .orchestrator(config)
        .run(RunOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.plan.len(), 1);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].image_name, "ghcr.io/acme/tool");
}

#[tokio::test]
async fn preview_takes_no_lock_and_writes_no_state() {
    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.11-slim"], 1).await;
    let mut config = h.config();
    python_slim(&mut config);
    let orchestrator = h.orchestrator(config);

    let (report, outcome) = orchestrator.preview().await.unwrap();
    assert_eq!(report.references.len(), 1);
    assert_eq!(outcome.plan.len(), 1);
    assert!(!orchestrator.store().path().exists());
    assert_eq!(h.remote_branches(), vec!["main".to_string()]);
}

#[tokio::test]
async fn unpushed_local_commit_refuses_before_patching() {
    let h = Harness::new(&[("Dockerfile", "FROM python:3.9-slim\n")]).await;
    h.serve_tags("python", &["3.9-slim", "3.11-slim"], 1).await;
    run_git(&h.work, &["commit", "--quiet", "--allow-empty", "-m", "local only"]);
    let mut config = h.config();
    python_slim(&mut config);
    let orchestrator = h.orchestrator(config);

    let err = orchestrator
        .run(RunOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, RunError::Branch(BranchError::BaseMismatch { .. })),
        "{err}"
    );
    assert!(err.to_string().contains("check out main"));
    assert_eq!(h.work_file("Dockerfile"), "FROM python:3.9-slim\n");
    assert_eq!(run_git(&h.work, &["status", "--porcelain"]), "");
    assert_eq!(h.remote_branches(), vec!["main".to_string()]);
    assert!(h.gitlab.created().is_empty());
    assert!(!orchestrator.store().load().unwrap().is_locked());
}
