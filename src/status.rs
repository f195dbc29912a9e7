//! Human-readable run status, shared by `evergreen status` and `GET /status`.

use crate::config::Config;
use crate::orchestrator::RunState;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::time::Duration;

const RECENT_RUNS: usize = 5;

pub fn render_status(config: &Config, state: &RunState, now: DateTime<Utc>) -> String {
    let host = if config.host.project_id.trim().is_empty() {
        "(not configured)".to_string()
    } else {
        format!("{} project {}", config.host.api_url, config.host.project_id)
    };

    let mut lines = vec![
        "◆ evergreen status".to_string(),
        String::new(),
        format!("Version      {}", env!("CARGO_PKG_VERSION")),
        format!("Config       {}", config.config_path.display()),
        format!("State        {}", config.resolved_state_path().display()),
        format!("Scan root    {}", config.resolved_scan_root().display()),
        format!(
            "Registry     {} ({})",
            config.registry.base_url, config.registry.flavor
        ),
        format!("Host         {host}"),
        format!(
            "Branches     {}/{}* -> {}",
            config.git.remote, config.git.branch_prefix, config.git.base_branch
        ),
        String::new(),
    ];

    let staleness = Duration::from_secs(config.run.lock_staleness_seconds);
    lines.push(match &state.active_lock {
        None => "Lock         free".to_string(),
        Some(lease) => format!(
            "Lock         held by {} since {} (run {}){}",
            lease.holder_id,
            lease.acquired_at.to_rfc3339(),
            lease.run_id,
            if lease.is_stale(now, staleness) {
                ", stale"
            } else {
                ""
            }
        ),
    });
    lines.push(format!(
        "Last success {}",
        state
            .last_run_timestamp
            .map_or_else(|| "never".to_string(), |ts| ts.to_rfc3339())
    ));
    if let Some(commit) = &state.last_processed_commit {
        lines.push(format!("Last commit  {commit}"));
    }
    lines.push(format!("Our branches {}", state.known_branches.len()));

    if !state.history.is_empty() {
        lines.push(String::new());
        lines.push("Recent runs".to_string());
        for record in state.history.iter().rev().take(RECENT_RUNS) {
            let mut line = format!(
                "  {}  {:<10} {} edit(s)",
                record.finished_at.format("%Y-%m-%d %H:%M:%S"),
                record.status.to_string(),
                record.edits
            );
            if let Some(branch) = &record.branch {
                let _ = write!(line, "  {branch}");
            }
            if let Some(mr) = record.merge_request {
                let _ = write!(line, "  !{mr}");
            }
            if let Some(error) = &record.error {
                let _ = write!(line, "  error: {error}");
            }
            lines.push(line);
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{LockLease, RunRecord, RunStatus};

    #[test]
    fn fresh_state_reads_as_free_and_never_run() {
        let out = render_status(&Config::default(), &RunState::default(), Utc::now());
        assert!(out.contains("Lock         free"));
        assert!(out.contains("Last success never"));
        assert!(out.contains("Host         (not configured)"));
        assert!(!out.contains("Recent runs"));
    }

    #[test]
    fn shows_stale_lock_and_latest_runs_first() {
        let now = Utc::now();
        let mut state = RunState {
            active_lock: Some(LockLease {
                holder_id: "ci-7:42:abc".into(),
                run_id: "r-9".into(),
                acquired_at: now - chrono::Duration::days(1),
            }),
            ..RunState::default()
        };
        for (i, status) in [RunStatus::NoChanges, RunStatus::Succeeded].into_iter().enumerate() {
            state.history.push_back(RunRecord {
                run_id: format!("r-{i}"),
                started_at: now,
                finished_at: now,
                status,
                edits: i,
                branch: (i == 1).then(|| "evergreen/update-base-images-abc".to_string()),
                merge_request: (i == 1).then_some(4),
                error: None,
            });
        }

        let out = render_status(&Config::default(), &state, now);
        assert!(out.contains("held by ci-7:42:abc"));
        assert!(out.contains(", stale"));
        let succeeded = out.find("succeeded").unwrap();
        let no_changes = out.find("no-changes").unwrap();
        assert!(succeeded < no_changes);
        assert!(out.contains("!4"));
    }
}
