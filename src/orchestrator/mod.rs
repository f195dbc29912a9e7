//! Run orchestration: single-flight locking and the
//! `Idle -> Scanning -> Planning -> Patching -> Publishing` state machine.

pub mod state;

pub use state::{LockLease, RunRecord, RunState, RunStatus, StateStore};

use crate::config::Config;
use crate::error::{ConfigError, ErrorClass, RunError, StateError};
use crate::patcher::{AppliedPlan, FilePatcher};
use crate::planner::{PlanOutcome, Planner, SkippedImage, UpdatePlan};
use crate::publisher::{GitLabHost, MergeRequestHost, MergeRequestRecord, Publisher};
use crate::registry::{RegistryClient, RequestBudget, TagSource};
use crate::scanner::{ScanReport, Scanner};
use crate::selector::PolicySet;
use crate::vcs::{BranchHandle, BranchManager};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Scanning,
    Planning,
    Patching,
    Publishing,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop after planning; touch no files, git refs or remote state.
    pub dry_run: bool,
}

/// Result of a run that reached `Idle` again.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub plan: UpdatePlan,
    pub skipped: Vec<SkippedImage>,
    pub branch: Option<BranchHandle>,
    pub merge_request: Option<MergeRequestRecord>,
}

/// The single-flight lock, taken for one run that has not started yet.
///
/// Pass it to [`Orchestrator::run_claimed`], which releases the lock when the
/// run ends.
#[derive(Debug)]
#[must_use = "the lock stays held until the claimed run finishes"]
pub struct RunClaim {
    run_id: String,
    started_at: DateTime<Utc>,
    deadline: Instant,
}

impl RunClaim {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// What a run produced, kept even when a later step fails so that bookkeeping
/// can record it.
#[derive(Default)]
struct Progress {
    head_commit: Option<String>,
    outcome: PlanOutcome,
    branch: Option<BranchHandle>,
    merge_request: Option<MergeRequestRecord>,
}

/// Unique id of this process as a lock holder: `<hostname>:<pid>:<uuid>`.
pub fn holder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".into());
    format!("{host}:{}:{}", std::process::id(), uuid::Uuid::new_v4())
}

pub struct Orchestrator {
    config: Config,
    policies: PolicySet,
    registry: Arc<dyn TagSource>,
    host: Option<Arc<dyn MergeRequestHost>>,
    store: StateStore,
    holder_id: String,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: Arc<dyn TagSource>,
        host: Option<Arc<dyn MergeRequestHost>>,
    ) -> Result<Self, RunError> {
        let policies = PolicySet::from_config(&config.policy)?;
        let store = StateStore::new(config.resolved_state_path());
        Ok(Self {
            config,
            policies,
            registry,
            host,
            store,
            holder_id: holder_id(),
        })
    }

    /// Wire up the HTTP registry client and GitLab host from configuration.
    /// A missing project id only matters once there is something to publish.
    pub fn from_config(config: Config) -> Result<Self, RunError> {
        let budget = Arc::new(RequestBudget::per_minute(
            config.registry.rate_limit_per_minute,
        ));
        let registry: Arc<dyn TagSource> = Arc::new(RegistryClient::new(&config.registry, budget)?);
        let host: Option<Arc<dyn MergeRequestHost>> = match GitLabHost::new(&config.host) {
            Ok(host) => Some(Arc::new(host)),
            Err(e) => {
                tracing::debug!("Merge request host not configured: {e}");
                None
            }
        };
        Self::new(config, registry, host)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn holder(&self) -> &str {
        &self.holder_id
    }

    /// Scan the tree. Read-only; takes no lock.
    pub fn scan(&self) -> Result<ScanReport, RunError> {
        Ok(Scanner::with_root(&self.config.resolved_scan_root(), &self.config.scanner)?.scan()?)
    }

    /// Scan and plan without taking the lock or touching anything.
    pub async fn preview(&self) -> Result<(ScanReport, PlanOutcome), RunError> {
        let report = self.scan()?;
        let outcome = self.planner().plan(&report.references).await;
        Ok((report, outcome))
    }

    /// Clear the lock if it is stale, or unconditionally with `force`.
    /// Returns the lease that was removed.
    pub async fn unlock(&self, force: bool) -> Result<Option<LockLease>, RunError> {
        let staleness = self.staleness();
        self.store
            .update(|state| {
                let removable = state
                    .active_lock
                    .as_ref()
                    .is_some_and(|lease| force || lease.is_stale(Utc::now(), staleness));
                Ok(if removable { state.active_lock.take() } else { None })
            })
            .await
    }

    /// One orchestrated run. Always releases the lock it took.
    pub async fn run(
        &self,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let claim = self.claim().await?;
        self.run_claimed(claim, options, cancel).await
    }

    /// Take the single-flight lock without starting the run. The run budget
    /// starts counting here.
    pub async fn claim(&self) -> Result<RunClaim, RunError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let deadline = Instant::now() + Duration::from_secs(self.config.run.run_timeout_seconds);
        self.acquire_lock(&run_id).await?;
        Ok(RunClaim {
            run_id,
            started_at,
            deadline,
        })
    }

    /// Execute a claimed run and release its lock.
    pub async fn run_claimed(
        &self,
        claim: RunClaim,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let RunClaim {
            run_id,
            started_at,
            deadline,
        } = claim;
        tracing::info!(run_id = %run_id, holder = %self.holder_id, dry_run = options.dry_run, "Run started");

        let mut progress = Progress::default();
        let result = self
            .execute(options, cancel, deadline, &mut progress)
            .await;

        if let Err(e) = &result {
            self.log_failure(e);
        }

        let status = match &result {
            Ok(status) => *status,
            Err(RunError::RunTimeout { .. }) => RunStatus::TimedOut,
            Err(RunError::Cancelled { .. }) => RunStatus::Cancelled,
            Err(_) => RunStatus::Failed,
        };
        let record = RunRecord {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            edits: progress.outcome.plan.len(),
            branch: progress.branch.as_ref().map(|b| b.name.clone()),
            merge_request: progress.merge_request.as_ref().and_then(|mr| mr.mr_id),
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.finish(record, &progress, result.is_ok()).await?;

        let status = result?;
        tracing::info!(
            run_id = %run_id,
            phase = %RunPhase::Idle,
            status = %status,
            edits = progress.outcome.plan.len(),
            "Run finished"
        );
        Ok(RunSummary {
            run_id,
            status,
            plan: progress.outcome.plan,
            skipped: progress.outcome.skipped,
            branch: progress.branch,
            merge_request: progress.merge_request,
        })
    }

    async fn execute(
        &self,
        options: RunOptions,
        cancel: &CancellationToken,
        deadline: Instant,
        progress: &mut Progress,
    ) -> Result<RunStatus, RunError> {
        let root = self.config.resolved_scan_root();
        let branches = BranchManager::new(&root, &self.config.git);

        self.transition(RunPhase::Scanning, cancel, deadline)?;
        let report = self.scan()?;
        progress.head_commit = branches.git().head_commit().await.ok();

        self.transition(RunPhase::Planning, cancel, deadline)?;
        let planner = self.planner();
        progress.outcome = tokio::time::timeout_at(deadline, planner.plan(&report.references))
            .await
            .map_err(|_| self.timeout(RunPhase::Planning))?;

        let plan = &progress.outcome.plan;
        if options.dry_run {
            return Ok(RunStatus::DryRun);
        }
        if plan.is_empty() {
            tracing::info!("All base images are up to date");
            return Ok(RunStatus::NoChanges);
        }

        self.transition(RunPhase::Patching, cancel, deadline)?;
        let host = self.host.as_deref().ok_or_else(|| {
            RunError::Config(ConfigError::Validation(
                "host.project_id is required to publish merge requests".into(),
            ))
        })?;
        branches.verify_base().await?;
        let applied = FilePatcher::new(&root).apply(plan, &report.fingerprints)?;

        if let Err(e) = self.transition(RunPhase::Publishing, cancel, deadline) {
            restore(applied);
            return Err(e);
        }
        let known_branches = self.store.load()?.known_branches;
        let branch = match branches.ensure_branch(plan, &applied, &known_branches).await {
            Ok(branch) => branch,
            Err(e) => {
                restore(applied);
                return Err(e.into());
            }
        };
        let branch = progress.branch.insert(branch);

        let publisher = Publisher::new(
            host,
            self.config.git.base_branch.clone(),
            self.config.host.remove_source_branch,
        );
        let plan = &progress.outcome.plan;
        let record = publisher.publish(branch, plan).await?;
        progress.merge_request = Some(record);

        Ok(RunStatus::Succeeded)
    }

    fn planner(&self) -> Planner<'_> {
        Planner::new(
            self.registry.as_ref(),
            &self.policies,
            self.config.registry.concurrency,
        )
    }

    fn staleness(&self) -> Duration {
        Duration::from_secs(self.config.run.lock_staleness_seconds)
    }

    fn timeout(&self, phase: RunPhase) -> RunError {
        RunError::RunTimeout {
            budget_secs: self.config.run.run_timeout_seconds,
            phase: phase.to_string(),
        }
    }

    /// Gate every state change on cancellation and the run deadline.
    fn transition(
        &self,
        next: RunPhase,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled {
                phase: next.to_string(),
            });
        }
        if Instant::now() >= deadline {
            return Err(self.timeout(next));
        }
        tracing::debug!(phase = %next, "Entering phase");
        Ok(())
    }

    async fn acquire_lock(&self, run_id: &str) -> Result<(), RunError> {
        let staleness = self.staleness();
        self.store.update(|state| {
            let now = Utc::now();
            if let Some(lease) = &state.active_lock {
                if !lease.is_stale(now, staleness) {
                    tracing::info!(holder = %lease.holder_id, "Another run holds the lock");
                    return Err(RunError::RunAlreadyInProgress {
                        holder: lease.holder_id.clone(),
                        since: lease.acquired_at.to_rfc3339(),
                    });
                }
                tracing::warn!(
                    holder = %lease.holder_id,
                    since = %lease.acquired_at,
                    "Reclaiming stale run lock"
                );
            }
            state.active_lock = Some(LockLease {
                holder_id: self.holder_id.clone(),
                run_id: run_id.to_string(),
                acquired_at: now,
            });
            Ok(())
        })
        .await
    }

    /// Release the lock and record the run in one write. When that write
    /// fails, a bare release is tried once more so the lock does not outlive
    /// the run.
    async fn finish(
        &self,
        record: RunRecord,
        progress: &Progress,
        succeeded: bool,
    ) -> Result<(), RunError> {
        let Err(e) = self.record_and_release(record, progress, succeeded).await else {
            return Ok(());
        };
        tracing::warn!("Failed to record run, retrying lock release: {e}");
        match self.release_lock().await {
            Ok(()) => Err(e.into()),
            Err(source) => {
                tracing::error!(
                    holder = %self.holder_id,
                    "Run lock is still held; clear it with `evergreen unlock --force`"
                );
                Err(RunError::LockNotReleased { source })
            }
        }
    }

    async fn record_and_release(
        &self,
        record: RunRecord,
        progress: &Progress,
        succeeded: bool,
    ) -> Result<(), StateError> {
        let history_limit = self.config.run.history_limit;
        self.store
            .update(|state| {
                if !state.release(&self.holder_id) {
                    tracing::warn!("Run lock was taken over while this run was active");
                }
                // A pushed branch is ours even if publishing failed afterwards.
                if let Some(branch) = &progress.branch {
                    state
                        .known_branches
                        .insert(branch.content_hash.clone(), branch.name.clone());
                }
                if succeeded {
                    state.last_run_timestamp = Some(record.finished_at);
                    if let Some(commit) = &progress.head_commit {
                        state.last_processed_commit = Some(commit.clone());
                    }
                }
                state.record(record, history_limit);
                Ok(())
            })
            .await
    }

    async fn release_lock(&self) -> Result<(), StateError> {
        self.store
            .update(|state| {
                state.release(&self.holder_id);
                Ok(())
            })
            .await
    }

    fn log_failure(&self, error: &RunError) {
        let phase = RunPhase::Failed;
        match error.class() {
            ErrorClass::Coordination => {
                tracing::warn!(phase = %phase, class = %error.class(), "Run stopped: {error}");
            }
            class => {
                tracing::error!(phase = %phase, class = %class, "Run failed: {error}");
            }
        }
    }
}

fn restore(applied: AppliedPlan) {
    if let Err(e) = applied.restore() {
        tracing::error!("Failed to restore working tree: {e}");
    }
}
