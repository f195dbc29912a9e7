use crate::cli::commands::{Cli, Commands};
use anyhow::Result;
use chrono::Utc;
use evergreen::error::{EXIT_FAILED, EXIT_OK};
use evergreen::orchestrator::StateStore;
use evergreen::planner::{PlanOutcome, SkippedImage, UpdatePlan};
use evergreen::schedule::WatchSchedule;
use evergreen::status::render_status;
use evergreen::{Config, Orchestrator, RunError, RunOptions, RunSummary};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Execute a subcommand and return the process exit code.
pub async fn dispatch(cli: Cli, config: Config) -> Result<i32> {
    match cli.command {
        Commands::Run { dry_run } => {
            let orchestrator = Orchestrator::from_config(config)?;
            let cancel = cancel_on_ctrl_c();
            Ok(run_once(&orchestrator, RunOptions { dry_run }, &cancel).await)
        }

        Commands::Watch {
            interval_secs,
            cron,
            run_on_startup,
            dry_run,
        } => {
            let schedule = watch_schedule(&config, interval_secs, cron.as_deref())?;
            let run_on_startup = start_immediately(run_on_startup, &config);
            let orchestrator = Orchestrator::from_config(config)?;
            watch(&orchestrator, &schedule, run_on_startup, RunOptions { dry_run }).await
        }

        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.webhook.host.clone());
            let port = port.unwrap_or(config.webhook.port);
            let webhook = config.webhook.clone();
            let orchestrator = Arc::new(Orchestrator::from_config(config)?);
            let cancel = cancel_on_ctrl_c();
            evergreen::server::run_server(&host, port, &webhook, orchestrator, cancel).await?;
            Ok(EXIT_OK)
        }

        Commands::Scan => {
            let orchestrator = Orchestrator::from_config(config)?;
            let report = orchestrator.scan()?;
            for reference in &report.references {
                println!(
                    "{}:{}  {}:{}",
                    reference.file_path.display(),
                    reference.line_number,
                    reference.image_name,
                    reference.current_tag
                );
            }
            let files: BTreeSet<_> = report.references.iter().map(|r| &r.file_path).collect();
            println!(
                "{} reference(s) to {} image(s) in {} file(s)",
                report.references.len(),
                report.distinct_images().len(),
                files.len()
            );
            Ok(EXIT_OK)
        }

        Commands::Plan => {
            let orchestrator = Orchestrator::from_config(config)?;
            let (_, PlanOutcome { plan, skipped }) = orchestrator.preview().await?;
            print_plan(&plan, &skipped);
            Ok(EXIT_OK)
        }

        Commands::Status => {
            let state = StateStore::new(config.resolved_state_path()).load()?;
            println!("{}", render_status(&config, &state, Utc::now()));
            Ok(EXIT_OK)
        }

        Commands::Unlock { force } => {
            let orchestrator = Orchestrator::from_config(config)?;
            if !orchestrator.store().load()?.is_locked() {
                println!("No run lock is held.");
                return Ok(EXIT_OK);
            }
            match orchestrator.unlock(force).await? {
                Some(lease) => {
                    warn!(holder = %lease.holder_id, run_id = %lease.run_id, "Run lock cleared");
                    println!(
                        "Released lock held by {} since {}",
                        lease.holder_id,
                        lease.acquired_at.to_rfc3339()
                    );
                    Ok(EXIT_OK)
                }
                None => {
                    eprintln!("The run lock is still fresh; pass --force to clear it anyway.");
                    Ok(EXIT_FAILED)
                }
            }
        }
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next phase boundary");
            child.cancel();
        }
    });
    token
}

async fn run_once(orchestrator: &Orchestrator, options: RunOptions, cancel: &CancellationToken) -> i32 {
    match orchestrator.run(options, cancel).await {
        Ok(summary) => {
            print_summary(&summary);
            EXIT_OK
        }
        // Already logged with its class by the orchestrator.
        Err(e) => e.exit_code(),
    }
}

fn watch_schedule(
    config: &Config,
    interval_secs: Option<u64>,
    cron: Option<&str>,
) -> Result<WatchSchedule> {
    if let Some(secs) = interval_secs {
        return Ok(WatchSchedule::interval_secs(secs));
    }
    match cron.or(config.watch.cron.as_deref()) {
        Some(expression) => WatchSchedule::cron(expression),
        None => Ok(WatchSchedule::interval_secs(config.watch.interval_secs)),
    }
}

/// `--run-on-startup[=BOOL]` wins over `watch.run_on_startup` either way.
fn start_immediately(flag: Option<bool>, config: &Config) -> bool {
    flag.unwrap_or(config.watch.run_on_startup)
}

async fn watch(
    orchestrator: &Orchestrator,
    schedule: &WatchSchedule,
    run_on_startup: bool,
    options: RunOptions,
) -> Result<i32> {
    let cancel = cancel_on_ctrl_c();
    info!(holder = %orchestrator.holder(), dry_run = options.dry_run, "Watching for base image updates");

    let mut first = true;
    loop {
        if !first || run_on_startup {
            match orchestrator.run(options, &cancel).await {
                Ok(summary) => print_summary(&summary),
                Err(RunError::Cancelled { .. }) => break,
                Err(RunError::RunAlreadyInProgress { holder, .. }) => {
                    info!(holder = %holder, "Skipping this cycle, another run is active");
                }
                Err(e) => debug!(class = %e.class(), "Cycle failed, waiting for the next one"),
            }
        }
        first = false;

        let Some(delay) = schedule.delay_from(Utc::now()) else {
            warn!("Schedule has no future occurrences");
            break;
        };
        debug!(delay_secs = delay.as_secs(), "Waiting for next run");
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    info!("Watch stopped");
    Ok(EXIT_OK)
}

fn print_summary(summary: &RunSummary) {
    println!("Run {}: {}", summary.run_id, summary.status);
    print_plan(&summary.plan, &summary.skipped);
    if let Some(branch) = &summary.branch {
        println!("Branch {} ({}) at {}", branch.name, branch.outcome, branch.commit);
    }
    if let Some(mr) = &summary.merge_request {
        let id = mr.mr_id.map_or_else(|| "?".to_string(), |id| id.to_string());
        println!(
            "Merge request !{id} {} [{}]{}",
            mr.outcome,
            mr.status,
            mr.web_url
                .as_deref()
                .map(|url| format!(" {url}"))
                .unwrap_or_default()
        );
    }
}

fn print_plan(plan: &UpdatePlan, skipped: &[SkippedImage]) {
    if plan.is_empty() {
        println!("All base images are up to date.");
    }
    for edit in plan.edits() {
        println!(
            "{}:{}  {} -> {}  ({})",
            edit.reference.file_path.display(),
            edit.reference.line_number,
            edit.reference.declared,
            edit.replacement(),
            edit.source
        );
    }
    for skip in skipped {
        println!("skipped {}: {}", skip.image_name, skip.error);
    }
}
