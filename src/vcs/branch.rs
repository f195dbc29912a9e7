use super::git::{Git, Identity};
use crate::config::GitConfig;
use crate::error::BranchError;
use crate::patcher::AppliedPlan;
use crate::planner::UpdatePlan;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// Length of the plan-hash suffix in branch names.
const BRANCH_HASH_LEN: usize = 12;

/// Provider-agnostic loop-prevention marker in the commit message.
pub const SKIP_CI_TRAILER: &str = "[skip ci]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum BranchOutcome {
    /// Branch did not exist remotely and was pushed fresh.
    Created,
    /// A stale bot-owned branch was force-updated.
    Updated,
    /// The remote branch already carries exactly this change.
    AlreadyProposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHandle {
    pub name: String,
    pub content_hash: String,
    /// Remote head of the branch after this run.
    pub commit: String,
    pub outcome: BranchOutcome,
}

/// Deterministic branch name for a plan.
pub fn branch_name(prefix: &str, plan: &UpdatePlan) -> String {
    let hash = plan.content_hash();
    format!(
        "{prefix}update-base-images-{}",
        &hash[..BRANCH_HASH_LEN.min(hash.len())]
    )
}

pub fn commit_title(plan: &UpdatePlan) -> String {
    format!("chore: update {} base image(s)", plan.changes().len())
}

/// Commit message listing every `(image, old -> new)` change.
pub fn commit_message(plan: &UpdatePlan) -> String {
    let mut message = commit_title(plan);
    message.push_str("\n\n");
    for (image, old, new) in plan.changes() {
        let _ = writeln!(message, "- {image}: {old} -> {new}");
    }
    message.push('\n');
    message.push_str(SKIP_CI_TRAILER);
    message
}

pub struct BranchManager {
    git: Git,
    remote: String,
    base_branch: String,
    prefix: String,
    push_options: Vec<String>,
}

impl BranchManager {
    pub fn new(workdir: &Path, config: &GitConfig) -> Self {
        Self {
            git: Git::new(
                workdir,
                Identity {
                    name: config.commit_author_name.clone(),
                    email: config.commit_author_email.clone(),
                },
            ),
            remote: config.remote.clone(),
            base_branch: config.base_branch.clone(),
            prefix: config.branch_prefix.clone(),
            push_options: config.push_options.clone(),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Fail unless HEAD is the current tip of `<remote>/<base_branch>`.
    /// Returns the tip.
    pub async fn verify_base(&self) -> Result<String, BranchError> {
        let tip = self.git.fetch_tip(&self.remote, &self.base_branch).await?;
        let head = self.git.head_commit().await?;
        if head != tip {
            tracing::error!(
                head = %head,
                tip = %tip,
                base = %self.base_branch,
                "Working copy is not at the base branch tip"
            );
            return Err(BranchError::BaseMismatch {
                remote: self.remote.clone(),
                base: self.base_branch.clone(),
                head,
                tip,
            });
        }
        Ok(tip)
    }

    /// Commit the applied plan on its content-named branch and push it.
    ///
    /// The branch is cut from the base tip; a working copy anywhere else is
    /// refused with [`BranchError::BaseMismatch`].
    ///
    /// `known_branches` maps plan hashes to branches this engine created; a
    /// remote branch of the same name that is not listed there is never
    /// touched. The working copy is back on its original ref when this
    /// returns, with or without an error, and no local branch is left behind.
    pub async fn ensure_branch(
        &self,
        plan: &UpdatePlan,
        applied: &AppliedPlan,
        known_branches: &BTreeMap<String, String>,
    ) -> Result<BranchHandle, BranchError> {
        self.verify_base().await?;
        let content_hash = plan.content_hash();
        let name = branch_name(&self.prefix, plan);

        let remote_head = self.git.remote_branch_head(&self.remote, &name).await?;
        let owned = known_branches.get(&content_hash) == Some(&name);
        if remote_head.is_some() && !owned {
            tracing::error!(branch = %name, "Remote branch exists but was not created by evergreen");
            return Err(BranchError::OwnershipConflict { branch: name });
        }

        let original_ref = self.git.current_ref().await?;

        if self.git.local_branch_exists(&name).await? {
            tracing::debug!(branch = %name, "Removing leftover local branch");
            self.git.delete_branch(&name).await?;
        }
        self.git.create_branch(&name).await?;

        let result = self
            .commit_and_push(plan, applied, &name, remote_head.as_deref())
            .await;
        let cleanup = self.return_to(&original_ref, &name).await;

        let (commit, outcome) = result?;
        cleanup?;
        tracing::info!(branch = %name, outcome = %outcome, "Branch ready");

        Ok(BranchHandle {
            name,
            content_hash,
            commit,
            outcome,
        })
    }

    async fn commit_and_push(
        &self,
        plan: &UpdatePlan,
        applied: &AppliedPlan,
        name: &str,
        remote_head: Option<&str>,
    ) -> Result<(String, BranchOutcome), BranchError> {
        let files: Vec<&Path> = applied.files().collect();
        self.git.add(&files).await?;
        let commit = self.git.commit(&commit_message(plan)).await?;

        let Some(remote_head) = remote_head else {
            self.git
                .push(&self.remote, name, &self.push_options, None)
                .await?;
            return Ok((commit, BranchOutcome::Created));
        };

        self.git.fetch(&self.remote, name).await?;
        if self.git.tree_of(remote_head).await? == self.git.tree_of(&commit).await? {
            tracing::info!(branch = %name, "Identical change already proposed");
            return Ok((remote_head.to_string(), BranchOutcome::AlreadyProposed));
        }

        tracing::info!(branch = %name, "Force-updating stale evergreen branch");
        self.git
            .push(&self.remote, name, &self.push_options, Some(remote_head))
            .await?;
        Ok((commit, BranchOutcome::Updated))
    }

    /// Switch back to `original_ref` and drop the local branch.
    async fn return_to(&self, original_ref: &str, name: &str) -> Result<(), BranchError> {
        self.git.checkout(original_ref).await?;
        self.git.delete_branch(name).await
    }
}
