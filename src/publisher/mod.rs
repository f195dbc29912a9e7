//! Merge request publishing with de-duplication against the remote host.

pub mod gitlab;

pub use gitlab::GitLabHost;

use crate::error::PublishError;
use crate::planner::UpdatePlan;
use crate::vcs::{BranchHandle, commit_title};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;

const DESCRIPTION_FOOTER: &str =
    "---\nOpened automatically by evergreen. Re-running against the same registry state reuses this request.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MergeRequestStatus {
    Opened,
    Closed,
    Merged,
    Locked,
    #[serde(other)]
    Unknown,
}

/// A merge request as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteMergeRequest {
    pub iid: u64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub state: MergeRequestStatus,
    pub source_branch: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

/// Creation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMergeRequest {
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub remove_source_branch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PublishOutcome {
    Created,
    Existing,
}

/// The merge request backing a branch, reconstructed from the host each run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequestRecord {
    pub branch_name: String,
    pub mr_id: Option<u64>,
    pub title: String,
    pub description: String,
    pub status: MergeRequestStatus,
    pub web_url: Option<String>,
    pub outcome: PublishOutcome,
}

impl MergeRequestRecord {
    fn from_remote(remote: RemoteMergeRequest, outcome: PublishOutcome) -> Self {
        Self {
            branch_name: remote.source_branch,
            mr_id: Some(remote.iid),
            title: remote.title,
            description: remote.description.unwrap_or_default(),
            status: remote.state,
            web_url: remote.web_url,
            outcome,
        }
    }
}

/// Source-control host that stores merge requests.
pub trait MergeRequestHost: Send + Sync {
    fn name(&self) -> &str;

    /// Every request (any state) whose source branch is `branch`.
    fn find_by_source_branch<'a>(
        &'a self,
        branch: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RemoteMergeRequest>, PublishError>> + Send + 'a>>;

    fn create<'a>(
        &'a self,
        request: &'a NewMergeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteMergeRequest, PublishError>> + Send + 'a>>;
}

/// Merge request body: one line per edit, then a fixed footer.
pub fn description(plan: &UpdatePlan) -> String {
    let mut body = String::from("This merge request updates container base images.\n\n");
    for edit in plan.edits() {
        let _ = writeln!(
            body,
            "- `{}:{}` {}: `{}` -> `{}`",
            edit.reference.file_path.display(),
            edit.reference.line_number,
            edit.reference.image_name,
            edit.reference.current_tag,
            edit.target_tag
        );
    }
    body.push('\n');
    body.push_str(DESCRIPTION_FOOTER);
    body
}

pub struct Publisher<'a> {
    host: &'a dyn MergeRequestHost,
    target_branch: String,
    remove_source_branch: bool,
}

impl<'a> Publisher<'a> {
    pub fn new(
        host: &'a dyn MergeRequestHost,
        target_branch: impl Into<String>,
        remove_source_branch: bool,
    ) -> Self {
        Self {
            host,
            target_branch: target_branch.into(),
            remove_source_branch,
        }
    }

    /// Return the open request for the branch, or open a new one.
    pub async fn publish(
        &self,
        branch: &BranchHandle,
        plan: &UpdatePlan,
    ) -> Result<MergeRequestRecord, PublishError> {
        let existing = self.host.find_by_source_branch(&branch.name).await?;
        if let Some(open) = existing
            .into_iter()
            .filter(|mr| mr.source_branch == branch.name)
            .find(|mr| mr.state == MergeRequestStatus::Opened)
        {
            tracing::info!(
                host = self.host.name(),
                branch = %branch.name,
                mr = open.iid,
                "Open merge request already exists"
            );
            return Ok(MergeRequestRecord::from_remote(open, PublishOutcome::Existing));
        }

        let request = NewMergeRequest {
            source_branch: branch.name.clone(),
            target_branch: self.target_branch.clone(),
            title: commit_title(plan),
            description: description(plan),
            remove_source_branch: self.remove_source_branch,
        };
        let created = self.host.create(&request).await?;
        tracing::info!(
            host = self.host.name(),
            branch = %branch.name,
            mr = created.iid,
            "Opened merge request"
        );
        Ok(MergeRequestRecord::from_remote(created, PublishOutcome::Created))
    }
}
