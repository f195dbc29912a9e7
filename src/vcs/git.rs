use crate::error::BranchError;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

/// Commit identity used for every automated commit.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Thin async wrapper over the `git` CLI, rooted at one working copy.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    identity: Identity,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, identity: Identity) -> Self {
        Self {
            workdir: workdir.into(),
            identity,
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output, BranchError> {
        Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BranchError::Git {
                command: command_name(args),
                message: format!("failed to run git: {e}"),
            })
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<String, BranchError> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(BranchError::Git {
                command: command_name(args),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    pub async fn head_commit(&self) -> Result<String, BranchError> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    /// Checked-out branch name, or the commit id when HEAD is detached.
    pub async fn current_ref(&self) -> Result<String, BranchError> {
        let output = self
            .output(&["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        self.head_commit().await
    }

    pub async fn tree_of(&self, rev: &str) -> Result<String, BranchError> {
        self.run(&["rev-parse", &format!("{rev}^{{tree}}")]).await
    }

    /// Commit id of `branch` on `remote`, if it exists there.
    pub async fn remote_branch_head(
        &self,
        remote: &str,
        branch: &str,
    ) -> Result<Option<String>, BranchError> {
        let refname = format!("refs/heads/{branch}");
        let listing = self.run(&["ls-remote", "--heads", remote, &refname]).await?;
        Ok(listing.lines().find_map(|line| {
            let (sha, name) = line.split_once('\t')?;
            (name == refname).then(|| sha.to_string())
        }))
    }

    pub async fn fetch(&self, remote: &str, branch: &str) -> Result<(), BranchError> {
        self.run(&["fetch", "--quiet", remote, &format!("refs/heads/{branch}")])
            .await
            .map(|_| ())
    }

    /// Fetch `branch` from `remote` and return the commit it points at.
    pub async fn fetch_tip(&self, remote: &str, branch: &str) -> Result<String, BranchError> {
        self.fetch(remote, branch).await?;
        self.run(&["rev-parse", "FETCH_HEAD"]).await
    }

    /// Create (or reset) `branch` at HEAD and switch to it, keeping
    /// working-tree changes.
    pub async fn create_branch(&self, branch: &str) -> Result<(), BranchError> {
        self.run(&["checkout", "--quiet", "-B", branch]).await.map(|_| ())
    }

    pub async fn checkout(&self, rev: &str) -> Result<(), BranchError> {
        self.run(&["checkout", "--quiet", rev]).await.map(|_| ())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<(), BranchError> {
        self.run(&["branch", "--quiet", "-D", branch]).await.map(|_| ())
    }

    pub async fn local_branch_exists(&self, branch: &str) -> Result<bool, BranchError> {
        let output = self
            .output(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])
            .await?;
        Ok(output.status.success())
    }

    pub async fn add(&self, paths: &[&Path]) -> Result<(), BranchError> {
        let mut args = vec!["add", "--"];
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        args.extend(rendered.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    /// Commit the index with the configured identity; returns the new commit id.
    pub async fn commit(&self, message: &str) -> Result<String, BranchError> {
        let name = format!("user.name={}", self.identity.name);
        let email = format!("user.email={}", self.identity.email);
        self.run(&[
            "-c",
            &name,
            "-c",
            &email,
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--quiet",
            "--no-verify",
            "-m",
            message,
        ])
        .await?;
        self.head_commit().await
    }

    /// Push HEAD to `refs/heads/<branch>`. With `lease`, the remote is
    /// force-updated only if it still points at that commit.
    pub async fn push(
        &self,
        remote: &str,
        branch: &str,
        push_options: &[String],
        lease: Option<&str>,
    ) -> Result<(), BranchError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let lease_arg = lease.map(|sha| format!("--force-with-lease=refs/heads/{branch}:{sha}"));

        let mut args = vec!["push", "--quiet", "--porcelain"];
        for option in push_options {
            args.push("-o");
            args.push(option);
        }
        if let Some(lease_arg) = &lease_arg {
            args.push(lease_arg);
        }
        args.push(remote);
        args.push(&refspec);

        self.run(&args)
            .await
            .map(|_| ())
            .map_err(|e| BranchError::PushFailed {
                branch: branch.to_string(),
                message: match e {
                    BranchError::Git { message, .. } => message,
                    other => other.to_string(),
                },
            })
    }
}

fn command_name(args: &[&str]) -> String {
    args.iter()
        .find(|a| !a.starts_with('-') && !a.contains('='))
        .map_or_else(String::new, ToString::to_string)
}
