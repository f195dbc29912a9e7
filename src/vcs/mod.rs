//! Version control: the git CLI wrapper and the content-named branch lifecycle.

pub mod branch;
pub mod git;

pub use branch::{
    BranchHandle, BranchManager, BranchOutcome, SKIP_CI_TRAILER, branch_name, commit_message,
    commit_title,
};
pub use git::{Git, Identity};
