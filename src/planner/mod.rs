//! Update planning: scanner output plus registry tags in, an ordered edit plan out.

use crate::error::RegistryError;
use crate::registry::{TagSource, VersionCandidate};
use crate::scanner::ImageReference;
use crate::selector::{EditSource, PolicySet, select};
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// One line rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEdit {
    pub reference: ImageReference,
    pub target_tag: String,
    pub source: EditSource,
}

impl PlannedEdit {
    /// Image token that replaces `reference.declared`.
    pub fn replacement(&self) -> String {
        format!("{}:{}", self.reference.image_name, self.target_tag)
    }
}

/// Edits grouped per file in path order, each file's edits in line order.
/// Holds at most one edit per `(file_path, line_number)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    files: BTreeMap<PathBuf, BTreeMap<usize, PlannedEdit>>,
}

impl UpdatePlan {
    /// Insert unless the line already has an edit. Returns whether it was kept.
    pub fn insert(&mut self, edit: PlannedEdit) -> bool {
        debug_assert_ne!(edit.target_tag, edit.reference.current_tag);
        let lines = self
            .files
            .entry(edit.reference.file_path.clone())
            .or_default();
        if lines.contains_key(&edit.reference.line_number) {
            return false;
        }
        lines.insert(edit.reference.line_number, edit);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.values().map(BTreeMap::len).sum()
    }

    pub fn edits(&self) -> impl Iterator<Item = &PlannedEdit> {
        self.files.values().flat_map(BTreeMap::values)
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    pub fn edits_for(&self, file: &Path) -> impl Iterator<Item = &PlannedEdit> {
        self.files.get(file).into_iter().flat_map(BTreeMap::values)
    }

    /// Distinct `(image, old_tag, new_tag)` changes in sorted order.
    pub fn changes(&self) -> BTreeSet<(&str, &str, &str)> {
        self.edits()
            .map(|e| {
                (
                    e.reference.image_name.as_str(),
                    e.reference.current_tag.as_str(),
                    e.target_tag.as_str(),
                )
            })
            .collect()
    }

    /// SHA-256 over the sorted `(image, old_tag, new_tag)` tuple of every edit.
    pub fn content_hash(&self) -> String {
        let mut tuples: Vec<_> = self
            .edits()
            .map(|e| {
                (
                    e.reference.image_name.as_str(),
                    e.reference.current_tag.as_str(),
                    e.target_tag.as_str(),
                )
            })
            .collect();
        tuples.sort_unstable();

        let mut hasher = Sha256::new();
        for (image, old, new) in tuples {
            hasher.update(image.as_bytes());
            hasher.update([0]);
            hasher.update(old.as_bytes());
            hasher.update([0]);
            hasher.update(new.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// An image whose tags could not be listed; its references are left as-is.
#[derive(Debug)]
pub struct SkippedImage {
    pub image_name: String,
    pub error: RegistryError,
}

#[derive(Debug, Default)]
pub struct PlanOutcome {
    pub plan: UpdatePlan,
    pub skipped: Vec<SkippedImage>,
}

pub struct Planner<'a> {
    source: &'a dyn TagSource,
    policies: &'a PolicySet,
    concurrency: usize,
}

impl<'a> Planner<'a> {
    pub fn new(source: &'a dyn TagSource, policies: &'a PolicySet, concurrency: usize) -> Self {
        Self {
            source,
            policies,
            concurrency: concurrency.max(1),
        }
    }

    /// Query each distinct image once, then select a target per reference.
    pub async fn plan(&self, references: &[ImageReference]) -> PlanOutcome {
        let mut ordered: Vec<&ImageReference> = references
            .iter()
            .filter(|r| !self.policies.skips_tag(&r.current_tag))
            .collect();
        ordered.sort();

        let images: BTreeSet<&str> = ordered.iter().map(|r| r.image_name.as_str()).collect();
        let mut outcome = PlanOutcome::default();
        let mut available = BTreeMap::new();
        for (image_name, result) in self.fetch_all(images).await {
            match result {
                Ok(candidates) => {
                    available.insert(image_name, candidates);
                }
                Err(error) => {
                    tracing::warn!(image = image_name.as_str(), "Skipping image: {error}");
                    outcome.skipped.push(SkippedImage { image_name, error });
                }
            }
        }

        for reference in ordered {
            let Some(candidates) = available.get(&reference.image_name) else {
                continue;
            };
            let policy = self.policies.for_image(&reference.image_name);
            let Some(selection) = select(&reference.current_tag, candidates, policy) else {
                continue;
            };
            let edit = PlannedEdit {
                reference: reference.clone(),
                target_tag: selection.tag,
                source: selection.source,
            };
            if !outcome.plan.insert(edit) {
                tracing::debug!(
                    file = %reference.file_path.display(),
                    line = reference.line_number,
                    "Dropping duplicate edit"
                );
            }
        }

        tracing::info!(
            edits = outcome.plan.len(),
            skipped = outcome.skipped.len(),
            "Update plan computed"
        );
        outcome
    }

    async fn fetch_all(
        &self,
        images: BTreeSet<&str>,
    ) -> BTreeMap<String, Result<Vec<VersionCandidate>, RegistryError>> {
        stream::iter(images)
            .map(|image| async move {
                let result = self.source.get_tags(image).await;
                (image.to_string(), result)
            })
            .buffer_unordered(self.concurrency)
            .boxed()
            .collect()
            .await
    }
}
