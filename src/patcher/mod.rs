//! File patcher: applies an [`UpdatePlan`] to the working tree, all or nothing.
//!
//! Every target file is checked against its scan-time fingerprint and fully
//! rewritten in memory before anything touches disk. Writes go through
//! temp-file-then-rename, and each rewritten line is re-read and re-parsed. Any
//! failure restores every file already written.

use crate::error::PatchError;
use crate::planner::{PlannedEdit, UpdatePlan};
use crate::scanner::{content_hash, parse_from_line};
use crate::utils::fs::write_atomic;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Files rewritten by a successful [`FilePatcher::apply`], with their prior
/// content so the change can be reverted.
#[derive(Debug)]
#[must_use = "an applied plan should be committed or restored"]
pub struct AppliedPlan {
    root: PathBuf,
    originals: Vec<(PathBuf, Vec<u8>)>,
}

impl AppliedPlan {
    /// Root-relative paths of every rewritten file, in plan order.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.originals.iter().map(|(path, _)| path.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }

    /// Put every file back to its scan-time content.
    pub fn restore(self) -> Result<(), PatchError> {
        restore_all(&self.root, &self.originals)
    }
}

struct PendingWrite<'p> {
    relative: PathBuf,
    original: Vec<u8>,
    patched: String,
    edits: Vec<&'p PlannedEdit>,
}

#[derive(Debug, Clone)]
pub struct FilePatcher {
    root: PathBuf,
}

impl FilePatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Apply `plan`. `fingerprints` are the scan-time content hashes keyed by
    /// root-relative path.
    pub fn apply(
        &self,
        plan: &UpdatePlan,
        fingerprints: &BTreeMap<PathBuf, String>,
    ) -> Result<AppliedPlan, PatchError> {
        let pending = plan
            .files()
            .map(|relative| self.prepare(plan, relative, fingerprints))
            .collect::<Result<Vec<_>, _>>()?;

        let mut written: Vec<(PathBuf, Vec<u8>)> = Vec::with_capacity(pending.len());
        for write in pending {
            let path = self.root.join(&write.relative);
            if let Err(source) = write_atomic(&path, write.patched.as_bytes()) {
                self.rollback(&written);
                return Err(PatchError::Io {
                    path: write.relative,
                    source,
                });
            }
            written.push((write.relative.clone(), write.original));

            if let Err(e) = verify(&path, &write.relative, &write.edits) {
                tracing::error!(file = %write.relative.display(), "Patch verification failed: {e}");
                self.rollback(&written);
                return Err(e);
            }
            tracing::debug!(
                file = %write.relative.display(),
                edits = write.edits.len(),
                "Patched manifest"
            );
        }

        Ok(AppliedPlan {
            root: self.root.clone(),
            originals: written,
        })
    }

    fn prepare<'p>(
        &self,
        plan: &'p UpdatePlan,
        relative: &Path,
        fingerprints: &BTreeMap<PathBuf, String>,
    ) -> Result<PendingWrite<'p>, PatchError> {
        let expected = fingerprints
            .get(relative)
            .ok_or_else(|| PatchError::MissingFingerprint(relative.to_path_buf()))?;
        let original = fs::read(self.root.join(relative)).map_err(|source| PatchError::Io {
            path: relative.to_path_buf(),
            source,
        })?;
        let actual = content_hash(&original);
        if &actual != expected {
            return Err(PatchError::FileIntegrity {
                path: relative.to_path_buf(),
                expected: expected.clone(),
                actual,
            });
        }

        let text = std::str::from_utf8(&original).map_err(|e| PatchError::Verification {
            path: relative.to_path_buf(),
            line: 0,
            message: format!("manifest is not valid UTF-8: {e}"),
        })?;
        let mut lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();

        let edits: Vec<&PlannedEdit> = plan.edits_for(relative).collect();
        for edit in &edits {
            let idx = edit.reference.line_number.saturating_sub(1);
            let line = lines
                .get_mut(idx)
                .ok_or_else(|| line_mismatch(relative, edit))?;
            *line = rewrite_line(line, edit).ok_or_else(|| line_mismatch(relative, edit))?;
        }

        Ok(PendingWrite {
            relative: relative.to_path_buf(),
            original,
            patched: lines.concat(),
            edits,
        })
    }

    fn rollback(&self, written: &[(PathBuf, Vec<u8>)]) {
        if let Err(e) = restore_all(&self.root, written) {
            tracing::error!("Failed to restore patched files: {e}");
        }
    }
}

fn line_mismatch(path: &Path, edit: &PlannedEdit) -> PatchError {
    PatchError::LineMismatch {
        path: path.to_path_buf(),
        line: edit.reference.line_number,
        declared: edit.reference.declared.clone(),
    }
}

/// Swap the declared image token on `line` for the edit's replacement,
/// leaving indentation, flags, stage alias and line ending untouched.
fn rewrite_line(line: &str, edit: &PlannedEdit) -> Option<String> {
    let parsed = parse_from_line(line)?;
    if parsed.declared != edit.reference.declared {
        return None;
    }

    let declared = edit.reference.declared.as_str();
    let bytes = line.as_bytes();
    let start = line.match_indices(declared).map(|(i, _)| i).find(|&i| {
        let end = i + declared.len();
        i > 0
            && bytes[i - 1].is_ascii_whitespace()
            && bytes.get(end).is_none_or(u8::is_ascii_whitespace)
    })?;

    let end = start + declared.len();
    Some(format!("{}{}{}", &line[..start], edit.replacement(), &line[end..]))
}

fn verify(path: &Path, relative: &Path, edits: &[&PlannedEdit]) -> Result<(), PatchError> {
    let content = fs::read_to_string(path).map_err(|source| PatchError::Io {
        path: relative.to_path_buf(),
        source,
    })?;
    let lines: Vec<&str> = content.lines().collect();

    for edit in edits {
        let line_number = edit.reference.line_number;
        let fail = |message: String| PatchError::Verification {
            path: relative.to_path_buf(),
            line: line_number,
            message,
        };
        let line = lines
            .get(line_number.saturating_sub(1))
            .ok_or_else(|| fail("line missing after write".into()))?;
        let parsed = parse_from_line(line)
            .ok_or_else(|| fail(format!("line no longer parses: {line:?}")))?;
        if parsed.image_name != edit.reference.image_name || parsed.tag != edit.target_tag {
            return Err(fail(format!(
                "expected {}, found {}:{}",
                edit.replacement(),
                parsed.image_name,
                parsed.tag
            )));
        }
        if parsed.tag == edit.reference.current_tag {
            return Err(fail(format!(
                "old tag {} still present",
                edit.reference.current_tag
            )));
        }
    }
    Ok(())
}

fn restore_all(root: &Path, originals: &[(PathBuf, Vec<u8>)]) -> Result<(), PatchError> {
    let mut first_error = None;
    for (relative, content) in originals {
        if let Err(source) = write_atomic(&root.join(relative), content) {
            first_error.get_or_insert(PatchError::Io {
                path: relative.clone(),
                source,
            });
        }
    }
    first_error.map_or(Ok(()), Err)
}
