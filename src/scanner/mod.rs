//! Reference scanner: finds `FROM image[:tag]` declarations in build manifests.
//!
//! Scanning is read-only and deterministic: files are visited in sorted path
//! order and every call to [`Scanner::manifests`] walks the tree afresh, so a
//! scan can be restarted at any point.

mod parse;

pub use parse::{DEFAULT_TAG, FromDeclaration, parse_from_line, split_tag};

use crate::config::ScannerConfig;
use crate::error::ScanError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One textual occurrence of an image reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageReference {
    /// Path relative to the scan root.
    pub file_path: PathBuf,
    /// 1-based line number.
    pub line_number: usize,
    pub image_name: String,
    pub current_tag: String,
    /// Image token as written on the line.
    pub declared: String,
}

/// A manifest file together with its scan-time fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedManifest {
    pub file_path: PathBuf,
    pub content_hash: String,
    pub references: Vec<ImageReference>,
}

/// Everything a full scan produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub references: Vec<ImageReference>,
    /// Content hash per scanned file, keyed by root-relative path.
    pub fingerprints: BTreeMap<PathBuf, String>,
}

impl ScanReport {
    pub fn distinct_images(&self) -> BTreeSet<&str> {
        self.references
            .iter()
            .map(|r| r.image_name.as_str())
            .collect()
    }
}

/// SHA-256 of raw file bytes, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    ignore_images: BTreeSet<String>,
}

impl Scanner {
    /// Build a scanner for `root`, taking patterns from `config`.
    pub fn with_root(root: &Path, config: &ScannerConfig) -> Result<Self, ScanError> {
        let include = config
            .dockerfile_glob_patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = config
            .exclude_patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: root.to_path_buf(),
            include,
            exclude,
            ignore_images: config.ignore_images.iter().cloned().collect(),
        })
    }

    /// Lazily walk the tree, yielding one entry per matching manifest.
    pub fn manifests(&self) -> impl Iterator<Item = Result<ScannedManifest, ScanError>> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git")
            .filter_map(move |entry| match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    let relative = entry.path().strip_prefix(&self.root).ok()?.to_path_buf();
                    self.is_manifest(&relative)
                        .then(|| self.read_manifest(entry.path(), relative))
                }
                Ok(_) => None,
                Err(e) => Some(Err(ScanError::Walk {
                    root: self.root.clone(),
                    message: e.to_string(),
                })),
            })
    }

    /// Lazily yield every reference in every manifest.
    pub fn references(&self) -> impl Iterator<Item = Result<ImageReference, ScanError>> + '_ {
        self.manifests().flat_map(|manifest| match manifest {
            Ok(m) => m.references.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })
    }

    /// Run a full scan. Unreadable files are skipped; a missing root is fatal.
    pub fn scan(&self) -> Result<ScanReport, ScanError> {
        if !self.root.is_dir() {
            return Err(ScanError::Walk {
                root: self.root.clone(),
                message: "scan root is not a directory".into(),
            });
        }

        let mut report = ScanReport::default();
        for manifest in self.manifests() {
            match manifest {
                Ok(m) => {
                    report
                        .fingerprints
                        .insert(m.file_path.clone(), m.content_hash);
                    report.references.extend(m.references);
                }
                Err(e) => tracing::warn!("Skipping manifest: {e}"),
            }
        }
        report.references.sort();
        tracing::debug!(
            files = report.fingerprints.len(),
            references = report.references.len(),
            "Scan complete"
        );
        Ok(report)
    }

    fn is_manifest(&self, relative: &Path) -> bool {
        let Some(file_name) = relative.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let relative_str = relative.to_string_lossy().replace('\\', "/");
        self.include.iter().any(|re| re.is_match(file_name))
            && !self.exclude.iter().any(|re| re.is_match(&relative_str))
    }

    fn read_manifest(&self, path: &Path, relative: PathBuf) -> Result<ScannedManifest, ScanError> {
        let bytes = std::fs::read(path).map_err(|source| ScanError::Read {
            path: relative.clone(),
            source,
        })?;
        let content_hash = content_hash(&bytes);
        let text = String::from_utf8_lossy(&bytes);

        let references = text
            .lines()
            .enumerate()
            .filter_map(|(idx, line)| {
                let decl = parse_from_line(line)?;
                if self.ignore_images.contains(&decl.image_name) {
                    return None;
                }
                Some(ImageReference {
                    file_path: relative.clone(),
                    line_number: idx + 1,
                    image_name: decl.image_name,
                    current_tag: decl.tag,
                    declared: decl.declared,
                })
            })
            .collect();

        Ok(ScannedManifest {
            file_path: relative,
            content_hash,
            references,
        })
    }
}

/// Translate a shell glob into an anchored regex.
/// `**` crosses directory separators, `*` and `?` do not.
fn glob_to_regex(pattern: &str) -> Result<Regex, ScanError> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|_| ScanError::Pattern {
        pattern: pattern.to_string(),
    })
}
