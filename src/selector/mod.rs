//! Version selection: choose the best eligible upgrade target for a tag.

mod version;

pub use version::TagVersion;

use crate::config::{PolicyConfig, SortRule};
use crate::error::ConfigError;
use crate::registry::VersionCandidate;
use crate::scanner::DEFAULT_TAG;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// How a target tag was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EditSource {
    PolicyDerived,
    ExplicitMapping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub tag: String,
    pub source: EditSource,
}

#[derive(Debug, Clone)]
pub struct UpdatePolicy {
    pub tag_pattern: Regex,
    pub sort_rule: SortRule,
    pub explicit_mappings: BTreeMap<String, String>,
}

impl UpdatePolicy {
    pub fn new(
        tag_pattern: &str,
        sort_rule: SortRule,
        explicit_mappings: BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let tag_pattern = Regex::new(tag_pattern).map_err(|e| {
            ConfigError::Validation(format!("tag_pattern {tag_pattern:?} is not a valid regex: {e}"))
        })?;
        Ok(Self {
            tag_pattern,
            sort_rule,
            explicit_mappings,
        })
    }
}

/// The default policy plus per-image overrides.
#[derive(Debug, Clone)]
pub struct PolicySet {
    default: UpdatePolicy,
    per_image: BTreeMap<String, UpdatePolicy>,
    skip_latest: bool,
}

impl PolicySet {
    pub fn single(policy: UpdatePolicy) -> Self {
        Self {
            default: policy,
            per_image: BTreeMap::new(),
            skip_latest: true,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, ConfigError> {
        let default = UpdatePolicy::new(
            &config.tag_pattern,
            config.sort_rule,
            config.explicit_mappings.clone(),
        )?;

        let mut per_image = BTreeMap::new();
        for image in &config.images {
            let policy = UpdatePolicy::new(
                image.tag_pattern.as_deref().unwrap_or(&config.tag_pattern),
                image.sort_rule.unwrap_or(config.sort_rule),
                image
                    .explicit_mappings
                    .clone()
                    .unwrap_or_else(|| config.explicit_mappings.clone()),
            )?;
            per_image.insert(image.image.clone(), policy);
        }

        Ok(Self {
            default,
            per_image,
            skip_latest: config.skip_latest,
        })
    }

    pub fn for_image(&self, image_name: &str) -> &UpdatePolicy {
        self.per_image.get(image_name).unwrap_or(&self.default)
    }

    /// Whether references at `current_tag` are left alone regardless of policy.
    pub fn skips_tag(&self, current_tag: &str) -> bool {
        self.skip_latest && current_tag == DEFAULT_TAG
    }
}

/// Pick the upgrade target for `current_tag`, or `None` when there is nothing
/// newer. Explicit mappings win when their target is an eligible candidate.
pub fn select(
    current_tag: &str,
    candidates: &[VersionCandidate],
    policy: &UpdatePolicy,
) -> Option<Selection> {
    let mut seen = BTreeSet::new();
    let eligible: Vec<&VersionCandidate> = candidates
        .iter()
        .filter(|c| policy.tag_pattern.is_match(&c.tag))
        .filter(|c| seen.insert(c.tag.as_str()))
        .collect();

    if let Some(mapped) = policy.explicit_mappings.get(current_tag)
        && eligible.iter().any(|c| &c.tag == mapped)
    {
        return (mapped != current_tag).then(|| Selection {
            tag: mapped.clone(),
            source: EditSource::ExplicitMapping,
        });
    }

    let best = match policy.sort_rule {
        SortRule::Semver => best_semver(current_tag, &eligible),
        SortRule::Lexical => best_lexical(current_tag, &eligible),
        SortRule::Date => best_by_date(current_tag, &eligible),
    }?;

    Some(Selection {
        tag: best.to_string(),
        source: EditSource::PolicyDerived,
    })
}

fn best_semver<'a>(current_tag: &str, eligible: &[&'a VersionCandidate]) -> Option<&'a str> {
    let (best_version, best_tag) = eligible
        .iter()
        .filter_map(|c| Some((TagVersion::parse(&c.tag)?, c.tag.as_str())))
        .max_by(|(va, ta), (vb, tb)| va.cmp_core(vb).then_with(|| ta.cmp(tb)))?;

    let newer = match TagVersion::parse(current_tag) {
        Some(current) => best_version.cmp_core(&current) == Ordering::Greater,
        None => best_tag != current_tag,
    };
    newer.then_some(best_tag)
}

fn best_lexical<'a>(current_tag: &str, eligible: &[&'a VersionCandidate]) -> Option<&'a str> {
    let best = eligible.iter().map(|c| c.tag.as_str()).max()?;
    (best > current_tag).then_some(best)
}

fn best_by_date<'a>(current_tag: &str, eligible: &[&'a VersionCandidate]) -> Option<&'a str> {
    let dated = || {
        eligible
            .iter()
            .filter_map(|c| Some((c.published_at?, c.tag.as_str())))
    };
    let best = dated().max()?;
    let newer = match dated().find(|(_, tag)| *tag == current_tag) {
        Some(current) => best > current,
        None => best.1 != current_tag,
    };
    newer.then_some(best.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candidates(tags: &[&str]) -> Vec<VersionCandidate> {
        tags.iter().map(|t| VersionCandidate::new("img", *t)).collect()
    }

    fn policy(pattern: &str, sort_rule: SortRule) -> UpdatePolicy {
        UpdatePolicy::new(pattern, sort_rule, BTreeMap::new()).unwrap()
    }

    fn target(current: &str, tags: &[&str], policy: &UpdatePolicy) -> Option<String> {
        select(current, &candidates(tags), policy).map(|s| s.tag)
    }

    #[test]
    fn picks_newest_slim_variant() {
        let p = policy(r"^\d+\.\d+-slim$", SortRule::Semver);
        let got = select(
            "3.9-slim",
            &candidates(&["3.9-slim", "3.10-slim", "3.11-slim", "3.12-alpine", "latest"]),
            &p,
        )
        .unwrap();
        assert_eq!(got.tag, "3.11-slim");
        assert_eq!(got.source, EditSource::PolicyDerived);
    }

    #[test]
    fn semver_orders_numerically_not_lexically() {
        let p = policy(r"^\d+\.\d+$", SortRule::Semver);
        assert_eq!(target("3.8", &["3.8", "3.9", "3.10"], &p).as_deref(), Some("3.10"));

        let lexical = policy(r"^\d+\.\d+$", SortRule::Lexical);
        assert_eq!(
            target("3.8", &["3.8", "3.9", "3.10"], &lexical).as_deref(),
            Some("3.9")
        );
    }

    #[test]
    fn no_update_when_already_newest() {
        let p = policy(r"^\d+\.\d+-slim$", SortRule::Semver);
        assert_eq!(target("3.11-slim", &["3.9-slim", "3.11-slim"], &p), None);
    }

    #[test]
    fn no_update_when_nothing_matches() {
        let p = policy(r"^\d+$", SortRule::Semver);
        assert_eq!(target("16", &["latest", "lts-alpine"], &p), None);
        assert_eq!(target("16", &[], &p), None);
    }

    #[test]
    fn never_downgrades() {
        let p = policy(r"^\d+$", SortRule::Semver);
        assert_eq!(target("20", &["16", "18"], &p), None);
    }

    #[test]
    fn unparseable_tags_are_excluded_under_semver() {
        let p = policy(r".*", SortRule::Semver);
        assert_eq!(
            target("1.0", &["1.0", "1.1", "nightly", "99rc"], &p).as_deref(),
            Some("1.1")
        );
    }

    #[test]
    fn equal_cores_break_ties_on_tag() {
        let p = policy(r".*", SortRule::Semver);
        assert_eq!(
            target("1.1", &["1.2-slim", "1.2-alpine"], &p).as_deref(),
            Some("1.2-slim")
        );
    }

    #[test]
    fn equal_core_spellings_are_not_upgrades() {
        let p = policy(r"^\d+(\.\d+)*$", SortRule::Semver);
        assert_eq!(target("18", &["18", "18.0", "18.0.0"], &p), None);
        assert_eq!(target("18.0.0", &["18", "18.0.0"], &p), None);
        assert_eq!(
            target("18", &["18", "18.0.0", "18.0.1"], &p).as_deref(),
            Some("18.0.1")
        );
    }

    #[test]
    fn explicit_mapping_short_circuits_sorting() {
        let mut mappings = BTreeMap::new();
        mappings.insert("16".to_string(), "18".to_string());
        let p = UpdatePolicy::new(r"^\d+$", SortRule::Semver, mappings).unwrap();
        let got = select("16", &candidates(&["16", "18", "20"]), &p).unwrap();
        assert_eq!(got.tag, "18");
        assert_eq!(got.source, EditSource::ExplicitMapping);
    }

    #[test]
    fn explicit_mapping_to_missing_tag_falls_through() {
        let mut mappings = BTreeMap::new();
        mappings.insert("16".to_string(), "19".to_string());
        let p = UpdatePolicy::new(r"^\d+$", SortRule::Semver, mappings).unwrap();
        let got = select("16", &candidates(&["16", "18", "20"]), &p).unwrap();
        assert_eq!(got.tag, "20");
        assert_eq!(got.source, EditSource::PolicyDerived);
    }

    #[test]
    fn explicit_mapping_must_match_pattern() {
        let mut mappings = BTreeMap::new();
        mappings.insert("16".to_string(), "18-alpine".to_string());
        let p = UpdatePolicy::new(r"^\d+$", SortRule::Semver, mappings).unwrap();
        assert_eq!(
            target("16", &["16", "18", "18-alpine"], &p).as_deref(),
            Some("18")
        );
    }

    #[test]
    fn date_rule_uses_publication_time() {
        let p = policy(r".*", SortRule::Date);
        let at = |day| Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        let tags = vec![
            VersionCandidate::new("img", "bookworm").published(at(3)),
            VersionCandidate::new("img", "bullseye").published(at(1)),
            VersionCandidate::new("img", "trixie"),
        ];
        let got = select("bullseye", &tags, &p).unwrap();
        assert_eq!(got.tag, "bookworm");
        assert_eq!(select("bookworm", &tags, &p), None);
    }

    #[test]
    fn duplicate_tags_are_collapsed() {
        let p = policy(r"^\d+$", SortRule::Semver);
        assert_eq!(target("1", &["2", "2", "1"], &p).as_deref(), Some("2"));
    }

    #[test]
    fn per_image_overrides_inherit_unset_fields() {
        let config = PolicyConfig {
            tag_pattern: r"^\d+\.\d+$".into(),
            images: vec![crate::config::ImagePolicyConfig {
                image: "node".into(),
                tag_pattern: Some(r"^\d+$".into()),
                ..Default::default()
            }],
            ..PolicyConfig::default()
        };
        let set = PolicySet::from_config(&config).unwrap();
        assert!(set.for_image("node").tag_pattern.is_match("18"));
        assert!(!set.for_image("python").tag_pattern.is_match("18"));
        assert_eq!(set.for_image("node").sort_rule, SortRule::Semver);
        assert!(set.skips_tag("latest"));
        assert!(!set.skips_tag("18"));
    }

    #[test]
    fn invalid_override_pattern_is_a_config_error() {
        let config = PolicyConfig {
            images: vec![crate::config::ImagePolicyConfig {
                image: "node".into(),
                tag_pattern: Some("([".into()),
                ..Default::default()
            }],
            ..PolicyConfig::default()
        };
        assert!(PolicySet::from_config(&config).is_err());
    }
}
