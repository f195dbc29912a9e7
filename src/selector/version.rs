use std::cmp::Ordering;

/// Numeric version core of a tag: `v?MAJOR[.MINOR[.PATCH]]` plus an optional
/// `-variant` suffix (`3.11-slim`, `18-alpine`).
///
/// The variant is validated but not ranked: which variants are comparable is
/// decided by the policy's tag pattern, never guessed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagVersion {
    core: [u64; 3],
}

impl TagVersion {
    pub fn parse(tag: &str) -> Option<Self> {
        let body = tag.strip_prefix('v').unwrap_or(tag);
        let (numeric, variant) = match body.split_once('-') {
            Some((numeric, variant)) => (numeric, Some(variant)),
            None => (body, None),
        };

        if let Some(v) = variant
            && (v.is_empty()
                || !v
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return None;
        }

        let mut core = [0u64; 3];
        let mut precision = 0;
        for part in numeric.split('.') {
            if precision == core.len()
                || part.is_empty()
                || !part.chars().all(|c| c.is_ascii_digit())
            {
                return None;
            }
            core[precision] = part.parse().ok()?;
            precision += 1;
        }

        Some(Self { core })
    }

    /// Compare numeric cores; missing components count as zero.
    pub fn cmp_core(&self, other: &Self) -> Ordering {
        self.core.cmp(&other.core)
    }
}
