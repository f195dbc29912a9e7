//! Tag-listing payloads from Docker Hub and Docker Registry v2 endpoints.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

/// Either listing shape: Hub's `{results: [{name, last_updated}], next}` or
/// the distribution API's `{name, tags: ["3.9", ...]}`.
#[derive(Debug, Deserialize)]
pub(crate) struct TagListing {
    #[serde(default)]
    pub results: Option<Vec<Value>>,
    #[serde(default)]
    pub tags: Option<Vec<Value>>,
    #[serde(default)]
    pub next: Option<String>,
}

/// One tag entry with whatever enrichment the registry provided.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TagEntry {
    pub name: String,
    pub published_at: Option<DateTime<Utc>>,
    pub raw: Value,
}

impl TagListing {
    pub fn into_entries(self) -> Vec<TagEntry> {
        self.results
            .into_iter()
            .flatten()
            .chain(self.tags.into_iter().flatten())
            .filter_map(entry_from_value)
            .collect()
    }
}

fn entry_from_value(raw: Value) -> Option<TagEntry> {
    let (name, published_at) = match &raw {
        Value::String(name) => (name.clone(), None),
        Value::Object(map) => {
            let name = map.get("name")?.as_str()?.to_string();
            let published_at = ["last_updated", "tag_last_pushed"]
                .iter()
                .filter_map(|key| map.get(*key)?.as_str())
                .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            (name, published_at)
        }
        _ => return None,
    };
    if name.is_empty() {
        return None;
    }
    Some(TagEntry {
        name,
        published_at,
        raw,
    })
}

/// Extract the `rel="next"` target from an RFC 8288 `Link` header,
/// resolved against the URL of the page that carried it.
pub(crate) fn next_from_link_header(header: &str, current: &Url) -> Option<Url> {
    header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        let is_next = parts.any(|param| {
            let param = param.trim();
            param
                .strip_prefix("rel=")
                .is_some_and(|rel| rel.trim_matches('"').split(' ').any(|r| r == "next"))
        });
        if is_next {
            current.join(target).ok()
        } else {
            None
        }
    })
}
