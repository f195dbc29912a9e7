//! Registry client: lists the published tags of an image.

pub mod budget;
pub mod client;
mod wire;

pub use budget::RequestBudget;
pub use client::{RegistryClient, split_registry_host};

use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// A published tag as reported by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCandidate {
    pub image_name: String,
    pub tag: String,
    /// Publication time, when the registry reports one.
    pub published_at: Option<DateTime<Utc>>,
    /// The registry's entry for this tag, kept verbatim.
    pub raw_registry_payload: Value,
}

impl VersionCandidate {
    pub fn new(image_name: impl Into<String>, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            image_name: image_name.into(),
            raw_registry_payload: Value::String(tag.clone()),
            tag,
            published_at: None,
        }
    }

    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}

/// Anything that can list tags for an image.
pub trait TagSource: Send + Sync {
    fn get_tags<'a>(
        &'a self,
        image_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<VersionCandidate>, RegistryError>> + Send + 'a>>;
}
