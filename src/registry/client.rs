use super::budget::RequestBudget;
use super::wire::{TagListing, next_from_link_header};
use super::{TagSource, VersionCandidate};
use crate::config::{RegistryConfig, RegistryFlavor};
use crate::error::{ConfigError, RegistryError};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DOCKER_HUB_HOSTS: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

pub fn build_registry_client(timeout_secs: u64) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(concat!("evergreen/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}

/// Outcome of a single HTTP attempt.
enum Attempt {
    /// Network failure or 5xx; worth another try.
    Retry(String),
    Fatal(RegistryError),
}

struct TagPage {
    candidates: Vec<VersionCandidate>,
    next: Option<Url>,
}

/// Docker-Registry-compatible tag lister with bounded retries and pagination.
pub struct RegistryClient {
    base_url: Url,
    flavor: RegistryFlavor,
    /// Pre-computed `Authorization` value (avoids `format!` per request).
    cached_auth: Option<String>,
    page_size: u32,
    max_pages: u32,
    max_attempts: u32,
    backoff_base: Duration,
    budget: Arc<RequestBudget>,
    client: Client,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig, budget: Arc<RequestBudget>) -> Result<Self, ConfigError> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            ConfigError::Validation(format!("registry.base_url {:?}: {e}", config.base_url))
        })?;

        Ok(Self {
            base_url,
            flavor: config.flavor,
            cached_auth: config.token.as_ref().map(|t| format!("Bearer {t}")),
            page_size: config.page_size.max(1),
            max_pages: config.max_pages.max(1),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            budget,
            client: build_registry_client(config.request_timeout_secs)?,
        })
    }

    /// URL of the first listing page for `image`.
    pub fn first_page_url(&self, image: &str) -> Result<Url, RegistryError> {
        let (host, path) = split_registry_host(image);
        let base = self.base_url.as_str().trim_end_matches('/');

        let raw = match self.flavor {
            RegistryFlavor::Hub => {
                if let Some(host) = host
                    && !DOCKER_HUB_HOSTS.contains(&host)
                {
                    return Err(RegistryError::UnsupportedRegistry {
                        image: image.to_string(),
                        host: host.to_string(),
                    });
                }
                let repo = if path.contains('/') {
                    path.to_string()
                } else {
                    format!("library/{path}")
                };
                format!(
                    "{base}/v2/repositories/{repo}/tags?page_size={}",
                    self.page_size
                )
            }
            RegistryFlavor::Distribution => {
                if let Some(host) = host
                    && Some(host) != self.base_authority().as_deref()
                {
                    return Err(RegistryError::UnsupportedRegistry {
                        image: image.to_string(),
                        host: host.to_string(),
                    });
                }
                format!("{base}/v2/{path}/tags/list?n={}", self.page_size)
            }
        };

        Url::parse(&raw).map_err(|e| RegistryError::Decode {
            image: image.to_string(),
            message: format!("invalid listing url {raw}: {e}"),
        })
    }

    fn base_authority(&self) -> Option<String> {
        let host = self.base_url.host_str()?;
        Some(match self.base_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    async fn list_tags(&self, image: &str) -> Result<Vec<VersionCandidate>, RegistryError> {
        let mut next = Some(self.first_page_url(image)?);
        let mut pages = 0;
        let mut candidates = Vec::new();

        while let Some(url) = next.take() {
            if pages == self.max_pages {
                tracing::warn!(
                    image,
                    max_pages = self.max_pages,
                    "Tag listing truncated at page cap"
                );
                break;
            }
            let page = self.fetch_page(image, &url).await?;
            pages += 1;
            candidates.extend(page.candidates);
            next = page.next;
        }

        tracing::debug!(image, pages, tags = candidates.len(), "Fetched registry tags");
        Ok(candidates)
    }

    async fn fetch_page(&self, image: &str, url: &Url) -> Result<TagPage, RegistryError> {
        let mut backoff = self.backoff_base;
        let mut last_failure = String::new();

        for attempt in 1..=self.max_attempts {
            self.budget.acquire().await;
            match self.request_page(image, url).await {
                Ok(page) => {
                    if attempt > 1 {
                        tracing::info!(image, attempt, "Registry recovered after retries");
                    }
                    return Ok(page);
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(message)) => {
                    last_failure = message;
                    if attempt < self.max_attempts {
                        tracing::warn!(
                            image,
                            attempt,
                            max_attempts = self.max_attempts,
                            "Registry request failed, retrying: {last_failure}"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        Err(RegistryError::Unavailable {
            image: image.to_string(),
            attempts: self.max_attempts,
            message: last_failure,
        })
    }

    async fn request_page(&self, image: &str, url: &Url) -> Result<TagPage, Attempt> {
        let mut request = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(auth) = &self.cached_auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Attempt::Retry(format!("request error: {e}")))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Attempt::Fatal(RegistryError::Auth {
                image: image.to_string(),
                status: status.as_u16(),
            }));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Attempt::Fatal(RegistryError::ImageNotFound {
                image: image.to_string(),
            }));
        }
        if status.is_server_error() {
            return Err(Attempt::Retry(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(RegistryError::Rejected {
                image: image.to_string(),
                status: status.as_u16(),
            }));
        }

        let link_next = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| next_from_link_header(v, url));

        let body = response
            .text()
            .await
            .map_err(|e| Attempt::Retry(format!("body read error: {e}")))?;
        let listing: TagListing = serde_json::from_str(&body).map_err(|e| {
            Attempt::Fatal(RegistryError::Decode {
                image: image.to_string(),
                message: e.to_string(),
            })
        })?;

        let body_next = listing
            .next
            .as_deref()
            .filter(|n| !n.is_empty())
            .and_then(|n| url.join(n).ok());
        let candidates = listing
            .into_entries()
            .into_iter()
            .map(|entry| VersionCandidate {
                image_name: image.to_string(),
                tag: entry.name,
                published_at: entry.published_at,
                raw_registry_payload: entry.raw,
            })
            .collect();

        Ok(TagPage {
            candidates,
            next: body_next.or(link_next),
        })
    }
}

impl TagSource for RegistryClient {
    fn get_tags<'a>(
        &'a self,
        image_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<VersionCandidate>, RegistryError>> + Send + 'a>>
    {
        Box::pin(self.list_tags(image_name))
    }
}

/// Split a leading registry host off an image name. A first path component is
/// a host when it contains `.` or `:` or is `localhost`.
pub fn split_registry_host(image: &str) -> (Option<&str>, &str) {
    match image.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first), rest)
        }
        _ => (None, image),
    }
}
