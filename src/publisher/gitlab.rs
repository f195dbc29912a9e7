use super::{MergeRequestHost, NewMergeRequest, RemoteMergeRequest};
use crate::config::{HostAuthStyle, HostConfig};
use crate::error::{ConfigError, PublishError};
use reqwest::{Client, RequestBuilder, Response};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// GitLab REST v4 merge request API.
pub struct GitLabHost {
    /// `<api_url>/projects/<url-encoded id>`
    project_url: String,
    token: Option<String>,
    auth_style: HostAuthStyle,
    client: Client,
}

impl GitLabHost {
    pub fn new(config: &HostConfig) -> Result<Self, ConfigError> {
        if config.project_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "host.project_id is required to publish merge requests (or set CI_PROJECT_ID)"
                    .into(),
            ));
        }
        let project: String = url::form_urlencoded::byte_serialize(config.project_id.as_bytes())
            .collect();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("evergreen/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            project_url: format!(
                "{}/projects/{project}",
                config.api_url.trim_end_matches('/')
            ),
            token: config.token.clone(),
            auth_style: config.auth_style,
            client,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.token, self.auth_style) {
            (Some(token), HostAuthStyle::Bearer) => request.bearer_auth(token),
            (Some(token), HostAuthStyle::PrivateToken) => request.header("PRIVATE-TOKEN", token),
            (None, _) => request,
        }
    }

    async fn list(&self, branch: &str) -> Result<Vec<RemoteMergeRequest>, PublishError> {
        let request = self
            .client
            .get(format!("{}/merge_requests", self.project_url))
            .query(&[("source_branch", branch), ("state", "all")]);
        let response = self.send(request).await?;
        decode(response).await
    }

    async fn open(&self, payload: &NewMergeRequest) -> Result<RemoteMergeRequest, PublishError> {
        let request = self
            .client
            .post(format!("{}/merge_requests", self.project_url))
            .json(payload);
        let response = self.send(request).await?;
        decode(response).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, PublishError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| PublishError::Request {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PublishError::Auth {
                status: status.as_u16(),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Status {
            status: status.as_u16(),
            body: truncate(&body, 500),
        })
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, PublishError> {
    let body = response.text().await.map_err(|e| PublishError::Request {
        message: e.to_string(),
    })?;
    serde_json::from_str(&body).map_err(|e| PublishError::Request {
        message: format!("unexpected response body: {e}"),
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

impl MergeRequestHost for GitLabHost {
    fn name(&self) -> &str {
        "gitlab"
    }

    fn find_by_source_branch<'a>(
        &'a self,
        branch: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RemoteMergeRequest>, PublishError>> + Send + 'a>>
    {
        Box::pin(self.list(branch))
    }

    fn create<'a>(
        &'a self,
        request: &'a NewMergeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RemoteMergeRequest, PublishError>> + Send + 'a>> {
        Box::pin(self.open(request))
    }
}
