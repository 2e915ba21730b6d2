//! Snapshot channel: full-state fetches against the investigations HTTP API.

use async_trait::async_trait;
use dig_core::{InvestigationRecord, LogEntry};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT_SECS: u64 = 15;
const API_SEGMENTS: [&str; 2] = ["api", "investigations"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("cannot build request url from '{0}'")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            FetchError::Decode(_) | FetchError::InvalidUrl(_) => false,
        }
    }
}

/// Both halves of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PullSnapshot {
    pub record: InvestigationRecord,
    pub logs: Vec<LogEntry>,
}

#[async_trait]
pub trait PullSource: Send + Sync {
    async fn fetch_investigation(&self, id: &str) -> Result<InvestigationRecord, FetchError>;
    async fn fetch_logs(&self, id: &str) -> Result<Vec<LogEntry>, FetchError>;
}

pub async fn fetch_snapshot(source: &dyn PullSource, id: &str) -> Result<PullSnapshot, FetchError> {
    let (record, logs) = tokio::try_join!(source.fetch_investigation(id), source.fetch_logs(id))?;
    Ok(PullSnapshot { record, logs })
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base: Url, token: Option<String>) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(Self { http, base, token })
    }

    pub async fn create_investigation(
        &self,
        repo_url: &str,
    ) -> Result<InvestigationRecord, FetchError> {
        let url = self.endpoint(&[""])?;
        let request = self
            .http
            .post(url)
            .json(&serde_json::json!({ "repo_url": repo_url }));
        read_json(self.send(request).await?).await
    }

    pub async fn list_investigations(
        &self,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<InvestigationRecord>, FetchError> {
        let url = self.endpoint(&[""])?;
        let request = self
            .http
            .get(url)
            .query(&[("skip", skip), ("limit", limit)]);
        read_json(self.send(request).await?).await
    }

    pub async fn delete_investigation(&self, id: &str) -> Result<(), FetchError> {
        let url = self.endpoint(&[id])?;
        let response = self.send(self.http.delete(url)).await?;
        check_status(&response)?;
        Ok(())
    }

    fn endpoint(&self, tail: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(API_SEGMENTS)
            .extend(tail);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))
    }
}

#[async_trait]
impl PullSource for ApiClient {
    async fn fetch_investigation(&self, id: &str) -> Result<InvestigationRecord, FetchError> {
        let url = self.endpoint(&[id])?;
        read_json(self.send(self.http.get(url)).await?).await
    }

    async fn fetch_logs(&self, id: &str) -> Result<Vec<LogEntry>, FetchError> {
        let url = self.endpoint(&[id, "logs"])?;
        read_json(self.send(self.http.get(url)).await?).await
    }
}

fn check_status(response: &Response) -> Result<(), FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(FetchError::Status {
        status: status.as_u16(),
        url: response.url().to_string(),
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, FetchError> {
    check_status(&response)?;
    let body = response
        .bytes()
        .await
        .map_err(|err| FetchError::Transport(err.to_string()))?;
    serde_json::from_slice(&body).map_err(|err| FetchError::Decode(err.to_string()))
}
