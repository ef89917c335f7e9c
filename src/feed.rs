use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("http error: {0}")]
    Http(String),
    #[error("feed request timed out after {0:?}")]
    Timeout(Duration),
    #[error("feed returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed feed payload: {0}")]
    Parse(String),
}

/// Upstream source of raw event records.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Stable key the cache envelope is stored under.
    fn identity(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<Value>, UpstreamError>;
}

pub struct BroadcastFeed {
    url: String,
    timeout: Duration,
    client: Client,
}

impl BroadcastFeed {
    pub fn from_config(config: &AppConfig) -> Result<Self, UpstreamError> {
        let timeout = Duration::from_secs(config.feed_timeout_secs.max(1));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.feed_connect_timeout_secs.max(1)))
            .timeout(timeout)
            .user_agent(config.feed_user_agent.clone())
            .build()
            .map_err(|err| UpstreamError::Http(err.to_string()))?;
        Ok(Self {
            url: config.feed_url.clone(),
            timeout,
            client,
        })
    }
}

#[async_trait]
impl FeedSource for BroadcastFeed {
    fn identity(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<Value>, UpstreamError> {
        let response = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;

        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        parse_payload(&body)
    }
}

impl BroadcastFeed {
    fn transport_error(&self, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Http(err.to_string())
        }
    }
}

/// The feed answers with a bare JSON array of event objects.
pub fn parse_payload(body: &str) -> Result<Vec<Value>, UpstreamError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| UpstreamError::Parse(err.to_string()))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(UpstreamError::Parse(format!(
            "expected an array of events, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
