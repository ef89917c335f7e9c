use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;

use crate::config::AppConfig;

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid address regex")
});

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid recipient address: {0:?}")]
    InvalidAddress(String),
    #[error("mailer not configured: {0}")]
    NotConfigured(&'static str),
    #[error("http error: {0}")]
    Http(String),
    #[error("provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl DeliveryError {
    /// Transport failures, throttling and provider-side errors may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Http(_) => true,
            DeliveryError::Rejected { status, .. } => *status == 429 || *status >= 500,
            DeliveryError::InvalidAddress(_) | DeliveryError::NotConfigured(_) => false,
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns the provider's status code on acceptance.
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<u16, DeliveryError>;

    fn is_configured(&self) -> bool {
        true
    }
}

pub fn validate_address(address: &str) -> Result<(), DeliveryError> {
    if ADDRESS_RE.is_match(address.trim()) {
        Ok(())
    } else {
        Err(DeliveryError::InvalidAddress(address.to_string()))
    }
}

pub struct SendGridMailer {
    api_key: Option<String>,
    from_email: Option<String>,
    client: Client,
}

impl SendGridMailer {
    pub fn from_config(config: &AppConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| DeliveryError::Http(err.to_string()))?;
        Ok(Self {
            api_key: config.sendgrid_api_key.clone(),
            from_email: config.from_email.clone(),
            client,
        })
    }
}

#[async_trait]
impl Mailer for SendGridMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<u16, DeliveryError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("SENDGRID_API_KEY"))?;
        let from = self
            .from_email
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("FROM_EMAIL"))?;
        validate_address(to)?;

        let payload = json!({
            "personalizations": [{ "to": [{ "email": to.trim() }] }],
            "from": { "email": from },
            "subject": subject,
            "content": [{ "type": "text/html", "value": html }],
        });

        let response = self
            .client
            .post(SENDGRID_ENDPOINT)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| DeliveryError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|err| DeliveryError::Http(err.to_string()))?;
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(status.as_u16())
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.from_email.is_some()
    }
}
