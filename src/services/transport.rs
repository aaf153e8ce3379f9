use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;

use crate::config::TransportConfig;
use crate::services::content::Content;

/// Everything a transport needs to put one prompt in front of a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEncounter {
    pub user_id: String,
    pub content: Content,
    pub sent_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport request timed out")]
    Timeout,
    #[error("transport network error: {0}")]
    Network(String),
    #[error("transport rejected delivery: status={status}, message={message}")]
    Rejected { status: u16, message: String },
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn deliver<'a>(
        &'a self,
        encounter: &'a OutboundEncounter,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Writes the delivery to the log and always succeeds.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

impl Transport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver<'a>(
        &'a self,
        encounter: &'a OutboundEncounter,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            tracing::info!(
                user_id = %encounter.user_id,
                theme = %encounter.content.theme,
                difficulty = %encounter.content.difficulty,
                deadline = %encounter.deadline,
                "Encounter delivered"
            );
            Ok(())
        })
    }
}

/// POSTs the encounter as JSON to a chat bridge.
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.to_string(),
            token,
            client,
        }
    }
}

impl Transport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn deliver<'a>(
        &'a self,
        encounter: &'a OutboundEncounter,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut request = self.client.post(&self.url).json(encounter);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let message = response.text().await.unwrap_or_default();
            Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            })
        })
    }
}

/// Webhook when a URL is configured, log-only otherwise.
pub fn from_config(config: &TransportConfig) -> Box<dyn Transport> {
    match &config.webhook_url {
        Some(url) => Box::new(WebhookTransport::new(
            url,
            config.webhook_token.clone(),
            Duration::from_secs(config.timeout_secs),
        )),
        None => Box::new(LogTransport),
    }
}
