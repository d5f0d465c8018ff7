//! External policy scorer over HTTP
//!
//! POSTs the assembled [`ScoringInput`] as JSON and expects a bare
//! [`ScoreResponse`] object back. Anything else is a hard failure.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::domain::services::{PolicyError, PolicyScorer, ScoreResponse, ScoringInput};
use crate::infrastructure::config::PolicyConfig;

pub struct HttpPolicyScorer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPolicyScorer {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// None when no scorer endpoint is configured
    pub fn from_config(config: &PolicyConfig) -> anyhow::Result<Option<Self>> {
        config
            .scorer_url
            .as_ref()
            .map(|url| {
                Self::new(
                    url.clone(),
                    config.scorer_api_key.clone(),
                    Duration::from_secs(config.scorer_timeout_secs),
                )
            })
            .transpose()
    }
}

#[async_trait]
impl PolicyScorer for HttpPolicyScorer {
    async fn score(&self, input: &ScoringInput) -> Result<ScoreResponse, PolicyError> {
        let mut request = self.client.post(&self.endpoint).json(input);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(PolicyError::Transport(format!(
                "scorer responded with HTTP {}",
                status.as_u16()
            )));
        }

        debug!("Scorer response for {}: {}", input.url, body);
        ScoreResponse::parse(&body)
    }
}
