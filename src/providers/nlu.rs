//! Intent classification client

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::NluConfig;
use crate::{Error, Result};

/// Request deadline for one classification
const NLU_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the startup health probe
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Intent labels the classifier emits
pub mod intent {
    pub const CHIT_CHAT: &str = "chit_chat";
    pub const PLAY_MUSIC: &str = "play_music";
    pub const SET_TEMPERATURE: &str = "set_temperature";
    pub const TURN_ON_LIGHT: &str = "turn_on_light";
    pub const TURN_OFF_LIGHT: &str = "turn_off_light";
    pub const DENY_ACTION: &str = "deny_action";
}

#[derive(Serialize)]
struct NluRequest<'a> {
    text: &'a str,
}

/// Classification result for one transcript
#[derive(Debug, Clone, Deserialize)]
pub struct Intent {
    /// The classified text
    pub text: String,
    /// Intent label (see [`intent`])
    pub intent: String,
    /// Classifier confidence in `[0, 1]`
    pub confidence: f32,
    /// Whether the intent is an actionable device command
    pub is_command: bool,
}

/// Classifies transcripts into intents
pub struct NluClient {
    client: reqwest::Client,
    endpoint: String,
}

impl NluClient {
    /// Build the client variant named in configuration
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown model name or a missing endpoint.
    pub fn from_config(config: &NluConfig) -> Result<Self> {
        match config.model.as_str() {
            "local" => Self::new(config.endpoint.clone()),
            other => Err(Error::Config(format!("unknown NLU model: {other}"))),
        }
    }

    /// Create a client for the given endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is empty.
    pub fn new(endpoint: String) -> Result<Self> {
        if endpoint.is_empty() {
            return Err(Error::Config("NLU endpoint required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(NLU_TIMEOUT)
                .build()
                .map_err(|e| Error::Nlu(e.to_string()))?,
            endpoint,
        })
    }

    /// Probe the service health endpoint; used once at startup
    ///
    /// # Errors
    ///
    /// Returns an error when the service is unreachable or replies non-200.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Nlu(format!("health probe failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Nlu(format!(
                "health probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Classify one transcript
    ///
    /// # Errors
    ///
    /// Returns an error when the service is unreachable, times out, or
    /// replies non-200.
    pub async fn classify(&self, text: &str) -> Result<Intent> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&NluRequest { text })
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "NLU request failed");
                Error::Nlu(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "NLU service error");
            return Err(Error::Nlu(format!("NLU service returned {status}: {body}")));
        }

        let result: Intent = response
            .json()
            .await
            .map_err(|e| Error::Nlu(format!("decode NLU response: {e}")))?;

        tracing::debug!(
            intent = %result.intent,
            confidence = result.confidence,
            is_command = result.is_command,
            "classification complete"
        );
        Ok(result)
    }
}
