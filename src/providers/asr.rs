//! Speech recognition client

use std::time::Duration;

use crate::config::AsrConfig;
use crate::{Error, Result};

/// Request deadline for one transcription
const ASR_TIMEOUT: Duration = Duration::from_secs(5);

/// Response from the recognition service
#[derive(serde::Deserialize)]
struct AsrResponse {
    text: String,
}

/// Transcribes device audio to text
pub struct AsrClient {
    client: reqwest::Client,
    endpoint: String,
}

impl AsrClient {
    /// Build the client variant named in configuration
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown model name or a missing endpoint.
    pub fn from_config(config: &AsrConfig) -> Result<Self> {
        match config.model.as_str() {
            "local" => Self::new(config.endpoint.clone()),
            other => Err(Error::Config(format!("unknown ASR model: {other}"))),
        }
    }

    /// Create a client for the given endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is empty.
    pub fn new(endpoint: String) -> Result<Self> {
        if endpoint.is_empty() {
            return Err(Error::Config("ASR endpoint required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(ASR_TIMEOUT)
                .build()
                .map_err(|e| Error::Asr(e.to_string()))?,
            endpoint,
        })
    }

    /// Transcribe one utterance
    ///
    /// # Errors
    ///
    /// Returns an error when the service is unreachable, times out, or
    /// replies non-200.
    pub async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/octet-stream")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "ASR request failed");
                Error::Asr(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "ASR service error");
            return Err(Error::Asr(format!("ASR service returned {status}: {body}")));
        }

        let result: AsrResponse = response
            .json()
            .await
            .map_err(|e| Error::Asr(format!("decode ASR response: {e}")))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}
