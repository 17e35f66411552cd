//! Speech synthesis client

use serde::Serialize;

use crate::config::{TtsConfig, TtsEndpointConfig};
use crate::{Error, Result};

/// TTS service variant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TtsProvider {
    Edge,
    Chat,
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice: &'a str,
    rate: &'a str,
    pitch: &'a str,
    volume: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    temperature: &'a str,
}

/// Synthesizes sentence audio from text
pub struct TtsClient {
    client: reqwest::Client,
    provider: TtsProvider,
    endpoint: String,
    voice: String,
    rate: String,
    pitch: String,
    volume: String,
    temperature: String,
}

impl TtsClient {
    /// Build the variant named in configuration (`edge` or `chat`)
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown model name or a missing endpoint.
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        match config.model.as_str() {
            "edge" => Self::new(TtsProvider::Edge, &config.edge),
            "chat" => Self::new(TtsProvider::Chat, &config.chat),
            other => Err(Error::Config(format!("unsupported TTS model: {other}"))),
        }
    }

    fn new(provider: TtsProvider, profile: &TtsEndpointConfig) -> Result<Self> {
        if profile.endpoint.is_empty() {
            return Err(Error::Config("TTS endpoint required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            provider,
            endpoint: profile.endpoint.clone(),
            voice: profile.params.voice.clone(),
            rate: profile.params.rate.clone(),
            pitch: profile.params.pitch.clone(),
            volume: profile.params.volume.clone(),
            temperature: profile.params.temperature.clone(),
        })
    }

    /// Synthesize one sentence
    ///
    /// # Errors
    ///
    /// Rejects empty text; returns an error when the service is unreachable
    /// or replies non-200.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if text.is_empty() {
            return Err(Error::BadArgument("text is empty".to_string()));
        }

        let request = TtsRequest {
            text,
            voice: &self.voice,
            rate: &self.rate,
            pitch: &self.pitch,
            volume: &self.volume,
            temperature: if self.provider == TtsProvider::Chat {
                &self.temperature
            } else {
                ""
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "TTS request failed");
                Error::Tts(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "TTS service error");
            return Err(Error::Tts(format!("TTS service returned {status}: {body}")));
        }

        let audio = response.bytes().await.map_err(|e| Error::Tts(e.to_string()))?;
        tracing::debug!(audio_bytes = audio.len(), "synthesis complete");
        Ok(audio.to_vec())
    }
}
