//! Streaming chat model client
//!
//! One chat call produces two lazy streams: the reply text, a few tokens per
//! chunk, and a usage stream that yields at most one token-accounting record.
//! Both come out of a single background worker reading the upstream SSE body;
//! the worker owns both senders and drops them on every exit path — normal
//! end, upstream error, or cancellation — so neither stream can dangle.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, QwenConfig};
use crate::{Error, Result};

/// Reply channel depth
const REPLY_DEPTH: usize = 10;

/// Token accounting for one chat call
#[derive(Debug, Clone)]
pub struct TokenUsage {
    /// Model identifier the usage belongs to
    pub model: String,
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the completion
    pub completion_tokens: u32,
    /// Total billed tokens
    pub total_tokens: u32,
    /// When the chat call started
    pub started_at: DateTime<Utc>,
    /// When the usage packet arrived
    pub finished_at: DateTime<Utc>,
}

impl TokenUsage {
    /// Wall-clock duration of the chat call in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// The chat model selected by configuration
pub enum ChatClient {
    /// Qwen-compatible chat completions service
    Qwen(QwenClient),
}

impl ChatClient {
    /// Build the chat strategy named in configuration
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown strategy name or an incomplete
    /// profile.
    pub fn from_config(agent: &AgentConfig, qwen: &QwenConfig) -> Result<Self> {
        match agent.model.as_str() {
            "qwen" => Ok(Self::Qwen(QwenClient::new(qwen)?)),
            other => Err(Error::Config(format!("unknown chat model: {other}"))),
        }
    }

    /// Start one chat call; see [`QwenClient::chat`]
    ///
    /// # Errors
    ///
    /// Returns an error when the upstream request cannot be started.
    pub async fn chat(
        &self,
        cancel: CancellationToken,
        device_sn: &str,
        prompt: &str,
    ) -> Result<(mpsc::Receiver<String>, mpsc::Receiver<TokenUsage>)> {
        match self {
            Self::Qwen(client) => client.chat(cancel, device_sn, prompt).await,
        }
    }
}

/// Client for a Qwen-compatible chat completions endpoint
pub struct QwenClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    system_prompt: String,
    role: String,
    stream: bool,
}

// -- wire types ---------------------------------------------------------------

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct SingleResponse {
    #[serde(default)]
    choices: Vec<SingleChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct SingleChoice {
    message: SingleMessage,
}

#[derive(Deserialize)]
struct SingleMessage {
    content: String,
}

impl QwenClient {
    /// Create a client from the Qwen profile
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is missing.
    pub fn new(config: &QwenConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(Error::Config("qwen endpoint required".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.system_desc.clone(),
            role: config.params.role.clone(),
            stream: config.params.stream,
        })
    }

    /// Start one chat call.
    ///
    /// Returns the reply stream and the usage stream. The reply stream is a
    /// finite, non-restartable sequence of text chunks; its closure signals
    /// end of reply. The usage stream yields at most one record.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be built or the upstream
    /// answers non-200. Errors after the streams are handed out are logged
    /// and end the reply with whatever was emitted so far.
    pub async fn chat(
        &self,
        cancel: CancellationToken,
        device_sn: &str,
        prompt: &str,
    ) -> Result<(mpsc::Receiver<String>, mpsc::Receiver<TokenUsage>)> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": self.role, "content": prompt },
            ],
            "stream": self.stream,
        });
        if self.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }

        let started = Utc::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, device_sn = %device_sn, "chat request failed");
                Error::Llm(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat service error");
            return Err(Error::Llm(format!(
                "chat service returned {status}: {body}"
            )));
        }

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_DEPTH);
        let (usage_tx, usage_rx) = mpsc::channel(1);
        let model = self.model.clone();
        let streaming = self.stream;
        let device_sn = device_sn.to_string();

        tokio::spawn(async move {
            let outcome = if streaming {
                consume_stream(response, &cancel, reply_tx, &usage_tx, &model, started).await
            } else {
                consume_single(response, reply_tx, &usage_tx, &model, started).await
            };
            if let Err(e) = outcome {
                tracing::error!(
                    error = %e,
                    device_sn = %device_sn,
                    model = %model,
                    "chat stream ended early"
                );
            }
            // senders drop here: both streams close on every exit path
        });

        Ok((reply_rx, usage_rx))
    }
}

/// Read the SSE body, forwarding content deltas and the usage packet.
///
/// The reply sender is closed when a `finish_reason: stop` arrives; reading
/// continues afterwards so the trailing usage packet is not lost.
async fn consume_stream(
    response: reqwest::Response,
    cancel: &CancellationToken,
    reply_tx: mpsc::Sender<String>,
    usage_tx: &mpsc::Sender<TokenUsage>,
    model: &str,
    started: DateTime<Utc>,
) -> Result<()> {
    let mut reply = Some(reply_tx);
    let mut body = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();

    'read: loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break; // EOF without [DONE]; treat as end of stream
        };
        let chunk = chunk.map_err(|e| Error::Llm(e.to_string()))?;
        pending.extend_from_slice(&chunk);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            if line.is_empty() || line == ": ping" {
                continue;
            }
            if line == "data: [DONE]" {
                break 'read;
            }
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };

            let parsed: StreamChunk = serde_json::from_str(payload)
                .map_err(|e| Error::Llm(format!("malformed stream payload: {e}")))?;

            if let Some(usage) = parsed.usage {
                let _ = usage_tx.try_send(TokenUsage {
                    model: model.to_string(),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    started_at: started,
                    finished_at: Utc::now(),
                });
            }

            let Some(choice) = parsed.choices.into_iter().next() else {
                continue;
            };

            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    if let Some(tx) = reply.clone() {
                        tokio::select! {
                            () = cancel.cancelled() => return Err(Error::Cancelled),
                            sent = tx.send(content) => {
                                if sent.is_err() {
                                    // consumer gone; keep draining for usage
                                    reply = None;
                                }
                            }
                        }
                    }
                }
            }

            if choice.finish_reason.as_deref() == Some("stop") {
                // end of reply; the usage packet may still follow
                reply = None;
            }
        }
    }

    Ok(())
}

/// Read a non-streaming response body as a single reply chunk
async fn consume_single(
    response: reqwest::Response,
    reply_tx: mpsc::Sender<String>,
    usage_tx: &mpsc::Sender<TokenUsage>,
    model: &str,
    started: DateTime<Utc>,
) -> Result<()> {
    let body: SingleResponse = response
        .json()
        .await
        .map_err(|e| Error::Llm(format!("decode chat response: {e}")))?;

    if let Some(usage) = body.usage {
        let _ = usage_tx.try_send(TokenUsage {
            model: model.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            started_at: started,
            finished_at: Utc::now(),
        });
    }

    let Some(choice) = body.choices.into_iter().next() else {
        return Err(Error::Llm("empty choices".to_string()));
    };
    let _ = reply_tx.send(choice.message.content).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let chunk: StreamChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"你"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("你"));
        assert!(chunk.choices[0].finish_reason.is_none());
        assert!(chunk.usage.is_none());
    }

    #[test]
    fn parses_stop_chunk() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parses_trailing_usage_chunk() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7,"total_tokens":19}}"#,
        )
        .unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.total_tokens, 19);
    }

    #[test]
    fn usage_duration_is_wall_clock() {
        let started = Utc::now();
        let usage = TokenUsage {
            model: "qwen-flash".to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            started_at: started,
            finished_at: started + chrono::Duration::milliseconds(250),
        };
        assert_eq!(usage.duration_ms(), 250);
    }
}
