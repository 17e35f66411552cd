//! Dialog pipeline
//!
//! One inbound utterance flows ASR → NLU → LLM → segmenter → TTS → egress.
//! The reply is synthesized sentence by sentence as the model streams, so the
//! device starts hearing audio before the full reply exists. Token usage is
//! consumed on a detached task so accounting can finish after the audio has
//! shipped.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::egress::EgressPublisher;
use crate::fragment::FragmentManager;
use crate::metering::Metering;
use crate::protocol::{self, frame::format, FrameHeader, FrameType};
use crate::providers::{intent, AsrClient, ChatClient, Intent, NluClient, TtsClient};
use crate::segmenter;
use crate::transport::middleware::MessageContext;
use crate::{Error, Result};

/// How long the detached accounting task waits for the usage packet
const USAGE_WAIT: std::time::Duration = std::time::Duration::from_secs(10);

/// The four-stage voice dialog pipeline
pub struct DialogPipeline {
    asr: AsrClient,
    nlu: NluClient,
    chat: ChatClient,
    tts: TtsClient,
    fragments: Arc<FragmentManager>,
    egress: Arc<EgressPublisher>,
    metering: Arc<Metering>,
    archive_dir: Option<PathBuf>,
}

impl DialogPipeline {
    /// Wire the pipeline stages
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        asr: AsrClient,
        nlu: NluClient,
        chat: ChatClient,
        tts: TtsClient,
        fragments: Arc<FragmentManager>,
        egress: Arc<EgressPublisher>,
        metering: Arc<Metering>,
        archive_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            asr,
            nlu,
            chat,
            tts,
            fragments,
            egress,
            metering,
            archive_dir,
        }
    }

    /// Handle one framed voice message.
    ///
    /// Full frames run the dialog immediately. Fragments accumulate in the
    /// fragment manager; the last frame moves the assembled utterance out and
    /// runs the dialog on it.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame is invalid or a pipeline stage fails;
    /// details are already logged with the message's trace id.
    pub async fn handle_frame(
        &self,
        cancel: CancellationToken,
        ctx: &MessageContext,
        payload: &[u8],
    ) -> Result<()> {
        let Some(device_sn) = ctx.device_sn.clone() else {
            return Err(Error::BadArgument("message has no device sn".to_string()));
        };
        let topic = ctx.topic.as_ref().map(ToString::to_string).unwrap_or_default();

        let (header, body) = match protocol::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    device_sn = %device_sn,
                    trace_id = %ctx.trace_id,
                    topic = %topic,
                    payload_len = payload.len(),
                    "dropping undecodable voice frame"
                );
                return Err(e.into());
            }
        };

        match FrameType::from_bits(header.frame_type) {
            Some(FrameType::Full) => {
                self.archive(&device_sn, &header, body).await;
                self.run_utterance(cancel, ctx, &device_sn, body.to_vec()).await
            }
            Some(FrameType::Fragment) => {
                let total = self.fragments.append(&device_sn, body);
                tracing::debug!(
                    device_sn = %device_sn,
                    trace_id = %ctx.trace_id,
                    seq = header.frame_seq,
                    accumulated = total,
                    "buffered fragment"
                );
                Ok(())
            }
            Some(FrameType::Last) => {
                self.fragments.append(&device_sn, body);
                let Some(utterance) = self.fragments.take(&device_sn) else {
                    return Ok(());
                };
                self.archive(&device_sn, &header, &utterance).await;
                self.run_utterance(cancel, ctx, &device_sn, utterance).await
            }
            None => Err(Error::BadArgument(format!(
                "unknown frame type {}",
                header.frame_type
            ))),
        }
    }

    /// Run the dialog for one assembled utterance
    async fn run_utterance(
        &self,
        cancel: CancellationToken,
        ctx: &MessageContext,
        device_sn: &str,
        utterance: Vec<u8>,
    ) -> Result<()> {
        let trace_id = ctx.trace_id.clone();
        let topic = ctx.topic.as_ref().map(ToString::to_string).unwrap_or_default();

        let transcript = match self.asr.transcribe(&utterance).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    device_sn = %device_sn,
                    trace_id = %trace_id,
                    topic = %topic,
                    payload_len = utterance.len(),
                    "asr stage failed"
                );
                return Err(e);
            }
        };

        let classified = match self.nlu.classify(&transcript).await {
            Ok(intent) => intent,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    device_sn = %device_sn,
                    trace_id = %trace_id,
                    topic = %topic,
                    transcript = %transcript,
                    "nlu stage failed"
                );
                return Err(e);
            }
        };

        if classified.intent != intent::CHIT_CHAT {
            return self.special_action(device_sn, &classified);
        }

        let (reply_rx, usage_rx) = match self
            .chat
            .chat(cancel.child_token(), device_sn, &transcript)
            .await
        {
            Ok(streams) => streams,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    device_sn = %device_sn,
                    trace_id = %trace_id,
                    topic = %topic,
                    "llm stage failed"
                );
                return Err(e);
            }
        };

        self.spawn_usage_recorder(device_sn.to_string(), trace_id.clone(), usage_rx);

        let mut sentences = segmenter::segment(reply_rx);
        while let Some(sentence) = sentences.recv().await {
            let audio = match self.tts.synthesize(&sentence).await {
                Ok(audio) => audio,
                Err(e) => {
                    // a lost sentence degrades the reply, it does not end it
                    tracing::error!(
                        error = %e,
                        device_sn = %device_sn,
                        trace_id = %trace_id,
                        sentence = %sentence,
                        "tts failed for sentence, skipping"
                    );
                    continue;
                }
            };

            if let Err(e) = self.egress.publish(&cancel, device_sn, &audio).await {
                tracing::error!(
                    error = %e,
                    device_sn = %device_sn,
                    trace_id = %trace_id,
                    topic = %topic,
                    payload_len = audio.len(),
                    "reply publish failed"
                );
                return Err(e);
            }
        }

        Ok(())
    }

    /// Record usage on a detached task correlated by trace id.
    ///
    /// Detached on purpose: the usage packet may arrive after the reply audio
    /// has already shipped and the caller has returned.
    fn spawn_usage_recorder(
        &self,
        device_sn: String,
        trace_id: String,
        mut usage_rx: tokio::sync::mpsc::Receiver<crate::providers::TokenUsage>,
    ) {
        let metering = Arc::clone(&self.metering);
        tokio::spawn(async move {
            match tokio::time::timeout(USAGE_WAIT, usage_rx.recv()).await {
                Ok(Some(usage)) => {
                    tracing::info!(
                        device_sn = %device_sn,
                        trace_id = %trace_id,
                        model = %usage.model,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        total_tokens = usage.total_tokens,
                        "llm usage received"
                    );
                    if let Err(e) = metering.record(&device_sn, &usage) {
                        tracing::error!(
                            error = %e,
                            device_sn = %device_sn,
                            trace_id = %trace_id,
                            "metering record failed"
                        );
                    }
                }
                Ok(None) => {
                    tracing::info!(
                        device_sn = %device_sn,
                        trace_id = %trace_id,
                        "usage stream closed without a report"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        device_sn = %device_sn,
                        trace_id = %trace_id,
                        "timeout waiting for llm usage data"
                    );
                }
            }
        });
    }

    /// Dispatch a non-chat intent
    fn special_action(&self, device_sn: &str, classified: &Intent) -> Result<()> {
        // TODO: publish the matching device command on the control topic
        // once the command channel is specified
        match classified.intent.as_str() {
            intent::DENY_ACTION
            | intent::PLAY_MUSIC
            | intent::SET_TEMPERATURE
            | intent::TURN_ON_LIGHT
            | intent::TURN_OFF_LIGHT => {
                tracing::info!(
                    device_sn = %device_sn,
                    intent = %classified.intent,
                    confidence = classified.confidence,
                    is_command = classified.is_command,
                    "dispatching special action"
                );
                Ok(())
            }
            other => {
                tracing::warn!(
                    device_sn = %device_sn,
                    intent = %other,
                    "unrecognized intent, ignoring"
                );
                Ok(())
            }
        }
    }

    /// Archive an utterance under the configured storage directory; failures
    /// are logged and swallowed
    async fn archive(&self, device_sn: &str, header: &FrameHeader, body: &[u8]) {
        let Some(dir) = &self.archive_dir else {
            return;
        };
        let ext = format::extension(header.audio_format);
        let path = dir
            .join(device_sn)
            .join(format!("{}_{}.{}", header.timestamp, header.frame_seq, ext));

        let result: std::io::Result<()> = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, body).await
        }
        .await;

        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "archived utterance"),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "utterance archive failed");
            }
        }
    }
}
