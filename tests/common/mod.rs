//! Shared test harness: an in-process mock of the four upstream model
//! services plus a capturing publisher, wired into a real pipeline.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use voxrelay::config::{QwenConfig, QwenParams, TtsConfig};
use voxrelay::egress::{EgressPublisher, FramePublisher, StaticResolver};
use voxrelay::metering::{CostCalculator, Metering, PricingRule, SqliteLedger};
use voxrelay::pipeline::DialogPipeline;
use voxrelay::protocol::AudioProfile;
use voxrelay::providers::{AsrClient, ChatClient, NluClient, QwenClient, TtsClient};
use voxrelay::FragmentManager;

/// Records every publish instead of talking to a broker
pub struct CapturePublisher {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl FramePublisher for CapturePublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _cancel: &CancellationToken,
    ) -> voxrelay::Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Behavior knobs and call records for the mock upstream
#[derive(Clone)]
pub struct UpstreamState {
    pub transcript: String,
    pub intent: String,
    pub sse: String,
    pub asr_calls: Arc<AtomicUsize>,
    pub asr_bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    pub tts_texts: Arc<Mutex<Vec<String>>>,
}

async fn asr(State(state): State<UpstreamState>, body: Bytes) -> impl IntoResponse {
    state.asr_calls.fetch_add(1, Ordering::SeqCst);
    state.asr_bodies.lock().unwrap().push(body.to_vec());
    Json(json!({ "text": state.transcript }))
}

async fn nlu(
    State(state): State<UpstreamState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    Json(json!({
        "text": body["text"],
        "intent": state.intent,
        "confidence": 0.97,
        "is_command": state.intent != "chit_chat",
    }))
}

async fn nlu_health() -> impl IntoResponse {
    "ok"
}

async fn chat(State(state): State<UpstreamState>) -> impl IntoResponse {
    state.sse.clone()
}

/// Sentences containing this marker make the mock TTS reply 500
pub const TTS_FAIL_MARKER: &str = "FAILME";

async fn tts(
    State(state): State<UpstreamState>,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    let text = body["text"].as_str().unwrap_or_default().to_string();
    let failing = text.contains(TTS_FAIL_MARKER);
    state.tts_texts.lock().unwrap().push(text);
    if failing {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "synthesis backend down",
        )
            .into_response();
    }
    Bytes::from_static(b"AUDIO").into_response()
}

/// One running mock upstream
pub struct Upstream {
    pub base_url: String,
    pub state: UpstreamState,
}

/// Start the mock upstream on an ephemeral port
pub async fn spawn_upstream(transcript: &str, intent: &str, sse: &str) -> Upstream {
    let state = UpstreamState {
        transcript: transcript.to_string(),
        intent: intent.to_string(),
        sse: sse.to_string(),
        asr_calls: Arc::new(AtomicUsize::new(0)),
        asr_bodies: Arc::new(Mutex::new(Vec::new())),
        tts_texts: Arc::new(Mutex::new(Vec::new())),
    };

    let router = Router::new()
        .route("/asr", post(asr))
        .route("/nlu", post(nlu))
        .route("/nlu/health", get(nlu_health))
        .route("/chat", post(chat))
        .route("/tts", post(tts))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Upstream {
        base_url: format!("http://{addr}"),
        state,
    }
}

/// A pipeline wired to the mock upstream and a capturing publisher
pub struct Harness {
    pub pipeline: DialogPipeline,
    pub fragments: Arc<FragmentManager>,
    pub publisher: Arc<CapturePublisher>,
    pub ledger: Arc<SqliteLedger>,
    pub upstream: Upstream,
}

/// Build a full pipeline against the mock upstream
pub async fn harness(transcript: &str, intent: &str, sse: &str) -> Harness {
    let upstream = spawn_upstream(transcript, intent, sse).await;
    let base = &upstream.base_url;

    let asr = AsrClient::new(format!("{base}/asr")).unwrap();
    let nlu = NluClient::new(format!("{base}/nlu")).unwrap();

    let chat = ChatClient::Qwen(
        QwenClient::new(&QwenConfig {
            endpoint: format!("{base}/chat"),
            api_key: "sk-test".to_string(),
            model: "qwen-flash".to_string(),
            system_desc: "You are a helpful voice assistant.".to_string(),
            params: QwenParams {
                role: "user".to_string(),
                stream: true,
            },
        })
        .unwrap(),
    );

    let tts = TtsClient::from_config(&TtsConfig {
        model: "edge".to_string(),
        edge: voxrelay::config::TtsEndpointConfig {
            endpoint: format!("{base}/tts"),
            params: voxrelay::config::TtsParams::default(),
        },
        chat: voxrelay::config::TtsEndpointConfig::default(),
    })
    .unwrap();

    let publisher = Arc::new(CapturePublisher {
        published: Mutex::new(Vec::new()),
    });
    let egress = Arc::new(EgressPublisher::new(
        publisher.clone(),
        Arc::new(StaticResolver::default()),
        AudioProfile::default(),
    ));

    let pool = voxrelay::db::init_memory().unwrap();
    let ledger = Arc::new(SqliteLedger::new(pool));

    let mut rules = std::collections::HashMap::new();
    rules.insert(
        "qwen-flash".to_string(),
        PricingRule {
            input_price: rust_decimal_macros::dec!(0.001),
            output_price: rust_decimal_macros::dec!(0.002),
            currency: "CNY".to_string(),
        },
    );
    let metering = Arc::new(Metering::new(CostCalculator::new(rules), ledger.clone()));

    let fragments = Arc::new(FragmentManager::new());
    let pipeline = DialogPipeline::new(
        asr,
        nlu,
        chat,
        tts,
        Arc::clone(&fragments),
        egress,
        metering,
        None,
    );

    Harness {
        pipeline,
        fragments,
        publisher,
        ledger,
        upstream,
    }
}

/// An SSE body streaming the given deltas, an optional usage packet, and the
/// terminator
pub fn sse_body(deltas: &[&str], usage: Option<(u32, u32)>) -> String {
    let mut body = String::new();
    for delta in deltas {
        body.push_str(&format!(
            "data: {}\n\n",
            json!({ "choices": [{ "delta": { "content": delta }, "finish_reason": null }] })
        ));
    }
    body.push_str(&format!(
        "data: {}\n\n",
        json!({ "choices": [{ "delta": {}, "finish_reason": "stop" }] })
    ));
    if let Some((prompt, completion)) = usage {
        body.push_str(&format!(
            "data: {}\n\n",
            json!({
                "choices": [],
                "usage": {
                    "prompt_tokens": prompt,
                    "completion_tokens": completion,
                    "total_tokens": prompt + completion,
                }
            })
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// A message context as the ingress chain would hand to the pipeline
pub fn device_context(device_sn: &str) -> voxrelay::transport::middleware::MessageContext {
    let mut ctx = voxrelay::transport::middleware::MessageContext::new();
    ctx.topic = Some(
        voxrelay::Topic::parse(&format!("test/T0001/{device_sn}/voice/server")).unwrap(),
    );
    ctx.device_sn = Some(device_sn.to_string());
    ctx
}
