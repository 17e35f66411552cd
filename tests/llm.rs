//! Streaming chat client behavior against a mock SSE upstream

mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{sse_body, spawn_upstream};
use voxrelay::config::{QwenConfig, QwenParams};
use voxrelay::providers::QwenClient;

fn client(base: &str, stream: bool) -> QwenClient {
    QwenClient::new(&QwenConfig {
        endpoint: format!("{base}/chat"),
        api_key: "sk-test".to_string(),
        model: "qwen-flash".to_string(),
        system_desc: "assistant".to_string(),
        params: QwenParams {
            role: "user".to_string(),
            stream,
        },
    })
    .unwrap()
}

#[tokio::test]
async fn deltas_arrive_in_order_and_usage_follows() {
    let sse = sse_body(&["你", "好", "。"], Some((12, 7)));
    let upstream = spawn_upstream("", "chit_chat", &sse).await;

    let (mut reply, mut usage) = client(&upstream.base_url, true)
        .chat(CancellationToken::new(), "A0001", "hello")
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = reply.recv().await {
        chunks.push(chunk);
    }
    assert_eq!(chunks, vec!["你", "好", "。"]);

    let report = tokio::time::timeout(Duration::from_secs(2), usage.recv())
        .await
        .expect("usage within deadline")
        .expect("usage present");
    assert_eq!(report.prompt_tokens, 12);
    assert_eq!(report.completion_tokens, 7);
    assert_eq!(report.total_tokens, 19);
    assert_eq!(report.model, "qwen-flash");
    assert!(report.duration_ms() >= 0);
}

#[tokio::test]
async fn done_without_usage_closes_both_streams() {
    let sse = sse_body(&["ok"], None);
    let upstream = spawn_upstream("", "chit_chat", &sse).await;

    let (mut reply, mut usage) = client(&upstream.base_url, true)
        .chat(CancellationToken::new(), "A0001", "hello")
        .await
        .unwrap();

    assert_eq!(reply.recv().await.as_deref(), Some("ok"));
    assert!(reply.recv().await.is_none());

    // no usage packet: the stream closes empty rather than hanging
    let closed = tokio::time::timeout(Duration::from_secs(2), usage.recv())
        .await
        .expect("usage stream settled");
    assert!(closed.is_none());
}

#[tokio::test]
async fn cancellation_closes_both_streams() {
    use axum::body::{Body, Bytes};
    use axum::routing::post;

    // one delta, then the stream stalls forever
    let app = axum::Router::new().route(
        "/chat",
        post(|| async {
            let body = Body::from_stream(futures::stream::unfold(0u8, |state| async move {
                if state == 0 {
                    let line = "data: {\"choices\":[{\"delta\":{\"content\":\"早\"},\"finish_reason\":null}]}\n\n";
                    Some((Ok::<_, std::io::Error>(Bytes::from(line)), 1))
                } else {
                    futures::future::pending::<()>().await;
                    None
                }
            }));
            body
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let cancel = CancellationToken::new();
    let (mut reply, mut usage) = client(&base, true)
        .chat(cancel.clone(), "A0001", "hello")
        .await
        .unwrap();

    assert_eq!(reply.recv().await.as_deref(), Some("早"));

    cancel.cancel();

    // cancellation closes the reply and usage streams promptly
    let closed = tokio::time::timeout(Duration::from_secs(2), reply.recv())
        .await
        .expect("reply closed after cancellation");
    assert!(closed.is_none());
    let closed = tokio::time::timeout(Duration::from_secs(2), usage.recv())
        .await
        .expect("usage closed after cancellation");
    assert!(closed.is_none());
}

#[tokio::test]
async fn upstream_error_status_fails_the_call() {
    // nothing is listening on this port
    let client = client("http://127.0.0.1:1", true);
    let err = client
        .chat(CancellationToken::new(), "A0001", "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, voxrelay::Error::Llm(_)));
}
