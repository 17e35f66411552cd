//! End-to-end dialog pipeline tests against an in-process mock upstream

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{device_context, harness, sse_body};
use voxrelay::protocol::{self, AudioProfile};
use voxrelay::providers::intent;

/// Poll until `check` passes or the deadline expires
async fn eventually<F: Fn() -> bool>(check: F, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {what}");
}

#[tokio::test]
async fn full_frame_runs_the_whole_dialog() {
    let sse = sse_body(&["你", "好", "，", "我", "是", "Qwen", "。"], Some((12, 7)));
    let h = harness("你好", intent::CHIT_CHAT, &sse).await;

    let frame = protocol::build_full(b"WAVDATA", AudioProfile::default());
    let ctx = device_context("A0001");
    h.pipeline
        .handle_frame(CancellationToken::new(), &ctx, &frame)
        .await
        .unwrap();

    // the segmenter collapsed the deltas into one sentence
    let texts = h.upstream.state.tts_texts.lock().unwrap().clone();
    assert_eq!(texts, vec!["你好，我是Qwen。".to_string()]);

    // one valid full frame carrying the synthesized audio went back out
    let published = h.publisher.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "test/T0001/A0001/voice/client");
    let (header, payload) = protocol::decode(&published[0].1).unwrap();
    assert_eq!(payload, b"AUDIO");
    assert_eq!(header.frame_seq, 0);

    // usage lands on a detached task; wait for the ledger row
    let ledger = h.ledger.clone();
    eventually(
        || !ledger.list_for_device("A0001").unwrap().is_empty(),
        "cost record appended",
    )
    .await;
    let rows = ledger.list_for_device("A0001").unwrap();
    assert_eq!(rows[0].prompt_tokens + rows[0].completion_tokens, 19);
    assert_eq!(rows[0].total_tokens, 19);
    assert_eq!(rows[0].currency, "CNY");
}

#[tokio::test]
async fn fragments_reassemble_before_recognition() {
    let sse = sse_body(&["ok"], None);
    let h = harness("hello", intent::CHIT_CHAT, &sse).await;
    let profile = AudioProfile::default();
    let ctx = device_context("A0001");

    for (seq, chunk, last) in [(0u16, b"abc", false), (1, b"def", false), (2, b"ghi", true)] {
        let frame = protocol::build_stream(seq, chunk, profile, last);
        h.pipeline
            .handle_frame(CancellationToken::new(), &ctx, &frame)
            .await
            .unwrap();
    }

    // recognition saw exactly the concatenated payloads
    let bodies = h.upstream.state.asr_bodies.lock().unwrap().clone();
    assert_eq!(bodies, vec![b"abcdefghi".to_vec()]);

    // the reassembly entry is gone
    assert!(h.fragments.is_empty());
}

#[tokio::test]
async fn fragments_alone_do_not_trigger_recognition() {
    let sse = sse_body(&["ok"], None);
    let h = harness("hello", intent::CHIT_CHAT, &sse).await;
    let ctx = device_context("A0001");

    let frame = protocol::build_stream(0, b"abc", AudioProfile::default(), false);
    h.pipeline
        .handle_frame(CancellationToken::new(), &ctx, &frame)
        .await
        .unwrap();

    assert_eq!(h.upstream.state.asr_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.fragments.len(), 1);
}

#[tokio::test]
async fn corrupted_frame_is_rejected_before_recognition() {
    let sse = sse_body(&["ok"], None);
    let h = harness("hello", intent::CHIT_CHAT, &sse).await;
    let ctx = device_context("A0001");

    let mut frame = protocol::build_full(b"WAVDATA", AudioProfile::default());
    let last = frame.len() - 1;
    frame[last] ^= 0x01;

    let err = h
        .pipeline
        .handle_frame(CancellationToken::new(), &ctx, &frame)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        voxrelay::Error::Frame(protocol::FrameError::BadCrc { .. })
    ));

    // no model service was touched, nothing was published
    assert_eq!(h.upstream.state.asr_calls.load(Ordering::SeqCst), 0);
    assert!(h.publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stream_without_usage_still_completes() {
    // the model terminates with [DONE] and never sends a usage packet
    let sse = sse_body(&["短", "回", "答", "。"], None);
    let h = harness("你好", intent::CHIT_CHAT, &sse).await;

    let frame = protocol::build_full(b"WAVDATA", AudioProfile::default());
    let ctx = device_context("A0001");
    h.pipeline
        .handle_frame(CancellationToken::new(), &ctx, &frame)
        .await
        .unwrap();

    // audio went out even though accounting never arrived
    assert_eq!(h.publisher.published.lock().unwrap().len(), 1);
    assert!(h.ledger.list_for_device("A0001").unwrap().is_empty());
}

#[tokio::test]
async fn non_chat_intent_skips_the_llm() {
    let sse = sse_body(&["ignored"], None);
    let h = harness("开灯", intent::TURN_ON_LIGHT, &sse).await;

    let frame = protocol::build_full(b"WAVDATA", AudioProfile::default());
    let ctx = device_context("A0001");
    h.pipeline
        .handle_frame(CancellationToken::new(), &ctx, &frame)
        .await
        .unwrap();

    // the special action is a stub: no reply audio is synthesized
    assert!(h.upstream.state.tts_texts.lock().unwrap().is_empty());
    assert!(h.publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn multi_sentence_reply_publishes_in_order() {
    // the first delta is long enough to flush on its own; the second flushes
    // as residue, giving two sentences
    let sse = sse_body(
        &["第一句话现在已经说完了。", "第二句话也说完了。"],
        Some((4, 4)),
    );
    let h = harness("你好", intent::CHIT_CHAT, &sse).await;

    let frame = protocol::build_full(b"WAVDATA", AudioProfile::default());
    let ctx = device_context("A0001");
    h.pipeline
        .handle_frame(CancellationToken::new(), &ctx, &frame)
        .await
        .unwrap();

    let texts = h.upstream.state.tts_texts.lock().unwrap().clone();
    assert_eq!(texts.len(), 2, "texts: {texts:?}");
    assert!(texts[0].starts_with("第一句"));
    assert!(texts[1].starts_with("第二句"));

    // publishes preserve sentence order
    let published = h.publisher.published.lock().unwrap().clone();
    assert_eq!(published.len(), 2);
}

#[tokio::test]
async fn tts_failure_skips_the_sentence_only() {
    let failing = format!("{}这一句坏掉了。", common::TTS_FAIL_MARKER);
    let sse = sse_body(&[&failing, "第二句话没有问题。"], None);
    let h = harness("你好", intent::CHIT_CHAT, &sse).await;

    let frame = protocol::build_full(b"WAVDATA", AudioProfile::default());
    let ctx = device_context("A0001");
    h.pipeline
        .handle_frame(CancellationToken::new(), &ctx, &frame)
        .await
        .unwrap();

    // both sentences reached synthesis, but only the healthy one shipped
    let texts = h.upstream.state.tts_texts.lock().unwrap().clone();
    assert_eq!(texts.len(), 2, "texts: {texts:?}");

    let published = h.publisher.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    let (_, payload) = (published[0].0.clone(), published[0].1.clone());
    let (_, audio) = protocol::decode(&payload).unwrap();
    assert_eq!(audio, b"AUDIO");
}
