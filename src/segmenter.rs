//! Adaptive sentence segmentation for streamed LLM text
//!
//! The chat model emits text a few tokens at a time; speech synthesis wants
//! whole sentences. The segmenter buffers incoming chunks and emits at safe
//! break scalars (CJK ideographs, whitespace, sentence punctuation), with a
//! strict flush past `MAX_LENGTH` and an inactivity flush so a slow model
//! cannot stall the audio stream.

use std::time::Duration;

use tokio::sync::mpsc;

/// Minimum buffered scalars before a break is considered
pub const MIN_LENGTH: usize = 12;

/// Buffered scalars beyond this are flushed even without a safe break
pub const MAX_LENGTH: usize = 45;

/// Inactivity flush delay
pub const FLUSH_DELAY: Duration = Duration::from_millis(600);

/// Minimum buffered scalars for the inactivity flush to fire
const TIMER_FLUSH_MIN: usize = 8;

/// How many trailing scalars are searched for a safe break
const BREAK_WINDOW: usize = 10;

/// Output channel depth
const OUTPUT_DEPTH: usize = 4;

/// Whether splitting after this scalar cannot cut through a word
#[must_use]
pub fn is_safe_break(c: char) -> bool {
    if c.is_whitespace() {
        return true;
    }
    // CJK unified ideographs (and extension A)
    if matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}') {
        return true;
    }
    matches!(
        c,
        '。' | '！' | '？' | '；' | ';' | ',' | '.' | '!' | '?' | '，' | '：' | ':' | '、'
    )
}

/// Index one past the latest safe-break scalar within the trailing window,
/// or `None` when the window holds no break
fn last_break(buf: &[char]) -> Option<usize> {
    let start = buf.len().saturating_sub(BREAK_WINDOW);
    buf[start..]
        .iter()
        .rposition(|&c| is_safe_break(c))
        .map(|i| start + i + 1)
}

/// Pipe a lazy text stream through the segmenter.
///
/// Returns the sentence stream; it closes after the input closes and any
/// residue has been emitted. Dropping the returned receiver stops the
/// segmentation task.
#[must_use]
pub fn segment(input: mpsc::Receiver<String>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(OUTPUT_DEPTH);
    tokio::spawn(run(input, tx));
    rx
}

async fn run(mut input: mpsc::Receiver<String>, out: mpsc::Sender<String>) {
    let mut buf: Vec<char> = Vec::new();

    loop {
        let idle = tokio::time::sleep(FLUSH_DELAY);
        tokio::pin!(idle);

        tokio::select! {
            chunk = input.recv() => {
                let Some(chunk) = chunk else {
                    // input closed: flush residue
                    if !buf.is_empty() && !emit(&out, buf.drain(..).collect()).await {
                        return;
                    }
                    return;
                };

                buf.extend(chunk.chars());

                let mut split = false;
                if buf.len() >= MIN_LENGTH {
                    if let Some(cut) = last_break(&buf) {
                        let sentence: String = buf[..cut].iter().collect();
                        buf.drain(..cut);
                        if !emit(&out, sentence.trim().to_string()).await {
                            return;
                        }
                        split = true;
                    }
                }
                if !split && buf.len() > MAX_LENGTH {
                    // strict flush: no safe break in sight, ship it anyway
                    if !emit(&out, buf.drain(..).collect()).await {
                        return;
                    }
                }
            }
            () = &mut idle => {
                if buf.len() >= TIMER_FLUSH_MIN
                    && !emit(&out, buf.drain(..).collect()).await
                {
                    return;
                }
            }
        }
    }
}

/// Send a sentence downstream; `false` when the consumer is gone
async fn emit(out: &mpsc::Sender<String>, sentence: String) -> bool {
    if sentence.is_empty() {
        return true;
    }
    out.send(sentence).await.is_ok()
}
