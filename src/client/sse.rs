//! Server-sent event reader for streamed provider responses.
//!
//! Epistemic foundation:
//! - K_i: Events are newline-delimited; payloads follow `data:`
//! - B_i: Byte chunks may split a line or a UTF-8 sequence (buffered)
//! - I^B: The connection may drop mid-stream → one error item, then end

use crate::models::ProviderError;
use futures::Stream;
use futures::stream::{self, BoxStream, StreamExt};

/// Stream of text chunks produced by a provider.
pub type ChunkStream = BoxStream<'static, Result<String, ProviderError>>;

struct SseState<S> {
    bytes: S,
    buffer: Vec<u8>,
    finished: bool,
}

/// Yield the payload of every `data:` line until `[DONE]` or end of body.
///
/// Comment, `event:` and blank lines are skipped.
pub(crate) fn data_lines<S, B>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\r', '\n']);

                if let Some(data) = line.strip_prefix("data:") {
                    let data = data.trim_start();
                    if data == "[DONE]" {
                        return None;
                    }
                    return Some((Ok(data.to_string()), state));
                }
                continue;
            }

            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((Err(ProviderError::Network(e)), state));
                }
                None => {
                    state.finished = true;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(parts: &[&'static [u8]]) -> Vec<String> {
        let bytes = stream::iter(
            parts
                .iter()
                .map(|p| Ok::<_, reqwest::Error>(*p))
                .collect::<Vec<_>>(),
        );
        data_lines(bytes)
            .map(|item| item.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_reassembles_split_lines() {
        let lines = collect(&[b"data: {\"a\"", b":1}\n\ndata: {\"b\":2}\r\n", b"\n"]).await;
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[tokio::test]
    async fn test_split_utf8_sequence_survives() {
        // "é" is 0xC3 0xA9
        let lines = collect(&[b"data: caf\xC3", b"\xA9\n"]).await;
        assert_eq!(lines, vec!["café"]);
    }

    #[tokio::test]
    async fn test_stops_at_done_and_skips_other_fields() {
        let lines = collect(&[
            b": keep-alive\nevent: message\ndata: one\n\ndata: [DONE]\n\ndata: after\n",
        ])
        .await;
        assert_eq!(lines, vec!["one"]);
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let lines = collect(&[b"data: last"]).await;
        assert_eq!(lines, vec!["last"]);
    }
}
