//! Provider clients
//!
//! Each client speaks one wire format. Both share the same line-oriented
//! read loop: bytes are split on newlines, every complete line is decoded
//! into frames, and frames become `StreamEvent`s on the sink.

mod ollama;
mod openai;

pub use ollama::OllamaChatClient;
pub use openai::OpenAiChatClient;

use crate::types::{ChatRequest, EventSink, ModelTarget, StreamEvent};
use crate::LlmResult;
use askforge_common::config::{ProviderConfig, ProviderKind};
use askforge_common::LlmError;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A chat-completion provider
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Provider name used in errors and logs
    fn provider(&self) -> &str;

    /// Non-streaming completion returning the full text
    async fn chat(&self, request: &ChatRequest, target: &ModelTarget) -> LlmResult<String>;

    /// Streaming completion.
    ///
    /// Every outcome is reported on `sink`: increments, then one `Complete`
    /// or `Error`. Once `cancel` fires the loop stops reading and returns
    /// without a terminal event.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        target: ModelTarget,
        sink: EventSink,
        cancel: CancellationToken,
    );
}

/// Build the client for a configured provider
pub fn create_client(name: &str, config: &ProviderConfig) -> LlmResult<Arc<dyn ChatClient>> {
    Ok(match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiChatClient::new(name, config)?),
        ProviderKind::Ollama => Arc::new(OllamaChatClient::new(name, config)?),
    })
}

/// Shared HTTP client: connect timeout only, since streams may run long.
/// Non-streaming calls set a per-request timeout instead.
pub(crate) fn http_client(name: &str, config: &ProviderConfig) -> LlmResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| LlmError::network(name, format!("failed to build HTTP client: {}", e)))
}

/// Turn a non-success response into the error taxonomy
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> LlmResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LlmError::from_status(provider, status.as_u16(), body))
}

/// One decoded unit of provider output
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Content(String),
    Thinking(String),
    Done,
    Error(LlmError),
}

/// Accumulates raw bytes and yields complete lines.
///
/// Splitting happens on the `\n` byte, so multi-byte characters are never
/// cut in half before decoding.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(Self::decode(&line[..line.len() - 1]));
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(Self::decode(&rest))
    }

    fn decode(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
    }
}

enum Flow {
    Continue,
    Finished,
}

fn dispatch(frames: Vec<Frame>, sink: &EventSink, cancel: &CancellationToken) -> Flow {
    for frame in frames {
        if cancel.is_cancelled() {
            return Flow::Finished;
        }
        let (event, terminal) = match frame {
            Frame::Content(text) if text.is_empty() => continue,
            Frame::Thinking(text) if text.is_empty() => continue,
            Frame::Content(text) => (StreamEvent::Content(text), false),
            Frame::Thinking(text) => (StreamEvent::Thinking(text), false),
            Frame::Done => (StreamEvent::Complete, true),
            Frame::Error(err) => (StreamEvent::Error(err), true),
        };
        // A dropped receiver means nobody is listening anymore
        if sink.send(event).is_err() || terminal {
            return Flow::Finished;
        }
    }
    Flow::Continue
}

/// Read a streaming body line by line until it ends, errors, or is cancelled.
///
/// A body that ends without an explicit done marker is reported as
/// `Complete`.
pub(crate) async fn drive_stream<D>(
    provider: &str,
    response: reqwest::Response,
    sink: &EventSink,
    cancel: &CancellationToken,
    decode: D,
) where
    D: Fn(&str) -> Vec<Frame>,
{
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(provider, "Stream read loop cancelled");
                return;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                for line in lines.push(&bytes) {
                    if let Flow::Finished = dispatch(decode(&line), sink, cancel) {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                if !cancel.is_cancelled() {
                    let _ = sink.send(StreamEvent::Error(LlmError::network(provider, e)));
                }
                return;
            }
            None => {
                if let Some(line) = lines.finish() {
                    if let Flow::Finished = dispatch(decode(&line), sink, cancel) {
                        return;
                    }
                }
                if !cancel.is_cancelled() {
                    let _ = sink.send(StreamEvent::Complete);
                }
                return;
            }
        }
    }
}

/// Report a failure that happened before the body started streaming
pub(crate) fn emit_error(sink: &EventSink, cancel: &CancellationToken, err: LlmError) {
    if !cancel.is_cancelled() {
        let _ = sink.send(StreamEvent::Error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: hel").is_empty());
        let lines = buf.push(b"lo\r\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: hello", "data: [DONE]"]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_keeps_multibyte_chars_intact() {
        let text = "données".as_bytes();
        let mut buf = LineBuffer::default();
        // Split inside the two-byte 'é'
        assert!(buf.push(&text[..3]).is_empty());
        buf.push(&text[3..]);
        assert_eq!(buf.finish().as_deref(), Some("données"));
    }

    #[test]
    fn test_dispatch_stops_at_terminal_frame() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let frames = vec![
            Frame::Content("a".into()),
            Frame::Content(String::new()),
            Frame::Done,
            Frame::Content("late".into()),
        ];
        assert!(matches!(dispatch(frames, &tx, &cancel), Flow::Finished));
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Content("a".into()));
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Complete);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_drops_frames_after_cancel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatch(vec![Frame::Content("x".into())], &tx, &cancel);
        assert!(rx.try_recv().is_err());
    }
}
