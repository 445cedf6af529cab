//! Fakes shared by the unit tests in this crate

use askforge_common::LlmError;
use askforge_llm::{ChatRequest, EventSink, LlmResult, LlmService, StreamCancellationHandle, StreamEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Replays canned `chat` replies in order and a fixed event script for
/// `stream_chat`, recording every request.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<LlmResult<String>>>,
    stream_script: Mutex<Vec<StreamEvent>>,
    stream_error: Mutex<Option<LlmError>>,
    requests: Mutex<Vec<ChatRequest>>,
    stream_calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let llm = Self::default();
        for reply in replies {
            llm.push_reply(Ok(reply.into()));
        }
        llm
    }

    pub fn push_reply(&self, reply: LlmResult<String>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn set_stream(&self, events: Vec<StreamEvent>) {
        *self.stream_script.lock().unwrap() = events;
    }

    /// Make `stream_chat` behave like an exhausted router
    pub fn fail_stream(&self, error: LlmError) {
        *self.stream_error.lock().unwrap() = Some(error);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::NoContent { model: "scripted".into() }))
    }

    async fn stream_chat(&self, request: ChatRequest, sink: EventSink) -> LlmResult<StreamCancellationHandle> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        if let Some(error) = self.stream_error.lock().unwrap().clone() {
            let _ = sink.send(StreamEvent::Error(error.clone()));
            return Err(error);
        }
        for event in self.stream_script.lock().unwrap().iter().cloned() {
            let _ = sink.send(event);
        }
        Ok(StreamCancellationHandle::new())
    }
}
