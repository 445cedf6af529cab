//! Model routing with failover
//!
//! Non-streaming calls walk the selector's candidates until one succeeds.
//! Streaming calls test each candidate for a usable first packet before
//! anything reaches the caller: events of an attempt stay queued in that
//! attempt's channel until its first event is classified. On success the
//! attempt is promoted and a relay task drains the queue to the caller in
//! arrival order; on failure the attempt is cancelled and its queue dropped,
//! so partial output from a failed provider never leaks.

use crate::cancel::StreamCancellationHandle;
use crate::client::{create_client, ChatClient};
use crate::health::ModelHealthStore;
use crate::selector::ModelSelector;
use crate::types::{ChatRequest, EventSink, ModelTarget, StreamEvent};
use crate::LlmResult;
use askforge_common::config::AiConfig;
use askforge_common::executor::WorkerPool;
use askforge_common::{metrics, LlmError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the answering pipeline needs from the model layer
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Full-text completion
    async fn chat(&self, request: &ChatRequest) -> LlmResult<String>;

    /// Streaming completion delivered to `sink`
    async fn stream_chat(
        &self,
        request: ChatRequest,
        sink: EventSink,
    ) -> LlmResult<StreamCancellationHandle>;
}

pub struct RoutingLlmService {
    selector: Arc<dyn ModelSelector>,
    health: Arc<ModelHealthStore>,
    clients: HashMap<String, Arc<dyn ChatClient>>,
    stream_pool: WorkerPool,
    first_packet_timeout: Duration,
}

impl RoutingLlmService {
    pub fn new(
        selector: Arc<dyn ModelSelector>,
        health: Arc<ModelHealthStore>,
        stream_pool: WorkerPool,
        first_packet_timeout: Duration,
    ) -> Self {
        Self {
            selector,
            health,
            clients: HashMap::new(),
            stream_pool,
            first_packet_timeout,
        }
    }

    /// Register the client serving a provider key
    pub fn with_client(mut self, provider: impl Into<String>, client: Arc<dyn ChatClient>) -> Self {
        self.clients.insert(provider.into(), client);
        self
    }

    /// Build clients for every configured provider
    pub fn from_config(
        ai: &AiConfig,
        selector: Arc<dyn ModelSelector>,
        health: Arc<ModelHealthStore>,
        stream_pool: WorkerPool,
    ) -> Result<Self> {
        let mut service = Self::new(
            selector,
            health,
            stream_pool,
            Duration::from_secs(ai.chat.first_packet_timeout_secs),
        );
        for (name, provider) in &ai.providers {
            service = service.with_client(name.clone(), create_client(name, provider)?);
        }
        info!(providers = service.clients.len(), "Model router initialized");
        Ok(service)
    }

    fn client_for(&self, target: &ModelTarget) -> LlmResult<Arc<dyn ChatClient>> {
        self.clients
            .get(target.provider_name())
            .cloned()
            .ok_or_else(|| LlmError::ProviderUnavailable {
                provider: target.provider_name().to_string(),
            })
    }

    /// Full-text completion with failover across candidates
    pub async fn chat(&self, request: &ChatRequest) -> LlmResult<String> {
        let candidates = self.selector.select_chat_candidates(request.thinking);
        self.execute_with_fallback(&candidates, |client, target| {
            let request = request.clone();
            async move { client.chat(&request, &target).await }
        })
        .await
    }

    /// Full-text completion on one named model, gated by its circuit
    pub async fn chat_with_model(&self, model_id: &str, request: &ChatRequest) -> LlmResult<String> {
        let unavailable = || LlmError::ModelUnavailable {
            model: model_id.to_string(),
        };
        let target = self.selector.find(model_id).ok_or_else(unavailable)?;
        if !self.health.allow_call(model_id) {
            debug!(model = model_id, "Circuit open, refusing explicit model call");
            return Err(unavailable());
        }

        let client = match self.client_for(&target) {
            Ok(client) => client,
            Err(e) => {
                self.health.mark_failure(model_id);
                return Err(e);
            }
        };

        match client.chat(request, &target).await {
            Ok(text) => {
                self.health.mark_success(model_id);
                metrics::record_model_call(model_id, "sync", "success");
                Ok(text)
            }
            Err(e) => {
                self.health.mark_failure(model_id);
                metrics::record_model_call(model_id, "sync", e.kind());
                Err(e)
            }
        }
    }

    /// Try `call` against each candidate in order and return the first success
    pub async fn execute_with_fallback<T, F, Fut>(&self, candidates: &[ModelTarget], mut call: F) -> LlmResult<T>
    where
        F: FnMut(Arc<dyn ChatClient>, ModelTarget) -> Fut,
        Fut: Future<Output = LlmResult<T>>,
    {
        let mut last_error: Option<LlmError> = None;

        for target in candidates {
            let outcome = match self.client_for(target) {
                Ok(client) => call(client, target.clone()).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => {
                    self.health.mark_success(target.id());
                    metrics::record_model_call(target.id(), "sync", "success");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(model = %target.id(), error = %e, "Model call failed, trying next candidate");
                    self.health.mark_failure(target.id());
                    metrics::record_model_call(target.id(), "sync", e.kind());
                    last_error = Some(e);
                }
            }
        }

        Err(exhausted(candidates.len(), last_error))
    }

    /// Stream a completion into `downstream`, failing over until a candidate
    /// produces its first packet.
    ///
    /// On success the returned handle stops the committed stream. When every
    /// candidate fails, `downstream` receives exactly one
    /// `Error(Exhausted)` and the same error is returned.
    pub async fn stream_chat(
        &self,
        request: ChatRequest,
        downstream: EventSink,
    ) -> LlmResult<StreamCancellationHandle> {
        let candidates = self.selector.select_chat_candidates(request.thinking);
        let mut last_error: Option<LlmError> = None;

        for target in &candidates {
            let model_id = target.id().to_string();

            let client = match self.client_for(target) {
                Ok(client) => client,
                Err(e) => {
                    warn!(model = %model_id, error = %e, "No client for candidate");
                    self.health.mark_failure(&model_id);
                    metrics::record_model_call(&model_id, "stream", e.kind());
                    last_error = Some(e);
                    continue;
                }
            };

            let handle = StreamCancellationHandle::new();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let call = {
                let request = request.clone();
                let target = target.clone();
                let token = handle.token();
                async move { client.stream_chat(request, target, tx, token).await }
            };

            let started = Instant::now();
            let attempt = match self.stream_pool.try_spawn(call) {
                Ok(attempt) => attempt,
                Err(saturated) => {
                    handle.cancel();
                    warn!(model = %model_id, pool = %saturated.pool, "Stream pool saturated, rejecting request");
                    metrics::record_model_call(&model_id, "stream", "pool_rejected");
                    let _ = downstream.send(StreamEvent::Error(LlmError::PoolRejected {
                        pool: saturated.pool,
                    }));
                    return Ok(StreamCancellationHandle::noop());
                }
            };

            match self.await_first_packet(target, &mut rx).await {
                Ok(first) => {
                    let elapsed = started.elapsed();
                    self.health.mark_success(&model_id);
                    metrics::record_model_call(&model_id, "stream", "success");
                    metrics::record_first_packet(&model_id, elapsed.as_secs_f64());
                    info!(
                        model = %model_id,
                        first_packet_ms = elapsed.as_millis() as u64,
                        "Stream committed"
                    );
                    promote(first, rx, downstream, handle.clone());
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(model = %model_id, error = %e, "Stream candidate failed, trying next");
                    handle.cancel();
                    release_worker(attempt).await;
                    self.health.mark_failure(&model_id);
                    metrics::record_model_call(&model_id, "stream", e.kind());
                    last_error = Some(e);
                }
            }
        }

        let err = exhausted(candidates.len(), last_error);
        warn!(error = %err, "All stream candidates failed");
        let _ = downstream.send(StreamEvent::Error(err.clone()));
        Err(err)
    }

    /// Wait for the attempt's first event and classify it
    async fn await_first_packet(
        &self,
        target: &ModelTarget,
        rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
    ) -> LlmResult<StreamEvent> {
        let first = tokio::time::timeout(self.first_packet_timeout, rx.recv())
            .await
            .map_err(|_| LlmError::Timeout {
                model: target.id().to_string(),
                timeout_ms: self.first_packet_timeout.as_millis() as u64,
            })?;

        match first {
            Some(event @ (StreamEvent::Content(_) | StreamEvent::Thinking(_))) => Ok(event),
            Some(StreamEvent::Complete) => Err(LlmError::NoContent {
                model: target.id().to_string(),
            }),
            Some(StreamEvent::Error(e)) => Err(e),
            None => Err(LlmError::invalid_response(
                target.provider_name(),
                "stream ended before the first packet",
            )),
        }
    }
}

#[async_trait]
impl LlmService for RoutingLlmService {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<String> {
        RoutingLlmService::chat(self, request).await
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        sink: EventSink,
    ) -> LlmResult<StreamCancellationHandle> {
        RoutingLlmService::stream_chat(self, request, sink).await
    }
}

/// Forward a committed attempt to the caller: the awaited first event, then
/// everything still queued, then live events, until a terminal event,
/// cancellation, or the caller going away.
fn promote(
    first: StreamEvent,
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    downstream: EventSink,
    handle: StreamCancellationHandle,
) {
    tokio::spawn(async move {
        if !forward(&downstream, &handle, first) {
            return;
        }
        while let Some(event) = rx.recv().await {
            if !forward(&downstream, &handle, event) {
                return;
            }
        }
    });
}

/// Stop a failed attempt and wait until its stream worker is free again,
/// so the next candidate can take the slot.
async fn release_worker(attempt: JoinHandle<()>) {
    attempt.abort();
    if let Err(e) = attempt.await {
        if !e.is_cancelled() {
            warn!(error = %e, "Abandoned stream attempt panicked");
        }
    }
}

fn forward(downstream: &EventSink, handle: &StreamCancellationHandle, event: StreamEvent) -> bool {
    if handle.is_cancelled() {
        return false;
    }
    let terminal = event.is_terminal();
    downstream.send(event).is_ok() && !terminal
}

fn exhausted(attempts: usize, last: Option<LlmError>) -> LlmError {
    LlmError::Exhausted {
        attempts,
        last: last
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no chat candidates available".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::ConfigModelSelector;
    use crate::types::test_target;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    enum Script {
        Hang,
        Fail(LlmError),
        Reply(Vec<StreamEvent>),
        Drip,
    }

    struct ScriptedClient {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(scripts: Vec<(&str, Script)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts
                    .into_iter()
                    .map(|(id, s)| (id.to_string(), s))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, _request: &ChatRequest, target: &ModelTarget) -> LlmResult<String> {
            self.calls.lock().unwrap().push(target.id().to_string());
            match self.scripts.get(target.id()) {
                Some(Script::Reply(events)) => Ok(events
                    .iter()
                    .filter_map(|e| match e {
                        StreamEvent::Content(t) => Some(t.as_str()),
                        _ => None,
                    })
                    .collect()),
                Some(Script::Fail(e)) => Err(e.clone()),
                _ => Err(LlmError::network("scripted", "unscripted")),
            }
        }

        async fn stream_chat(
            &self,
            _request: ChatRequest,
            target: ModelTarget,
            sink: EventSink,
            cancel: CancellationToken,
        ) {
            self.calls.lock().unwrap().push(target.id().to_string());
            match self.scripts.get(target.id()).cloned() {
                Some(Script::Hang) | None => cancel.cancelled().await,
                Some(Script::Fail(e)) => {
                    let _ = sink.send(StreamEvent::Error(e));
                }
                Some(Script::Reply(events)) => {
                    for event in events {
                        if cancel.is_cancelled() || sink.send(event).is_err() {
                            return;
                        }
                    }
                }
                Some(Script::Drip) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {
                            if sink.send(StreamEvent::Content("tick".into())).is_err() {
                                return;
                            }
                        }
                    }
                },
            }
        }
    }

    fn service(
        client: Arc<ScriptedClient>,
        ids: &[&str],
        health: Arc<ModelHealthStore>,
        pool: WorkerPool,
    ) -> RoutingLlmService {
        let targets = ids
            .iter()
            .map(|id| test_target(id, "scripted", "http://unused"))
            .collect();
        let selector = Arc::new(ConfigModelSelector::from_targets(targets, health.clone()));
        RoutingLlmService::new(selector, health, pool, Duration::from_millis(100))
            .with_client("scripted", client)
    }

    fn server_error() -> LlmError {
        LlmError::from_status("scripted", 500, "boom")
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_stream_fails_over_timeout_then_error_then_succeeds() {
        let client = ScriptedClient::new(vec![
            ("slow", Script::Hang),
            ("broken", Script::Fail(server_error())),
            (
                "good",
                Script::Reply(vec![
                    StreamEvent::Content("Hel".into()),
                    StreamEvent::Content("lo".into()),
                    StreamEvent::Complete,
                ]),
            ),
        ]);
        let health = Arc::new(ModelHealthStore::new(1, Duration::from_secs(60)));
        let svc = service(
            client.clone(),
            &["slow", "broken", "good"],
            health.clone(),
            WorkerPool::new("stream", 4),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = svc.stream_chat(ChatRequest::default(), tx).await;
        assert!(handle.is_ok());

        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Content("Hel".into()),
                StreamEvent::Content("lo".into()),
                StreamEvent::Complete,
            ]
        );
        assert_eq!(client.calls(), vec!["slow", "broken", "good"]);
        assert!(health.is_open("slow"));
        assert!(health.is_open("broken"));
        assert!(!health.is_open("good"));
    }

    #[tokio::test]
    async fn test_stream_no_content_fails_over() {
        let client = ScriptedClient::new(vec![
            ("empty", Script::Reply(vec![StreamEvent::Complete])),
            (
                "good",
                Script::Reply(vec![StreamEvent::Thinking("hmm".into()), StreamEvent::Complete]),
            ),
        ]);
        let health = Arc::new(ModelHealthStore::default());
        let svc = service(client, &["empty", "good"], health, WorkerPool::new("stream", 4));

        let (tx, rx) = mpsc::unbounded_channel();
        svc.stream_chat(ChatRequest::default(), tx).await.unwrap();
        assert_eq!(
            drain(rx).await,
            vec![StreamEvent::Thinking("hmm".into()), StreamEvent::Complete]
        );
    }

    #[tokio::test]
    async fn test_stream_exhausted_emits_single_error() {
        let client = ScriptedClient::new(vec![
            ("a", Script::Fail(server_error())),
            ("b", Script::Fail(LlmError::from_status("scripted", 429, "slow down"))),
        ]);
        let health = Arc::new(ModelHealthStore::default());
        let svc = service(client, &["a", "b"], health, WorkerPool::new("stream", 4));

        let (tx, rx) = mpsc::unbounded_channel();
        let result = svc.stream_chat(ChatRequest::default(), tx).await;
        assert!(matches!(result, Err(LlmError::Exhausted { attempts: 2, .. })));

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(LlmError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn test_stream_pool_rejection_is_terminal() {
        let client = ScriptedClient::new(vec![("a", Script::Reply(vec![StreamEvent::Complete]))]);
        let health = Arc::new(ModelHealthStore::default());
        let pool = WorkerPool::new("stream", 1);
        let _busy = pool
            .try_spawn(tokio::time::sleep(Duration::from_secs(5)))
            .unwrap();
        let svc = service(client.clone(), &["a"], health.clone(), pool);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = svc.stream_chat(ChatRequest::default(), tx).await;
        assert!(handle.is_ok());

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(LlmError::PoolRejected { .. })));
        assert!(client.calls().is_empty());
        assert!(!health.is_open("a"));
    }

    #[tokio::test]
    async fn test_stream_fails_over_on_single_worker_pool() {
        let client = ScriptedClient::new(vec![
            ("slow", Script::Hang),
            (
                "good",
                Script::Reply(vec![StreamEvent::Content("ok".into()), StreamEvent::Complete]),
            ),
        ]);
        let health = Arc::new(ModelHealthStore::default());
        let pool = WorkerPool::new("stream", 1);
        let svc = service(client.clone(), &["slow", "good"], health, pool.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = svc.stream_chat(ChatRequest::default(), tx).await;
        assert!(handle.is_ok());

        assert_eq!(
            drain(rx).await,
            vec![StreamEvent::Content("ok".into()), StreamEvent::Complete]
        );
        assert_eq!(client.calls(), vec!["slow", "good"]);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let client = ScriptedClient::new(vec![("a", Script::Drip)]);
        let health = Arc::new(ModelHealthStore::default());
        let svc = service(client, &["a"], health, WorkerPool::new("stream", 4));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = svc.stream_chat(ChatRequest::default(), tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Content("tick".into())));

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        // The relay drops its sender once it sees the flag, closing the channel
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = rx.recv().await {
                assert!(!event.is_terminal());
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_chat_falls_back_in_order() {
        let client = ScriptedClient::new(vec![
            ("a", Script::Fail(server_error())),
            ("b", Script::Reply(vec![StreamEvent::Content("answer".into())])),
        ]);
        let health = Arc::new(ModelHealthStore::default());
        let svc = service(client.clone(), &["a", "b"], health, WorkerPool::new("stream", 1));

        let text = svc.chat(&ChatRequest::default()).await.unwrap();
        assert_eq!(text, "answer");
        assert_eq!(client.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_chat_with_model_respects_open_circuit() {
        let client = ScriptedClient::new(vec![(
            "a",
            Script::Reply(vec![StreamEvent::Content("hi".into())]),
        )]);
        let health = Arc::new(ModelHealthStore::new(1, Duration::from_secs(60)));
        health.mark_failure("a");
        let svc = service(client.clone(), &["a"], health, WorkerPool::new("stream", 1));

        let result = svc.chat_with_model("a", &ChatRequest::default()).await;
        assert!(matches!(result, Err(LlmError::ModelUnavailable { .. })));
        assert!(client.calls().is_empty());

        let unknown = svc.chat_with_model("missing", &ChatRequest::default()).await;
        assert!(matches!(unknown, Err(LlmError::ModelUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_missing_provider_client_counts_as_failure() {
        let health = Arc::new(ModelHealthStore::new(1, Duration::from_secs(60)));
        let selector = Arc::new(ConfigModelSelector::from_targets(
            vec![test_target("orphan", "nowhere", "http://unused")],
            health.clone(),
        ));
        let svc = RoutingLlmService::new(
            selector,
            health.clone(),
            WorkerPool::new("stream", 1),
            Duration::from_millis(50),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let result = svc.stream_chat(ChatRequest::default(), tx).await;
        assert!(matches!(result, Err(LlmError::Exhausted { attempts: 1, .. })));
        assert!(health.is_open("orphan"));
        assert_eq!(drain(rx).await.len(), 1);
    }
}
