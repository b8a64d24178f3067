use bytes::Bytes;
use fingerprint::{fingerprint as compute_fingerprint, CanonicalizationStrategy};
use futures::Stream;
use matcher::matches;
use meta_store::MetaStore;
use proxy_core::backend::{BackendResponse, ByteStream};
use proxy_core::meta::snapshot_basename;
use proxy_core::time::now_secs;
use proxy_core::{BackendAdapter, ChatMessage, Heat, PrefixFingerprint, ProxyError, RequestConfig};
use serde_json::Value;
use slot_acquirer::SlotAcquirer;
use slot_table::{SlotGuard, SlotTable};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// What the HTTP façade should do with a completed or in-flight request
/// (§6's inbound/outbound contract, generalized away from axum types so
/// this crate has no HTTP dependency).
pub enum CoordinatorOutcome {
    Json { status: u16, body: Value },
    Stream { status: u16, bytes: ByteStream },
}

impl std::fmt::Debug for CoordinatorOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorOutcome::Json { status, body } => f
                .debug_struct("Json")
                .field("status", status)
                .field("body", body)
                .finish(),
            CoordinatorOutcome::Stream { status, .. } => f
                .debug_struct("Stream")
                .field("status", status)
                .finish(),
        }
    }
}

/// A failure to surface to the client. `status`/`body` are meant to be
/// passed through close to verbatim (§7: "propagate status/body").
#[derive(Debug)]
pub struct CoordinatorError {
    pub status: u16,
    pub body: Value,
}

impl CoordinatorError {
    fn backend_unreachable(msg: impl Into<String>) -> Self {
        Self {
            status: 502,
            body: serde_json::json!({ "error": { "type": "backend_unreachable", "message": msg.into() } }),
        }
    }

    fn backend_http(status: u16, body: String) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": { "type": "backend_http_error", "body": body } }),
        }
    }

    fn backend_non_json(msg: impl Into<String>) -> Self {
        Self {
            status: 502,
            body: serde_json::json!({ "error": { "type": "backend_non_json", "message": msg.into() } }),
        }
    }

    fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            status: 400,
            body: serde_json::json!({ "error": { "type": "invalid_request", "message": msg.into() } }),
        }
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "coordinator error {}: {}", self.status, self.body)
    }
}

impl std::error::Error for CoordinatorError {}

/// Classifies, matches, acquires, dispatches, and finalizes one chat
/// completion request (§4.5). Backend-agnostic — depends only on
/// `BackendAdapter`, so it is unit-testable against a fake.
pub struct Coordinator {
    table: Arc<SlotTable>,
    meta_store: Arc<MetaStore>,
    acquirer: Arc<SlotAcquirer>,
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
    model_id: String,
    canonicalization: CanonicalizationStrategy,
}

impl Coordinator {
    pub fn new(
        table: Arc<SlotTable>,
        meta_store: Arc<MetaStore>,
        acquirer: Arc<SlotAcquirer>,
        backends: HashMap<String, Arc<dyn BackendAdapter>>,
        model_id: String,
        canonicalization: CanonicalizationStrategy,
    ) -> Self {
        Self {
            table,
            meta_store,
            acquirer,
            backends,
            model_id,
            canonicalization,
        }
    }

    /// Handle one `/v1/chat/completions` request end to end (§4.5, §6).
    pub async fn handle_chat_completion(
        &self,
        body: Value,
        request_config: &RequestConfig,
        stream: bool,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let messages: Vec<ChatMessage> = serde_json::from_value(
            body.get("messages").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|e| CoordinatorError::invalid_request(e.to_string()))?;

        let fp = compute_fingerprint(
            &messages,
            request_config.words_per_block,
            &self.model_id,
            self.canonicalization,
        );
        let is_big = request_config.is_big(fp.word_count, fp.char_count, fp.block_hashes.len());

        let snapshot = self.table.snapshot().await;
        let records = {
            let meta_store = self.meta_store.clone();
            tokio::task::spawn_blocking(move || meta_store.scan())
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "metadata scan task panicked");
                    Vec::new()
                })
        };
        let match_result = matches(
            &fp,
            request_config.words_per_block,
            &self.model_id,
            &snapshot,
            &records,
            request_config.similarity_threshold,
        );

        let acquisition = self
            .acquirer
            .acquire(
                &match_result.outcome,
                &fp,
                is_big,
                match_result.rejected_active.as_ref(),
            )
            .await
            .map_err(|e| CoordinatorError::backend_unreachable(e.to_string()))?;

        let mut guard = acquisition.guard;
        guard.state_mut().last_used_at = now_secs();
        let sid = guard.sid().clone();

        let Some(backend) = self.backends.get(&sid.backend_id).cloned() else {
            guard.release();
            return Err(CoordinatorError::backend_unreachable(format!(
                "no backend registered for {}",
                sid.backend_id
            )));
        };

        let result = backend
            .forward_chat_completion(sid.local_slot_id, body, is_big, stream)
            .await;

        match result {
            Err(ProxyError::BackendUnreachable(msg)) => {
                guard.release();
                Err(CoordinatorError::backend_unreachable(msg))
            }
            Err(ProxyError::BackendHttpError { status, body }) => {
                guard.release();
                Err(CoordinatorError::backend_http(status, body))
            }
            Err(ProxyError::BackendNonJson(msg)) => {
                guard.release();
                Err(CoordinatorError::backend_non_json(msg))
            }
            Err(other) => {
                guard.release();
                Err(CoordinatorError::backend_unreachable(other.to_string()))
            }
            Ok(BackendResponse::Json { status, body }) => {
                if is_big {
                    self.finalize_big(&mut guard, &backend, &fp, request_config.words_per_block)
                        .await;
                }
                guard.release();
                Ok(CoordinatorOutcome::Json { status, body })
            }
            Ok(BackendResponse::Stream { status, bytes }) => {
                let finalizer = StreamFinalizer {
                    backend,
                    meta_store: self.meta_store.clone(),
                    guard: Some(guard),
                    fingerprint: fp,
                    is_big,
                    model_id: self.model_id.clone(),
                    words_per_block: request_config.words_per_block,
                };
                Ok(CoordinatorOutcome::Stream {
                    status,
                    bytes: Box::pin(RelayStream {
                        inner: bytes,
                        finalizer: Some(finalizer),
                    }),
                })
            }
        }
    }

    /// Post-generation save + metadata write for a big request (§4.5 step
    /// 6, §7's Save failure row: logged, never propagated to the client).
    async fn finalize_big(
        &self,
        guard: &mut SlotGuard,
        backend: &Arc<dyn BackendAdapter>,
        fp: &PrefixFingerprint,
        words_per_block: u32,
    ) {
        let sid = guard.sid().clone();
        let basename = snapshot_basename(&fp.key);
        match backend.save_slot(sid.local_slot_id, &basename).await {
            Ok(()) => {
                let meta_store = self.meta_store.clone();
                let key = fp.key;
                let prefix_text = fp.prefix_text.clone();
                let block_hashes = fp.block_hashes.clone();
                let model_id = self.model_id.clone();
                let write_result = tokio::task::spawn_blocking(move || {
                    meta_store.write(key, &prefix_text, &block_hashes, words_per_block, &model_id)
                })
                .await;
                match write_result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(%sid, key = %fp.key, error = %err, "post-generation metadata write failed");
                    }
                    Err(err) => {
                        tracing::warn!(%sid, key = %fp.key, error = %err, "metadata write task panicked");
                    }
                }
                let state = guard.state_mut();
                state.heat = Heat::Hot;
                state.big_key = Some(fp.key);
                state.block_hashes = fp.block_hashes.clone();
                state.words_per_block = words_per_block;
                state.last_saved_at = now_secs();
            }
            Err(err) => {
                tracing::warn!(%sid, key = %fp.key, error = %err, "post-generation save_slot failed, slot heat left unchanged");
            }
        }
    }
}

/// Byte-relay wrapper that touches the slot on every chunk and runs the
/// big-request finalizer (save + metadata write + lock release) exactly
/// once, whether the stream is consumed to completion or dropped early by a
/// disconnecting client (§5 "Cancellation and timeouts", §9 "Streaming
/// relay").
struct RelayStream {
    inner: ByteStream,
    finalizer: Option<StreamFinalizer>,
}

impl Stream for RelayStream {
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(_))) = &poll {
            if let Some(finalizer) = this.finalizer.as_mut() {
                finalizer.touch();
            }
        }
        if let Poll::Ready(None) = &poll {
            this.finalizer.take().map(StreamFinalizer::spawn_finish);
        }
        poll
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.spawn_finish();
        }
    }
}

struct StreamFinalizer {
    backend: Arc<dyn BackendAdapter>,
    meta_store: Arc<MetaStore>,
    guard: Option<SlotGuard>,
    fingerprint: PrefixFingerprint,
    is_big: bool,
    model_id: String,
    words_per_block: u32,
}

impl StreamFinalizer {
    fn touch(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            guard.state_mut().last_used_at = now_secs();
        }
    }

    fn spawn_finish(mut self) {
        tokio::spawn(async move {
            if self.is_big {
                let sid = self.guard.as_ref().map(|g| g.sid().clone());
                if let Some(sid) = sid {
                    let basename = snapshot_basename(&self.fingerprint.key);
                    match self.backend.save_slot(sid.local_slot_id, &basename).await {
                        Ok(()) => {
                            let meta_store = self.meta_store.clone();
                            let key = self.fingerprint.key;
                            let prefix_text = self.fingerprint.prefix_text.clone();
                            let block_hashes = self.fingerprint.block_hashes.clone();
                            let model_id = self.model_id.clone();
                            let words_per_block = self.words_per_block;
                            let write_result = tokio::task::spawn_blocking(move || {
                                meta_store.write(key, &prefix_text, &block_hashes, words_per_block, &model_id)
                            })
                            .await;
                            match write_result {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => {
                                    tracing::warn!(%sid, error = %err, "stream finalize: metadata write failed");
                                }
                                Err(err) => {
                                    tracing::warn!(%sid, error = %err, "stream finalize: metadata write task panicked");
                                }
                            }
                            if let Some(guard) = self.guard.as_mut() {
                                let state = guard.state_mut();
                                state.heat = Heat::Hot;
                                state.big_key = Some(self.fingerprint.key);
                                state.block_hashes = self.fingerprint.block_hashes.clone();
                                state.words_per_block = self.words_per_block;
                                state.last_saved_at = now_secs();
                            }
                        }
                        Err(err) => {
                            tracing::warn!(%sid, error = %err, "stream finalize: save_slot failed, slot heat left unchanged");
                        }
                    }
                }
            }
            if let Some(mut guard) = self.guard.take() {
                guard.release();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meta_store::MetaStore;
    use proxy_core::SlotId;
    use slot_table::SlotTable;
    use std::collections::HashSet;

    struct FakeBackend;

    #[async_trait]
    impl BackendAdapter for FakeBackend {
        fn backend_id(&self) -> &str {
            "b1"
        }
        fn n_slots(&self) -> usize {
            1
        }
        async fn forward_chat_completion(
            &self,
            _local_slot_id: usize,
            _body: Value,
            _cache_prompt: bool,
            _stream: bool,
        ) -> Result<BackendResponse, ProxyError> {
            Ok(BackendResponse::Json {
                status: 200,
                body: serde_json::json!({"choices": []}),
            })
        }
        async fn save_slot(&self, _local_slot_id: usize, _basename: &str) -> Result<(), ProxyError> {
            Ok(())
        }
        async fn restore_slot(&self, _local_slot_id: usize, _basename: &str) -> Result<(), ProxyError> {
            Ok(())
        }
        async fn model_id(&self) -> Result<String, ProxyError> {
            Ok("m1".to_string())
        }
    }

    fn request_config() -> RequestConfig {
        RequestConfig {
            words_per_block: 4,
            threshold_mode: proxy_core::ThresholdMode::Words,
            min_prefix_words: 8,
            min_prefix_chars: 64,
            min_prefix_blocks: 2,
            similarity_threshold: 0.75,
        }
    }

    fn coordinator(dir: &tempfile::TempDir) -> Coordinator {
        let table = Arc::new(SlotTable::new(&[("b1".to_string(), 2)]));
        let meta_store = Arc::new(MetaStore::new(dir.path()).unwrap());
        let mut backends: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
        backends.insert("b1".to_string(), Arc::new(FakeBackend));
        let acquirer = Arc::new(SlotAcquirer::new(
            table.clone(),
            meta_store.clone(),
            backends.clone(),
            HashSet::new(),
        ));
        Coordinator::new(
            table,
            meta_store,
            acquirer,
            backends,
            "m1".to_string(),
            CanonicalizationStrategy::default(),
        )
    }

    #[tokio::test]
    async fn small_cold_request_never_saves() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(&dir);
        let body = serde_json::json!({
            "model": "gpt-anything",
            "messages": [{"role": "user", "content": "hi there"}]
        });
        let outcome = coord
            .handle_chat_completion(body, &request_config(), false)
            .await
            .unwrap();
        match outcome {
            CoordinatorOutcome::Json { status, .. } => assert_eq!(status, 200),
            _ => panic!("expected json outcome"),
        }
        assert!(coord.meta_store.scan().is_empty());
    }

    #[tokio::test]
    async fn big_cold_request_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(&dir);
        let text = "a b c d e f g h i j k l m n o p q r s t";
        let body = serde_json::json!({
            "model": "gpt-anything",
            "messages": [{"role": "user", "content": text}]
        });
        let outcome = coord
            .handle_chat_completion(body, &request_config(), false)
            .await
            .unwrap();
        match outcome {
            CoordinatorOutcome::Json { status, .. } => assert_eq!(status, 200),
            _ => panic!("expected json outcome"),
        }
        assert_eq!(coord.meta_store.scan().len(), 1);
    }

    #[tokio::test]
    async fn unknown_backend_releases_slot_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(SlotTable::new(&[("missing".to_string(), 1)]));
        let meta_store = Arc::new(MetaStore::new(dir.path()).unwrap());
        let backends: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
        let acquirer = Arc::new(SlotAcquirer::new(
            table.clone(),
            meta_store.clone(),
            backends.clone(),
            HashSet::new(),
        ));
        let coord = Coordinator::new(
            table.clone(),
            meta_store,
            acquirer,
            backends,
            "m1".to_string(),
            CanonicalizationStrategy::default(),
        );
        let body = serde_json::json!({"model": "x", "messages": []});
        let err = coord
            .handle_chat_completion(body, &request_config(), false)
            .await
            .unwrap_err();
        assert_eq!(err.status, 502);
        let sid = SlotId::new("missing", 0);
        let guard = table.lock(&sid).await.unwrap();
        drop(guard);
    }
}
