use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

pub type ByteStream = BoxStream<'static, Result<Bytes, ProxyError>>;

/// A chat-completion response from the backend, either buffered JSON or a
/// raw byte stream to relay verbatim (§1: "opaque byte relay").
pub enum BackendResponse {
    Json { status: u16, body: Value },
    Stream { status: u16, bytes: ByteStream },
}

/// Opaque contract for one inference backend (§4.3, §6). The coordinator and
/// slot acquirer depend on this trait only, never on a concrete HTTP client,
/// so they can be exercised against a fake in tests.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier for this backend, used as the first half of a `SlotId`.
    fn backend_id(&self) -> &str;

    /// Number of local slots this backend exposes.
    fn n_slots(&self) -> usize;

    /// Forward a chat-completion request, injecting cache/slot parameters.
    async fn forward_chat_completion(
        &self,
        local_slot_id: usize,
        body: Value,
        cache_prompt: bool,
        stream: bool,
    ) -> Result<BackendResponse, ProxyError>;

    /// Persist the slot's current KV state to `basename` on the backend's disk.
    async fn save_slot(&self, local_slot_id: usize, basename: &str) -> Result<(), ProxyError>;

    /// Restore a previously saved KV snapshot into the slot.
    async fn restore_slot(&self, local_slot_id: usize, basename: &str) -> Result<(), ProxyError>;

    /// The backend's reported model identifier (used only to build the
    /// content key, never exposed to clients — §6's `/v1/models` always
    /// answers with the proxy's configured name).
    async fn model_id(&self) -> Result<String, ProxyError>;
}

/// Inject the slot identifier at root, in an `options` sub-object, and as a
/// query-string fragment appended to `path` (§9: "slot identity
/// triplication", preserved exactly as a defensive accommodation of
/// backend-version drift). Centralized here so both the streaming and
/// non-streaming forwarding paths share one implementation.
pub fn inject_slot_identity(mut body: Value, local_slot_id: usize, cache_prompt: bool) -> Value {
    if let Value::Object(ref mut map) = body {
        map.insert("cache_prompt".into(), Value::Bool(cache_prompt));
        map.insert("n_keep".into(), Value::from(-1));
        map.insert("slot_id".into(), Value::from(local_slot_id));
        map.insert("id_slot".into(), Value::from(local_slot_id));

        let options = map
            .entry("options")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(opts) = options {
            opts.insert("slot_id".into(), Value::from(local_slot_id));
            opts.insert("id_slot".into(), Value::from(local_slot_id));
        }
    }
    body
}

pub fn slot_identity_query(local_slot_id: usize) -> String {
    format!("slot_id={local_slot_id}&id_slot={local_slot_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injects_slot_id_at_three_positions() {
        let body = json!({"model": "x", "messages": []});
        let out = inject_slot_identity(body, 3, true);
        assert_eq!(out["slot_id"], 3);
        assert_eq!(out["id_slot"], 3);
        assert_eq!(out["options"]["slot_id"], 3);
        assert_eq!(out["options"]["id_slot"], 3);
        assert_eq!(out["cache_prompt"], true);
        assert_eq!(out["n_keep"], -1);
    }

    #[test]
    fn query_string_carries_both_aliases() {
        assert_eq!(slot_identity_query(2), "slot_id=2&id_slot=2");
    }
}
