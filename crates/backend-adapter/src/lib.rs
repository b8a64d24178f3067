use async_trait::async_trait;
use futures::StreamExt;
use proxy_core::backend::{inject_slot_identity, slot_identity_query, BackendResponse};
use proxy_core::{BackendAdapter, ProxyError};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;

/// `BackendAdapter` backed by one `reqwest::Client` per backend (§4.3/§6).
/// Connection pooling is per-backend, never shared, so one slow backend
/// cannot starve another's connection pool.
pub struct HttpBackendAdapter {
    backend_id: String,
    base_url: String,
    n_slots: usize,
    client: reqwest::Client,
    cached_model_id: Mutex<Option<String>>,
}

impl HttpBackendAdapter {
    pub fn new(
        backend_id: impl Into<String>,
        base_url: impl Into<String>,
        n_slots: usize,
        request_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProxyError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            backend_id: backend_id.into(),
            base_url: base_url.into(),
            n_slots,
            client,
            cached_model_id: Mutex::new(None),
        })
    }

    fn chat_completions_url(&self, local_slot_id: usize) -> String {
        format!(
            "{}/v1/chat/completions?{}",
            self.base_url,
            slot_identity_query(local_slot_id)
        )
    }

    fn slot_action_url(&self, local_slot_id: usize, action: &str) -> String {
        format!("{}/slots/{local_slot_id}?action={action}", self.base_url)
    }

    async fn slot_action(
        &self,
        local_slot_id: usize,
        action: &str,
        basename: &str,
    ) -> Result<(), ProxyError> {
        let url = self.slot_action_url(local_slot_id, action);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "filename": basename }))
            .send()
            .await
            .map_err(|e| ProxyError::BackendUnreachable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::BackendHttpError { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for HttpBackendAdapter {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn n_slots(&self) -> usize {
        self.n_slots
    }

    async fn forward_chat_completion(
        &self,
        local_slot_id: usize,
        body: Value,
        cache_prompt: bool,
        stream: bool,
    ) -> Result<BackendResponse, ProxyError> {
        let body = inject_slot_identity(body, local_slot_id, cache_prompt);
        let url = self.chat_completions_url(local_slot_id);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::BackendUnreachable(e.to_string()))?;

        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::BackendHttpError { status, body });
        }

        if stream {
            let bytes = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| ProxyError::BackendUnreachable(e.to_string())))
                .boxed();
            Ok(BackendResponse::Stream { status, bytes })
        } else {
            let text = resp
                .text()
                .await
                .map_err(|e| ProxyError::BackendUnreachable(e.to_string()))?;
            let value: Value = serde_json::from_str(&text)
                .map_err(|_| ProxyError::BackendNonJson(text))?;
            Ok(BackendResponse::Json { status, body: value })
        }
    }

    async fn save_slot(&self, local_slot_id: usize, basename: &str) -> Result<(), ProxyError> {
        self.slot_action(local_slot_id, "save", basename).await
    }

    async fn restore_slot(&self, local_slot_id: usize, basename: &str) -> Result<(), ProxyError> {
        self.slot_action(local_slot_id, "restore", basename).await
    }

    async fn model_id(&self) -> Result<String, ProxyError> {
        {
            let cached = self.cached_model_id.lock().await;
            if let Some(id) = cached.as_ref() {
                return Ok(id.clone());
            }
        }

        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProxyError::BackendUnreachable(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::BackendHttpError { status, body });
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::BackendNonJson(e.to_string()))?;
        let id = value
            .get("data")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::BackendNonJson("missing data[0].id".to_string()))?
            .to_string();

        *self.cached_model_id.lock().await = Some(id.clone());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_completions_url_carries_both_slot_aliases() {
        let adapter =
            HttpBackendAdapter::new("b1", "http://localhost:8080", 4, Duration::from_secs(30))
                .unwrap();
        let url = adapter.chat_completions_url(2);
        assert!(url.contains("slot_id=2"));
        assert!(url.contains("id_slot=2"));
    }

    #[test]
    fn slot_action_url_encodes_action_and_id() {
        let adapter =
            HttpBackendAdapter::new("b1", "http://localhost:8080", 4, Duration::from_secs(30))
                .unwrap();
        assert_eq!(
            adapter.slot_action_url(3, "save"),
            "http://localhost:8080/slots/3?action=save"
        );
    }
}
