use matcher::Outcome;
use meta_store::MetaStore;
use proxy_core::meta::snapshot_basename;
use proxy_core::{BackendAdapter, Hash256, Heat, PrefixFingerprint, ProxyError, SlotId, SlotState};
use slot_table::{SlotGuard, SlotTable};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of `acquire`: the held slot and whether it was restored from an
/// on-disk snapshot as part of this acquisition (§4.4's `(sid, restored_flag)`).
pub struct Acquisition {
    pub guard: SlotGuard,
    pub restored: bool,
}

/// Orchestrates selection, eviction-with-save, restore, and lock
/// acquisition (§4.4). Generic over `BackendAdapter` so it never depends on
/// a concrete HTTP client.
pub struct SlotAcquirer {
    table: Arc<SlotTable>,
    meta_store: Arc<MetaStore>,
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
    pinned_keys: HashSet<Hash256>,
}

impl SlotAcquirer {
    pub fn new(
        table: Arc<SlotTable>,
        meta_store: Arc<MetaStore>,
        backends: HashMap<String, Arc<dyn BackendAdapter>>,
        pinned_keys: HashSet<Hash256>,
    ) -> Self {
        Self {
            table,
            meta_store,
            backends,
            pinned_keys,
        }
    }

    /// Acquire a slot for this request. `rejected` is the Matcher's
    /// rejected-but-close active candidate, if any, and MUST be excluded
    /// from cold/restore target selection whenever a non-rejected
    /// alternative exists (§4.3, §4.4, §8).
    pub async fn acquire(
        &self,
        outcome: &Outcome,
        fingerprint: &PrefixFingerprint,
        is_big: bool,
        rejected: Option<&SlotId>,
    ) -> Result<Acquisition, ProxyError> {
        if !is_big {
            let guard = self.select_and_lock(rejected, true).await?;
            return self.downgrade_to_cold(guard).await;
        }

        match outcome {
            Outcome::ActiveExact { sid } | Outcome::ActiveLcp { sid } => {
                let guard = self.table.lock(sid).await.ok_or_else(|| {
                    ProxyError::InvalidConfig(format!("matcher returned unknown slot {sid}"))
                })?;
                Ok(Acquisition {
                    guard,
                    restored: false,
                })
            }
            Outcome::Cold => {
                let mut guard = self.select_and_lock(rejected, false).await?;
                self.evict_if_needed(&mut guard, fingerprint.key).await;
                Ok(Acquisition {
                    guard,
                    restored: false,
                })
            }
            Outcome::RestoreLcp { key } => {
                let mut guard = self.select_and_lock(rejected, false).await?;
                self.evict_if_needed(&mut guard, fingerprint.key).await;
                let restored = self.try_restore(&mut guard, *key).await;
                Ok(Acquisition { guard, restored })
            }
        }
    }

    async fn downgrade_to_cold(&self, mut guard: SlotGuard) -> Result<Acquisition, ProxyError> {
        let state = guard.state_mut();
        state.heat = Heat::Cold;
        state.big_key = None;
        state.block_hashes.clear();
        Ok(Acquisition {
            guard,
            restored: false,
        })
    }

    /// Pick a target SlotId under the process-wide pick lock and acquire
    /// its per-slot lock before releasing the pick lock, so selection and
    /// locking are atomic (§5's ordering guarantee (1)).
    async fn select_and_lock(
        &self,
        rejected: Option<&SlotId>,
        prefer_cold: bool,
    ) -> Result<SlotGuard, ProxyError> {
        let _pick = self.table.pick_lock().await;
        let snapshot = self.table.snapshot().await;
        let sid = select_target(&snapshot, rejected, &self.pinned_keys, prefer_cold)
            .ok_or_else(|| ProxyError::InvalidConfig("no slots configured".to_string()))?;
        self.table
            .lock(&sid)
            .await
            .ok_or_else(|| ProxyError::InvalidConfig(format!("selected unknown slot {sid}")))
    }

    /// Evict the slot's current content if it differs from the key this
    /// request will eventually occupy the slot with (§4.4). A failed save
    /// is logged and the in-memory binding is still overwritten.
    async fn evict_if_needed(&self, guard: &mut SlotGuard, target_key: Hash256) {
        let current = guard.state().big_key;
        if current == Some(target_key) {
            return;
        }
        let Some(old_key) = current else {
            return;
        };
        let sid = guard.sid().clone();
        let Some(backend) = self.backends.get(&sid.backend_id) else {
            tracing::warn!(%sid, "eviction: unknown backend, skipping save");
            self.clear_slot(guard);
            return;
        };

        let basename = snapshot_basename(&old_key);
        match backend.save_slot(sid.local_slot_id, &basename).await {
            Ok(()) => {
                let meta_store = self.meta_store.clone();
                let touch_key = old_key;
                let touch_result = tokio::task::spawn_blocking(move || meta_store.touch(&touch_key)).await;
                match touch_result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(%sid, key = %old_key, error = %err, "eviction: touch failed");
                    }
                    Err(err) => {
                        tracing::warn!(%sid, key = %old_key, error = %err, "eviction: touch task panicked");
                    }
                }
                guard.state_mut().last_saved_at = proxy_core::time::now_secs();
            }
            Err(err) => {
                tracing::warn!(%sid, key = %old_key, error = %err, "eviction: save_slot failed, overwriting in-memory binding anyway");
            }
        }
        self.clear_slot(guard);
    }

    fn clear_slot(&self, guard: &mut SlotGuard) {
        let state = guard.state_mut();
        state.heat = Heat::Cold;
        state.big_key = None;
        state.block_hashes.clear();
    }

    /// Attempt to restore `key`'s snapshot into the slot. On success the
    /// slot becomes hot with `big_key = key`; on failure it stays cold and
    /// the backend will cold-start (§4.4).
    async fn try_restore(&self, guard: &mut SlotGuard, key: Hash256) -> bool {
        let sid = guard.sid().clone();
        let Some(backend) = self.backends.get(&sid.backend_id) else {
            tracing::warn!(%sid, "restore: unknown backend");
            return false;
        };
        let basename = snapshot_basename(&key);
        match backend.restore_slot(sid.local_slot_id, &basename).await {
            Ok(()) => {
                let state = guard.state_mut();
                state.heat = Heat::Hot;
                state.big_key = Some(key);
                true
            }
            Err(err) => {
                tracing::warn!(%sid, key = %key, error = %err, "restore_slot failed, continuing as cold start");
                false
            }
        }
    }
}

/// Selection order (§4.4): a never-used slot excluding rejected; else the
/// global LRU excluding rejected and pinned; else the global LRU
/// unconditionally. `prefer_cold` additionally prefers a cold slot within
/// each tier for small requests, since a cold slot costs nothing to reuse.
fn select_target(
    snapshot: &[(SlotId, SlotState)],
    rejected: Option<&SlotId>,
    pinned: &HashSet<Hash256>,
    prefer_cold: bool,
) -> Option<SlotId> {
    let is_rejected = |sid: &SlotId| rejected.map(|r| r == sid).unwrap_or(false);
    let is_pinned = |state: &SlotState| {
        state
            .big_key
            .map(|k| pinned.contains(&k))
            .unwrap_or(false)
    };

    let never_used = snapshot
        .iter()
        .filter(|(sid, state)| state.is_never_used() && !is_rejected(sid))
        .map(|(sid, _)| sid.clone())
        .next();
    if let Some(sid) = never_used {
        return Some(sid);
    }

    let tier2 = snapshot
        .iter()
        .filter(|(sid, state)| !is_rejected(sid) && !is_pinned(state))
        .min_by_key(|(_, state)| (prefer_cold && state.heat == Heat::Hot, state.last_used_at));
    if let Some((sid, _)) = tier2 {
        return Some(sid.clone());
    }

    snapshot
        .iter()
        .min_by_key(|(_, state)| (prefer_cold && state.heat == Heat::Hot, state.last_used_at))
        .map(|(sid, _)| sid.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fingerprint::{fingerprint, CanonicalizationStrategy};
    use proxy_core::backend::BackendResponse;
    use proxy_core::ChatMessage;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeBackend {
        saved: AsyncMutex<Vec<(usize, String)>>,
        restored: AsyncMutex<Vec<(usize, String)>>,
        fail_save: bool,
        fail_restore: bool,
    }

    #[async_trait]
    impl BackendAdapter for FakeBackend {
        fn backend_id(&self) -> &str {
            "b1"
        }
        fn n_slots(&self) -> usize {
            2
        }
        async fn forward_chat_completion(
            &self,
            _local_slot_id: usize,
            _body: serde_json::Value,
            _cache_prompt: bool,
            _stream: bool,
        ) -> Result<BackendResponse, ProxyError> {
            unimplemented!()
        }
        async fn save_slot(&self, local_slot_id: usize, basename: &str) -> Result<(), ProxyError> {
            if self.fail_save {
                return Err(ProxyError::BackendHttpError {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            self.saved
                .lock()
                .await
                .push((local_slot_id, basename.to_string()));
            Ok(())
        }
        async fn restore_slot(&self, local_slot_id: usize, basename: &str) -> Result<(), ProxyError> {
            if self.fail_restore {
                return Err(ProxyError::BackendHttpError {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            self.restored
                .lock()
                .await
                .push((local_slot_id, basename.to_string()));
            Ok(())
        }
        async fn model_id(&self) -> Result<String, ProxyError> {
            Ok("m1".to_string())
        }
    }

    fn fp(text: &str) -> PrefixFingerprint {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: text.to_string(),
        }];
        fingerprint(&messages, 4, "m1", CanonicalizationStrategy::default())
    }

    fn acquirer(backend: FakeBackend) -> (SlotAcquirer, Arc<SlotTable>, tempfile::TempDir) {
        let table = Arc::new(SlotTable::new(&[("b1".to_string(), 2)]));
        let dir = tempfile::tempdir().unwrap();
        let meta_store = Arc::new(MetaStore::new(dir.path()).unwrap());
        let mut backends: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
        backends.insert("b1".to_string(), Arc::new(backend));
        (
            SlotAcquirer::new(table.clone(), meta_store, backends, HashSet::new()),
            table,
            dir,
        )
    }

    #[tokio::test]
    async fn cold_outcome_picks_never_used_slot_first() {
        let (acq, _table, _dir) = acquirer(FakeBackend::default());
        let request = fp("hello there friend");
        let acquisition = acq.acquire(&Outcome::Cold, &request, true, None).await.unwrap();
        assert_eq!(acquisition.guard.sid().local_slot_id, 0);
        assert!(!acquisition.restored);
    }

    #[tokio::test]
    async fn restore_outcome_calls_backend_restore_and_marks_hot() {
        let (acq, _table, _dir) = acquirer(FakeBackend::default());
        let request = fp("hello there friend");
        let restore_key = request.key;
        let acquisition = acq
            .acquire(&Outcome::RestoreLcp { key: restore_key }, &request, true, None)
            .await
            .unwrap();
        assert!(acquisition.restored);
        assert_eq!(acquisition.guard.state().big_key, Some(restore_key));
        assert_eq!(acquisition.guard.state().heat, Heat::Hot);
    }

    #[tokio::test]
    async fn rejected_slot_is_excluded_when_alternative_exists() {
        let (acq, table, _dir) = acquirer(FakeBackend::default());
        let rejected = table.slot_ids()[0].clone();
        let request = fp("hello there friend");
        let acquisition = acq
            .acquire(&Outcome::Cold, &request, true, Some(&rejected))
            .await
            .unwrap();
        assert_ne!(*acquisition.guard.sid(), rejected);
    }

    #[tokio::test]
    async fn small_request_never_evicts_and_ends_cold() {
        let (acq, _table, _dir) = acquirer(FakeBackend::default());
        let request = fp("hi");
        let acquisition = acq.acquire(&Outcome::Cold, &request, false, None).await.unwrap();
        assert_eq!(acquisition.guard.state().heat, Heat::Cold);
        assert!(acquisition.guard.state().big_key.is_none());
    }

    #[tokio::test]
    async fn eviction_save_failure_still_overwrites_binding() {
        let backend = FakeBackend {
            fail_save: true,
            ..Default::default()
        };
        let (acq, table, _dir) = acquirer(backend);
        let sid = table.slot_ids()[0].clone();
        {
            let mut guard = table.lock(&sid).await.unwrap();
            let state = guard.state_mut();
            state.heat = Heat::Hot;
            state.big_key = Some(Hash256([9; 32]));
            state.last_used_at = 5;
        }

        let request = fp("a brand new prefix that differs entirely");
        let acquisition = acq.acquire(&Outcome::Cold, &request, true, None).await.unwrap();
        assert!(acquisition.guard.state().big_key.is_none() || acquisition.guard.state().big_key != Some(Hash256([9; 32])));
    }
}
