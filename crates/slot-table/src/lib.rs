use proxy_core::{SlotId, SlotState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

/// In-memory state of every `(backend_id, local_slot_id)` pair (§3, §4.4).
/// Each slot has its own mutex; `pick_lock` is the process-wide mutex that
/// makes "pick a candidate, then acquire its lock" atomic across concurrent
/// acquirers (§5's ordering guarantee (1)).
pub struct SlotTable {
    slots: HashMap<SlotId, Arc<Mutex<SlotState>>>,
    order: Vec<SlotId>,
    pick_lock: Mutex<()>,
}

impl SlotTable {
    /// Build the fixed universe of slots from a backend list of
    /// `(backend_id, n_slots)` pairs. The universe never changes after
    /// construction (§3: "fixed at startup").
    pub fn new(backends: &[(String, usize)]) -> Self {
        let mut slots = HashMap::new();
        let mut order = Vec::new();
        for (backend_id, n_slots) in backends {
            for local_slot_id in 0..*n_slots {
                let sid = SlotId::new(backend_id.clone(), local_slot_id);
                slots.insert(sid.clone(), Arc::new(Mutex::new(SlotState::cold())));
                order.push(sid);
            }
        }
        Self {
            slots,
            order,
            pick_lock: Mutex::new(()),
        }
    }

    pub fn slot_ids(&self) -> &[SlotId] {
        &self.order
    }

    /// Hold this across the matching-and-selection decision so that two
    /// concurrent callers cannot both pick the same SlotId.
    pub async fn pick_lock(&self) -> MutexGuard<'_, ()> {
        self.pick_lock.lock().await
    }

    /// A consistent-enough-for-matching read of every slot's state. Not
    /// synchronized with concurrent writers as a whole (§4.2's analogous
    /// tolerance for `scan()`); each individual slot's value is exact.
    pub async fn snapshot(&self) -> Vec<(SlotId, SlotState)> {
        let mut out = Vec::with_capacity(self.order.len());
        for sid in &self.order {
            let handle = self.slots.get(sid).expect("slot universe is fixed");
            let state = handle.lock().await.clone();
            out.push((sid.clone(), state));
        }
        out
    }

    /// Acquire the per-slot lock, returning an RAII guard. Call while
    /// holding `pick_lock` to keep the pick-then-lock sequence atomic.
    pub async fn lock(&self, sid: &SlotId) -> Option<SlotGuard> {
        let handle = Arc::clone(self.slots.get(sid)?);
        let guard = handle.lock_owned().await;
        Some(SlotGuard {
            sid: sid.clone(),
            guard: Some(guard),
        })
    }
}

/// RAII handle on a held slot lock. Releases on `Drop`; `release()` can be
/// called explicitly and is idempotent — dropping an already-released guard
/// is a no-op, never a double-unlock (§7).
pub struct SlotGuard {
    sid: SlotId,
    guard: Option<OwnedMutexGuard<SlotState>>,
}

impl SlotGuard {
    pub fn sid(&self) -> &SlotId {
        &self.sid
    }

    pub fn state(&self) -> &SlotState {
        self.guard.as_ref().expect("state accessed after release")
    }

    pub fn state_mut(&mut self) -> &mut SlotState {
        self.guard.as_mut().expect("state accessed after release")
    }

    /// Release the lock now instead of waiting for `Drop`. Safe to call
    /// more than once.
    pub fn release(&mut self) {
        self.guard.take();
    }
}
