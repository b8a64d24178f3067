use crate::hash::Hash256;
use serde::{Deserialize, Serialize};

/// Identifies one backend-local KV slot (§3). The universe of `SlotId`s is
/// fixed at startup by the configured backend list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub backend_id: String,
    pub local_slot_id: usize,
}

impl SlotId {
    pub fn new(backend_id: impl Into<String>, local_slot_id: usize) -> Self {
        Self {
            backend_id: backend_id.into(),
            local_slot_id,
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.backend_id, self.local_slot_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heat {
    Cold,
    Hot,
}

/// Per-slot state (§3). `words_per_block` and `block_hashes` are carried
/// alongside `big_key` so the Matcher can compute LCP against a hot slot
/// without going back to the Metadata Store.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub heat: Heat,
    pub big_key: Option<Hash256>,
    pub block_hashes: Vec<Hash256>,
    pub words_per_block: u32,
    pub last_used_at: u64,
    pub last_saved_at: u64,
}

impl SlotState {
    pub fn cold() -> Self {
        Self {
            heat: Heat::Cold,
            big_key: None,
            block_hashes: Vec::new(),
            words_per_block: 0,
            last_used_at: 0,
            last_saved_at: 0,
        }
    }

    pub fn is_never_used(&self) -> bool {
        self.last_used_at == 0
    }
}

impl Default for SlotState {
    fn default() -> Self {
        Self::cold()
    }
}
