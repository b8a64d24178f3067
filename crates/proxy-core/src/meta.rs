use crate::hash::Hash256;
use serde::{Deserialize, Serialize};

/// One on-disk metadata record for a content key (§3). Serialized as
/// `<key>.meta.json` by the Metadata Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub key: Hash256,
    pub model_id: String,
    pub words_per_block: u32,
    pub prefix_len_chars: usize,
    pub block_hashes: Vec<Hash256>,
    pub updated_at: u64,
}

impl MetaRecord {
    pub fn snapshot_basename(&self) -> String {
        snapshot_basename(&self.key)
    }
}

/// Basename a backend writes a KV snapshot under for a given content key
/// (§3's `SnapshotFile`). Free function so callers that only have a key
/// (not a full `MetaRecord`) — e.g. the Slot Acquirer evicting a slot's
/// current `big_key` — can derive it too.
pub fn snapshot_basename(key: &Hash256) -> String {
    format!("slotcache_{}.bin", key.to_hex())
}
