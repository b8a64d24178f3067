use crate::hash::Hash256;

/// Derived, immutable per-request fingerprint of a chat message list's
/// canonical prefix (§3). Constructed by the `fingerprint` crate; this is
/// just the data shape shared across crates.
#[derive(Debug, Clone)]
pub struct PrefixFingerprint {
    pub prefix_text: String,
    pub block_hashes: Vec<Hash256>,
    pub key: Hash256,
    pub word_count: usize,
    pub char_count: usize,
}

impl PrefixFingerprint {
    pub fn is_empty(&self) -> bool {
        self.block_hashes.is_empty()
    }
}
