use proxy_core::{ChatMessage, Hash256, PrefixFingerprint};
use sha2::{Digest, Sha256};

/// Which convention derives the content key from the canonical prefix
/// (§9 Open Questions: two coexisting hashing conventions were found in the
/// source). `RolelessWithModel` is the default used by `fingerprint()`;
/// `RolelessNoModel` is kept for reading/migrating metadata written under
/// the legacy convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalizationStrategy {
    RolelessNoModel,
    RolelessWithModel,
}

impl Default for CanonicalizationStrategy {
    fn default() -> Self {
        Self::RolelessWithModel
    }
}

/// Derive a `PrefixFingerprint` from a chat message list (§4.1). Pure,
/// synchronous, no I/O.
pub fn fingerprint(
    messages: &[ChatMessage],
    words_per_block: u32,
    model_id: &str,
    strategy: CanonicalizationStrategy,
) -> PrefixFingerprint {
    let prefix_text = canonical_prefix_text(messages);
    let tokens = tokenize(&prefix_text);
    let block_hashes = block_hashes(&tokens, words_per_block);
    let key = content_key(model_id, &prefix_text, strategy);

    PrefixFingerprint {
        word_count: tokens.len(),
        char_count: prefix_text.chars().count(),
        prefix_text,
        block_hashes,
        key,
    }
}

/// Concatenate each message's content in order, separated by a blank line.
/// Role markers are deliberately discarded (§3).
fn canonical_prefix_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Maximal runs of word characters, lowercased, in order (§3's `BlockHash`).
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Hash each non-overlapping run of `words_per_block` tokens; the trailing
/// short block is still hashed, but a zero-token block is never emitted
/// (§4.1 edge cases).
fn block_hashes(tokens: &[String], words_per_block: u32) -> Vec<Hash256> {
    if words_per_block == 0 || tokens.is_empty() {
        return Vec::new();
    }
    tokens
        .chunks(words_per_block as usize)
        .map(|chunk| sha256(chunk.join(" ").as_bytes()))
        .collect()
}

fn content_key(model_id: &str, prefix_text: &str, strategy: CanonicalizationStrategy) -> Hash256 {
    match strategy {
        CanonicalizationStrategy::RolelessWithModel => {
            let mut buf = String::with_capacity(model_id.len() + 1 + prefix_text.len());
            buf.push_str(model_id);
            buf.push('\n');
            buf.push_str(prefix_text);
            sha256(buf.as_bytes())
        }
        CanonicalizationStrategy::RolelessNoModel => sha256(prefix_text.as_bytes()),
    }
}

fn sha256(bytes: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    Hash256(digest.into())
}

/// Number of leading positions where `a[i] == b[i]`; ties broken by position
/// (returns the first point of divergence, §4.1).
pub fn longest_common_prefix(a: &[Hash256], b: &[Hash256]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
