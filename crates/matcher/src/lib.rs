use fingerprint::longest_common_prefix;
use proxy_core::{Hash256, MetaRecord, PrefixFingerprint, SlotId, SlotState};

/// Outcome of matching, in priority order: an exact hit on an active slot
/// beats a similarity hit on an active slot, which beats a similarity hit
/// against on-disk metadata, which beats starting cold (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    ActiveExact { sid: SlotId },
    ActiveLcp { sid: SlotId },
    RestoreLcp { key: Hash256 },
    Cold,
}

/// Result of a match: the outcome plus, if an active candidate existed but
/// was rejected for insufficient similarity, its SlotId — callers MUST
/// exclude this SlotId from cold/restore target selection (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub outcome: Outcome,
    pub rejected_active: Option<SlotId>,
}

/// Find the best active-slot and on-disk-metadata candidates for a request
/// fingerprint against the current Slot Table snapshot and Metadata Store
/// scan (§4.3). Pure with respect to its inputs; performs no I/O and
/// mutates nothing.
pub fn matches(
    request: &PrefixFingerprint,
    words_per_block: u32,
    model_id: &str,
    slots: &[(SlotId, SlotState)],
    records: &[MetaRecord],
    similarity_threshold: f64,
) -> MatchResult {
    let active = best_active_candidate(request, words_per_block, slots);

    if let Some((sid, lcp, candidate_len)) = &active {
        if *lcp == request.block_hashes.len() && *candidate_len == request.block_hashes.len() {
            return MatchResult {
                outcome: Outcome::ActiveExact { sid: sid.clone() },
                rejected_active: None,
            };
        }
        let ratio = similarity_ratio(*lcp, request.block_hashes.len(), *candidate_len);
        if ratio >= similarity_threshold {
            return MatchResult {
                outcome: Outcome::ActiveLcp { sid: sid.clone() },
                rejected_active: None,
            };
        }
    }

    let rejected_active = active.map(|(sid, _, _)| sid);

    if let Some(key) = best_restore_candidate(
        request,
        words_per_block,
        model_id,
        records,
        similarity_threshold,
    ) {
        return MatchResult {
            outcome: Outcome::RestoreLcp { key },
            rejected_active,
        };
    }

    MatchResult {
        outcome: Outcome::Cold,
        rejected_active,
    }
}

/// Returns `(sid, lcp, candidate_block_count)` for the hot slot with
/// maximum `lcp` against `request`, tie-broken by most-recent
/// `last_used_at` (§4.3).
fn best_active_candidate(
    request: &PrefixFingerprint,
    words_per_block: u32,
    slots: &[(SlotId, SlotState)],
) -> Option<(SlotId, usize, usize)> {
    slots
        .iter()
        .filter(|(_, state)| state.heat == proxy_core::Heat::Hot)
        .filter(|(_, state)| state.words_per_block == words_per_block)
        .map(|(sid, state)| {
            let lcp = longest_common_prefix(&request.block_hashes, &state.block_hashes);
            (sid.clone(), lcp, state.block_hashes.len(), state.last_used_at)
        })
        .max_by(|a, b| a.1.cmp(&b.1).then(a.3.cmp(&b.3)))
        .map(|(sid, lcp, len, _)| (sid, lcp, len))
}

fn best_restore_candidate(
    request: &PrefixFingerprint,
    words_per_block: u32,
    model_id: &str,
    records: &[MetaRecord],
    similarity_threshold: f64,
) -> Option<Hash256> {
    records
        .iter()
        .filter(|r| r.model_id == model_id && r.words_per_block == words_per_block)
        .map(|r| {
            let lcp = longest_common_prefix(&request.block_hashes, &r.block_hashes);
            (r, lcp)
        })
        .max_by_key(|(r, lcp)| (*lcp, r.updated_at))
        .filter(|(r, lcp)| {
            similarity_ratio(*lcp, request.block_hashes.len(), r.block_hashes.len())
                >= similarity_threshold
        })
        .map(|(r, _)| r.key)
}

fn similarity_ratio(lcp: usize, request_len: usize, candidate_len: usize) -> f64 {
    let denom = request_len.min(candidate_len);
    if denom == 0 {
        return 0.0;
    }
    lcp as f64 / denom as f64
}
