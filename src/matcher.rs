//! Offset histogram voting
//!
//! A true match aligns: every correct hash coincidence between the query
//! and a stored track shares the same reference-minus-query time offset,
//! while spurious coincidences scatter. Counting votes per (track, offset)
//! and taking each track's best bin isolates the aligned signal.

use crate::config::MatcherConfig;
use crate::error::EngineError;
use crate::fingerprint::Landmark;
use crate::store::IndexStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A scored track candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub track_id: i64,
    /// Vote count of the best offset bin.
    pub score: u32,
    /// Estimated reference offset of the query, in frames. Positive means
    /// the query starts that far into the stored track.
    pub offset_frames: i64,
    /// Total matched hash pairs for this track across all offsets.
    pub matched_hashes: u32,
}

/// Match query landmarks against the index and rank the candidates.
///
/// Returns the ranked list when the best candidate passes acceptance
/// (`score_min`, and `margin` over the runner-up unless it is the only
/// candidate above `score_min`), and an empty list otherwise. Empty or
/// unmatched queries yield an empty list, never an error.
pub fn match_landmarks<S>(
    query: &[Landmark],
    store: &S,
    cfg: &MatcherConfig,
) -> Result<Vec<Candidate>, EngineError>
where
    S: IndexStore + ?Sized,
{
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let mut anchors_by_hash: HashMap<u32, Vec<u32>> = HashMap::new();
    for lm in query {
        anchors_by_hash.entry(lm.hash).or_default().push(lm.anchor_frame);
    }
    let hashes: Vec<u32> = anchors_by_hash.keys().copied().collect();
    let hits = store.lookup_many(&hashes)?;

    let quant = cfg.offset_quantization.max(1) as i64;
    let mut histograms: HashMap<i64, HashMap<i64, u32>> = HashMap::new();
    let mut totals: HashMap<i64, u32> = HashMap::new();
    for hit in &hits {
        let Some(query_frames) = anchors_by_hash.get(&hit.hash) else {
            continue;
        };
        for &query_frame in query_frames {
            let offset = hit.anchor_frame as i64 - query_frame as i64;
            let bin = offset.div_euclid(quant);
            *histograms
                .entry(hit.track_id)
                .or_default()
                .entry(bin)
                .or_default() += 1;
            *totals.entry(hit.track_id).or_default() += 1;
        }
    }

    let mut candidates: Vec<Candidate> = histograms
        .into_iter()
        .map(|(track_id, histogram)| {
            let (bin, score) = histogram
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(&bin, &count)| (bin, count))
                .unwrap_or((0, 0));
            Candidate {
                track_id,
                score,
                offset_frames: bin * quant,
                matched_hashes: totals.get(&track_id).copied().unwrap_or(0),
            }
        })
        .collect();

    candidates.sort_unstable_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.matched_hashes.cmp(&a.matched_hashes))
            .then_with(|| a.track_id.cmp(&b.track_id))
    });

    if !accepted(&candidates, cfg) {
        return Ok(Vec::new());
    }
    Ok(candidates)
}

fn accepted(candidates: &[Candidate], cfg: &MatcherConfig) -> bool {
    let Some(top) = candidates.first() else {
        return false;
    };
    if top.score < cfg.score_min {
        return false;
    }
    let above_minimum = candidates
        .iter()
        .filter(|c| c.score >= cfg.score_min)
        .count();
    if above_minimum <= 1 {
        return true;
    }
    top.score as f32 / candidates[1].score as f32 >= cfg.margin
}
