//! Constellation hashing
//!
//! Each peak acts as an anchor and is paired with up to `fan_value` target
//! peaks inside a forward time window. A pair packs into a fixed-width
//! integer hash of (anchor bin, target bin, frame delta). Every anchor
//! yields several independent hashes, so losing some peaks to noise only
//! degrades recall instead of breaking the match.

use crate::config::FingerprintConfig;
use crate::peaks::Peak;
use serde::{Deserialize, Serialize};

/// One hashed anchor-target pair, stamped with the anchor's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Landmark {
    pub hash: u32,
    pub anchor_frame: u32,
}

/// Generate the landmark sequence for a peak list.
///
/// `peaks` must be ordered by time frame then frequency bin, which is what
/// [`crate::peaks::extract`] produces. The output is deterministic: anchors
/// are visited in order, and targets are selected by ascending frame delta,
/// then ascending frequency distance.
pub fn generate(peaks: &[Peak], cfg: &FingerprintConfig) -> Vec<Landmark> {
    let mut landmarks = Vec::new();

    for (i, anchor) in peaks.iter().enumerate() {
        let mut targets: Vec<(u32, usize, &Peak)> = Vec::new();
        for target in &peaks[i + 1..] {
            let dt = (target.time_frame - anchor.time_frame) as u32;
            if dt > cfg.target_zone_max {
                break;
            }
            if dt < cfg.target_zone_min {
                continue;
            }
            let df = anchor.freq_bin.abs_diff(target.freq_bin);
            targets.push((dt, df, target));
        }
        targets.sort_by_key(|&(dt, df, peak)| (dt, df, peak.freq_bin));

        for &(dt, _, target) in targets.iter().take(cfg.fan_value) {
            if let Some(hash) = pack_hash(anchor.freq_bin as u32, target.freq_bin as u32, dt, cfg)
            {
                landmarks.push(Landmark {
                    hash,
                    anchor_frame: anchor.time_frame as u32,
                });
            }
        }
    }

    landmarks
}

/// Pack an anchor-target pair into a hash. Returns `None` when a component
/// does not fit its configured width; callers skip such pairs the same way
/// on ingest and on identify.
pub fn pack_hash(f_a: u32, f_b: u32, dt: u32, cfg: &FingerprintConfig) -> Option<u32> {
    if f_a >= 1 << cfg.anchor_freq_bits
        || f_b >= 1 << cfg.target_freq_bits
        || dt >= 1 << cfg.delta_bits
    {
        return None;
    }
    Some((f_a << (cfg.target_freq_bits + cfg.delta_bits)) | (f_b << cfg.delta_bits) | dt)
}
