//! Spectral peak extraction
//!
//! A peak is a bin that dominates its time-frequency neighborhood and sits
//! above a per-frame adaptive threshold. Sparse, locally maximal peaks
//! survive additive noise and speaker coloration, which is what makes the
//! downstream hashes robust.

use crate::config::PeakConfig;
use crate::spectrogram::Spectrogram;
use ndarray::Array2;
use std::cmp::Ordering;

/// A local maximum of the spectrogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub freq_bin: usize,
    pub time_frame: usize,
    /// dB magnitude at the peak.
    pub magnitude: f32,
}

/// Extract peaks from `spec`, ordered by time frame then frequency bin.
///
/// Bins clamped to `db_floor` never qualify: a flat floor plateau would
/// otherwise emit one degenerate peak per neighborhood.
pub fn extract(spec: &Spectrogram, cfg: &PeakConfig, db_floor: f32) -> Vec<Peak> {
    let (bins, frames) = spec.data.dim();
    if bins == 0 || frames == 0 {
        return Vec::new();
    }

    let thresholds: Vec<f32> = (0..frames)
        .map(|t| {
            let column = spec.data.column(t);
            let mean = column.mean().unwrap_or(db_floor);
            let std = column.std(0.0);
            (mean + cfg.threshold_sigma * std).max(db_floor)
        })
        .collect();

    let mut peaks = Vec::new();
    for t in 0..frames {
        for f in 0..bins {
            let value = spec.data[[f, t]];
            if value <= db_floor || value < thresholds[t] {
                continue;
            }
            if dominates_neighborhood(&spec.data, f, t, value, cfg) {
                peaks.push(Peak {
                    freq_bin: f,
                    time_frame: t,
                    magnitude: value,
                });
            }
        }
    }

    let cap = (cfg.peaks_per_second_cap as f32 * spec.duration_seconds()).ceil() as usize;
    if cap > 0 && peaks.len() > cap {
        peaks.sort_unstable_by(|a, b| {
            b.magnitude
                .partial_cmp(&a.magnitude)
                .unwrap_or(Ordering::Equal)
                .then_with(|| (a.time_frame, a.freq_bin).cmp(&(b.time_frame, b.freq_bin)))
        });
        peaks.truncate(cap);
        peaks.sort_unstable_by_key(|p| (p.time_frame, p.freq_bin));
    }

    peaks
}

/// True when `(f, t)` holds the neighborhood maximum. Ties are broken in
/// favor of the lexicographically smallest `(f, t)`, so exactly one bin
/// survives per tie group.
fn dominates_neighborhood(
    data: &Array2<f32>,
    f: usize,
    t: usize,
    value: f32,
    cfg: &PeakConfig,
) -> bool {
    let (bins, frames) = data.dim();
    let f_lo = f.saturating_sub(cfg.freq_neighborhood);
    let f_hi = (f + cfg.freq_neighborhood).min(bins - 1);
    let t_lo = t.saturating_sub(cfg.time_neighborhood);
    let t_hi = (t + cfg.time_neighborhood).min(frames - 1);

    for nf in f_lo..=f_hi {
        for nt in t_lo..=t_hi {
            let neighbor = data[[nf, nt]];
            if neighbor > value {
                return false;
            }
            if neighbor == value && (nf, nt) < (f, t) {
                return false;
            }
        }
    }
    true
}
