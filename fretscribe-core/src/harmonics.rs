//! # Harmonic Resolution
//!
//! Guitar partials sit at integer multiples of the fundamental, so a single
//! played note shows up as a whole family of spectral peaks. This module
//! walks the peaks from strongest to weakest, lets each unclaimed peak claim
//! its harmonic partials, and keeps the peaks that look like real
//! fundamentals. Without this step the octave-up partials would be reported
//! as extra notes.

use serde::{Deserialize, Serialize};

use crate::peaks::Peak;
use crate::tuning::BinScale;

/// A peak accepted as the fundamental of a played note.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fundamental {
    pub peak: Peak,
    /// Sum of `decay^(h-1)` over the harmonics found.
    pub harmonic_score: f32,
    pub harmonic_count: usize,
}

/// Settings for [`resolve_fundamentals`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicParams {
    pub max_harmonics: usize,
    pub decay_factor: f32,
    pub tolerance_cents: f32,
    pub fundamental_boost: f32,
}

/// A peak with its per-frame claim flag.
#[derive(Debug, Clone, Copy)]
struct Slot {
    peak: Peak,
    claimed: bool,
}

/// Groups a frame's peaks into fundamentals and their harmonics.
///
/// A candidate is confirmed if at least one harmonic was found for it, or if
/// its magnitude exceeds `threshold * fundamental_boost` on its own. Equal
/// magnitudes keep their input order.
pub fn resolve_fundamentals(
    peaks: &[Peak],
    threshold: f32,
    params: &HarmonicParams,
    scale: &BinScale,
) -> Vec<Fundamental> {
    let mut slots: Vec<Slot> = peaks
        .iter()
        .map(|&peak| Slot {
            peak,
            claimed: false,
        })
        .collect();
    // Stable sort: ties stay in input order.
    slots.sort_by(|a, b| b.peak.magnitude.total_cmp(&a.peak.magnitude));

    let tolerance = scale.cents_to_bins(params.tolerance_cents);
    let mut fundamentals = Vec::new();

    for i in 0..slots.len() {
        if slots[i].claimed {
            continue;
        }
        slots[i].claimed = true;
        let candidate = slots[i].peak;

        let mut harmonic_score = 0.0;
        let mut harmonic_count = 0;
        for h in 2..=params.max_harmonics {
            let expected = candidate.bin + scale.harmonic_offset(h);
            let nearest = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.claimed)
                .map(|(j, slot)| (j, (slot.peak.bin - expected).abs()))
                .filter(|&(_, distance)| distance <= tolerance)
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((j, _)) = nearest {
                slots[j].claimed = true;
                harmonic_score += params.decay_factor.powi(h as i32 - 1);
                harmonic_count += 1;
            }
        }

        if harmonic_count > 0 || candidate.magnitude > threshold * params.fundamental_boost {
            fundamentals.push(Fundamental {
                peak: candidate,
                harmonic_score,
                harmonic_count,
            });
        }
    }

    fundamentals
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn scale() -> BinScale {
        BinScale::new(12, 65.406)
    }

    fn params() -> HarmonicParams {
        HarmonicParams {
            max_harmonics: 6,
            decay_factor: 0.8,
            tolerance_cents: 50.0,
            fundamental_boost: 2.0,
        }
    }

    fn peak(bin: f32, magnitude: f32) -> Peak {
        let scale = scale();
        Peak {
            bin,
            magnitude,
            frequency: scale.bin_to_frequency(bin),
            midi: scale.bin_to_midi(bin),
        }
    }

    #[test]
    fn octave_partial_is_absorbed() {
        let peaks = [peak(21.0, 1.0), peak(33.02, 0.5)];
        let fundamentals = resolve_fundamentals(&peaks, 0.05, &params(), &scale());
        assert_eq!(fundamentals.len(), 1);
        assert_abs_diff_eq!(fundamentals[0].peak.bin, 21.0);
        assert_eq!(fundamentals[0].harmonic_count, 1);
        assert_abs_diff_eq!(fundamentals[0].harmonic_score, 0.8, epsilon = 1e-6);
    }

    #[test]
    fn harmonic_series_accumulates_decayed_weights() {
        // Fundamental with partials 2, 3 and 4 (offsets 12, 19.02, 24 bins).
        let peaks = [
            peak(10.0, 1.0),
            peak(22.0, 0.6),
            peak(29.02, 0.4),
            peak(34.0, 0.3),
        ];
        let fundamentals = resolve_fundamentals(&peaks, 0.05, &params(), &scale());
        assert_eq!(fundamentals.len(), 1);
        assert_eq!(fundamentals[0].harmonic_count, 3);
        assert_abs_diff_eq!(
            fundamentals[0].harmonic_score,
            0.8 + 0.64 + 0.512,
            epsilon = 1e-5
        );
    }

    #[test]
    fn lone_peak_needs_the_boost_margin() {
        let weak = [peak(30.0, 0.15)];
        assert!(resolve_fundamentals(&weak, 0.1, &params(), &scale()).is_empty());
        let strong = [peak(30.0, 0.25)];
        assert_eq!(resolve_fundamentals(&strong, 0.1, &params(), &scale()).len(), 1);
    }

    #[test]
    fn out_of_tolerance_partial_stays_independent() {
        // 12.8 bins above is 80 cents away from the octave: not a harmonic.
        let peaks = [peak(10.0, 1.0), peak(22.8, 0.9)];
        let fundamentals = resolve_fundamentals(&peaks, 0.1, &params(), &scale());
        assert_eq!(fundamentals.len(), 2);
        assert!(fundamentals.iter().all(|f| f.harmonic_count == 0));
    }

    #[test]
    fn fifth_apart_notes_both_survive() {
        // E3 (bin 16) and B3 (bin 23), each with an octave partial. B3's octave
        // coincides with E3's third partial, so E3 claims it; B3 still stands
        // on its own magnitude.
        let peaks = [
            peak(16.0, 1.0),
            peak(28.0, 0.5),
            peak(23.0, 0.9),
            peak(35.0, 0.45),
        ];
        let fundamentals = resolve_fundamentals(&peaks, 0.05, &params(), &scale());
        let bins: Vec<f32> = fundamentals.iter().map(|f| f.peak.bin).collect();
        assert_eq!(bins, vec![16.0, 23.0]);
        assert_eq!(fundamentals[0].harmonic_count, 2);
        assert_eq!(fundamentals[1].harmonic_count, 0);
    }

    #[test]
    fn no_peaks_no_fundamentals() {
        assert!(resolve_fundamentals(&[], 0.1, &params(), &scale()).is_empty());
    }
}
