//! # Peak Picking
//!
//! Finds the local maxima of a magnitude frame that clear the frame's
//! threshold and refines each one to sub-bin precision with parabolic
//! interpolation.

use serde::{Deserialize, Serialize};

use crate::tuning::BinScale;

/// Denominators smaller than this are treated as a flat top (offset 0).
const FLAT_TOP_EPSILON: f32 = 1e-12;

/// A spectral peak refined to sub-bin precision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Interpolated bin position.
    pub bin: f32,
    /// Interpolated magnitude.
    pub magnitude: f32,
    pub frequency: f32,
    /// Fractional MIDI pitch.
    pub midi: f32,
}

/// Parabolic interpolation through three equally spaced samples around a
/// maximum at the centre one. Returns `(offset, magnitude)` where `offset`
/// lies in [-0.5, 0.5] for a true local maximum.
pub fn parabolic_interpolation(left: f32, centre: f32, right: f32) -> (f32, f32) {
    let denominator = left - 2.0 * centre + right;
    let offset = if denominator.abs() < FLAT_TOP_EPSILON {
        0.0
    } else {
        0.5 * (left - right) / denominator
    };
    let magnitude = centre - 0.25 * (left - right) * offset;
    (offset, magnitude)
}

/// Returns every interior local maximum of `magnitudes` above `threshold`.
/// An empty result is valid (silence).
pub fn pick_peaks(magnitudes: &[f32], threshold: f32, scale: &BinScale) -> Vec<Peak> {
    if magnitudes.len() < 3 {
        return Vec::new();
    }
    magnitudes
        .windows(3)
        .enumerate()
        .filter_map(|(i, w)| {
            let (left, centre, right) = (w[0], w[1], w[2]);
            if centre > left && centre > right && centre > threshold {
                let (offset, magnitude) = parabolic_interpolation(left, centre, right);
                let bin = (i + 1) as f32 + offset;
                Some(Peak {
                    bin,
                    magnitude,
                    frequency: scale.bin_to_frequency(bin),
                    midi: scale.bin_to_midi(bin),
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn scale() -> BinScale {
        BinScale::new(12, 65.406)
    }

    #[test]
    fn symmetric_peak_has_no_offset() {
        let (offset, magnitude) = parabolic_interpolation(0.5, 1.0, 0.5);
        assert_abs_diff_eq!(offset, 0.0);
        assert_abs_diff_eq!(magnitude, 1.0);
    }

    #[test]
    fn lopsided_peak_leans_toward_larger_neighbour() {
        // Samples of y = 1 - (x - 0.25)^2 at x = -1, 0, 1.
        let (offset, magnitude) = parabolic_interpolation(1.0 - 1.5625, 1.0 - 0.0625, 1.0 - 0.5625);
        assert_abs_diff_eq!(offset, 0.25, epsilon = 1e-5);
        assert_abs_diff_eq!(magnitude, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn flat_top_guard() {
        let (offset, magnitude) = parabolic_interpolation(1.0, 1.0, 1.0);
        assert_eq!(offset, 0.0);
        assert_eq!(magnitude, 1.0);
    }

    #[test]
    fn picks_interior_maxima_above_threshold() {
        let mags = [0.9, 0.1, 0.8, 0.1, 0.05, 0.3, 0.05, 0.0];
        let peaks = pick_peaks(&mags, 0.2, &scale());
        assert_eq!(peaks.len(), 2);
        assert_abs_diff_eq!(peaks[0].bin, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(peaks[1].bin, 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(peaks[0].midi, 38.0, epsilon = 1e-3);
    }

    #[test]
    fn edges_and_plateaus_are_not_peaks() {
        assert!(pick_peaks(&[1.0, 0.5, 0.2], 0.0, &scale()).is_empty());
        assert!(pick_peaks(&[0.1, 0.5, 0.5, 0.1], 0.0, &scale()).is_empty());
        assert!(pick_peaks(&[0.0; 16], 0.0, &scale()).is_empty());
    }
}
