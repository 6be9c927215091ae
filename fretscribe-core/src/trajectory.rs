//! # Pitch Trajectory Analysis
//!
//! Runs once per note when the tracker closes it. The per-frame pitch
//! samples are smoothed, then checked for a bend (a large one-way pitch
//! movement) or vibrato (a smaller oscillating one). This module also
//! computes the note's confidence score.

use serde::{Deserialize, Serialize};

/// One frame's observation of a tracked note.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchSample {
    pub frame: usize,
    pub time: f64,
    /// Interpolated CQT bin.
    pub bin: f32,
    /// Fractional MIDI pitch.
    pub midi: f32,
    pub frequency: f32,
    pub magnitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BendDirection {
    Up,
    Down,
}

/// A one-way pitch movement across the note.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bend {
    pub direction: BendDirection,
    /// Smoothed MIDI pitch at the first frame.
    pub start_pitch: f32,
    /// Smoothed MIDI pitch at the last frame.
    pub end_pitch: f32,
    /// Full smoothed pitch range in cents.
    pub amount_cents: f32,
}

/// A periodic pitch oscillation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vibrato {
    /// Oscillations per second.
    pub rate_hz: f32,
    /// Peak-to-peak depth in cents.
    pub depth_cents: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryParams {
    pub smoothing_frames: usize,
    pub bend_threshold_cents: f32,
    pub vibrato_threshold_cents: f32,
    /// Samples ignored at each end of the note. Their analysis windows only
    /// partly cover it, so their pitch readings jitter.
    pub edge_frames: usize,
}

/// What the trajectory shows. Bends take precedence over vibrato.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrajectoryShape {
    pub bend: Option<Bend>,
    pub vibrato: Option<Vibrato>,
}

/// Centered moving average. An even `window` is widened by one to stay
/// centred, so 2 and 3 both average three samples. Near the ends the window
/// shrinks to the samples that exist.
pub fn smooth(values: &[f32], window: usize) -> Vec<f32> {
    let n = values.len();
    let half = window / 2;
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n.saturating_sub(1));
            let slice = &values[lo..=hi];
            slice.iter().sum::<f32>() / slice.len() as f32
        })
        .collect()
}

/// Indices of alternating local maxima and minima.
fn alternating_extrema(values: &[f32]) -> Vec<usize> {
    let mut extrema: Vec<(usize, bool)> = Vec::new();
    for i in 1..values.len().saturating_sub(1) {
        let is_max = values[i] > values[i - 1] && values[i] >= values[i + 1];
        let is_min = values[i] < values[i - 1] && values[i] <= values[i + 1];
        if !is_max && !is_min {
            continue;
        }
        match extrema.last_mut() {
            // Two maxima (or minima) in a row: keep the more extreme one.
            Some((last, last_is_max)) if *last_is_max == is_max => {
                let more_extreme = if is_max {
                    values[i] > values[*last]
                } else {
                    values[i] < values[*last]
                };
                if more_extreme {
                    *last = i;
                }
            }
            _ => extrema.push((i, is_max)),
        }
    }
    extrema.into_iter().map(|(i, _)| i).collect()
}

/// Classifies a note's pitch trajectory as a bend, vibrato or neither.
pub fn analyze_trajectory(
    samples: &[PitchSample],
    hop_duration: f64,
    params: &TrajectoryParams,
) -> TrajectoryShape {
    let edge = params.edge_frames;
    if samples.len() < 2 * edge + 2 {
        return TrajectoryShape::default();
    }
    let core = &samples[edge..samples.len() - edge];
    let pitches: Vec<f32> = core.iter().map(|s| s.midi).collect();
    let smoothed = smooth(&pitches, params.smoothing_frames);

    let min = smoothed.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = smoothed.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range_cents = (max - min) * 100.0;

    let first = smoothed[0];
    let last = smoothed[smoothed.len() - 1];

    if range_cents > params.bend_threshold_cents {
        let direction = if last > first {
            BendDirection::Up
        } else {
            BendDirection::Down
        };
        return TrajectoryShape {
            bend: Some(Bend {
                direction,
                start_pitch: first,
                end_pitch: last,
                amount_cents: range_cents,
            }),
            vibrato: None,
        };
    }

    if range_cents > params.vibrato_threshold_cents {
        let extrema = alternating_extrema(&smoothed);
        // Each swing between turning points must reach half the threshold.
        let min_swing = params.vibrato_threshold_cents / 2.0;
        let regular = extrema
            .windows(2)
            .all(|pair| (smoothed[pair[1]] - smoothed[pair[0]]).abs() * 100.0 >= min_swing);
        if extrema.len() >= 4 && regular {
            let spans = extrema.len() - 1;
            let half_period_frames =
                (extrema[spans] - extrema[0]) as f64 / spans as f64;
            let half_period = half_period_frames * hop_duration;
            if half_period > 0.0 {
                return TrajectoryShape {
                    bend: None,
                    vibrato: Some(Vibrato {
                        rate_hz: (1.0 / (2.0 * half_period)) as f32,
                        depth_cents: range_cents,
                    }),
                };
            }
        }
    }

    TrajectoryShape::default()
}

/// Maps a [0, 1] score into `[lower_bound, 1]`.
fn rescale(score: f32, lower_bound: f32) -> f32 {
    lower_bound + (1.0 - lower_bound) * score.clamp(0.0, 1.0)
}

/// Frame count at which a note counts as fully established.
const CONFIDENT_FRAME_COUNT: f32 = 10.0;
/// Average magnitude at which the signal-strength term saturates.
const REFERENCE_MAGNITUDE: f32 = 0.1;

/// Confidence in [0, 1]: the product of duration, pitch stability, signal
/// strength, clarity and onset-sharpness terms.
pub fn confidence(samples: &[PitchSample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f32;

    let duration = rescale(n / CONFIDENT_FRAME_COUNT, 0.5);

    let mean_pitch = samples.iter().map(|s| s.midi).sum::<f32>() / n;
    let variance = samples
        .iter()
        .map(|s| (s.midi - mean_pitch).powi(2))
        .sum::<f32>()
        / n;
    let stability = rescale((-variance.sqrt() * 2.0).exp(), 0.5);

    let mean_magnitude = samples.iter().map(|s| s.magnitude).sum::<f32>() / n;
    let strength = rescale(mean_magnitude / REFERENCE_MAGNITUDE, 0.6);

    let peak_magnitude = samples.iter().map(|s| s.magnitude).fold(0.0_f32, f32::max);
    let clarity = if peak_magnitude > 0.0 {
        rescale(mean_magnitude / peak_magnitude, 0.7)
    } else {
        0.7
    };

    let onset = match samples {
        [first, second, ..] if first.magnitude > 0.0 => {
            rescale(second.magnitude / first.magnitude / 2.0, 0.8)
        }
        _ => rescale(0.5, 0.8),
    };

    (duration * stability * strength * clarity * onset).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const HOP: f64 = 0.01;

    fn params() -> TrajectoryParams {
        TrajectoryParams {
            smoothing_frames: 3,
            bend_threshold_cents: 80.0,
            vibrato_threshold_cents: 20.0,
            edge_frames: 0,
        }
    }

    fn samples_from(pitches: &[f32], magnitude: f32) -> Vec<PitchSample> {
        pitches
            .iter()
            .enumerate()
            .map(|(i, &midi)| PitchSample {
                frame: i,
                time: i as f64 * HOP,
                bin: midi - 36.0,
                midi,
                frequency: crate::tuning::midi_to_frequency(midi),
                magnitude,
            })
            .collect()
    }

    #[test]
    fn smoothing_is_centered() {
        let smoothed = smooth(&[0.0, 3.0, 0.0, 3.0], 3);
        assert_abs_diff_eq!(smoothed[0], 1.5);
        assert_abs_diff_eq!(smoothed[1], 1.0);
        assert_abs_diff_eq!(smoothed[2], 2.0);
        assert_abs_diff_eq!(smoothed[3], 1.5);
        assert_eq!(smooth(&[1.0, 2.0], 1), vec![1.0, 2.0]);
        assert_eq!(smooth(&[0.0, 3.0, 0.0, 3.0], 2), smoothed);
    }

    #[test]
    fn steady_pitch_has_no_shape() {
        let samples = samples_from(&[60.0; 20], 0.2);
        assert_eq!(analyze_trajectory(&samples, HOP, &params()), TrajectoryShape::default());
    }

    #[test]
    fn rising_pitch_is_a_bend_up() {
        let pitches: Vec<f32> = (0..20).map(|i| 60.0 + (i as f32 / 19.0) * 2.0).collect();
        let shape = analyze_trajectory(&samples_from(&pitches, 0.2), HOP, &params());
        let bend = shape.bend.unwrap();
        assert_eq!(bend.direction, BendDirection::Up);
        assert!(bend.end_pitch > bend.start_pitch);
        assert!(bend.amount_cents > 150.0);
        assert!(shape.vibrato.is_none());
    }

    #[test]
    fn falling_pitch_is_a_bend_down() {
        let pitches: Vec<f32> = (0..20).map(|i| 62.0 - (i as f32 / 19.0) * 2.0).collect();
        let shape = analyze_trajectory(&samples_from(&pitches, 0.2), HOP, &params());
        assert_eq!(shape.bend.unwrap().direction, BendDirection::Down);
    }

    #[test]
    fn oscillating_pitch_is_vibrato() {
        // 5 Hz oscillation, +-0.3 semitones, sampled every 10 ms for 0.8 s.
        let pitches: Vec<f32> = (0..80)
            .map(|i| {
                let t = i as f32 * HOP as f32;
                60.0 + 0.3 * (2.0 * std::f32::consts::PI * 5.0 * t).sin()
            })
            .collect();
        let shape = analyze_trajectory(&samples_from(&pitches, 0.2), HOP, &params());
        assert!(shape.bend.is_none());
        let vibrato = shape.vibrato.unwrap();
        assert_abs_diff_eq!(vibrato.rate_hz, 5.0, epsilon = 0.3);
        assert!(vibrato.depth_cents > 40.0 && vibrato.depth_cents <= 60.0);
    }

    #[test]
    fn single_swell_is_not_vibrato() {
        // Above the vibrato threshold, but only one turning point.
        let pitches = [60.0, 60.2, 60.4, 60.4, 60.2, 60.0];
        let shape = analyze_trajectory(&samples_from(&pitches, 0.2), HOP, &params());
        assert_eq!(shape, TrajectoryShape::default());
    }

    #[test]
    fn jitter_in_partial_frames_is_ignored() {
        // A steady note whose first and last four readings jump by 0.8 semitones.
        let mut pitches = vec![40.4, 39.6, 40.4, 39.6];
        pitches.extend([40.0; 30]);
        pitches.extend([39.6, 40.4, 39.6, 40.4]);
        let samples = samples_from(&pitches, 0.2);

        let untrimmed = analyze_trajectory(&samples, HOP, &params());
        assert!(untrimmed.vibrato.is_some());

        let trimmed = TrajectoryParams {
            edge_frames: 4,
            ..params()
        };
        assert_eq!(analyze_trajectory(&samples, HOP, &trimmed), TrajectoryShape::default());
    }

    #[test]
    fn too_short_after_trimming_has_no_shape() {
        let pitches: Vec<f32> = (0..9).map(|i| 60.0 + i as f32 * 0.3).collect();
        let trimmed = TrajectoryParams {
            edge_frames: 4,
            ..params()
        };
        let shape = analyze_trajectory(&samples_from(&pitches, 0.2), HOP, &trimmed);
        assert_eq!(shape, TrajectoryShape::default());
    }

    #[test]
    fn uneven_wobble_is_not_vibrato() {
        // One 30 cent blip among 5 cent flickers: four turning points, but no steady swing.
        let pitches = [60.0, 60.3, 60.0, 60.05, 60.0, 60.05, 60.0, 60.05, 60.0];
        let unsmoothed = TrajectoryParams {
            smoothing_frames: 1,
            ..params()
        };
        let shape = analyze_trajectory(&samples_from(&pitches, 0.2), HOP, &unsmoothed);
        assert_eq!(shape, TrajectoryShape::default());
    }

    #[test]
    fn confidence_rewards_long_stable_loud_notes() {
        let long = confidence(&samples_from(&[60.0; 20], 0.2));
        let short = confidence(&samples_from(&[60.0; 3], 0.2));
        let quiet = confidence(&samples_from(&[60.0; 20], 0.01));
        let wobbly: Vec<f32> = (0..20).map(|i| if i % 2 == 0 { 59.5 } else { 60.5 }).collect();
        let unstable = confidence(&samples_from(&wobbly, 0.2));

        assert!(long > short);
        assert!(long > quiet);
        assert!(long > unstable);
        for c in [long, short, quiet, unstable] {
            assert!((0.0..=1.0).contains(&c));
        }
    }

    #[test]
    fn confidence_of_an_ideal_note() {
        // Every term saturates except onset: equal first two frames give 0.5 -> 0.9.
        let c = confidence(&samples_from(&[60.0; 20], 0.2));
        assert_abs_diff_eq!(c, 0.9, epsilon = 1e-5);
        assert_eq!(confidence(&[]), 0.0);
    }
}
