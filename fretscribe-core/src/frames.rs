//! # Frame Producer
//!
//! Slices the audio buffer into overlapping Hann-windowed frames and runs
//! each through the spectral kernel. The resulting [`FrameSet`] is the one
//! expensive artifact of a run; everything downstream is recomputed from it
//! when only the sensitivity settings change.

use std::f32::consts::PI;

use crate::config::SpectralParams;
use crate::cqt::SpectralKernel;
use crate::error::{TabError, TabResult};

/// One analysed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: usize,
    /// Start of the frame's window, `index * hop_duration`, in seconds.
    pub time: f64,
    pub magnitudes: Vec<f32>,
}

/// The ordered frames of one audio buffer, plus the per-frame statistics the
/// later stages need.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSet {
    pub frames: Vec<Frame>,
    /// Mean magnitude across all bins, per frame.
    pub frame_means: Vec<f32>,
    /// Sum of positive magnitude increases from the previous frame.
    pub spectral_flux: Vec<f32>,
    pub params: SpectralParams,
    pub sample_rate: u32,
    /// Length of the analysed audio in samples.
    pub sample_count: usize,
}

impl FrameSet {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn hop_duration(&self) -> f64 {
        self.params.hop_size as f64 / self.sample_rate as f64
    }

    /// Seconds from a frame's timestamp to the start of the audio it stands
    /// for: the hop-long slice centred in its window.
    pub fn slice_offset(&self) -> f64 {
        (self.params.frame_size - self.params.hop_size) as f64 / (2.0 * self.sample_rate as f64)
    }

    /// Frames at each end of a note whose window only partly covers it.
    pub fn partial_overlap_frames(&self) -> usize {
        self.params.frame_size.div_ceil(self.params.hop_size) - 1
    }

    /// Length of the analysed audio in seconds.
    pub fn duration(&self) -> f64 {
        self.sample_count as f64 / self.sample_rate as f64
    }

    /// Per-frame peak threshold: the mean magnitude over `±window` frames,
    /// scaled by `factor` and floored at `absolute`.
    pub fn adaptive_thresholds(&self, absolute: f32, factor: f32, window: usize) -> Vec<f32> {
        let n = self.frame_means.len();
        (0..n)
            .map(|i| {
                let lo = i.saturating_sub(window);
                let hi = (i + window).min(n - 1);
                let local = &self.frame_means[lo..=hi];
                let average = local.iter().sum::<f32>() / local.len() as f32;
                (average * factor).max(absolute)
            })
            .collect()
    }

    /// Spectral flux normalised to the strongest onset of the run.
    pub fn normalized_flux(&self) -> Vec<f32> {
        let max = self.spectral_flux.iter().cloned().fold(0.0_f32, f32::max);
        if max <= 0.0 {
            return vec![0.0; self.spectral_flux.len()];
        }
        self.spectral_flux.iter().map(|f| f / max).collect()
    }
}

/// Builds a Hann window of length `n`: `0.5 - 0.5 * cos(2*pi*i / (n-1))`.
pub fn hann_window(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    let n_minus_1 = (n - 1) as f32;
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / n_minus_1).cos())
        .collect()
}

/// Number of whole frames in a buffer: `floor((len - N) / H) + 1`, or zero
/// when the buffer is shorter than one frame.
pub fn frame_count(len: usize, frame_size: usize, hop_size: usize) -> usize {
    if len < frame_size {
        0
    } else {
        (len - frame_size) / hop_size + 1
    }
}

/// Cuts audio into windowed frames and feeds them to a spectral kernel.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    params: SpectralParams,
    sample_rate: u32,
    window: Vec<f32>,
}

impl FrameProducer {
    /// Fails on a frame size that is not a power of two, a hop of zero or
    /// larger than the frame, or a zero sample rate.
    pub fn new(params: SpectralParams, sample_rate: u32) -> TabResult<Self> {
        if params.frame_size == 0 || !params.frame_size.is_power_of_two() {
            return Err(TabError::FrameSizeNotPowerOfTwo(params.frame_size));
        }
        if params.hop_size == 0 || params.hop_size > params.frame_size {
            return Err(TabError::InvalidConfig {
                field: "hop_size",
                reason: format!("must be in 1..={}", params.frame_size),
            });
        }
        if sample_rate == 0 {
            return Err(TabError::InvalidSampleRate(sample_rate));
        }
        Ok(Self {
            window: hann_window(params.frame_size),
            params,
            sample_rate,
        })
    }

    pub fn produce(&self, samples: &[f32], kernel: &mut dyn SpectralKernel) -> TabResult<FrameSet> {
        self.produce_with_cancel(samples, kernel, &|| false)
    }

    /// Like [`FrameProducer::produce`], but polls `is_cancelled` before every
    /// frame and abandons the run with [`TabError::Cancelled`].
    pub fn produce_with_cancel(
        &self,
        samples: &[f32],
        kernel: &mut dyn SpectralKernel,
        is_cancelled: &dyn Fn() -> bool,
    ) -> TabResult<FrameSet> {
        let SpectralParams {
            frame_size,
            hop_size,
            ..
        } = self.params;
        let expected_bins = self.params.total_bins();
        if kernel.bin_count() != expected_bins {
            return Err(TabError::KernelOutputLength {
                expected: expected_bins,
                actual: kernel.bin_count(),
            });
        }

        let count = frame_count(samples.len(), frame_size, hop_size);
        let hop_duration = hop_size as f64 / self.sample_rate as f64;
        let mut frames = Vec::with_capacity(count);
        let mut frame_means = Vec::with_capacity(count);
        let mut spectral_flux = Vec::with_capacity(count);
        let mut windowed = vec![0.0_f32; frame_size];

        for index in 0..count {
            if is_cancelled() {
                return Err(TabError::Cancelled);
            }
            let start = index * hop_size;
            for ((out, &sample), &w) in windowed
                .iter_mut()
                .zip(&samples[start..start + frame_size])
                .zip(&self.window)
            {
                *out = sample * w;
            }

            let magnitudes = kernel
                .transform(&windowed)
                .map_err(|source| TabError::Kernel { frame: index, source })?;
            if magnitudes.len() != expected_bins {
                return Err(TabError::KernelOutputLength {
                    expected: expected_bins,
                    actual: magnitudes.len(),
                });
            }

            let mean = magnitudes.iter().sum::<f32>() / expected_bins as f32;
            let flux = match frames.last() {
                Some(Frame { magnitudes: previous, .. }) => magnitudes
                    .iter()
                    .zip(previous.iter())
                    .map(|(now, before)| (now - before).max(0.0))
                    .sum(),
                None => 0.0,
            };

            frame_means.push(mean);
            spectral_flux.push(flux);
            frames.push(Frame {
                index,
                time: index as f64 * hop_duration,
                magnitudes,
            });
        }

        log::debug!(
            "Produced {} frames from {} samples ({} bins each)",
            frames.len(),
            samples.len(),
            expected_bins
        );

        Ok(FrameSet {
            frames,
            frame_means,
            spectral_flux,
            params: self.params,
            sample_rate: self.sample_rate,
            sample_count: samples.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Returns the sum of the frame as a single "bin" repeated, so tests can
    /// see exactly what the producer fed in.
    struct SumKernel {
        bins: usize,
    }

    impl SpectralKernel for SumKernel {
        fn bin_count(&self) -> usize {
            self.bins
        }

        fn transform(&mut self, windowed: &[f32]) -> anyhow::Result<Vec<f32>> {
            let sum: f32 = windowed.iter().sum();
            Ok(vec![sum; self.bins])
        }
    }

    fn params(frame_size: usize, hop_size: usize) -> SpectralParams {
        SpectralParams {
            frame_size,
            hop_size,
            bins_per_octave: 2,
            octaves: 1,
            min_frequency: 100.0,
        }
    }

    #[test]
    fn hann_window_shape() {
        let w = hann_window(5);
        assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(w[2], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(w[4], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(w[1], w[3], epsilon = 1e-6);
    }

    #[test]
    fn frame_count_formula() {
        assert_eq!(frame_count(100, 64, 16), 3);
        assert_eq!(frame_count(64, 64, 16), 1);
        assert_eq!(frame_count(63, 64, 16), 0);
    }

    #[test]
    fn constructor_fails_fast() {
        assert!(matches!(
            FrameProducer::new(params(100, 10), 44_100),
            Err(TabError::FrameSizeNotPowerOfTwo(100))
        ));
        assert!(FrameProducer::new(params(64, 0), 44_100).is_err());
        assert!(FrameProducer::new(params(64, 128), 44_100).is_err());
        assert!(matches!(
            FrameProducer::new(params(64, 16), 0),
            Err(TabError::InvalidSampleRate(0))
        ));
    }

    #[test]
    fn frames_are_windowed_and_timestamped() {
        let producer = FrameProducer::new(params(64, 16), 1_000).unwrap();
        let mut kernel = SumKernel { bins: 2 };
        let set = producer.produce(&vec![1.0; 100], &mut kernel).unwrap();

        assert_eq!(set.len(), 3);
        let window_sum: f32 = hann_window(64).iter().sum();
        assert_abs_diff_eq!(set.frames[0].magnitudes[0], window_sum, epsilon = 1e-3);
        assert_abs_diff_eq!(set.frames[2].time, 0.032, epsilon = 1e-9);
        // Frame 2 stands for samples 56..72, the middle of its 32..96 window.
        assert_abs_diff_eq!(set.frames[2].time + set.slice_offset(), 0.056, epsilon = 1e-9);
        assert_eq!(set.partial_overlap_frames(), 3);
        // Identical frames: no flux anywhere.
        assert!(set.spectral_flux.iter().all(|&f| f.abs() < 1e-3));
    }

    #[test]
    fn flux_counts_only_increases() {
        let producer = FrameProducer::new(params(64, 64), 1_000).unwrap();
        let mut kernel = SumKernel { bins: 2 };
        let mut samples = vec![0.0; 64];
        samples.extend(vec![1.0; 64]);
        samples.extend(vec![0.0; 64]);
        let set = producer.produce(&samples, &mut kernel).unwrap();
        let window_sum: f32 = hann_window(64).iter().sum();

        assert_eq!(set.spectral_flux[0], 0.0);
        assert_abs_diff_eq!(set.spectral_flux[1], 2.0 * window_sum, epsilon = 1e-3);
        assert_eq!(set.spectral_flux[2], 0.0);
        let normalized = set.normalized_flux();
        assert_abs_diff_eq!(normalized[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn thresholds_average_neighbouring_frames() {
        let set = FrameSet {
            frames: vec![],
            frame_means: vec![0.0, 0.0, 0.3, 0.0, 0.0],
            spectral_flux: vec![0.0; 5],
            params: params(64, 16),
            sample_rate: 1_000,
            sample_count: 0,
        };
        let thresholds = set.adaptive_thresholds(0.01, 2.0, 1);
        assert_abs_diff_eq!(thresholds[0], 0.01, epsilon = 1e-6);
        assert_abs_diff_eq!(thresholds[1], 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(thresholds[2], 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(thresholds[4], 0.01, epsilon = 1e-6);
    }

    #[test]
    fn kernel_failure_aborts_the_run() {
        struct Broken;
        impl SpectralKernel for Broken {
            fn bin_count(&self) -> usize {
                2
            }
            fn transform(&mut self, _: &[f32]) -> anyhow::Result<Vec<f32>> {
                anyhow::bail!("device lost")
            }
        }
        let producer = FrameProducer::new(params(64, 16), 1_000).unwrap();
        let result = producer.produce(&vec![0.0; 128], &mut Broken);
        assert!(matches!(result, Err(TabError::Kernel { frame: 0, .. })));
    }

    #[test]
    fn bin_count_mismatch_is_rejected() {
        let producer = FrameProducer::new(params(64, 16), 1_000).unwrap();
        let mut kernel = SumKernel { bins: 5 };
        assert!(matches!(
            producer.produce(&vec![0.0; 128], &mut kernel),
            Err(TabError::KernelOutputLength { expected: 2, actual: 5 })
        ));
    }
}
