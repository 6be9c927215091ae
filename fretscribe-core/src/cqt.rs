//! # Constant-Q Transform Module
//!
//! The spectral kernel turns one windowed frame of audio into a vector of
//! magnitudes on a log-spaced bin grid (one bin per `1/bins_per_octave`
//! octave). The rest of the pipeline only sees the [`SpectralKernel`] trait,
//! so any implementation can be plugged in.
//!
//! The default [`CqtKernel`] evaluates the transform in the frequency domain:
//! each bin's time-domain atom (a Hann-windowed complex exponential) is
//! transformed once with RustFFT at construction, trimmed to its significant
//! coefficients, and correlated against the FFT of every incoming frame.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::error::{TabError, TabResult};
use crate::tuning::BinScale;

/// Spectral coefficients smaller than this fraction of an atom's largest
/// coefficient are dropped from the sparse kernel.
const SPARSITY_THRESHOLD: f32 = 0.005;

/// A per-frame magnitude transform on a fixed bin grid.
pub trait SpectralKernel: Send {
    /// Number of magnitudes returned by [`SpectralKernel::transform`].
    fn bin_count(&self) -> usize;

    /// Transforms one already-windowed frame into `bin_count()` magnitudes.
    fn transform(&mut self, windowed: &[f32]) -> anyhow::Result<Vec<f32>>;
}

/// Parameters of the constant-Q bin grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParams {
    pub bins_per_octave: usize,
    pub octaves: usize,
    pub sample_rate: u32,
    pub min_frequency: f32,
    pub frame_size: usize,
}

impl KernelParams {
    pub fn total_bins(&self) -> usize {
        self.bins_per_octave * self.octaves
    }
}

/// One bin's spectral atom, stored as (fft index, conjugated coefficient).
struct SparseAtom {
    coefficients: Vec<(usize, Complex<f32>)>,
    /// Sum of the atom's time-domain window, used to normalise magnitudes.
    window_sum: f32,
}

/// Constant-Q transform backed by RustFFT.
pub struct CqtKernel {
    params: KernelParams,
    fft: Arc<dyn Fft<f32>>,
    atoms: Vec<SparseAtom>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for CqtKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqtKernel")
            .field("params", &self.params)
            .field("atoms", &self.atoms.len())
            .finish()
    }
}

impl CqtKernel {
    /// Builds the kernel for a bin grid. Fails if any parameter is unusable
    /// or a bin's centre frequency lies at or above Nyquist.
    pub fn new(params: KernelParams) -> TabResult<Self> {
        let KernelParams {
            bins_per_octave,
            octaves,
            sample_rate,
            min_frequency,
            frame_size: n,
        } = params;
        if bins_per_octave == 0 || octaves == 0 {
            return Err(TabError::KernelInit(format!(
                "empty bin grid ({} bins per octave, {} octaves)",
                bins_per_octave, octaves
            )));
        }
        if n == 0 || !n.is_power_of_two() {
            return Err(TabError::KernelInit(format!("frame size {} is not a power of two", n)));
        }
        if sample_rate == 0 || !(min_frequency > 0.0) {
            return Err(TabError::KernelInit(format!(
                "sample rate {} Hz / min frequency {} Hz must be positive",
                sample_rate, min_frequency
            )));
        }

        let sr = sample_rate as f32;
        let scale = BinScale::new(bins_per_octave, min_frequency);
        let q = 1.0 / (2.0_f32.powf(1.0 / bins_per_octave as f32) - 1.0);

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        let mut scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        let total_bins = params.total_bins();
        let mut atoms = Vec::with_capacity(total_bins);
        for k in 0..total_bins {
            let freq = scale.bin_to_frequency(k as f32);
            if freq >= sr / 2.0 {
                return Err(TabError::KernelInit(format!(
                    "bin {} at {:.1} Hz is above the Nyquist frequency of {:.1} Hz",
                    k,
                    freq,
                    sr / 2.0
                )));
            }
            let filter_len = ((q * sr / freq).ceil() as usize).clamp(2, n);

            // Atom centred in the frame so short (high) bins see the middle of the Hann window.
            let offset = (n - filter_len) / 2;
            let mut atom = vec![Complex::new(0.0, 0.0); n];
            let mut window_sum = 0.0;
            let centre = (filter_len as f32 - 1.0) / 2.0;
            for i in 0..filter_len {
                let w = 0.5 - 0.5 * (2.0 * PI * i as f32 / (filter_len as f32 - 1.0)).cos();
                let phase = 2.0 * PI * freq * (i as f32 - centre) / sr;
                atom[offset + i] = Complex::new(w * phase.cos(), w * phase.sin());
                window_sum += w;
            }
            fft.process_with_scratch(&mut atom, &mut scratch);

            let peak = atom.iter().map(|c| c.norm()).fold(0.0_f32, f32::max);
            let coefficients = atom
                .iter()
                .enumerate()
                .filter(|(_, c)| c.norm() > peak * SPARSITY_THRESHOLD)
                .map(|(i, c)| (i, c.conj()))
                .collect();
            atoms.push(SparseAtom {
                coefficients,
                window_sum,
            });
        }

        log::debug!(
            "CQT kernel ready: {} bins from {:.2} Hz, frame {} at {} Hz",
            total_bins,
            min_frequency,
            n,
            sample_rate
        );

        Ok(Self {
            params,
            fft,
            atoms,
            buffer: vec![Complex::new(0.0, 0.0); n],
            scratch,
        })
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }
}

impl SpectralKernel for CqtKernel {
    fn bin_count(&self) -> usize {
        self.atoms.len()
    }

    fn transform(&mut self, windowed: &[f32]) -> anyhow::Result<Vec<f32>> {
        let n = self.params.frame_size;
        if windowed.len() != n {
            anyhow::bail!("frame has {} samples, kernel expects {}", windowed.len(), n);
        }
        for (slot, &sample) in self.buffer.iter_mut().zip(windowed) {
            *slot = Complex::new(sample, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let norm = n as f32;
        let magnitudes = self
            .atoms
            .iter()
            .map(|atom| {
                let sum: Complex<f32> = atom
                    .coefficients
                    .iter()
                    .map(|&(i, k)| self.buffer[i] * k)
                    .sum();
                // Parseval: sum / N is the time-domain correlation with the atom.
                sum.norm() / (norm * atom.window_sum)
            })
            .collect();
        Ok(magnitudes)
    }
}
