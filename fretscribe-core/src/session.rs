//! # Transcription Session
//!
//! A long-lived owner of one spectral kernel and the frames it produced for
//! the current audio buffer. Changing the sensitivity re-runs the analysis
//! from the cached frames; only a change to the spectral settings sends the
//! audio through the kernel again.
//!
//! Results are published through a [`SnapshotHandle`]: readers always get a
//! complete [`Transcription`], and a failed or cancelled run leaves the
//! previous one in place.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::cqt::{CqtKernel, KernelParams, SpectralKernel};
use crate::error::{TabError, TabResult};
use crate::frames::{FrameProducer, FrameSet};
use crate::pipeline;
use crate::Transcription;

/// Shared, cheaply cloneable view of the latest published transcription.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    current: Arc<RwLock<Arc<Transcription>>>,
}

impl SnapshotHandle {
    /// The most recently published transcription.
    pub fn load(&self) -> Arc<Transcription> {
        self.current.read().clone()
    }

    fn publish(&self, transcription: Transcription) -> Arc<Transcription> {
        let snapshot = Arc::new(transcription);
        *self.current.write() = snapshot.clone();
        snapshot
    }
}

fn kernel_params(config: &PipelineConfig, sample_rate: u32) -> KernelParams {
    KernelParams {
        bins_per_octave: config.bins_per_octave,
        octaves: config.octaves,
        sample_rate,
        min_frequency: config.min_frequency,
        frame_size: config.frame_size,
    }
}

fn never_cancelled() -> bool {
    false
}

pub struct TranscriptionSession {
    config: PipelineConfig,
    sample_rate: u32,
    kernel: Box<dyn SpectralKernel>,
    /// True when the kernel was built here and can be rebuilt for new spectral settings.
    owns_kernel: bool,
    producer: FrameProducer,
    samples: Option<Arc<[f32]>>,
    frames: Option<Arc<FrameSet>>,
    snapshot: SnapshotHandle,
}

impl std::fmt::Debug for TranscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionSession")
            .field("config", &self.config)
            .field("sample_rate", &self.sample_rate)
            .field("cached_frames", &self.frames.as_ref().map(|f| f.len()))
            .finish()
    }
}

impl TranscriptionSession {
    /// Validates `config` for `sample_rate` and builds the default CQT kernel.
    pub fn new(config: PipelineConfig, sample_rate: u32) -> TabResult<Self> {
        config.validate()?;
        config.validate_for_sample_rate(sample_rate)?;
        let kernel = CqtKernel::new(kernel_params(&config, sample_rate))?;
        let mut session = Self::with_kernel(config, sample_rate, Box::new(kernel))?;
        session.owns_kernel = true;
        Ok(session)
    }

    /// Uses a caller-supplied kernel. Its bin count must match the config's
    /// bin grid. An injected kernel is kept across [`Self::reconfigure`], so
    /// the spectral settings must stay compatible with it.
    pub fn with_kernel(
        config: PipelineConfig,
        sample_rate: u32,
        kernel: Box<dyn SpectralKernel>,
    ) -> TabResult<Self> {
        config.validate()?;
        config.validate_for_sample_rate(sample_rate)?;
        let producer = FrameProducer::new(config.spectral_params(), sample_rate)?;
        let expected = config.spectral_params().total_bins();
        if kernel.bin_count() != expected {
            return Err(TabError::KernelOutputLength {
                expected,
                actual: kernel.bin_count(),
            });
        }
        log::info!(
            "Transcription session ready: {} Hz, {} bins, frame {} / hop {}",
            sample_rate,
            expected,
            config.frame_size,
            config.hop_size
        );
        Ok(Self {
            config,
            sample_rate,
            kernel,
            owns_kernel: false,
            producer,
            samples: None,
            frames: None,
            snapshot: SnapshotHandle::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The cached frames of the last transcribed buffer, if any.
    pub fn frames(&self) -> Option<&Arc<FrameSet>> {
        self.frames.as_ref()
    }

    /// The latest published transcription.
    pub fn snapshot(&self) -> Arc<Transcription> {
        self.snapshot.load()
    }

    /// A handle other threads can read snapshots through.
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.snapshot.clone()
    }

    /// Computes and caches frames for `samples`, runs the analysis and
    /// publishes the result.
    pub fn transcribe(&mut self, samples: impl Into<Arc<[f32]>>) -> TabResult<Arc<Transcription>> {
        self.set_samples(samples.into());
        self.refresh(&never_cancelled)
    }

    /// Re-runs the analysis with a new adaptive threshold factor, reusing
    /// the cached frames. Without any audio only the config changes.
    pub fn update_sensitivity(&mut self, factor: f32) -> TabResult<Arc<Transcription>> {
        self.set_sensitivity(factor)?;
        self.refresh(&never_cancelled)
    }

    /// Applies a new configuration. Frames are recomputed only when the
    /// spectral settings differ from the cached ones.
    pub fn reconfigure(&mut self, config: PipelineConfig) -> TabResult<Arc<Transcription>> {
        self.apply_config(config)?;
        self.refresh(&never_cancelled)
    }

    /// Replaces the audio buffer and drops its frames.
    pub(crate) fn set_samples(&mut self, samples: Arc<[f32]>) {
        self.samples = Some(samples);
        self.frames = None;
    }

    pub(crate) fn set_sensitivity(&mut self, factor: f32) -> TabResult<()> {
        self.apply_config(PipelineConfig {
            adaptive_threshold_factor: factor,
            ..self.config.clone()
        })
    }

    /// Validates and installs `config`. A change to the spectral settings
    /// rebuilds the frame producer (and an owned kernel) and drops the frames.
    pub(crate) fn apply_config(&mut self, config: PipelineConfig) -> TabResult<()> {
        config.validate()?;
        config.validate_for_sample_rate(self.sample_rate)?;

        if config.spectral_params() != self.config.spectral_params() {
            let producer = FrameProducer::new(config.spectral_params(), self.sample_rate)?;
            if self.owns_kernel {
                self.kernel = Box::new(CqtKernel::new(kernel_params(&config, self.sample_rate))?);
            }
            self.producer = producer;
            self.frames = None;
            log::debug!("Spectral settings changed, cached frames dropped");
        }
        self.config = config;
        Ok(())
    }

    /// Brings the published snapshot up to date with the current audio and
    /// config, computing frames first if none are cached.
    pub(crate) fn refresh(&mut self, is_cancelled: &dyn Fn() -> bool) -> TabResult<Arc<Transcription>> {
        let frames = match (self.frames.clone(), self.samples.clone()) {
            (Some(frames), _) => frames,
            (None, Some(samples)) => {
                let frames = self
                    .producer
                    .produce_with_cancel(&samples, self.kernel.as_mut(), is_cancelled)?;
                log::info!(
                    "Computed {} frames for {:.2}s of audio",
                    frames.len(),
                    frames.duration()
                );
                let frames = Arc::new(frames);
                self.frames = Some(frames.clone());
                frames
            }
            (None, None) => return Ok(self.snapshot()),
        };
        let transcription = pipeline::analyze_with_cancel(&frames, &self.config, is_cancelled)?;
        Ok(self.snapshot.publish(transcription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE_RATE: u32 = 22_050;

    fn config() -> PipelineConfig {
        PipelineConfig {
            frame_size: 2048,
            hop_size: 256,
            ..Default::default()
        }
    }

    fn tone(frequency: f32, seconds: f32) -> Vec<f32> {
        let n = (seconds * SAMPLE_RATE as f32) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                0.5 * (2.0 * std::f32::consts::PI * frequency * t).sin()
            })
            .collect()
    }

    /// Counts calls and delegates to the real kernel.
    struct CountingKernel {
        inner: CqtKernel,
        calls: Arc<AtomicUsize>,
    }

    impl SpectralKernel for CountingKernel {
        fn bin_count(&self) -> usize {
            self.inner.bin_count()
        }

        fn transform(&mut self, windowed: &[f32]) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.transform(windowed)
        }
    }

    struct FailingKernel {
        bins: usize,
    }

    impl SpectralKernel for FailingKernel {
        fn bin_count(&self) -> usize {
            self.bins
        }

        fn transform(&mut self, _windowed: &[f32]) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("device unavailable")
        }
    }

    #[test]
    fn new_session_has_an_empty_snapshot() {
        let session = TranscriptionSession::new(config(), SAMPLE_RATE).unwrap();
        assert!(session.snapshot().notes.is_empty());
        assert!(session.frames().is_none());
    }

    #[test]
    fn rejects_bad_sample_rate_up_front() {
        assert!(matches!(
            TranscriptionSession::new(config(), 0),
            Err(TabError::InvalidSampleRate(0))
        ));
    }

    #[test]
    fn sensitivity_change_reuses_frames() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = CqtKernel::new(kernel_params(&config(), SAMPLE_RATE)).unwrap();
        let kernel = CountingKernel {
            inner,
            calls: calls.clone(),
        };
        let mut session =
            TranscriptionSession::with_kernel(config(), SAMPLE_RATE, Box::new(kernel)).unwrap();

        session.transcribe(tone(440.0, 0.5)).unwrap();
        let after_first = calls.load(Ordering::SeqCst);
        assert!(after_first > 0);

        session.update_sensitivity(3.0).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
        assert_eq!(session.config().adaptive_threshold_factor, 3.0);
    }

    #[test]
    fn spectral_change_recomputes_frames() {
        let mut session = TranscriptionSession::new(config(), SAMPLE_RATE).unwrap();
        session.transcribe(tone(440.0, 0.5)).unwrap();
        let before = session.frames().unwrap().len();

        session
            .reconfigure(PipelineConfig {
                hop_size: 512,
                ..config()
            })
            .unwrap();
        let after = session.frames().unwrap().len();
        assert!(after < before);
    }

    #[test]
    fn failed_run_keeps_the_previous_snapshot() {
        let bins = config().spectral_params().total_bins();
        let mut session = TranscriptionSession::with_kernel(
            config(),
            SAMPLE_RATE,
            Box::new(FailingKernel { bins }),
        )
        .unwrap();
        let before = session.snapshot();
        let result = session.transcribe(tone(440.0, 0.5));
        assert!(matches!(result, Err(TabError::Kernel { frame: 0, .. })));
        assert!(Arc::ptr_eq(&before, &session.snapshot()));
    }

    #[test]
    fn invalid_sensitivity_is_rejected_without_side_effects() {
        let mut session = TranscriptionSession::new(config(), SAMPLE_RATE).unwrap();
        assert!(session.update_sensitivity(-1.0).is_err());
        assert_eq!(session.config().adaptive_threshold_factor, 1.5);
    }

    #[test]
    fn snapshot_handle_sees_published_results() {
        let mut session = TranscriptionSession::new(config(), SAMPLE_RATE).unwrap();
        let handle = session.snapshot_handle();
        let published = session.transcribe(tone(440.0, 0.5)).unwrap();
        assert!(Arc::ptr_eq(&handle.load(), &published));
        assert_eq!(published.notes.len(), 1);
    }
}
