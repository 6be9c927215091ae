//! # Analysis Pipeline
//!
//! Runs everything after the spectral transform: peak picking, harmonic
//! resolution, note tracking, post-processing and tab generation. The input
//! is a cached [`FrameSet`], so a run is cheap enough to repeat whenever the
//! sensitivity settings change.
//!
//! The spectral fields of the config (frame size, hop, bin grid) are not
//! read here; the frame set carries the values it was computed with.
//!
//! Notes are timed by the hop-long slice at the centre of each frame's
//! window rather than by the window start, so a note lines up with the
//! sound that produced it to within one hop.

use crate::config::PipelineConfig;
use crate::error::{TabError, TabResult};
use crate::frames::FrameSet;
use crate::harmonics::{self, HarmonicParams};
use crate::peaks;
use crate::post;
use crate::tab;
use crate::tracker::{NoteTracker, TrackerParams};
use crate::trajectory::TrajectoryParams;
use crate::tuning::BinScale;
use crate::Transcription;

impl From<&PipelineConfig> for HarmonicParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_harmonics: config.max_harmonics,
            decay_factor: config.harmonic_decay_factor,
            tolerance_cents: config.harmonic_tolerance_cents,
            fundamental_boost: config.fundamental_boost,
        }
    }
}

fn tracker_params(config: &PipelineConfig, frames: &FrameSet) -> TrackerParams {
    TrackerParams {
        tolerance_cents: config.note_tolerance_cents,
        max_gap_frames: config.max_gap_frames,
        min_note_duration: config.min_note_duration,
        max_note_duration: config.max_note_duration,
        trajectory: TrajectoryParams {
            smoothing_frames: config.pitch_smoothing_frames,
            bend_threshold_cents: config.bend_threshold_cents,
            vibrato_threshold_cents: config.vibrato_threshold_cents,
            edge_frames: frames.partial_overlap_frames(),
        },
    }
}

/// Transcribes a frame set. Deterministic for a given frame set and config.
pub fn analyze(frames: &FrameSet, config: &PipelineConfig) -> TabResult<Transcription> {
    analyze_with_cancel(frames, config, &|| false)
}

/// Like [`analyze`], but polls `is_cancelled` before every frame and between
/// stages, abandoning the run with [`TabError::Cancelled`].
pub fn analyze_with_cancel(
    frames: &FrameSet,
    config: &PipelineConfig,
    is_cancelled: &dyn Fn() -> bool,
) -> TabResult<Transcription> {
    config.validate()?;

    let scale = BinScale::new(frames.params.bins_per_octave, frames.params.min_frequency);
    let thresholds = frames.adaptive_thresholds(
        config.absolute_threshold,
        config.adaptive_threshold_factor,
        config.adaptive_window_size,
    );
    let onsets = frames.normalized_flux();
    let harmonic_params = HarmonicParams::from(config);

    let mut tracker =
        NoteTracker::new(tracker_params(config, frames), scale, frames.hop_duration());
    let slice_offset = frames.slice_offset();
    let mut peak_total = 0;
    let mut fundamental_total = 0;

    for (i, frame) in frames.frames.iter().enumerate() {
        if is_cancelled() {
            return Err(TabError::Cancelled);
        }
        let peaks = peaks::pick_peaks(&frame.magnitudes, thresholds[i], &scale);
        let fundamentals =
            harmonics::resolve_fundamentals(&peaks, thresholds[i], &harmonic_params, &scale);
        peak_total += peaks.len();
        fundamental_total += fundamentals.len();
        tracker.process_frame(
            frame.index,
            frame.time + slice_offset,
            &fundamentals,
            onsets[i],
        );
    }
    log::debug!(
        "{} peaks resolved into {} fundamentals over {} frames",
        peak_total,
        fundamental_total,
        frames.len()
    );

    let notes = post::merge_notes(tracker.finish());
    if is_cancelled() {
        return Err(TabError::Cancelled);
    }
    let chords = post::detect_chords(&notes);

    let num_columns =
        tab::column_count(frames.sample_count, frames.sample_rate, config.columns_per_second);
    let tab = tab::generate_tab(&notes, config, num_columns);

    log::info!(
        "Transcribed {:.2}s of audio: {} notes, {} chords",
        frames.duration(),
        notes.len(),
        chords.len()
    );

    Ok(Transcription { notes, chords, tab })
}
