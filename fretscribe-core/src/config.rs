//! # Configuration Module
//!
//! The flat option set for the whole pipeline. Every field has a default, so
//! a config file only needs to mention the values it changes.

use crate::error::{TabError, TabResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Number of strings on the instrument.
pub const NUM_STRINGS: usize = 6;

/// All tunable parameters of a transcription run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // --- Spectral analysis (changing these invalidates cached frames) ---
    /// Samples per analysis frame, a power of two.
    pub frame_size: usize,
    /// Samples between consecutive frames.
    pub hop_size: usize,
    pub bins_per_octave: usize,
    pub octaves: usize,
    /// Centre frequency of bin 0 in Hz.
    pub min_frequency: f32,

    // --- Peak thresholds ---
    pub absolute_threshold: f32,
    /// Multiplier on the local average magnitude. This is the "sensitivity" knob.
    pub adaptive_threshold_factor: f32,
    /// Half-width, in frames, of the local average window.
    pub adaptive_window_size: usize,

    // --- Harmonic resolution ---
    pub max_harmonics: usize,
    pub harmonic_decay_factor: f32,
    pub harmonic_tolerance_cents: f32,
    /// A peak without harmonic support must exceed `threshold * fundamental_boost`.
    pub fundamental_boost: f32,

    // --- Note tracking ---
    pub note_tolerance_cents: f32,
    pub max_gap_frames: usize,
    /// Seconds.
    pub min_note_duration: f32,
    /// Seconds.
    pub max_note_duration: f32,
    pub pitch_smoothing_frames: usize,
    pub vibrato_threshold_cents: f32,
    pub bend_threshold_cents: f32,

    // --- Fretboard ---
    /// Open-string MIDI pitches, index 0 is the top line of the tab (high e).
    pub string_tuning: [u8; NUM_STRINGS],
    pub max_fret: u8,
    pub capo_fret: u8,
    pub preferred_position_range: [u8; 2],
    pub columns_per_second: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            hop_size: 512,
            bins_per_octave: 12,
            octaves: 6,
            min_frequency: 65.406,
            absolute_threshold: 0.01,
            adaptive_threshold_factor: 1.5,
            adaptive_window_size: 4,
            max_harmonics: 6,
            harmonic_decay_factor: 0.8,
            harmonic_tolerance_cents: 50.0,
            fundamental_boost: 2.0,
            note_tolerance_cents: 50.0,
            max_gap_frames: 3,
            min_note_duration: 0.05,
            max_note_duration: 8.0,
            pitch_smoothing_frames: 3,
            vibrato_threshold_cents: 20.0,
            bend_threshold_cents: 80.0,
            string_tuning: [64, 59, 55, 50, 45, 40],
            max_fret: 22,
            capo_fret: 0,
            preferred_position_range: [0, 7],
            columns_per_second: 16,
        }
    }
}

/// The subset of the configuration that determines the computed frames.
///
/// Two configs with equal spectral params can share one frame cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralParams {
    pub frame_size: usize,
    pub hop_size: usize,
    pub bins_per_octave: usize,
    pub octaves: usize,
    pub min_frequency: f32,
}

impl SpectralParams {
    pub fn total_bins(&self) -> usize {
        self.bins_per_octave * self.octaves
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> TabError {
    TabError::InvalidConfig {
        field,
        reason: reason.into(),
    }
}

fn require_finite(field: &'static str, value: f32) -> TabResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid(field, "must be finite"))
    }
}

impl PipelineConfig {
    pub fn spectral_params(&self) -> SpectralParams {
        SpectralParams {
            frame_size: self.frame_size,
            hop_size: self.hop_size,
            bins_per_octave: self.bins_per_octave,
            octaves: self.octaves,
            min_frequency: self.min_frequency,
        }
    }

    /// Checks every field. Called by all constructors so that a bad
    /// configuration fails before any audio is touched.
    pub fn validate(&self) -> TabResult<()> {
        if !self.frame_size.is_power_of_two() || self.frame_size < 64 {
            return Err(TabError::FrameSizeNotPowerOfTwo(self.frame_size));
        }
        if self.hop_size == 0 || self.hop_size > self.frame_size {
            return Err(invalid("hop_size", format!("must be in 1..={}", self.frame_size)));
        }
        if self.bins_per_octave == 0 {
            return Err(invalid("bins_per_octave", "must be at least 1"));
        }
        if self.octaves == 0 {
            return Err(invalid("octaves", "must be at least 1"));
        }
        require_finite("min_frequency", self.min_frequency)?;
        if self.min_frequency <= 0.0 {
            return Err(invalid("min_frequency", "must be positive"));
        }

        require_finite("absolute_threshold", self.absolute_threshold)?;
        if self.absolute_threshold < 0.0 {
            return Err(invalid("absolute_threshold", "must not be negative"));
        }
        require_finite("adaptive_threshold_factor", self.adaptive_threshold_factor)?;
        if self.adaptive_threshold_factor <= 0.0 {
            return Err(invalid("adaptive_threshold_factor", "must be positive"));
        }

        if self.max_harmonics == 0 {
            return Err(invalid("max_harmonics", "must be at least 1"));
        }
        require_finite("harmonic_decay_factor", self.harmonic_decay_factor)?;
        if self.harmonic_decay_factor <= 0.0 || self.harmonic_decay_factor > 1.0 {
            return Err(invalid("harmonic_decay_factor", "must be in (0, 1]"));
        }
        require_finite("harmonic_tolerance_cents", self.harmonic_tolerance_cents)?;
        if self.harmonic_tolerance_cents < 0.0 {
            return Err(invalid("harmonic_tolerance_cents", "must not be negative"));
        }
        require_finite("fundamental_boost", self.fundamental_boost)?;
        if self.fundamental_boost < 0.0 {
            return Err(invalid("fundamental_boost", "must not be negative"));
        }

        require_finite("note_tolerance_cents", self.note_tolerance_cents)?;
        if self.note_tolerance_cents < 0.0 {
            return Err(invalid("note_tolerance_cents", "must not be negative"));
        }
        require_finite("min_note_duration", self.min_note_duration)?;
        require_finite("max_note_duration", self.max_note_duration)?;
        if self.min_note_duration < 0.0 {
            return Err(invalid("min_note_duration", "must not be negative"));
        }
        if self.max_note_duration <= 0.0 || self.max_note_duration < self.min_note_duration {
            return Err(invalid(
                "max_note_duration",
                "must be positive and not below min_note_duration",
            ));
        }
        if self.pitch_smoothing_frames == 0 {
            return Err(invalid("pitch_smoothing_frames", "must be at least 1"));
        }
        require_finite("vibrato_threshold_cents", self.vibrato_threshold_cents)?;
        require_finite("bend_threshold_cents", self.bend_threshold_cents)?;
        if self.vibrato_threshold_cents < 0.0 || self.bend_threshold_cents < 0.0 {
            return Err(invalid("vibrato_threshold_cents", "thresholds must not be negative"));
        }

        self.validate_tuning()?;
        if self.columns_per_second == 0 {
            return Err(invalid("columns_per_second", "must be at least 1"));
        }
        Ok(())
    }

    fn validate_tuning(&self) -> TabResult<()> {
        if self.capo_fret >= self.max_fret {
            return Err(TabError::InvalidTuning(format!(
                "capo at fret {} leaves no playable frets below max fret {}",
                self.capo_fret, self.max_fret
            )));
        }
        for (string, &open) in self.string_tuning.iter().enumerate() {
            if open as u32 + self.max_fret as u32 > 127 {
                return Err(TabError::InvalidTuning(format!(
                    "string {} (open pitch {}) exceeds the MIDI range at fret {}",
                    string, open, self.max_fret
                )));
            }
        }
        let [low, high] = self.preferred_position_range;
        if low > high {
            return Err(TabError::InvalidTuning(format!(
                "preferred position range [{}, {}] is reversed",
                low, high
            )));
        }
        Ok(())
    }

    /// Checks the parts of the configuration that depend on the audio's sample rate.
    pub fn validate_for_sample_rate(&self, sample_rate: u32) -> TabResult<()> {
        if sample_rate == 0 {
            return Err(TabError::InvalidSampleRate(sample_rate));
        }
        let top_frequency = self.min_frequency * 2.0_f32.powf(self.octaves as f32);
        if top_frequency >= sample_rate as f32 / 2.0 {
            return Err(TabError::InvalidSampleRate(sample_rate));
        }
        Ok(())
    }

    /// Saves the configuration to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> TabResult<()> {
        let json_string = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }

    /// Loads a configuration from a JSON file. Missing fields take their
    /// defaults; the result is validated before it is returned.
    pub fn load(path: impl AsRef<Path>) -> TabResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let config: PipelineConfig = serde_json::from_str(&data)?;
        config.validate()?;
        log::info!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }
}
