//! # Musical Tuning Module
//!
//! Conversions between the different ways the pipeline talks about pitch:
//! CQT bin positions, frequencies in Hz, fractional MIDI pitches and cents.
//! Also provides note names for tab string labels and chord roots.
//!
//! ## Features
//! - Equal temperament frequency calculations (A4 = 440 Hz)
//! - Bin <-> frequency mapping for a log-spaced bin grid
//! - Note names for all 128 MIDI pitches

use once_cell::sync::Lazy;

/// Pitch-class names, indexed by `midi % 12`.
pub const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Names for every MIDI pitch (e.g. "E2", "A#4"), computed once at startup.
static NOTE_NAMES: Lazy<Vec<String>> = Lazy::new(|| {
    (0..128u32)
        .map(|midi| {
            // MIDI 60 is C4, so octave numbering starts at -1.
            let octave = midi as i32 / 12 - 1;
            format!("{}{}", PITCH_CLASS_NAMES[(midi % 12) as usize], octave)
        })
        .collect()
});

/// Returns the scientific-pitch name of a MIDI note number.
pub fn note_name(midi: u8) -> &'static str {
    NOTE_NAMES[(midi & 0x7f) as usize].as_str()
}

/// Returns the pitch-class name (no octave) of a MIDI note number.
pub fn pitch_class_name(midi: u8) -> &'static str {
    PITCH_CLASS_NAMES[(midi % 12) as usize]
}

pub fn midi_to_frequency(midi: f32) -> f32 {
    440.0 * 2.0_f32.powf((midi - 69.0) / 12.0)
}

pub fn frequency_to_midi(freq: f32) -> f32 {
    69.0 + 12.0 * (freq / 440.0).log2()
}

/// The log-frequency grid shared by the spectral kernel and every stage that
/// interprets its bins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinScale {
    pub bins_per_octave: usize,
    pub min_frequency: f32,
}

impl BinScale {
    pub fn new(bins_per_octave: usize, min_frequency: f32) -> Self {
        Self {
            bins_per_octave,
            min_frequency,
        }
    }

    /// Centre frequency of a (possibly fractional) bin position.
    pub fn bin_to_frequency(&self, bin: f32) -> f32 {
        self.min_frequency * 2.0_f32.powf(bin / self.bins_per_octave as f32)
    }

    pub fn bin_to_midi(&self, bin: f32) -> f32 {
        frequency_to_midi(self.min_frequency) + bin * 12.0 / self.bins_per_octave as f32
    }

    /// Width of a cents interval expressed in bins.
    pub fn cents_to_bins(&self, cents: f32) -> f32 {
        cents * self.bins_per_octave as f32 / 1200.0
    }

    /// Bin offset between a fundamental and its `harmonic`-th partial.
    pub fn harmonic_offset(&self, harmonic: usize) -> f32 {
        (harmonic as f32).log2() * self.bins_per_octave as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn names_follow_scientific_pitch() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(40), "E2");
        assert_eq!(note_name(69), "A4");
        assert_eq!(pitch_class_name(70), "A#");
    }

    #[test]
    fn midi_frequency_conversions_agree() {
        assert_abs_diff_eq!(midi_to_frequency(69.0), 440.0, epsilon = 1e-3);
        assert_abs_diff_eq!(frequency_to_midi(82.407), 40.0, epsilon = 1e-3);
    }

    #[test]
    fn bin_scale_maps_semitones() {
        let scale = BinScale::new(12, 65.406);
        assert_abs_diff_eq!(scale.bin_to_midi(0.0), 36.0, epsilon = 1e-3);
        assert_abs_diff_eq!(scale.bin_to_midi(33.0), 69.0, epsilon = 1e-3);
        assert_abs_diff_eq!(scale.bin_to_frequency(33.0), 440.0, epsilon = 1e-2);
        assert_abs_diff_eq!(scale.harmonic_offset(2), 12.0, epsilon = 1e-4);
        assert_abs_diff_eq!(scale.cents_to_bins(50.0), 0.5, epsilon = 1e-6);

        let fine = BinScale::new(36, 65.406);
        assert_abs_diff_eq!(fine.harmonic_offset(3), 57.059, epsilon = 1e-2);
    }
}
