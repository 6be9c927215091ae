//! # Post-Processing
//!
//! Cleans up the tracker's output: same-pitch fragments separated by a brief
//! dropout are merged back into one note, and notes that start together are
//! clustered into chords with a best-effort quality label.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::tracker::Note;
use crate::tuning;

/// Same-pitch notes closer than this (seconds) are merged.
pub const MERGE_WINDOW: f64 = 0.05;
/// Notes starting within this many seconds of each other form a chord.
pub const CHORD_WINDOW: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChordType {
    Major,
    Minor,
    Diminished,
    Augmented,
    Dominant7,
    Major7,
    Minor7,
    Sus2,
    Sus4,
    Power,
    Unknown,
}

impl fmt::Display for ChordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self {
            ChordType::Major => "",
            ChordType::Minor => "m",
            ChordType::Diminished => "dim",
            ChordType::Augmented => "aug",
            ChordType::Dominant7 => "7",
            ChordType::Major7 => "maj7",
            ChordType::Minor7 => "m7",
            ChordType::Sus2 => "sus2",
            ChordType::Sus4 => "sus4",
            ChordType::Power => "5",
            ChordType::Unknown => "?",
        };
        f.write_str(suffix)
    }
}

/// Interval patterns in semitones above the root. Earlier entries win ties,
/// so the order here is part of the classification's behavior.
const CHORD_PATTERNS: [(ChordType, &[u8]); 10] = [
    (ChordType::Major, &[0, 4, 7]),
    (ChordType::Minor, &[0, 3, 7]),
    (ChordType::Diminished, &[0, 3, 6]),
    (ChordType::Augmented, &[0, 4, 8]),
    (ChordType::Dominant7, &[0, 4, 7, 10]),
    (ChordType::Major7, &[0, 4, 7, 11]),
    (ChordType::Minor7, &[0, 3, 7, 10]),
    (ChordType::Sus2, &[0, 2, 7]),
    (ChordType::Sus4, &[0, 5, 7]),
    (ChordType::Power, &[0, 7]),
];

/// Notes sounding together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chord {
    pub time: f64,
    pub duration: f64,
    /// MIDI pitch of the lowest note.
    pub root: i32,
    pub chord_type: ChordType,
    /// Rounded MIDI pitches of the constituent notes, ascending.
    pub pitches: Vec<i32>,
}

impl Chord {
    /// Display name such as "Am" or "E5".
    pub fn name(&self) -> String {
        format!(
            "{}{}",
            tuning::pitch_class_name(self.root.rem_euclid(128) as u8),
            self.chord_type
        )
    }
}

fn sort_chronologically(notes: &mut [Note]) {
    notes.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then(a.midi_pitch.total_cmp(&b.midi_pitch))
    });
}

/// Merges same-pitch notes separated by less than [`MERGE_WINDOW`]. The
/// earlier note is stretched to cover the later one and keeps the larger
/// magnitude. Output is sorted by start time.
pub fn merge_notes(mut notes: Vec<Note>) -> Vec<Note> {
    sort_chronologically(&mut notes);
    let before = notes.len();

    let mut merged: Vec<Note> = Vec::with_capacity(notes.len());
    for note in notes {
        let target = merged
            .iter_mut()
            .rev()
            .find(|kept| kept.midi_key() == note.midi_key());
        match target {
            Some(kept) if note.start_time - kept.end_time() < MERGE_WINDOW => {
                let end = kept.end_time().max(note.end_time());
                kept.duration = end - kept.start_time;
                kept.magnitude = kept.magnitude.max(note.magnitude);
                kept.confidence = kept.confidence.max(note.confidence);
                kept.samples.extend(note.samples);
            }
            _ => merged.push(note),
        }
    }

    log::debug!("Merged {} notes into {}", before, merged.len());
    merged
}

/// Scores each pattern by how many of its intervals are present; the first
/// pattern with the highest score wins. A score below 2 means only the root
/// matched, which is reported as [`ChordType::Unknown`].
pub fn classify_chord(root: i32, pitches: &[i32]) -> ChordType {
    let intervals: BTreeSet<u8> = pitches
        .iter()
        .map(|p| (p - root).rem_euclid(12) as u8)
        .collect();

    let mut best = (ChordType::Unknown, 0usize);
    for (chord_type, pattern) in CHORD_PATTERNS.iter() {
        let score = pattern.iter().filter(|i| intervals.contains(i)).count();
        if score > best.1 {
            best = (*chord_type, score);
        }
    }
    if best.1 < 2 {
        ChordType::Unknown
    } else {
        best.0
    }
}

/// Groups notes whose onsets fall within [`CHORD_WINDOW`] of the group's
/// first note. Groups with at least two distinct pitch classes become chords.
pub fn detect_chords(notes: &[Note]) -> Vec<Chord> {
    let mut sorted: Vec<&Note> = notes.iter().collect();
    sorted.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then(a.midi_pitch.total_cmp(&b.midi_pitch))
    });

    let mut chords = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let anchor = sorted[i];
        let group: Vec<&Note> = sorted[i..]
            .iter()
            .take_while(|n| n.start_time - anchor.start_time <= CHORD_WINDOW)
            .copied()
            .collect();

        let pitch_classes: BTreeSet<i32> =
            group.iter().map(|n| n.midi_key().rem_euclid(12)).collect();
        if group.len() >= 2 && pitch_classes.len() >= 2 {
            let mut pitches: Vec<i32> = group.iter().map(|n| n.midi_key()).collect();
            pitches.sort();
            pitches.dedup();
            let root = pitches[0];
            let end = group
                .iter()
                .map(|n| n.end_time())
                .fold(f64::NEG_INFINITY, f64::max);
            chords.push(Chord {
                time: anchor.start_time,
                duration: end - anchor.start_time,
                root,
                chord_type: classify_chord(root, &pitches),
                pitches,
            });
            i += group.len();
        } else {
            i += 1;
        }
    }

    log::debug!("Detected {} chords", chords.len());
    chords
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn note(start: f64, duration: f64, midi: f32, magnitude: f32) -> Note {
        Note {
            start_time: start,
            duration,
            midi_pitch: midi,
            frequency: tuning::midi_to_frequency(midi),
            magnitude,
            bend: None,
            vibrato: None,
            confidence: 0.8,
            onset_strength: 1.0,
            samples: vec![],
        }
    }

    #[test]
    fn fragments_of_one_pitch_are_merged() {
        let notes = vec![note(0.5, 0.2, 60.1, 0.3), note(0.0, 0.47, 60.0, 0.2)];
        let merged = merge_notes(notes);
        assert_eq!(merged.len(), 1);
        assert_abs_diff_eq!(merged[0].start_time, 0.0);
        assert_abs_diff_eq!(merged[0].duration, 0.7, epsilon = 1e-9);
        assert_abs_diff_eq!(merged[0].magnitude, 0.3);
    }

    #[test]
    fn separated_or_different_notes_stay_apart() {
        let notes = vec![
            note(0.0, 0.2, 60.0, 0.2),
            note(0.3, 0.2, 60.0, 0.2),
            note(0.21, 0.2, 62.0, 0.2),
        ];
        let merged = merge_notes(notes);
        assert_eq!(merged.len(), 3);
        let starts: Vec<f64> = merged.iter().map(|n| n.start_time).collect();
        assert_eq!(starts, vec![0.0, 0.21, 0.3]);
    }

    #[test]
    fn classifies_common_shapes() {
        assert_eq!(classify_chord(57, &[57, 60, 64]), ChordType::Minor);
        assert_eq!(classify_chord(48, &[48, 52, 55]), ChordType::Major);
        assert_eq!(classify_chord(43, &[43, 47, 50, 53]), ChordType::Dominant7);
        assert_eq!(classify_chord(48, &[48, 52, 55, 59]), ChordType::Major7);
        assert_eq!(classify_chord(50, &[50, 52, 57]), ChordType::Sus2);
        assert_eq!(classify_chord(50, &[50, 55, 57]), ChordType::Sus4);
        assert_eq!(classify_chord(59, &[59, 62, 65]), ChordType::Diminished);
        assert_eq!(classify_chord(48, &[48, 52, 56]), ChordType::Augmented);
        assert_eq!(classify_chord(48, &[48, 49]), ChordType::Unknown);
    }

    #[test]
    fn ties_keep_the_earlier_pattern() {
        // Root and fifth alone score 2 for Major, Minor, Sus2, Sus4 and Power;
        // Major comes first in the table.
        assert_eq!(classify_chord(40, &[40, 47, 52]), ChordType::Major);
    }

    #[test]
    fn simultaneous_onsets_form_a_chord() {
        let notes = vec![
            note(1.0, 0.5, 57.0, 0.2),
            note(1.02, 0.6, 60.0, 0.2),
            note(1.04, 0.4, 64.0, 0.2),
            note(2.0, 0.5, 64.0, 0.2),
        ];
        let chords = detect_chords(&notes);
        assert_eq!(chords.len(), 1);
        let chord = &chords[0];
        assert_eq!(chord.root, 57);
        assert_eq!(chord.pitches, vec![57, 60, 64]);
        assert_eq!(chord.chord_type, ChordType::Minor);
        assert_eq!(chord.name(), "Am");
        assert_abs_diff_eq!(chord.time, 1.0);
        assert_abs_diff_eq!(chord.duration, 0.62, epsilon = 1e-9);
    }

    #[test]
    fn octaves_alone_are_not_a_chord() {
        let notes = vec![note(0.0, 0.5, 45.0, 0.2), note(0.01, 0.5, 57.0, 0.2)];
        assert!(detect_chords(&notes).is_empty());
    }

    #[test]
    fn empty_input() {
        assert!(merge_notes(vec![]).is_empty());
        assert!(detect_chords(&[]).is_empty());
    }
}
