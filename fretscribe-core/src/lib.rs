// fretscribe-core/src/lib.rs

//! The core engine of the guitar transcriber.
//! This crate turns a buffer of audio samples into notes, chords and
//! six-string tablature: a constant-Q transform, peak picking, harmonic
//! resolution, note tracking, post-processing and fret assignment.
//! It is completely headless and does no audio I/O of its own.

pub mod config;
pub mod cqt;
pub mod error;
pub mod frames;
pub mod harmonics;
pub mod midi;
pub mod peaks;
pub mod pipeline;
pub mod post;
pub mod session;
pub mod tab;
pub mod tracker;
pub mod trajectory;
pub mod tuning;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use config::PipelineConfig;
pub use error::{TabError, TabResult};
pub use post::{Chord, ChordType};
pub use session::{SnapshotHandle, TranscriptionSession};
pub use tab::{TabCell, TabGrid};
pub use tracker::Note;
pub use worker::{TranscriptionWorker, WorkerEvent};

/// The complete result of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    /// Finalized notes in start order.
    pub notes: Vec<Note>,
    /// Groups of notes that start together.
    pub chords: Vec<Chord>,
    pub tab: TabGrid,
}

impl Default for Transcription {
    /// Nothing transcribed yet: no notes and a zero-column tab.
    fn default() -> Self {
        let config = PipelineConfig::default();
        Self {
            notes: Vec::new(),
            chords: Vec::new(),
            tab: TabGrid::new(
                0,
                config.string_tuning,
                config.capo_fret,
                config.columns_per_second,
            ),
        }
    }
}

impl Transcription {
    /// The notes as tick-timed MIDI notes.
    pub fn midi_notes(&self, tempo: midi::Tempo) -> Vec<midi::MidiNote> {
        midi::to_midi_notes(&self.notes, tempo)
    }

    /// Serializes the transcription as pretty-printed JSON.
    pub fn to_json(&self) -> TabResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
