//! MIDI view of a transcription: tick-timed notes and a flat event list that
//! a file writer or synthesizer can consume.

use serde::{Deserialize, Serialize};

use crate::tracker::Note;

/// Tick resolution and tempo used to convert seconds to ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tempo {
    pub bpm: f64,
    /// Pulses (ticks) per quarter note.
    pub ppq: u16,
}

impl Default for Tempo {
    fn default() -> Self {
        Self { bpm: 120.0, ppq: 480 }
    }
}

impl Tempo {
    pub fn ticks_per_second(&self) -> f64 {
        self.bpm / 60.0 * self.ppq as f64
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.ticks_per_second()).round() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidiNote {
    pub key: u8,
    /// 1..=127, relative to the loudest note of the transcription.
    pub velocity: u8,
    pub start_tick: u64,
    /// At least one tick.
    pub duration_ticks: u64,
    pub start_seconds: f64,
    pub duration_seconds: f64,
    /// Signed bend amount in cents, 0 for unbent notes.
    pub bend_cents: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiEventKind {
    NoteOn,
    NoteOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub tick: u64,
    pub kind: MidiEventKind,
    pub key: u8,
    pub velocity: u8,
}

fn velocity(magnitude: f32, loudest: f32) -> u8 {
    if loudest <= 0.0 {
        return 1;
    }
    ((magnitude / loudest) * 127.0).round().clamp(1.0, 127.0) as u8
}

/// Converts notes to MIDI notes in start order. Pitches are rounded to the
/// nearest key and clamped to 0..=127.
pub fn to_midi_notes(notes: &[Note], tempo: Tempo) -> Vec<MidiNote> {
    let loudest = notes.iter().map(|n| n.magnitude).fold(0.0_f32, f32::max);
    let mut midi: Vec<MidiNote> = notes
        .iter()
        .map(|note| {
            let start_tick = tempo.seconds_to_ticks(note.start_time);
            let end_tick = tempo.seconds_to_ticks(note.end_time());
            let bend_cents = note
                .bend
                .map(|b| (b.end_pitch - b.start_pitch) * 100.0)
                .unwrap_or(0.0);
            MidiNote {
                key: note.midi_key().clamp(0, 127) as u8,
                velocity: velocity(note.magnitude, loudest),
                start_tick,
                duration_ticks: end_tick.saturating_sub(start_tick).max(1),
                start_seconds: note.start_time,
                duration_seconds: note.duration,
                bend_cents,
            }
        })
        .collect();
    midi.sort_by_key(|n| (n.start_tick, n.key));
    midi
}

/// Flattens notes into NoteOn/NoteOff events ordered by tick. At equal ticks
/// NoteOff comes first so a repeated key is released before it is struck again.
pub fn to_midi_events(notes: &[MidiNote]) -> Vec<MidiEvent> {
    let mut events: Vec<MidiEvent> = notes
        .iter()
        .flat_map(|note| {
            [
                MidiEvent {
                    tick: note.start_tick,
                    kind: MidiEventKind::NoteOn,
                    key: note.key,
                    velocity: note.velocity,
                },
                MidiEvent {
                    tick: note.start_tick + note.duration_ticks,
                    kind: MidiEventKind::NoteOff,
                    key: note.key,
                    velocity: 0,
                },
            ]
        })
        .collect();
    events.sort_by_key(|e| {
        let order = match e.kind {
            MidiEventKind::NoteOff => 0,
            MidiEventKind::NoteOn => 1,
        };
        (e.tick, order, e.key)
    });
    events
}
