//! # Note Tracking
//!
//! Turns the per-frame fundamentals into notes that span many frames. Each
//! active note lives in an arena slot addressed by a stable [`NoteId`]; a
//! rounded-bin index finds candidates for a new fundamental without walking
//! every active note. A note stays open while its pitch keeps reappearing,
//! tolerates short dropouts, and is finalized once the gap grows too long,
//! it reaches the maximum length, or the stream ends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::harmonics::Fundamental;
use crate::trajectory::{self, Bend, PitchSample, TrajectoryParams, Vibrato};
use crate::tuning::{self, BinScale};

/// Index of an active note in the tracker's arena.
pub type NoteId = usize;

/// A finalized note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Seconds from the start of the audio.
    pub start_time: f64,
    /// Seconds. Never below the configured minimum note duration.
    pub duration: f64,
    /// Average fractional MIDI pitch.
    pub midi_pitch: f32,
    /// Average frequency in Hz.
    pub frequency: f32,
    /// Average magnitude, used as velocity.
    pub magnitude: f32,
    pub bend: Option<Bend>,
    pub vibrato: Option<Vibrato>,
    /// 0..1
    pub confidence: f32,
    /// Spectral flux at the first frame relative to the strongest onset of the run.
    pub onset_strength: f32,
    pub samples: Vec<PitchSample>,
}

impl Note {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Nearest integer MIDI pitch.
    pub fn midi_key(&self) -> i32 {
        self.midi_pitch.round() as i32
    }

    /// Scientific-pitch name of the nearest key, e.g. "E2".
    pub fn name(&self) -> &'static str {
        tuning::note_name(self.midi_key().clamp(0, 127) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerParams {
    pub tolerance_cents: f32,
    pub max_gap_frames: usize,
    pub min_note_duration: f32,
    pub max_note_duration: f32,
    pub trajectory: TrajectoryParams,
}

#[derive(Debug, Clone)]
struct ActiveNote {
    /// Tracking bin; follows the pitch as it drifts.
    bin: f32,
    start_frame: usize,
    start_time: f64,
    last_seen_frame: usize,
    frames_since_seen: usize,
    onset_strength: f32,
    samples: Vec<PitchSample>,
}

/// Multi-frame note state machine.
#[derive(Debug)]
pub struct NoteTracker {
    params: TrackerParams,
    scale: BinScale,
    hop_duration: f64,
    arena: Vec<Option<ActiveNote>>,
    free: Vec<NoteId>,
    /// Rounded tracking bin -> ids of the active notes at that bin.
    by_bin: BTreeMap<i64, Vec<NoteId>>,
    finished: Vec<Note>,
    discarded: usize,
}

fn bin_key(bin: f32) -> i64 {
    bin.round() as i64
}

impl NoteTracker {
    pub fn new(params: TrackerParams, scale: BinScale, hop_duration: f64) -> Self {
        Self {
            params,
            scale,
            hop_duration,
            arena: Vec::new(),
            free: Vec::new(),
            by_bin: BTreeMap::new(),
            finished: Vec::new(),
            discarded: 0,
        }
    }

    /// Number of notes currently open.
    pub fn active_count(&self) -> usize {
        self.arena.iter().filter(|slot| slot.is_some()).count()
    }

    /// Feeds one frame's fundamentals, strongest first.
    pub fn process_frame(
        &mut self,
        frame: usize,
        time: f64,
        fundamentals: &[Fundamental],
        onset_strength: f32,
    ) {
        let tolerance = self.scale.cents_to_bins(self.params.tolerance_cents);
        let mut matched = vec![false; self.arena.len()];

        for fundamental in fundamentals {
            let peak = fundamental.peak;
            let sample = PitchSample {
                frame,
                time,
                bin: peak.bin,
                midi: peak.midi,
                frequency: peak.frequency,
                magnitude: peak.magnitude,
            };

            match self.nearest_active(peak.bin, tolerance, &matched) {
                Some(id) => {
                    self.extend(id, frame, sample);
                    matched[id] = true;
                }
                None => {
                    let id = self.open(frame, time, sample, onset_strength);
                    if id >= matched.len() {
                        matched.resize(id + 1, false);
                    }
                    matched[id] = true;
                }
            }
        }

        for id in 0..self.arena.len() {
            let Some(note) = self.arena[id].as_mut() else {
                continue;
            };
            let close = if matched.get(id).copied().unwrap_or(false) {
                let length = (frame - note.start_frame + 1) as f64 * self.hop_duration;
                length >= self.params.max_note_duration as f64
            } else {
                note.frames_since_seen += 1;
                note.frames_since_seen > self.params.max_gap_frames
            };
            if close {
                self.close(id);
            }
        }
    }

    /// Closes every remaining note and returns all finalized notes in the
    /// order they were closed.
    pub fn finish(mut self) -> Vec<Note> {
        for id in 0..self.arena.len() {
            if self.arena[id].is_some() {
                self.close(id);
            }
        }
        log::debug!(
            "Tracker finished: {} notes kept, {} shorter than {:.3}s discarded",
            self.finished.len(),
            self.discarded,
            self.params.min_note_duration
        );
        self.finished
    }

    fn nearest_active(&self, bin: f32, tolerance: f32, matched: &[bool]) -> Option<NoteId> {
        let lo = (bin - tolerance).floor() as i64;
        let hi = (bin + tolerance).ceil() as i64;
        let mut best: Option<(NoteId, f32)> = None;
        for ids in self.by_bin.range(lo..=hi).map(|(_, ids)| ids) {
            for &id in ids {
                if matched.get(id).copied().unwrap_or(false) {
                    continue;
                }
                let Some(note) = self.arena[id].as_ref() else {
                    continue;
                };
                let distance = (note.bin - bin).abs();
                if distance > tolerance {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_id, best_distance)) => {
                        distance < best_distance || (distance == best_distance && id < best_id)
                    }
                };
                if better {
                    best = Some((id, distance));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    fn open(&mut self, frame: usize, time: f64, sample: PitchSample, onset_strength: f32) -> NoteId {
        let note = ActiveNote {
            bin: sample.bin,
            start_frame: frame,
            start_time: time,
            last_seen_frame: frame,
            frames_since_seen: 0,
            onset_strength,
            samples: vec![sample],
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id] = Some(note);
                id
            }
            None => {
                self.arena.push(Some(note));
                self.arena.len() - 1
            }
        };
        self.by_bin.entry(bin_key(sample.bin)).or_default().push(id);
        log::trace!("Opened note {} at frame {} (bin {:.2})", id, frame, sample.bin);
        id
    }

    fn extend(&mut self, id: NoteId, frame: usize, sample: PitchSample) {
        let Some(note) = self.arena[id].as_mut() else {
            return;
        };
        let old_key = bin_key(note.bin);
        note.bin = sample.bin;
        note.last_seen_frame = frame;
        note.frames_since_seen = 0;
        note.samples.push(sample);
        let new_key = bin_key(sample.bin);
        if new_key != old_key {
            self.unindex(id, old_key);
            self.by_bin.entry(new_key).or_default().push(id);
        }
    }

    fn unindex(&mut self, id: NoteId, key: i64) {
        if let Some(ids) = self.by_bin.get_mut(&key) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.by_bin.remove(&key);
            }
        }
    }

    fn close(&mut self, id: NoteId) {
        let Some(note) = self.arena[id].take() else {
            return;
        };
        self.unindex(id, bin_key(note.bin));
        self.free.push(id);

        match self.finalize(note) {
            Some(finished) => self.finished.push(finished),
            None => self.discarded += 1,
        }
    }

    /// Builds the immutable note, or `None` if it is too short to keep.
    fn finalize(&self, note: ActiveNote) -> Option<Note> {
        // The gap tail after the last matched frame is not part of the note.
        let frames = note.last_seen_frame - note.start_frame + 1;
        let duration = frames as f64 * self.hop_duration;
        if duration < self.params.min_note_duration as f64 {
            log::trace!(
                "Discarded {:.3}s note at {:.3}s",
                duration,
                note.start_time
            );
            return None;
        }

        let n = note.samples.len() as f32;
        let midi_pitch = note.samples.iter().map(|s| s.midi).sum::<f32>() / n;
        let frequency = note.samples.iter().map(|s| s.frequency).sum::<f32>() / n;
        let magnitude = note.samples.iter().map(|s| s.magnitude).sum::<f32>() / n;
        let shape = trajectory::analyze_trajectory(
            &note.samples,
            self.hop_duration,
            &self.params.trajectory,
        );
        let confidence = trajectory::confidence(&note.samples);

        Some(Note {
            start_time: note.start_time,
            duration,
            midi_pitch,
            frequency,
            magnitude,
            bend: shape.bend,
            vibrato: shape.vibrato,
            confidence,
            onset_strength: note.onset_strength,
            samples: note.samples,
        })
    }
}
