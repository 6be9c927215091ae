//! # Tab Generator
//!
//! Places every finalized note on a (string, fret) position and writes it
//! into a string-by-column grid. Candidate positions are scored for comfort
//! (preferred hand position, open strings), for conflicts with notes already
//! placed, and for continuity with the frets used nearby in time. The
//! highest score wins; on a tie the lowest string index wins.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::config::{NUM_STRINGS, PipelineConfig};
use crate::tracker::Note;
use crate::trajectory::BendDirection;
use crate::tuning;

/// Columns on each side of a note's start column used for the continuity average.
pub const CONTINUITY_WINDOW: usize = 10;
/// Notes whose onset strength is below this can be slurred into from the
/// previous note on the same string.
pub const LEGATO_ONSET_THRESHOLD: f32 = 0.3;

const PREFERRED_RANGE_BONUS: f32 = 10.0;
const OPEN_STRING_BONUS: f32 = 5.0;
const CONFLICT_PENALTY: f32 = -100.0;
const CONTINUITY_WEIGHT: f32 = 2.0;

/// Playing technique marked after a fret number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Articulation {
    BendUp,
    BendDown,
    Vibrato,
    HammerOn,
    PullOff,
}

impl Articulation {
    pub fn suffix(self) -> char {
        match self {
            Articulation::BendUp => 'b',
            Articulation::BendDown => 'r',
            Articulation::Vibrato => 'v',
            Articulation::HammerOn => 'h',
            Articulation::PullOff => 'p',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TabCell {
    #[default]
    Empty,
    /// Continuation of the note started earlier in the same row.
    Sustain,
    Fret {
        fret: u8,
        articulation: Option<Articulation>,
    },
}

impl TabCell {
    pub fn is_empty(&self) -> bool {
        matches!(self, TabCell::Empty)
    }

    fn text(&self) -> String {
        match self {
            TabCell::Empty => "-".to_string(),
            TabCell::Sustain => "=".to_string(),
            TabCell::Fret { fret, articulation } => match articulation {
                Some(a) => format!("{}{}", fret, a.suffix()),
                None => fret.to_string(),
            },
        }
    }
}

/// A playable (string, fret) pair. String 0 is the top tab line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FretPosition {
    pub string: usize,
    /// Fret relative to the capo.
    pub fret: u8,
}

/// A cell that breaks the rule that sustain only continues a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SustainViolation {
    pub string: usize,
    pub column: usize,
}

/// The string-by-column tablature grid with one confidence value per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabGrid {
    cells: Vec<Vec<TabCell>>,
    confidence: Vec<f32>,
    string_tuning: [u8; NUM_STRINGS],
    capo_fret: u8,
    columns_per_second: u32,
}

impl TabGrid {
    /// An all-empty grid.
    pub fn new(
        num_columns: usize,
        string_tuning: [u8; NUM_STRINGS],
        capo_fret: u8,
        columns_per_second: u32,
    ) -> Self {
        Self {
            cells: vec![vec![TabCell::Empty; num_columns]; NUM_STRINGS],
            confidence: vec![0.0; num_columns],
            string_tuning,
            capo_fret,
            columns_per_second,
        }
    }

    pub fn num_strings(&self) -> usize {
        self.cells.len()
    }

    pub fn num_columns(&self) -> usize {
        self.confidence.len()
    }

    pub fn cell(&self, string: usize, column: usize) -> TabCell {
        self.cells
            .get(string)
            .and_then(|row| row.get(column))
            .copied()
            .unwrap_or_default()
    }

    /// The cells of one string, `None` past the last string.
    pub fn row(&self, string: usize) -> Option<&[TabCell]> {
        self.cells.get(string).map(Vec::as_slice)
    }

    /// Highest confidence of the notes sounding in each column, 0 where none do.
    pub fn confidence(&self) -> &[f32] {
        &self.confidence
    }

    pub fn string_tuning(&self) -> [u8; NUM_STRINGS] {
        self.string_tuning
    }

    pub fn columns_per_second(&self) -> u32 {
        self.columns_per_second
    }

    /// Column containing `time` seconds.
    pub fn column_at(&self, time: f64) -> usize {
        (time.max(0.0) * self.columns_per_second as f64).floor() as usize
    }

    pub fn is_all_empty(&self) -> bool {
        self.cells.iter().flatten().all(TabCell::is_empty)
    }

    fn column_is_silent(&self, column: usize) -> bool {
        self.cells.iter().all(|row| row[column].is_empty())
    }

    /// Returns the first cell, scanning row by row, where a sustain marker
    /// opens a row or follows an empty cell.
    pub fn check_sustain_invariant(&self) -> Result<(), SustainViolation> {
        for (string, row) in self.cells.iter().enumerate() {
            let mut previous = TabCell::Empty;
            for (column, cell) in row.iter().enumerate() {
                if *cell == TabCell::Sustain && previous.is_empty() {
                    return Err(SustainViolation { string, column });
                }
                previous = *cell;
            }
        }
        Ok(())
    }

    /// ASCII tablature: one line per string labelled with its open-string
    /// note, then a line with a 0-9 confidence digit per sounding column.
    pub fn render(&self) -> String {
        let widths: Vec<usize> = (0..self.num_columns())
            .map(|col| {
                self.cells
                    .iter()
                    .map(|row| row[col].text().len())
                    .max()
                    .unwrap_or(1)
            })
            .collect();

        let mut out = String::new();
        for (string, row) in self.cells.iter().enumerate() {
            let open = self.string_tuning[string].saturating_add(self.capo_fret);
            let _ = write!(out, "{:<2}|", tuning::pitch_class_name(open));
            for (cell, &width) in row.iter().zip(&widths) {
                let fill = if *cell == TabCell::Sustain { '=' } else { '-' };
                let text = cell.text();
                out.push_str(&text);
                out.extend(std::iter::repeat_n(fill, width - text.len() + 1));
            }
            out.push_str("|\n");
        }

        out.push_str("  |");
        for (col, &width) in widths.iter().enumerate() {
            if self.column_is_silent(col) {
                out.push(' ');
            } else {
                let digit = ((self.confidence[col] * 10.0) as u32).min(9);
                let _ = write!(out, "{}", digit);
            }
            out.extend(std::iter::repeat_n(' ', width));
        }
        out.push_str("|\n");
        out
    }
}

/// Number of tab columns covering `sample_count` samples, rounded up.
pub fn column_count(sample_count: usize, sample_rate: u32, columns_per_second: u32) -> usize {
    if sample_rate == 0 {
        return 0;
    }
    let numerator = sample_count as u64 * columns_per_second as u64;
    numerator.div_ceil(sample_rate as u64) as usize
}

/// Every position on which `midi_key` can be played, in string order.
pub fn candidate_positions(midi_key: i32, config: &PipelineConfig) -> Vec<FretPosition> {
    config
        .string_tuning
        .iter()
        .enumerate()
        .filter_map(|(string, &open)| {
            let fret = midi_key - open as i32 - config.capo_fret as i32;
            let in_range =
                fret >= 0 && fret + config.capo_fret as i32 <= config.max_fret as i32;
            in_range.then_some(FretPosition {
                string,
                fret: fret as u8,
            })
        })
        .collect()
}

/// Column span of a note, clipped to the grid. `None` if it starts past the end.
fn column_span(note: &Note, columns_per_second: u32, num_columns: usize) -> Option<(usize, usize)> {
    let cps = columns_per_second as f64;
    let start = (note.start_time.max(0.0) * cps).floor() as usize;
    if start >= num_columns {
        return None;
    }
    let end = ((note.end_time() * cps).ceil() as i64 - 1).max(start as i64) as usize;
    Some((start, end.min(num_columns - 1)))
}

struct Placer<'a> {
    config: &'a PipelineConfig,
    grid: TabGrid,
    /// Last column and fret written on each string.
    last_on_string: [Option<(usize, u8)>; NUM_STRINGS],
    dropped: usize,
}

impl Placer<'_> {
    fn average_nearby_fret(&self, column: usize) -> Option<f32> {
        let lo = column.saturating_sub(CONTINUITY_WINDOW);
        let hi = (column + CONTINUITY_WINDOW).min(self.grid.num_columns() - 1);
        let frets: Vec<f32> = self
            .grid
            .cells
            .iter()
            .flat_map(|row| row[lo..=hi].iter())
            .filter_map(|cell| match cell {
                TabCell::Fret { fret, .. } => Some(*fret as f32),
                _ => None,
            })
            .collect();
        if frets.is_empty() {
            None
        } else {
            Some(frets.iter().sum::<f32>() / frets.len() as f32)
        }
    }

    fn score(&self, position: FretPosition, span: (usize, usize), nearby: Option<f32>) -> f32 {
        let [low, high] = self.config.preferred_position_range;
        let mut score = 0.0;
        if (low..=high).contains(&position.fret) {
            score += PREFERRED_RANGE_BONUS;
        }
        if position.fret == 0 {
            score += OPEN_STRING_BONUS;
        }
        let row = &self.grid.cells[position.string];
        if row[span.0..=span.1].iter().any(|cell| !cell.is_empty()) {
            score += CONFLICT_PENALTY;
        }
        if let Some(average) = nearby {
            score -= CONTINUITY_WEIGHT * (position.fret as f32 - average).abs();
        }
        score
    }

    fn articulation(&self, note: &Note, position: FretPosition, start: usize) -> Option<Articulation> {
        if let Some(bend) = note.bend {
            return Some(match bend.direction {
                BendDirection::Up => Articulation::BendUp,
                BendDirection::Down => Articulation::BendDown,
            });
        }
        if note.vibrato.is_some() {
            return Some(Articulation::Vibrato);
        }
        let (previous_end, previous_fret) = self.last_on_string[position.string]?;
        if previous_end + 1 >= start && note.onset_strength < LEGATO_ONSET_THRESHOLD {
            if position.fret > previous_fret {
                return Some(Articulation::HammerOn);
            }
            if position.fret < previous_fret {
                return Some(Articulation::PullOff);
            }
        }
        None
    }

    fn place(&mut self, note: &Note) {
        let num_columns = self.grid.num_columns();
        let Some(span) = column_span(note, self.config.columns_per_second, num_columns) else {
            self.drop_note(note, "starts after the last column");
            return;
        };

        let nearby = self.average_nearby_fret(span.0);
        let mut best: Option<(FretPosition, f32)> = None;
        for position in candidate_positions(note.midi_key(), self.config) {
            let score = self.score(position, span, nearby);
            // Strictly greater: the first (lowest) string keeps ties.
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((position, score));
            }
        }
        let Some((position, score)) = best else {
            self.drop_note(note, "is outside the fretboard");
            return;
        };
        if !self.grid.cells[position.string][span.0].is_empty() {
            self.drop_note(note, "has no free string");
            return;
        }

        let articulation = self.articulation(note, position, span.0);
        let row = &mut self.grid.cells[position.string];
        row[span.0] = TabCell::Fret {
            fret: position.fret,
            articulation,
        };
        let mut end = span.0;
        for column in span.0 + 1..=span.1 {
            if !row[column].is_empty() {
                break;
            }
            row[column] = TabCell::Sustain;
            end = column;
        }
        for column in span.0..=end {
            let slot = &mut self.grid.confidence[column];
            *slot = slot.max(note.confidence);
        }
        self.last_on_string[position.string] = Some((end, position.fret));

        log::trace!(
            "Placed {} at string {} fret {} (columns {}..={}, score {:.1})",
            note.name(),
            position.string,
            position.fret,
            span.0,
            end,
            score
        );
    }

    fn drop_note(&mut self, note: &Note, reason: &str) {
        self.dropped += 1;
        log::trace!(
            "Dropped {} at {:.3}s from the tab: note {}",
            note.name(),
            note.start_time,
            reason
        );
    }
}

/// Lays `notes` out on a grid of `num_columns` columns. Notes are placed in
/// the order given; anything that cannot be placed is left out of the grid.
pub fn generate_tab(notes: &[Note], config: &PipelineConfig, num_columns: usize) -> TabGrid {
    let mut placer = Placer {
        config,
        grid: TabGrid::new(
            num_columns,
            config.string_tuning,
            config.capo_fret,
            config.columns_per_second,
        ),
        last_on_string: [None; NUM_STRINGS],
        dropped: 0,
    };
    if num_columns > 0 {
        for note in notes {
            placer.place(note);
        }
    }
    log::debug!(
        "Tab generated: {} columns, {} of {} notes placed",
        num_columns,
        notes.len() - placer.dropped.min(notes.len()),
        notes.len()
    );
    placer.grid
}
