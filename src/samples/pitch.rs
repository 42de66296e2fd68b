// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Note names and nearest-sample pitch resolution.

use std::fmt;
use std::str::FromStr;

/// Octaves a note name may carry. Together they span the MIDI note range.
const OCTAVES: std::ops::RangeInclusive<i32> = -1..=9;

/// The furthest (in semitones) the resolver will search for a recorded pitch.
pub const MAX_SEARCH_INTERVAL: i32 = 96;

const SHARP_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A pitch expressed as a MIDI note number. C4 is 60.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Note(i32);

impl Note {
    /// Creates a note from a MIDI note number.
    pub const fn from_midi(midi: i32) -> Note {
        Note(midi)
    }

    /// Returns the MIDI note number.
    pub fn midi(self) -> i32 {
        self.0
    }

    /// Returns the note the given number of semitones away.
    pub fn transpose(self, semitones: i32) -> Note {
        Note(self.0 + semitones)
    }

    /// The signed distance in semitones from `self` up to `other`.
    pub fn semitones_to(self, other: Note) -> i32 {
        other.0 - self.0
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octave = self.0.div_euclid(12) - 1;
        let pitch_class = self.0.rem_euclid(12) as usize;
        write!(f, "{}{}", SHARP_NAMES[pitch_class], octave)
    }
}

/// Error returned when a note name can't be parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid note name '{0}'")]
pub struct ParseNoteError(String);

impl FromStr for Note {
    type Err = ParseNoteError;

    /// Parses scientific pitch notation such as `C4`, `F#3`, `Bb5` or `c-1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseNoteError(s.to_string());
        let mut chars = s.trim().chars().peekable();

        let base = match chars.next().map(|c| c.to_ascii_uppercase()) {
            Some('C') => 0,
            Some('D') => 2,
            Some('E') => 4,
            Some('F') => 5,
            Some('G') => 7,
            Some('A') => 9,
            Some('B') => 11,
            _ => return Err(err()),
        };

        let mut accidental: i32 = 0;
        while let Some(&c) = chars.peek() {
            accidental = match c {
                '#' | 's' => accidental.checked_add(1),
                'b' => accidental.checked_sub(1),
                _ => break,
            }
            .ok_or_else(err)?;
            chars.next();
        }

        let octave: i32 = chars.collect::<String>().parse().map_err(|_| err())?;
        if !OCTAVES.contains(&octave) {
            return Err(err());
        }
        (octave + 1)
            .checked_mul(12)
            .and_then(|midi| midi.checked_add(base))
            .and_then(|midi| midi.checked_add(accidental))
            .map(Note)
            .ok_or_else(err)
    }
}

/// The outcome of resolving a requested note against a set of recorded notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// The note that was asked for.
    pub requested: Note,
    /// The recorded note to play instead. Equal to `requested` when nothing was found.
    pub resolved: Note,
    /// Whether `resolved` is actually present in the recorded set.
    pub found: bool,
}

impl Resolution {
    /// Semitones from the requested note up to the resolved sample.
    pub fn semitone_offset(&self) -> i32 {
        self.requested.semitones_to(self.resolved)
    }
}

/// Finds the recorded note closest to `requested`.
///
/// Candidates are checked outward from the requested pitch. At each distance the note
/// above is checked before the note below, so equidistant candidates resolve upward.
pub fn resolve_nearest<F>(requested: Note, is_available: F) -> Resolution
where
    F: Fn(Note) -> bool,
{
    for interval in 0..=MAX_SEARCH_INTERVAL {
        let higher = requested.transpose(interval);
        if is_available(higher) {
            return Resolution {
                requested,
                resolved: higher,
                found: true,
            };
        }
        let lower = requested.transpose(-interval);
        if is_available(lower) {
            return Resolution {
                requested,
                resolved: lower,
                found: true,
            };
        }
    }

    Resolution {
        requested,
        resolved: requested,
        found: false,
    }
}

/// The playback rate that corrects for a substituted sample `semitone_offset` semitones
/// away from the requested note and applies a further `transposition`.
pub fn playback_rate(semitone_offset: f64, transposition: f64) -> f64 {
    interval_to_frequency_ratio(-semitone_offset + transposition)
}

/// Converts an interval in semitones to a frequency ratio.
pub fn interval_to_frequency_ratio(semitones: f64) -> f64 {
    2f64.powf(semitones / 12.0)
}
