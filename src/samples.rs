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

//! Sample playback.
//!
//! This module provides:
//! - Instrument loading and caching (in-memory, converted to the output rate)
//! - Note names and nearest-pitch resolution
//! - Bookkeeping for transient playback nodes
//! - Pitch-shifting voices

mod loader;
mod pitch;
mod pool;
mod voice;

pub use loader::{LoadError, LoadedSample, SampleLibrary, SampleLoader, SampleSet};
pub use pitch::{
    interval_to_frequency_ratio, playback_rate, resolve_nearest, Note, ParseNoteError,
    Resolution, MAX_SEARCH_INTERVAL,
};
pub use pool::{NodeHandle, NodePool, PlaybackTag, PoolId, Terminal};
pub use voice::{Voice, VoiceError};
