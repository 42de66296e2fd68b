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

//! Sample loading and caching.
//!
//! Instruments are decoded entirely into memory and converted to the output sample rate
//! before playback starts, so triggering a note never touches the disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::pitch::{Note, ParseNoteError};
use crate::audio::sample_source::{decode_file, SampleSourceError};
use crate::config;

/// Errors that can occur while loading an instrument.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("instrument '{0}' is not defined")]
    UnknownInstrument(String),

    #[error("instrument '{0}' has no samples")]
    EmptyManifest(String),

    #[error("instrument '{instrument}' has an invalid note name: {source}")]
    BadNote {
        instrument: String,
        #[source]
        source: ParseNoteError,
    },

    #[error("instrument '{instrument}': failed to load {}: {source}", .path.display())]
    Decode {
        instrument: String,
        path: PathBuf,
        #[source]
        source: SampleSourceError,
    },

    #[error("sample loading task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A loaded sample that can be played back.
/// The sample data is stored in an Arc for efficient sharing between voices.
#[derive(Clone)]
pub struct LoadedSample {
    /// The sample data as f32 samples (interleaved if multi-channel).
    data: Arc<Vec<f32>>,
    /// Number of channels in the sample.
    channel_count: u16,
    /// Sample rate of the audio data.
    sample_rate: u32,
}

impl LoadedSample {
    /// Wraps already decoded interleaved sample data.
    pub fn from_frames(data: Arc<Vec<f32>>, channel_count: u16, sample_rate: u32) -> Self {
        Self {
            data,
            channel_count: channel_count.max(1),
            sample_rate,
        }
    }

    /// Returns the interleaved sample data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the number of channels.
    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    /// Returns the sample rate of the data.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the number of frames.
    pub fn frames(&self) -> usize {
        self.data.len() / self.channel_count as usize
    }

    /// Returns the playback length at the native rate.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate.max(1) as f64)
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

impl std::fmt::Debug for LoadedSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedSample")
            .field("frames", &self.frames())
            .field("channels", &self.channel_count)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Manages loading and caching of sample data.
pub struct SampleLoader {
    /// Cache of loaded samples by file path.
    cache: HashMap<PathBuf, LoadedSample>,
    /// Target sample rate for transcoding (matches audio output).
    target_sample_rate: u32,
}

impl SampleLoader {
    /// Creates a new sample loader.
    pub fn new(target_sample_rate: u32) -> Self {
        Self {
            cache: HashMap::new(),
            target_sample_rate,
        }
    }

    /// Loads a sample from a file into memory.
    /// Returns a cached version if already loaded.
    pub fn load(&mut self, path: &Path) -> Result<LoadedSample, SampleSourceError> {
        if let Some(sample) = self.cache.get(path) {
            debug!(path = ?path, "Using cached sample");
            return Ok(sample.clone());
        }

        let decoded = decode_file(path)?;
        let channel_count = decoded.channels;

        let (final_samples, final_sample_rate) = if decoded.sample_rate != self.target_sample_rate
        {
            debug!(
                path = ?path,
                source_rate = decoded.sample_rate,
                target_rate = self.target_sample_rate,
                "Transcoding sample"
            );
            let transcoded = transcode_samples(
                &decoded.samples,
                channel_count,
                decoded.sample_rate,
                self.target_sample_rate,
            );
            (transcoded, self.target_sample_rate)
        } else {
            (decoded.samples, decoded.sample_rate)
        };

        let loaded = LoadedSample::from_frames(
            Arc::new(final_samples),
            channel_count,
            final_sample_rate,
        );

        debug!(
            path = ?path,
            channels = channel_count,
            sample_rate = final_sample_rate,
            duration_ms = loaded.duration().as_millis(),
            memory_kb = loaded.memory_size() / 1024,
            "Sample loaded"
        );

        self.cache.insert(path.to_path_buf(), loaded.clone());
        Ok(loaded)
    }

    /// Returns the total memory used by cached samples.
    pub fn total_memory_usage(&self) -> usize {
        self.cache.values().map(|s| s.memory_size()).sum()
    }
}

impl std::fmt::Debug for SampleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleLoader")
            .field("cached_samples", &self.cache.len())
            .field("target_sample_rate", &self.target_sample_rate)
            .field("total_memory_kb", &(self.total_memory_usage() / 1024))
            .finish()
    }
}

/// Transcodes samples from one sample rate to another using linear interpolation.
fn transcode_samples(
    samples: &[f32],
    channel_count: u16,
    source_rate: u32,
    target_rate: u32,
) -> Vec<f32> {
    let ratio = target_rate as f64 / source_rate as f64;
    let channels = channel_count.max(1) as usize;
    let source_frames = samples.len() / channels;
    let target_frames = (source_frames as f64 * ratio).ceil() as usize;

    let mut output = Vec::with_capacity(target_frames * channels);
    for target_frame in 0..target_frames {
        let source_pos = target_frame as f64 / ratio;
        let source_frame = source_pos.floor() as usize;
        let frac = source_pos.fract() as f32;

        for channel in 0..channels {
            let s0 = samples
                .get(source_frame * channels + channel)
                .copied()
                .unwrap_or(0.0);
            let s1 = samples
                .get((source_frame + 1) * channels + channel)
                .copied()
                .unwrap_or(s0);
            output.push(s0 + (s1 - s0) * frac);
        }
    }

    output
}

/// The loaded samples of one instrument, addressable by note and by manifest position.
pub struct SampleSet {
    instrument: String,
    by_note: HashMap<Note, LoadedSample>,
    ordered: Vec<LoadedSample>,
}

impl SampleSet {
    /// Builds a set from samples. Pitched samples are ordered by pitch, lowest first,
    /// followed by unpitched samples in manifest order. Samples without a note are only
    /// reachable by position.
    pub fn new(instrument: &str, mut samples: Vec<(Option<Note>, LoadedSample)>) -> Self {
        samples.sort_by_key(|(note, _)| (note.is_none(), *note));
        let mut by_note = HashMap::new();
        let mut ordered = Vec::with_capacity(samples.len());
        for (note, sample) in samples {
            if let Some(note) = note {
                by_note.insert(note, sample.clone());
            }
            ordered.push(sample);
        }
        Self {
            instrument: instrument.to_string(),
            by_note,
            ordered,
        }
    }

    /// The instrument this set was loaded for.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Returns true if a sample is recorded at the given note.
    pub fn contains(&self, note: Note) -> bool {
        self.by_note.contains_key(&note)
    }

    /// Returns the sample recorded at the given note.
    pub fn get(&self, note: Note) -> Option<&LoadedSample> {
        self.by_note.get(&note)
    }

    /// Returns the sample at the given position in pitch order, or manifest order for
    /// unpitched samples.
    pub fn get_index(&self, index: usize) -> Option<&LoadedSample> {
        self.ordered.get(index)
    }

    /// Returns the recorded notes in ascending order.
    pub fn notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.by_note.keys().copied().collect();
        notes.sort();
        notes
    }

    /// Number of samples in the set.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Returns true if the set holds no samples.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl std::fmt::Debug for SampleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleSet")
            .field("instrument", &self.instrument)
            .field("notes", &self.notes())
            .field("samples", &self.ordered.len())
            .finish()
    }
}

/// Loads instruments by name and keeps them for reuse.
pub struct SampleLibrary {
    base_path: PathBuf,
    instruments: HashMap<String, config::Instrument>,
    loader: Arc<Mutex<SampleLoader>>,
    sets: Mutex<HashMap<String, Arc<SampleSet>>>,
}

impl SampleLibrary {
    /// Creates a library for the given instruments, converting to `target_sample_rate`.
    pub fn new(
        base_path: &Path,
        instruments: HashMap<String, config::Instrument>,
        target_sample_rate: u32,
    ) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            instruments,
            loader: Arc::new(Mutex::new(SampleLoader::new(target_sample_rate))),
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a library from a soundscape configuration.
    pub fn from_config(config: &config::Soundscape) -> Self {
        Self::new(
            config.base_path(),
            config.instruments().clone(),
            config.audio().sample_rate(),
        )
    }

    /// Loads the named instrument. Decoding runs on the blocking pool; a set that was
    /// already loaded is shared.
    pub async fn load(&self, name: &str) -> Result<Arc<SampleSet>, LoadError> {
        if let Some(set) = self.sets.lock().get(name) {
            return Ok(set.clone());
        }

        let instrument = self
            .instruments
            .get(name)
            .ok_or_else(|| LoadError::UnknownInstrument(name.to_string()))?;
        if instrument.samples().is_empty() {
            return Err(LoadError::EmptyManifest(name.to_string()));
        }

        let directory = instrument.directory(name, &self.base_path);
        let entries = instrument
            .samples()
            .entries()
            .into_iter()
            .map(|(note, file)| {
                let note = note
                    .map(|note| note.parse::<Note>())
                    .transpose()
                    .map_err(|source| LoadError::BadNote {
                        instrument: name.to_string(),
                        source,
                    })?;
                Ok((note, directory.join(file)))
            })
            .collect::<Result<Vec<(Option<Note>, PathBuf)>, LoadError>>()?;

        let loader = self.loader.clone();
        let instrument_name = name.to_string();
        let set = tokio::task::spawn_blocking(move || {
            let mut loader = loader.lock();
            let samples = entries
                .into_iter()
                .map(|(note, path)| match loader.load(&path) {
                    Ok(sample) => Ok((note, sample)),
                    Err(source) => Err(LoadError::Decode {
                        instrument: instrument_name.clone(),
                        path,
                        source,
                    }),
                })
                .collect::<Result<Vec<_>, LoadError>>()?;
            Ok::<_, LoadError>(SampleSet::new(&instrument_name, samples))
        })
        .await??;

        info!(
            instrument = name,
            samples = set.len(),
            notes = set.notes().len(),
            "Instrument loaded"
        );

        let set = Arc::new(set);
        self.sets.lock().insert(name.to_string(), set.clone());
        Ok(set)
    }
}

impl std::fmt::Debug for SampleLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleLibrary")
            .field("base_path", &self.base_path)
            .field("instruments", &self.instruments.len())
            .field("loaded", &self.sets.lock().len())
            .finish()
    }
}
