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
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::samples::{LoadedSample, PlaybackTag};

pub mod cpal;
pub mod effects;
pub mod mixer;
pub mod mock;
pub mod offline;
pub mod sample_source;

/// Global bus ID counter, shared by channels and sends.
static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a channel strip in the audio graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

/// Identifies an effect send in the audio graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        ChannelId(NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl SendId {
    pub(crate) fn next() -> Self {
        SendId(NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Errors from audio devices and output.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no output device found with name {0}")]
    UnknownDevice(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("unable to write audio file: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request to play one sample once.
#[derive(Clone)]
pub struct PlaybackRequest {
    /// Reported back through [`AudioGraph::drain_completed`] when playback ends.
    pub tag: PlaybackTag,
    /// The sample to play.
    pub sample: LoadedSample,
    /// The channel strip the playback feeds.
    pub channel: ChannelId,
    /// Absolute mixer frame at which playback begins.
    pub start_frame: u64,
    /// Playback rate, where 1.0 is the recorded pitch.
    pub rate: f64,
    /// Linear gain.
    pub gain: f32,
    /// Fade-in length in output time.
    pub fade_in: Duration,
    /// Fade-out length in output time, ending with the sample.
    pub fade_out: Duration,
}

impl fmt::Debug for PlaybackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackRequest")
            .field("tag", &self.tag)
            .field("channel", &self.channel)
            .field("start_frame", &self.start_frame)
            .field("rate", &self.rate)
            .field("gain", &self.gain)
            .finish()
    }
}

/// The level control of a channel strip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Level {
    /// A constant gain in decibels.
    Fixed { db: f32 },
    /// A sine sweep between two levels in decibels.
    Lfo {
        min_db: f32,
        max_db: f32,
        frequency: f64,
        phase_degrees: f64,
    },
}

impl Level {
    /// The level in decibels `seconds` after the channel was created.
    pub fn db_at(&self, seconds: f64) -> f32 {
        match *self {
            Level::Fixed { db } => db,
            Level::Lfo {
                min_db,
                max_db,
                frequency,
                phase_degrees,
            } => {
                let angle =
                    std::f64::consts::TAU * frequency * seconds + phase_degrees.to_radians();
                let unit = 0.5 + 0.5 * angle.sin();
                min_db + (max_db - min_db) * unit as f32
            }
        }
    }
}

/// Converts decibels to a linear gain.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// A channel strip feeding a send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSpec {
    /// Where the channel's output goes.
    pub send: SendId,
    /// Channel level.
    pub level: Level,
    /// Stereo position in [-1, 1]. `None` leaves the signal untouched.
    pub pan: Option<f32>,
}

/// One stage of a send's effect chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EffectSpec {
    Lowpass {
        frequency: f32,
    },
    Compressor {
        threshold_db: f32,
        ratio: f32,
        attack: Duration,
        release: Duration,
    },
    Reverb {
        room_size: f32,
        dampening: f32,
        wet: f32,
    },
    FeedbackDelay {
        delay: Duration,
        feedback: f32,
        wet: f32,
    },
}

/// A shared effect bus feeding the main output.
#[derive(Debug, Clone, PartialEq)]
pub struct SendSpec {
    pub name: String,
    pub effects: Vec<EffectSpec>,
}

/// The audio operations the generators depend on.
///
/// Playback is fire-and-forget: a request that ends naturally is reported once by
/// `drain_completed`, while stopped playbacks and playbacks on disposed channels are
/// never reported. Stopping or disposing something unknown is ignored.
pub trait AudioGraph: Send {
    /// The output sample rate.
    fn sample_rate(&self) -> u32;

    /// The number of frames rendered so far.
    fn current_frame(&self) -> u64;

    /// Creates an effect send routed to the main output.
    fn create_send(&mut self, spec: SendSpec) -> SendId;

    /// Creates a channel strip routed to a send.
    fn create_channel(&mut self, spec: ChannelSpec) -> ChannelId;

    /// Schedules a one-shot playback.
    fn start_playback(&mut self, request: PlaybackRequest);

    /// Stops a playback without reporting it.
    fn stop_playback(&mut self, tag: PlaybackTag);

    /// Removes a channel and silently drops every playback on it.
    fn dispose_channel(&mut self, channel: ChannelId);

    /// Removes a send. Channels still routed to it go silent.
    fn dispose_send(&mut self, send: SendId);

    /// Returns the playbacks that ended naturally since the last call.
    fn drain_completed(&mut self) -> Vec<PlaybackTag>;
}

/// Lists the names of output devices known to cpal.
pub fn list_devices() -> Result<Vec<String>, AudioError> {
    cpal::list_device_names()
}
