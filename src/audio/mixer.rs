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
// Core audio mixing logic shared by the live and offline backends.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use super::effects::{self, Effect};
use super::{
    db_to_gain, AudioGraph, ChannelId, ChannelSpec, PlaybackRequest, SendId, SendSpec,
};
use crate::samples::PlaybackTag;

/// The mixer always renders interleaved stereo.
pub const NUM_CHANNELS: usize = 2;

/// Messages from the scheduler side to the mixer.
pub enum Command {
    CreateSend { id: SendId, spec: SendSpec },
    CreateChannel { id: ChannelId, spec: ChannelSpec },
    Start(PlaybackRequest),
    Stop(PlaybackTag),
    DisposeChannel(ChannelId),
    DisposeSend(SendId),
}

/// Renders scheduled playbacks through channels and sends into a stereo mix.
pub struct AudioMixer {
    sample_rate: u32,
    commands: Receiver<Command>,
    completed: Sender<PlaybackTag>,
    /// Frames rendered so far, shared with the graph handle.
    frame: Arc<AtomicU64>,
    sources: Vec<ActiveSource>,
    channels: HashMap<ChannelId, Channel>,
    sends: HashMap<SendId, Bus>,
    main_left: Vec<f32>,
    main_right: Vec<f32>,
}

/// The scheduler's handle onto a mixer.
pub struct MixerGraph {
    sample_rate: u32,
    commands: Sender<Command>,
    completed: Receiver<PlaybackTag>,
    frame: Arc<AtomicU64>,
}

/// Represents an active audio source in the mixer.
struct ActiveSource {
    tag: PlaybackTag,
    request: PlaybackRequest,
    /// Read position in source frames.
    position: f64,
    /// Source frames advanced per output frame.
    step: f64,
    /// Output frames rendered so far.
    elapsed: f64,
    /// Total output frames this source lasts.
    length: f64,
    fade_in: f64,
    fade_out: f64,
}

struct Channel {
    spec: ChannelSpec,
    created_frame: u64,
    left: Vec<f32>,
    right: Vec<f32>,
}

struct Bus {
    name: String,
    effects: Vec<Box<dyn Effect>>,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl AudioMixer {
    /// Creates a mixer and the graph handle that drives it.
    pub fn new(sample_rate: u32) -> (AudioMixer, MixerGraph) {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
        let frame = Arc::new(AtomicU64::new(0));

        (
            AudioMixer {
                sample_rate,
                commands: command_rx,
                completed: completed_tx,
                frame: frame.clone(),
                sources: Vec::new(),
                channels: HashMap::new(),
                sends: HashMap::new(),
                main_left: Vec::new(),
                main_right: Vec::new(),
            },
            MixerGraph {
                sample_rate,
                commands: command_tx,
                completed: completed_rx,
                frame,
            },
        )
    }

    /// Gets the sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far.
    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Number of playbacks that are scheduled or sounding.
    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    fn apply(&mut self, command: Command, block_start: u64) {
        match command {
            Command::CreateSend { id, spec } => {
                debug!(send = %spec.name, effects = spec.effects.len(), "Creating send");
                let effects = spec
                    .effects
                    .iter()
                    .map(|effect| effects::build(effect, self.sample_rate))
                    .collect();
                self.sends.insert(
                    id,
                    Bus {
                        name: spec.name,
                        effects,
                        left: Vec::new(),
                        right: Vec::new(),
                    },
                );
            }
            Command::CreateChannel { id, spec } => {
                self.channels.insert(
                    id,
                    Channel {
                        spec,
                        created_frame: block_start,
                        left: Vec::new(),
                        right: Vec::new(),
                    },
                );
            }
            Command::Start(request) => {
                let source = ActiveSource::new(request, self.sample_rate);
                self.sources.push(source);
            }
            Command::Stop(tag) => self.sources.retain(|source| source.tag != tag),
            Command::DisposeChannel(id) => {
                self.channels.remove(&id);
                self.sources.retain(|source| source.request.channel != id);
            }
            Command::DisposeSend(id) => {
                if let Some(bus) = self.sends.remove(&id) {
                    debug!(send = %bus.name, "Disposed send");
                }
            }
        }
    }

    /// Mixes the next block into `output`, which holds interleaved stereo frames.
    pub fn process_into_output(&mut self, output: &mut [f32]) {
        let frames = output.len() / NUM_CHANNELS;
        let block_start = self.frame.load(Ordering::Acquire);

        while let Ok(command) = self.commands.try_recv() {
            self.apply(command, block_start);
        }

        for channel in self.channels.values_mut() {
            reset(&mut channel.left, frames);
            reset(&mut channel.right, frames);
        }
        for bus in self.sends.values_mut() {
            reset(&mut bus.left, frames);
            reset(&mut bus.right, frames);
        }
        reset(&mut self.main_left, frames);
        reset(&mut self.main_right, frames);

        // Sources into channels.
        let channels = &mut self.channels;
        let completed = &self.completed;
        self.sources.retain_mut(|source| {
            let Some(channel) = channels.get_mut(&source.request.channel) else {
                return false;
            };
            if source.render(block_start, &mut channel.left, &mut channel.right) {
                // The scheduler may already be gone during shutdown.
                let _ = completed.send(source.tag);
                return false;
            }
            true
        });

        // Channels into sends.
        let sample_rate = self.sample_rate as f64;
        for channel in self.channels.values_mut() {
            let Some(bus) = self.sends.get_mut(&channel.spec.send) else {
                continue;
            };
            let (pan_left, pan_right) = match channel.spec.pan {
                Some(pan) => {
                    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
                    (angle.cos(), angle.sin())
                }
                None => (1.0, 1.0),
            };
            for i in 0..frames {
                let seconds =
                    (block_start + i as u64).saturating_sub(channel.created_frame) as f64
                        / sample_rate;
                let gain = db_to_gain(channel.spec.level.db_at(seconds));
                bus.left[i] += channel.left[i] * gain * pan_left;
                bus.right[i] += channel.right[i] * gain * pan_right;
            }
        }

        // Sends into the main bus.
        for bus in self.sends.values_mut() {
            for effect in bus.effects.iter_mut() {
                effect.process(&mut bus.left, &mut bus.right);
            }
            for i in 0..frames {
                self.main_left[i] += bus.left[i];
                self.main_right[i] += bus.right[i];
            }
        }

        for (i, frame) in output.chunks_exact_mut(NUM_CHANNELS).enumerate() {
            frame[0] = self.main_left[i].clamp(-1.0, 1.0);
            frame[1] = self.main_right[i].clamp(-1.0, 1.0);
        }

        self.frame
            .store(block_start + frames as u64, Ordering::Release);
    }

    /// Processes multiple frames of audio mixing.
    pub fn process_frames(&mut self, num_frames: usize) -> Vec<f32> {
        let mut frames = vec![0.0; num_frames * NUM_CHANNELS];
        self.process_into_output(&mut frames);
        frames
    }
}

fn reset(buffer: &mut Vec<f32>, frames: usize) {
    buffer.clear();
    buffer.resize(frames, 0.0);
}

impl ActiveSource {
    fn new(request: PlaybackRequest, output_rate: u32) -> Self {
        let output_rate = output_rate as f64;
        let step = (request.rate * request.sample.sample_rate() as f64 / output_rate).max(1e-6);
        let length = request.sample.frames() as f64 / step;
        Self {
            tag: request.tag,
            position: 0.0,
            step,
            elapsed: 0.0,
            length,
            fade_in: request.fade_in.as_secs_f64() * output_rate,
            fade_out: request.fade_out.as_secs_f64() * output_rate,
            request,
        }
    }

    fn envelope(&self) -> f32 {
        let mut envelope = 1.0f64;
        if self.fade_in > 0.0 && self.elapsed < self.fade_in {
            envelope = envelope.min(self.elapsed / self.fade_in);
        }
        let remaining = self.length - self.elapsed;
        if self.fade_out > 0.0 && remaining < self.fade_out {
            envelope = envelope.min(remaining / self.fade_out);
        }
        envelope.max(0.0) as f32
    }

    /// Renders into the channel buffers. Returns true once the sample is exhausted.
    fn render(&mut self, block_start: u64, left: &mut [f32], right: &mut [f32]) -> bool {
        let sample = &self.request.sample;
        let frames = sample.frames();
        let channels = sample.channel_count() as usize;
        let data = sample.data();

        let offset = self.request.start_frame.saturating_sub(block_start);
        if offset >= left.len() as u64 {
            return false;
        }

        for i in offset as usize..left.len() {
            if self.position >= frames as f64 {
                break;
            }
            let index = self.position as usize;
            let frac = (self.position - index as f64) as f32;
            let read = |channel: usize| {
                let s0 = data[index * channels + channel];
                let s1 = if index + 1 < frames {
                    data[(index + 1) * channels + channel]
                } else {
                    s0
                };
                s0 + (s1 - s0) * frac
            };
            let (l, r) = if channels == 1 {
                let s = read(0);
                (s, s)
            } else {
                (read(0), read(1))
            };

            let gain = self.envelope() * self.request.gain;
            left[i] += l * gain;
            right[i] += r * gain;

            self.position += self.step;
            self.elapsed += 1.0;
        }

        self.position >= frames as f64
    }
}

impl MixerGraph {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Audio mixer is gone, dropping command");
        }
    }
}

impl AudioGraph for MixerGraph {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    fn create_send(&mut self, spec: SendSpec) -> SendId {
        let id = SendId::next();
        self.send(Command::CreateSend { id, spec });
        id
    }

    fn create_channel(&mut self, spec: ChannelSpec) -> ChannelId {
        let id = ChannelId::next();
        self.send(Command::CreateChannel { id, spec });
        id
    }

    fn start_playback(&mut self, request: PlaybackRequest) {
        self.send(Command::Start(request));
    }

    fn stop_playback(&mut self, tag: PlaybackTag) {
        self.send(Command::Stop(tag));
    }

    fn dispose_channel(&mut self, channel: ChannelId) {
        self.send(Command::DisposeChannel(channel));
    }

    fn dispose_send(&mut self, send: SendId) {
        self.send(Command::DisposeSend(send));
    }

    fn drain_completed(&mut self) -> Vec<PlaybackTag> {
        self.completed.try_iter().collect()
    }
}
