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
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use super::{AudioGraph, ChannelId, ChannelSpec, PlaybackRequest, SendId, SendSpec};
use crate::samples::PlaybackTag;

/// A mock graph. Doesn't render anything; it records what it was asked to do.
pub struct MockGraph {
    name: String,
    sample_rate: u32,
    clock: Clock,
    state: Arc<Mutex<MockState>>,
}

/// Inspects and steers a [`MockGraph`] after it has been handed off.
#[derive(Clone)]
pub struct MockHandle {
    frame: Arc<AtomicU64>,
    state: Arc<Mutex<MockState>>,
}

enum Clock {
    /// Frames only move when a test says so.
    Manual(Arc<AtomicU64>),
    /// Frames follow the wall clock.
    Realtime(Instant),
}

#[derive(Default)]
struct MockState {
    sends: HashMap<SendId, SendSpec>,
    channels: HashMap<ChannelId, ChannelSpec>,
    disposed_sends: Vec<SendId>,
    disposed_channels: Vec<ChannelId>,
    /// Clock frame each channel was created at, and disposed at once it's gone.
    channel_frames: HashMap<ChannelId, (u64, Option<u64>)>,
    started: Vec<PlaybackRequest>,
    stopped: Vec<PlaybackTag>,
    live: HashMap<PlaybackTag, PlaybackRequest>,
    completed: Vec<PlaybackTag>,
}

impl MockGraph {
    /// Creates a mock graph with a manually driven clock.
    pub fn new(sample_rate: u32) -> (MockGraph, MockHandle) {
        let frame = Arc::new(AtomicU64::new(0));
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            MockGraph {
                name: "mock".to_string(),
                sample_rate,
                clock: Clock::Manual(frame.clone()),
                state: state.clone(),
            },
            MockHandle { frame, state },
        )
    }

    /// Creates a mock graph whose clock follows the wall clock.
    pub fn realtime(name: &str, sample_rate: u32) -> MockGraph {
        MockGraph {
            name: name.to_string(),
            sample_rate,
            clock: Clock::Realtime(Instant::now()),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// The name of the mock device.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AudioGraph for MockGraph {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_frame(&self) -> u64 {
        match &self.clock {
            Clock::Manual(frame) => frame.load(Ordering::Acquire),
            Clock::Realtime(start) => {
                (start.elapsed().as_secs_f64() * self.sample_rate as f64) as u64
            }
        }
    }

    fn create_send(&mut self, spec: SendSpec) -> SendId {
        let id = SendId::next();
        self.state.lock().sends.insert(id, spec);
        id
    }

    fn create_channel(&mut self, spec: ChannelSpec) -> ChannelId {
        let id = ChannelId::next();
        let frame = self.current_frame();
        let mut state = self.state.lock();
        state.channels.insert(id, spec);
        state.channel_frames.insert(id, (frame, None));
        id
    }

    fn start_playback(&mut self, request: PlaybackRequest) {
        debug!(
            device = %self.name,
            start_frame = request.start_frame,
            rate = request.rate,
            "Mock playback started"
        );
        let mut state = self.state.lock();
        state.live.insert(request.tag, request.clone());
        state.started.push(request);
    }

    fn stop_playback(&mut self, tag: PlaybackTag) {
        let mut state = self.state.lock();
        if state.live.remove(&tag).is_some() {
            state.stopped.push(tag);
        }
    }

    fn dispose_channel(&mut self, channel: ChannelId) {
        let frame = self.current_frame();
        let mut state = self.state.lock();
        if state.channels.remove(&channel).is_some() {
            state.disposed_channels.push(channel);
            if let Some((_, disposed)) = state.channel_frames.get_mut(&channel) {
                *disposed = Some(frame);
            }
        }
        state.live.retain(|_, request| request.channel != channel);
    }

    fn dispose_send(&mut self, send: SendId) {
        let mut state = self.state.lock();
        if state.sends.remove(&send).is_some() {
            state.disposed_sends.push(send);
        }
    }

    fn drain_completed(&mut self) -> Vec<PlaybackTag> {
        std::mem::take(&mut self.state.lock().completed)
    }
}

impl MockHandle {
    /// Moves the manual clock.
    pub fn set_frame(&self, frame: u64) {
        self.frame.store(frame, Ordering::Release);
    }

    /// Every playback request received so far.
    pub fn started(&self) -> Vec<PlaybackRequest> {
        self.state.lock().started.clone()
    }

    /// Playbacks that were stopped while still live.
    pub fn stopped(&self) -> Vec<PlaybackTag> {
        self.state.lock().stopped.clone()
    }

    /// Number of playbacks that have neither ended nor been stopped.
    pub fn live_playbacks(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of channels that exist.
    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Specs of the channels that exist.
    pub fn channels(&self) -> Vec<ChannelSpec> {
        self.state.lock().channels.values().copied().collect()
    }

    /// Number of sends that exist.
    pub fn send_count(&self) -> usize {
        self.state.lock().sends.len()
    }

    /// Names of the sends that exist.
    pub fn send_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .sends
            .values()
            .map(|spec| spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Channels disposed so far.
    pub fn disposed_channels(&self) -> Vec<ChannelId> {
        self.state.lock().disposed_channels.clone()
    }

    /// The clock frames a channel was created and disposed at.
    pub fn channel_frames(&self, channel: ChannelId) -> Option<(u64, Option<u64>)> {
        self.state.lock().channel_frames.get(&channel).copied()
    }

    /// Sends disposed so far.
    pub fn disposed_sends(&self) -> Vec<SendId> {
        self.state.lock().disposed_sends.clone()
    }

    /// Ends a live playback naturally. Returns false if it wasn't live.
    pub fn complete(&self, tag: PlaybackTag) -> bool {
        let mut state = self.state.lock();
        if state.live.remove(&tag).is_some() {
            state.completed.push(tag);
            true
        } else {
            false
        }
    }

    /// Ends every live playback whose sample would have run out by `frame`.
    pub fn complete_due(&self, frame: u64, sample_rate: u32) -> usize {
        let mut state = self.state.lock();
        let due: Vec<PlaybackTag> = state
            .live
            .iter()
            .filter(|(_, request)| {
                let step = request.rate * request.sample.sample_rate() as f64 / sample_rate as f64;
                let length = (request.sample.frames() as f64 / step).ceil() as u64;
                request.start_frame + length <= frame
            })
            .map(|(tag, _)| *tag)
            .collect();
        for tag in &due {
            state.live.remove(tag);
            state.completed.push(*tag);
        }
        due.len()
    }
}
