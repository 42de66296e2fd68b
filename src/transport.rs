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

//! A frame-accurate event scheduler.
//!
//! The transport owns no clock of its own. Whoever drives it calls
//! [`Transport::advance_to`] with a target frame, and every event due at or before that
//! frame fires in time order, ties broken by submission order. Callbacks get the
//! context and the transport itself, so they can schedule follow-up work.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::debug;

/// A callback that fires once.
pub type Callback<C> = Box<dyn FnOnce(&mut C, &mut Transport<C>) + Send>;

/// A callback that fires every period until it returns [`Repeat::Stop`].
pub type RepeatingTask<C> = Box<dyn FnMut(&mut C, &mut Transport<C>) -> Repeat + Send>;

/// Identifies a scheduled event. A repeating event keeps its ID across firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

/// What a repeating task wants after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Again,
    Stop,
}

enum Task<C> {
    Once(Callback<C>),
    Repeating { period: u64, task: RepeatingTask<C> },
}

/// Queue key: fire frame, then submission sequence.
type Slot = (u64, u64);

pub struct Transport<C> {
    sample_rate: u32,
    started: bool,
    position: u64,
    next_seq: u64,
    next_id: u64,
    queue: BTreeMap<Slot, (EventId, Task<C>)>,
    index: HashMap<EventId, Slot>,
    /// The repeating event currently firing, and whether it cancelled itself.
    running: Option<(EventId, bool)>,
}

impl<C> Transport<C> {
    /// Creates a stopped transport at frame zero.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            started: false,
            position: 0,
            next_seq: 0,
            next_id: 0,
            queue: BTreeMap::new(),
            index: HashMap::new(),
            running: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Converts a duration to a frame count at the transport's sample rate.
    pub fn seconds_to_frames(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as u64
    }

    /// The current frame. Inside a callback this is the callback's fire frame.
    pub fn now(&self) -> u64 {
        self.position
    }

    /// The current position in seconds.
    pub fn seconds(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Starts the transport at `origin`. Starting twice keeps the first origin.
    pub fn start(&mut self, origin: u64) {
        if self.started {
            return;
        }
        self.started = true;
        self.position = self.position.max(origin);
        debug!(origin = self.position, "Transport started");
    }

    /// Schedules `callback` to fire `delay` after now.
    pub fn schedule_once<F>(&mut self, delay: Duration, callback: F) -> EventId
    where
        F: FnOnce(&mut C, &mut Transport<C>) + Send + 'static,
    {
        let frame = self.position + self.seconds_to_frames(delay);
        self.schedule_at(frame, callback)
    }

    /// Schedules `callback` at an absolute frame. Frames in the past fire at the next
    /// advance, at the current position.
    pub fn schedule_at<F>(&mut self, frame: u64, callback: F) -> EventId
    where
        F: FnOnce(&mut C, &mut Transport<C>) + Send + 'static,
    {
        let id = self.next_event_id();
        self.enqueue(frame, id, Task::Once(Box::new(callback)));
        id
    }

    /// Schedules `task` to fire `first` after now, then every `period` after its
    /// previous fire frame for as long as it returns [`Repeat::Again`].
    pub fn schedule_repeating<F>(&mut self, first: Duration, period: Duration, task: F) -> EventId
    where
        F: FnMut(&mut C, &mut Transport<C>) -> Repeat + Send + 'static,
    {
        let frame = self.position + self.seconds_to_frames(first);
        let period = self.seconds_to_frames(period).max(1);
        let id = self.next_event_id();
        self.enqueue(
            frame,
            id,
            Task::Repeating {
                period,
                task: Box::new(task),
            },
        );
        id
    }

    /// Cancels a pending event. Returns false if it already fired or was cancelled.
    /// A repeating task may cancel itself from inside its own callback.
    pub fn cancel(&mut self, id: EventId) -> bool {
        if let Some(slot) = self.index.remove(&id) {
            self.queue.remove(&slot);
            return true;
        }
        match &mut self.running {
            Some((running, cancelled)) if *running == id && !*cancelled => {
                *cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Fires every event due at or before `target`, then moves the position to
    /// `target`. Does nothing until the transport is started. Returns the number of
    /// callbacks fired.
    pub fn advance_to(&mut self, target: u64, context: &mut C) -> usize {
        if !self.started {
            return 0;
        }

        let mut fired = 0;
        while let Some(entry) = self.queue.first_entry() {
            let (frame, _) = *entry.key();
            if frame > target {
                break;
            }
            let (id, task) = entry.remove();
            self.index.remove(&id);
            self.position = self.position.max(frame);
            fired += 1;

            match task {
                Task::Once(callback) => callback(context, self),
                Task::Repeating { period, mut task } => {
                    self.running = Some((id, false));
                    let repeat = task(context, self);
                    let cancelled = matches!(self.running.take(), Some((_, true)));
                    if repeat == Repeat::Again && !cancelled {
                        self.enqueue(frame + period, id, Task::Repeating { period, task });
                    }
                }
            }
        }

        self.position = self.position.max(target);
        fired
    }

    /// Drops every pending event.
    pub fn clear(&mut self) {
        debug!(pending = self.queue.len(), "Clearing transport");
        self.queue.clear();
        self.index.clear();
    }

    /// Number of pending events.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn next_event_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    fn enqueue(&mut self, frame: u64, id: EventId, task: Task<C>) {
        let slot = (frame.max(self.position), self.next_seq);
        self.next_seq += 1;
        self.queue.insert(slot, (id, task));
        self.index.insert(id, slot);
    }
}
