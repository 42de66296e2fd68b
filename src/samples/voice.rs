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

//! Pitch-shifting sample voices.
//!
//! A voice plays any requested note from a sparse set of recordings: it picks the
//! nearest recorded pitch and resamples it to the exact target, then keeps track of
//! each resulting playback until it ends or the voice is disposed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::loader::{LoadError, SampleLibrary, SampleSet};
use super::pitch::{playback_rate, resolve_nearest, Note};
use super::pool::{NodeHandle, NodePool, PoolId, Terminal};
use crate::audio::{AudioGraph, ChannelId, PlaybackRequest};

/// Errors from triggering a voice.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VoiceError {
    #[error("voice for '{0}' has no destination")]
    NotConnected(String),

    #[error("voice for '{0}' has been disposed")]
    Disposed(String),
}

/// A playback started by a voice that hasn't finished yet.
#[derive(Debug, Clone, Copy)]
struct LiveNode {
    note: Note,
    start_frame: u64,
}

/// A reusable sample player bound to one instrument and one fixed transposition.
pub struct Voice {
    instrument: String,
    /// Released on dispose.
    samples: Option<Arc<SampleSet>>,
    /// Semitones added to every note.
    transposition: f64,
    /// Fade-in and fade-out applied to every playback.
    fade: Duration,
    destination: Option<ChannelId>,
    live: NodePool<LiveNode>,
}

impl Voice {
    /// Loads the instrument and creates a voice for it.
    pub async fn create(
        library: &SampleLibrary,
        instrument: &str,
        transposition: f64,
        fade: Duration,
    ) -> Result<Voice, LoadError> {
        let samples = library.load(instrument).await?;
        Ok(Voice::from_set(samples, transposition, fade))
    }

    /// Creates a voice over an already loaded set.
    pub fn from_set(samples: Arc<SampleSet>, transposition: f64, fade: Duration) -> Voice {
        Voice {
            instrument: samples.instrument().to_string(),
            samples: Some(samples),
            transposition,
            fade,
            destination: None,
            live: NodePool::new(),
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn transposition(&self) -> f64 {
        self.transposition
    }

    /// Routes later triggers to `destination`. Playbacks already started keep theirs.
    pub fn connect(&mut self, destination: ChannelId) {
        self.destination = Some(destination);
    }

    pub fn destination(&self) -> Option<ChannelId> {
        self.destination
    }

    /// Starts `note` at the absolute frame `when`.
    ///
    /// Returns the handle of the new playback, or `None` if no recording is close
    /// enough to the note to play it.
    pub fn trigger_attack(
        &mut self,
        graph: &mut dyn AudioGraph,
        note: Note,
        when: u64,
    ) -> Result<Option<NodeHandle>, VoiceError> {
        let samples = self
            .samples
            .as_ref()
            .ok_or_else(|| VoiceError::Disposed(self.instrument.clone()))?;
        let channel = self
            .destination
            .ok_or_else(|| VoiceError::NotConnected(self.instrument.clone()))?;

        let resolution = resolve_nearest(note, |candidate| samples.contains(candidate));
        let sample = match samples.get(resolution.resolved) {
            Some(sample) if resolution.found => sample.clone(),
            _ => {
                warn!(
                    instrument = %self.instrument,
                    note = %note,
                    "No sample near the requested note, skipping"
                );
                return Ok(None);
            }
        };

        let rate = playback_rate(resolution.semitone_offset() as f64, self.transposition);
        let handle = self.live.insert(LiveNode {
            note: resolution.resolved,
            start_frame: when,
        });
        let tag = self.live.tag(handle);

        debug!(
            instrument = %self.instrument,
            note = %note,
            resolved = %resolution.resolved,
            rate,
            start_frame = when,
            "Triggering sample"
        );
        graph.start_playback(PlaybackRequest {
            tag,
            sample,
            channel,
            start_frame: when,
            rate,
            gain: 1.0,
            fade_in: self.fade,
            fade_out: self.fade,
        });

        Ok(Some(handle))
    }

    /// Records that a playback ended on its own. Returns false for stale handles.
    pub fn on_ended(&mut self, handle: NodeHandle) -> bool {
        self.live.finish(handle, Terminal::Ended).is_some()
    }

    /// Stops every live playback and releases the sample set. Safe to call twice.
    pub fn dispose(&mut self, graph: &mut dyn AudioGraph) {
        if self.samples.take().is_none() {
            return;
        }

        let disposed = self.live.dispose_all();
        for (handle, node) in &disposed {
            debug!(
                instrument = %self.instrument,
                note = %node.note,
                start_frame = node.start_frame,
                "Stopping playback"
            );
            graph.stop_playback(self.live.tag(*handle));
        }
        debug!(
            instrument = %self.instrument,
            stopped = disposed.len(),
            "Voice disposed"
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.samples.is_none()
    }

    /// The pool that owns this voice's playbacks.
    pub fn pool_id(&self) -> PoolId {
        self.live.id()
    }

    /// Number of playbacks that haven't finished.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("instrument", &self.instrument)
            .field("transposition", &self.transposition)
            .field("destination", &self.destination)
            .field("live", &self.live.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use super::*;
    use crate::audio::mock::{MockGraph, MockHandle};
    use crate::audio::{ChannelSpec, Level, SendSpec};
    use crate::testutil::{pitched_set, unpitched_set};

    fn note(name: &str) -> Note {
        name.parse().unwrap()
    }

    fn make_rig(notes: &[&str], transposition: f64) -> (Voice, MockGraph, MockHandle, ChannelId) {
        let (mut graph, handle) = MockGraph::new(1000);
        let send = graph.create_send(SendSpec {
            name: "main".to_string(),
            effects: vec![],
        });
        let channel = graph.create_channel(ChannelSpec {
            send,
            level: Level::Fixed { db: 0.0 },
            pan: None,
        });
        let set = Arc::new(pitched_set("glass", notes, 100, 1000));
        let mut voice = Voice::from_set(set, transposition, Duration::from_secs(3));
        voice.connect(channel);
        (voice, graph, handle, channel)
    }

    #[test]
    fn test_trigger_plays_nearest_sample() {
        let (mut voice, mut graph, handle, channel) = make_rig(&["C4", "G4"], 0.0);

        assert!(voice.trigger_attack(&mut graph, note("C4"), 10).unwrap().is_some());
        assert!(voice.trigger_attack(&mut graph, note("D4"), 20).unwrap().is_some());

        let started = handle.started();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].rate, 1.0);
        assert_eq!(started[0].start_frame, 10);
        assert_eq!(started[0].channel, channel);
        assert_eq!(started[0].fade_in, Duration::from_secs(3));
        assert_eq!(started[0].fade_out, Duration::from_secs(3));
        // D4 is played from C4, two semitones sharp.
        assert!((started[1].rate - 2f64.powf(2.0 / 12.0)).abs() < 1e-9);
        assert_eq!(voice.live_count(), 2);
    }

    #[test]
    fn test_trigger_applies_transposition() {
        let (mut voice, mut graph, handle, _) = make_rig(&["C4", "G4"], -12.0);

        // E4 is closer to G4, three semitones above.
        voice.trigger_attack(&mut graph, note("E4"), 0).unwrap();
        let rate = handle.started()[0].rate;
        assert!((rate - 2f64.powf(-15.0 / 12.0)).abs() < 1e-9);
    }

    #[test]
    fn test_ties_resolve_upward() {
        let (mut voice, mut graph, handle, _) = make_rig(&["C4", "E4"], 0.0);
        voice.trigger_attack(&mut graph, note("D4"), 0).unwrap();
        let rate = handle.started()[0].rate;
        assert!((rate - 2f64.powf(-2.0 / 12.0)).abs() < 1e-9);
    }

    #[test]
    fn test_trigger_requires_connect() {
        let set = Arc::new(pitched_set("glass", &["C4"], 10, 1000));
        let mut voice = Voice::from_set(set, 0.0, Duration::ZERO);
        let (mut graph, handle) = MockGraph::new(1000);

        assert_eq!(
            voice.trigger_attack(&mut graph, note("C4"), 0),
            Err(VoiceError::NotConnected("glass".to_string()))
        );
        assert!(handle.started().is_empty());
        assert_eq!(voice.live_count(), 0);
    }

    #[test]
    fn test_connect_only_affects_later_triggers() {
        let (mut voice, mut graph, handle, first) = make_rig(&["C4"], 0.0);
        voice.trigger_attack(&mut graph, note("C4"), 0).unwrap();

        let send = graph.create_send(SendSpec {
            name: "other".to_string(),
            effects: vec![],
        });
        let second = graph.create_channel(ChannelSpec {
            send,
            level: Level::Fixed { db: 0.0 },
            pan: None,
        });
        voice.connect(second);
        voice.trigger_attack(&mut graph, note("C4"), 0).unwrap();

        let channels: Vec<ChannelId> = handle.started().iter().map(|r| r.channel).collect();
        assert_eq!(channels, vec![first, second]);
    }

    #[test]
    fn test_unplayable_note_is_skipped() {
        let set = Arc::new(unpitched_set("claves", 2, 10, 1000));
        let (mut graph, handle) = MockGraph::new(1000);
        let send = graph.create_send(SendSpec {
            name: "main".to_string(),
            effects: vec![],
        });
        let channel = graph.create_channel(ChannelSpec {
            send,
            level: Level::Fixed { db: 0.0 },
            pan: None,
        });
        let mut voice = Voice::from_set(set, 0.0, Duration::ZERO);
        voice.connect(channel);

        assert_eq!(voice.trigger_attack(&mut graph, note("C4"), 0), Ok(None));
        assert!(handle.started().is_empty());
    }

    #[test]
    fn test_ended_nodes_leave_the_pool() {
        let (mut voice, mut graph, handle, _) = make_rig(&["C4"], 0.0);
        let node = voice
            .trigger_attack(&mut graph, note("C4"), 0)
            .unwrap()
            .unwrap();

        assert!(handle.complete(handle.started()[0].tag));
        let completed = graph.drain_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].pool, voice.pool_id());

        assert!(voice.on_ended(completed[0].handle));
        assert!(!voice.on_ended(node));
        assert_eq!(voice.live_count(), 0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (mut voice, mut graph, handle, _) = make_rig(&["C4"], 0.0);
        voice.trigger_attack(&mut graph, note("C4"), 0).unwrap();
        voice.trigger_attack(&mut graph, note("C4"), 50).unwrap();

        voice.dispose(&mut graph);
        assert!(voice.is_disposed());
        assert_eq!(voice.live_count(), 0);
        assert_eq!(handle.stopped().len(), 2);
        assert_eq!(handle.live_playbacks(), 0);

        voice.dispose(&mut graph);
        assert_eq!(handle.stopped().len(), 2);

        assert_eq!(
            voice.trigger_attack(&mut graph, note("C4"), 0),
            Err(VoiceError::Disposed("glass".to_string()))
        );
    }

    #[tokio::test]
    async fn test_create_reports_load_errors() {
        let library = SampleLibrary::new(Path::new("."), HashMap::new(), 44100);
        let err = Voice::create(&library, "missing", 0.0, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::UnknownInstrument(name) if name == "missing"));
    }
}
