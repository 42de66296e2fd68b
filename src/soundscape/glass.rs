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

//! Wine glass loops: each voice replays one note every loop period, starting at a
//! staggered offset, through a channel whose level drifts with a slow LFO.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::{uniform, Ensemble};
use crate::audio::{AudioGraph, ChannelId, ChannelSpec, EffectSpec, Level, SendId, SendSpec};
use crate::samples::{Note, PlaybackTag, Voice};
use crate::transport::{Repeat, Transport};

const COMPRESSOR_THRESHOLD_DB: f32 = -24.0;
const COMPRESSOR_RATIO: f32 = 12.0;
const COMPRESSOR_ATTACK: Duration = Duration::from_millis(3);
const COMPRESSOR_RELEASE: Duration = Duration::from_millis(250);

/// Settings for the glass loops.
#[derive(Debug, Clone, PartialEq)]
pub struct GlassParams {
    pub instrument: String,
    /// One voice per note.
    pub notes: Vec<Note>,
    /// Voice `i` is transposed by `transpositions[i % len]` semitones.
    pub transpositions: Vec<f64>,
    pub loop_period: Duration,
    /// How far ahead of the firing each note is scheduled.
    pub trigger_offset: Duration,
    pub fade: Duration,
    pub lfo_min_db: f32,
    pub lfo_max_db: f32,
    /// LFO frequencies are drawn from `[0, lfo_max_frequency)`.
    pub lfo_max_frequency: f64,
    pub filter_frequency: f32,
}

impl GlassParams {
    /// The transposition for voice `index`.
    pub fn transposition(&self, index: usize) -> f64 {
        if self.transpositions.is_empty() {
            return 0.0;
        }
        self.transpositions[index % self.transpositions.len()]
    }
}

/// Shifts start delays so the earliest one lands at one second.
pub fn normalize_start_delays(delays: &[f64]) -> Vec<f64> {
    let min = delays.iter().copied().fold(f64::INFINITY, f64::min);
    delays.iter().map(|delay| delay - min + 1.0).collect()
}

struct GlassVoice {
    voice: Voice,
    note: Note,
    channel: ChannelId,
}

/// The glass voices and the send they share.
pub struct GlassLoops {
    send: SendId,
    voices: Vec<GlassVoice>,
    trigger_offset: Duration,
    loop_period: Duration,
}

impl GlassLoops {
    /// Creates the glass send and one LFO channel per voice, and connects each voice.
    pub fn assemble<R: Rng>(
        graph: &mut dyn AudioGraph,
        rng: &mut R,
        voices: Vec<(Voice, Note)>,
        params: &GlassParams,
    ) -> GlassLoops {
        let send = graph.create_send(SendSpec {
            name: "glass".to_string(),
            effects: vec![
                EffectSpec::Lowpass {
                    frequency: params.filter_frequency,
                },
                EffectSpec::Compressor {
                    threshold_db: COMPRESSOR_THRESHOLD_DB,
                    ratio: COMPRESSOR_RATIO,
                    attack: COMPRESSOR_ATTACK,
                    release: COMPRESSOR_RELEASE,
                },
            ],
        });

        let voices = voices
            .into_iter()
            .map(|(mut voice, note)| {
                let frequency = uniform(rng, (0.0, params.lfo_max_frequency));
                let phase_degrees = uniform(rng, (0.0, 360.0));
                let channel = graph.create_channel(ChannelSpec {
                    send,
                    level: Level::Lfo {
                        min_db: params.lfo_min_db,
                        max_db: params.lfo_max_db,
                        frequency,
                        phase_degrees,
                    },
                    pan: None,
                });
                voice.connect(channel);
                debug!(
                    note = %note,
                    transposition = voice.transposition(),
                    lfo_frequency = frequency,
                    lfo_phase = phase_degrees,
                    "Glass voice assembled"
                );
                GlassVoice {
                    voice,
                    note,
                    channel,
                }
            })
            .collect();

        GlassLoops {
            send,
            voices,
            trigger_offset: params.trigger_offset,
            loop_period: params.loop_period,
        }
    }

    /// Arms one repeating trigger per voice at a staggered start.
    pub fn arm<R: Rng>(&self, transport: &mut Transport<Ensemble>, rng: &mut R) {
        let period = self.loop_period.as_secs_f64();
        let delays: Vec<f64> = self
            .voices
            .iter()
            .map(|_| uniform(rng, (0.0, period)))
            .collect();
        let offset = transport.seconds_to_frames(self.trigger_offset);

        for (index, delay) in normalize_start_delays(&delays).into_iter().enumerate() {
            transport.schedule_repeating(
                Duration::from_secs_f64(delay),
                self.loop_period,
                move |ensemble: &mut Ensemble, transport: &mut Transport<Ensemble>| {
                    ensemble
                        .glass
                        .trigger(index, ensemble.graph.as_mut(), transport.now() + offset);
                    Repeat::Again
                },
            );
        }
    }

    fn trigger(&mut self, index: usize, graph: &mut dyn AudioGraph, when: u64) {
        let Some(glass) = self.voices.get_mut(index) else {
            return;
        };
        if let Err(e) = glass.voice.trigger_attack(graph, glass.note, when) {
            warn!(err = %e, note = %glass.note, "Unable to trigger glass voice");
        }
    }

    /// Routes a natural completion to the voice that owns it.
    pub fn on_ended(&mut self, tag: PlaybackTag) -> bool {
        self.voices
            .iter_mut()
            .find(|glass| glass.voice.pool_id() == tag.pool)
            .is_some_and(|glass| glass.voice.on_ended(tag.handle))
    }

    /// Disposes every voice, then the channels and the send.
    pub fn dispose(&mut self, graph: &mut dyn AudioGraph) {
        for glass in &mut self.voices {
            glass.voice.dispose(graph);
            graph.dispose_channel(glass.channel);
        }
        graph.dispose_send(self.send);
    }

    /// Live playbacks across all voices.
    pub fn live_count(&self) -> usize {
        self.voices.iter().map(|glass| glass.voice.live_count()).sum()
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// The channel of each voice, in voice order.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.voices.iter().map(|glass| glass.channel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_start_delays() {
        assert_eq!(
            normalize_start_delays(&[5.0, 40.0, 0.0]),
            vec![6.0, 41.0, 1.0]
        );
        assert_eq!(normalize_start_delays(&[12.5]), vec![1.0]);
        assert!(normalize_start_delays(&[]).is_empty());
    }

    #[test]
    fn test_transposition_cycles() {
        let params = GlassParams {
            instrument: "glass".to_string(),
            notes: vec![],
            transpositions: vec![-36.0, -24.0],
            loop_period: Duration::from_secs(60),
            trigger_offset: Duration::from_secs(1),
            fade: Duration::from_secs(3),
            lfo_min_db: -500.0,
            lfo_max_db: 30.0,
            lfo_max_frequency: 0.01,
            filter_frequency: 1000.0,
        };
        let transpositions: Vec<f64> = (0..5).map(|i| params.transposition(i)).collect();
        assert_eq!(transpositions, vec![-36.0, -24.0, -36.0, -24.0, -36.0]);
    }
}
