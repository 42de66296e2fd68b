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

//! Bouncing claves.
//!
//! Every train is a ball dropped somewhere in the stereo field: hits come closer and
//! closer together until the spacing falls under a cutoff derived from the decay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use super::{uniform, Ensemble};
use crate::audio::{
    db_to_gain, AudioGraph, ChannelId, ChannelSpec, EffectSpec, Level, PlaybackRequest, SendId,
    SendSpec,
};
use crate::samples::{NodeHandle, NodePool, PlaybackTag, SampleSet, Terminal};
use crate::transport::Transport;

const REVERB_DAMPENING: f32 = 3000.0;

/// Settings for the clave trains.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaveParams {
    pub instrument: String,
    /// Gain of every hit.
    pub gain_db: f32,
    /// Half-open range the per-train decay is drawn from.
    pub decay: (f64, f64),
    /// Half-open range the per-train playback rate is drawn from.
    pub rate: (f64, f64),
    /// Time from one train's start to the next.
    pub train_interval: (Duration, Duration),
    /// How long a train's nodes live before they are released.
    pub lifetime: Duration,
    pub reverb_room_size: f32,
    pub delay_time: Duration,
    pub delay_feedback: f32,
    pub delay_wet: f32,
}

/// The shape of one bouncing ball.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BounceTrain {
    /// Stereo position in [-1, 1).
    pub pan: f32,
    /// Seconds from the train's start to its first hit.
    pub start: f64,
    /// Each interval is the previous one times this.
    pub decay: f64,
    pub rate: f64,
}

impl BounceTrain {
    /// Draws a random train.
    pub fn random<R: Rng>(rng: &mut R, params: &ClaveParams) -> BounceTrain {
        BounceTrain {
            pan: uniform(rng, (-1.0, 1.0)) as f32,
            start: 1.0 + rng.gen::<f64>(),
            decay: uniform(rng, params.decay),
            rate: uniform(rng, params.rate),
        }
    }

    /// The smallest interval still played.
    pub fn cutoff(&self) -> f64 {
        (1.0 - self.decay - 0.15) / 10.0
    }

    /// Hit times in seconds from the train's start.
    pub fn impacts(&self) -> Impacts {
        let cutoff = self.cutoff();
        Impacts {
            time: self.start,
            interval: if cutoff > 0.0 && self.decay < 1.0 {
                1.0
            } else {
                0.0
            },
            decay: self.decay,
            cutoff: cutoff.max(f64::MIN_POSITIVE),
        }
    }
}

/// Iterator over the hit times of a [`BounceTrain`].
#[derive(Debug, Clone)]
pub struct Impacts {
    time: f64,
    interval: f64,
    decay: f64,
    cutoff: f64,
}

impl Iterator for Impacts {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.interval < self.cutoff {
            return None;
        }
        let time = self.time;
        self.interval *= self.decay;
        self.time += self.interval;
        Some(time)
    }
}

/// Identifies a train while its nodes are alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrainId(u64);

struct Train {
    channel: ChannelId,
    hits: Vec<NodeHandle>,
}

/// A single hit in flight.
struct Hit {
    train: TrainId,
}

/// The clave trains and the send they share.
pub struct Bounces {
    claves: Option<Arc<SampleSet>>,
    send: SendId,
    hits: NodePool<Hit>,
    trains: HashMap<TrainId, Train>,
    next_train: u64,
    params: ClaveParams,
}

impl Bounces {
    /// Creates the clave send: reverb into feedback delay.
    pub fn assemble(
        graph: &mut dyn AudioGraph,
        claves: Arc<SampleSet>,
        params: &ClaveParams,
    ) -> Bounces {
        let send = graph.create_send(SendSpec {
            name: "clave".to_string(),
            effects: vec![
                EffectSpec::Reverb {
                    room_size: params.reverb_room_size,
                    dampening: REVERB_DAMPENING,
                    wet: 1.0,
                },
                EffectSpec::FeedbackDelay {
                    delay: params.delay_time,
                    feedback: params.delay_feedback,
                    wet: params.delay_wet,
                },
            ],
        });

        Bounces {
            claves: Some(claves),
            send,
            hits: NodePool::new(),
            trains: HashMap::new(),
            next_train: 0,
            params: params.clone(),
        }
    }

    /// Schedules the first train.
    pub fn arm<R: Rng>(&self, transport: &mut Transport<Ensemble>, rng: &mut R) {
        transport.schedule_once(self.next_interval(rng), launch);
    }

    fn next_interval<R: Rng>(&self, rng: &mut R) -> Duration {
        let (min, max) = self.params.train_interval;
        Duration::from_secs_f64(uniform(rng, (min.as_secs_f64(), max.as_secs_f64())))
    }

    /// Starts every hit of `train` relative to `now` on a fresh panned channel.
    pub fn start_train<R: Rng>(
        &mut self,
        graph: &mut dyn AudioGraph,
        rng: &mut R,
        train: &BounceTrain,
        now: u64,
    ) -> Option<TrainId> {
        let claves = self.claves.as_ref()?;
        if claves.is_empty() {
            return None;
        }

        let id = TrainId(self.next_train);
        self.next_train += 1;

        let channel = graph.create_channel(ChannelSpec {
            send: self.send,
            level: Level::Fixed { db: 0.0 },
            pan: Some(train.pan),
        });
        let gain = db_to_gain(self.params.gain_db);
        let sample_rate = graph.sample_rate() as f64;

        let mut hits = Vec::new();
        for offset in train.impacts() {
            let Some(sample) = claves.get_index(rng.gen_range(0..claves.len())) else {
                continue;
            };
            let handle = self.hits.insert(Hit { train: id });
            let tag = self.hits.tag(handle);
            graph.start_playback(PlaybackRequest {
                tag,
                sample: sample.clone(),
                channel,
                start_frame: now + (offset * sample_rate).round() as u64,
                rate: train.rate,
                gain,
                fade_in: Duration::ZERO,
                fade_out: Duration::ZERO,
            });
            hits.push(handle);
        }

        debug!(
            train = id.0,
            pan = train.pan,
            decay = train.decay,
            rate = train.rate,
            hits = hits.len(),
            "Clave train started"
        );
        self.trains.insert(id, Train { channel, hits });
        Some(id)
    }

    /// Force-releases a train's remaining hits and its channel. Unknown trains are
    /// ignored.
    pub fn release_train(&mut self, graph: &mut dyn AudioGraph, id: TrainId) {
        let Some(train) = self.trains.remove(&id) else {
            return;
        };
        let mut stopped = 0;
        for handle in train.hits {
            if let Some(hit) = self.hits.finish(handle, Terminal::Disposed) {
                debug_assert_eq!(hit.train, id);
                graph.stop_playback(self.hits.tag(handle));
                stopped += 1;
            }
        }
        graph.dispose_channel(train.channel);
        debug!(train = id.0, stopped, "Clave train released");
    }

    /// Records a hit that ended on its own.
    pub fn on_ended(&mut self, tag: PlaybackTag) -> bool {
        tag.pool == self.hits.id() && self.hits.finish(tag.handle, Terminal::Ended).is_some()
    }

    /// Releases every train, then the send and the sample set.
    pub fn dispose(&mut self, graph: &mut dyn AudioGraph) {
        let trains: Vec<TrainId> = self.trains.keys().copied().collect();
        for id in trains {
            self.release_train(graph, id);
        }
        graph.dispose_send(self.send);
        self.claves = None;
    }

    /// Hits that haven't finished.
    pub fn live_count(&self) -> usize {
        self.hits.len()
    }

    /// Trains whose nodes haven't been released.
    pub fn active_trains(&self) -> usize {
        self.trains.len()
    }

    pub fn params(&self) -> &ClaveParams {
        &self.params
    }
}

/// Starts a train, schedules its release, and schedules the next one.
fn launch(ensemble: &mut Ensemble, transport: &mut Transport<Ensemble>) {
    let train = BounceTrain::random(&mut ensemble.rng, ensemble.clave.params());
    let started = ensemble.clave.start_train(
        ensemble.graph.as_mut(),
        &mut ensemble.rng,
        &train,
        transport.now(),
    );

    if let Some(id) = started {
        transport.schedule_once(
            ensemble.clave.params.lifetime,
            move |ensemble: &mut Ensemble, _: &mut Transport<Ensemble>| {
                ensemble.clave.release_train(ensemble.graph.as_mut(), id);
            },
        );
    }

    let next = ensemble.clave.next_interval(&mut ensemble.rng);
    info!(
        at = transport.seconds(),
        next_in = next.as_secs_f64(),
        "Clave train dropped"
    );
    transport.schedule_once(next, launch);
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::audio::mock::MockGraph;
    use crate::testutil::unpitched_set;

    fn params() -> ClaveParams {
        ClaveParams {
            instrument: "claves".to_string(),
            gain_db: -35.0,
            decay: (0.75, 0.85),
            rate: (0.5, 1.5),
            train_interval: (Duration::from_secs(10), Duration::from_secs(20)),
            lifetime: Duration::from_secs(60),
            reverb_room_size: 0.6,
            delay_time: Duration::from_secs(3),
            delay_feedback: 0.3,
            delay_wet: 0.2,
        }
    }

    fn train(decay: f64) -> BounceTrain {
        BounceTrain {
            pan: 0.0,
            start: 1.5,
            decay,
            rate: 1.0,
        }
    }

    #[test]
    fn test_bounce_series() {
        let train = train(0.8);
        assert!((train.cutoff() - 0.005).abs() < 1e-12);

        let times: Vec<f64> = train.impacts().collect();
        assert_eq!(times[0], 1.5);
        assert!((times[1] - 2.3).abs() < 1e-12);

        let intervals: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(intervals.windows(2).all(|w| w[1] < w[0]));
        assert!(intervals.iter().all(|interval| *interval >= train.cutoff()));
        // 0.8^23 is the last interval above the cutoff.
        assert_eq!(times.len(), 24);
    }

    #[test]
    fn test_unbounded_decay_plays_nothing() {
        assert_eq!(train(0.9).impacts().count(), 0);
        assert_eq!(train(1.0).impacts().count(), 0);
    }

    #[test]
    fn test_decay_near_limit() {
        // A cutoff of 5e-7 still yields a finite, if long, series.
        let train = train(0.849995);
        assert!(train.cutoff() > 0.0 && train.cutoff() < 1e-6);
        assert_eq!(train.impacts().count(), 90);
    }

    #[test]
    fn test_random_train_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let train = BounceTrain::random(&mut rng, &params());
            assert!((-1.0..1.0).contains(&train.pan));
            assert!((1.0..2.0).contains(&train.start));
            assert!((0.75..0.85).contains(&train.decay));
            assert!((0.5..1.5).contains(&train.rate));
        }
    }

    #[test]
    fn test_train_lifecycle() {
        let (mut graph, handle) = MockGraph::new(1000);
        let mut rng = StdRng::seed_from_u64(1);
        let claves = Arc::new(unpitched_set("claves", 3, 50, 1000));
        let mut bounces = Bounces::assemble(&mut graph, claves, &params());
        assert_eq!(handle.send_names(), vec!["clave"]);

        let id = bounces
            .start_train(&mut graph, &mut rng, &train(0.8), 5000)
            .unwrap();
        let started = handle.started();
        assert_eq!(started.len(), 24);
        assert_eq!(started[0].start_frame, 6500);
        assert_eq!(started[1].start_frame, 7300);
        assert!(started
            .iter()
            .all(|request| (request.gain - db_to_gain(-35.0)).abs() < 1e-9));
        assert_eq!(handle.channels()[0].pan, Some(0.0));
        assert_eq!(bounces.live_count(), 24);

        // Two hits end naturally, the rest are released with the train.
        for request in &started[..2] {
            assert!(handle.complete(request.tag));
        }
        for tag in graph.drain_completed() {
            assert!(bounces.on_ended(tag));
        }
        assert_eq!(bounces.live_count(), 22);

        bounces.release_train(&mut graph, id);
        assert_eq!(bounces.live_count(), 0);
        assert_eq!(bounces.active_trains(), 0);
        assert_eq!(handle.stopped().len(), 22);
        assert_eq!(handle.disposed_channels().len(), 1);

        // Releasing again, or reporting a released hit, does nothing.
        bounces.release_train(&mut graph, id);
        assert!(!bounces.on_ended(started[5].tag));
        assert_eq!(handle.stopped().len(), 22);

        bounces.dispose(&mut graph);
        assert_eq!(handle.send_count(), 0);
        assert!(bounces
            .start_train(&mut graph, &mut rng, &train(0.8), 0)
            .is_none());
    }
}
