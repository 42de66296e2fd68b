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

//! The soundscape: glass loops and clave trains on one transport.
//!
//! Loading, assembly and starting are separate steps so the pieces can be driven by a
//! live device, an offline renderer or a mock graph alike.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, Instrument};

use crate::audio::offline::OfflineRenderer;
use crate::audio::AudioGraph;
use crate::samples::{LoadError, Note, SampleLibrary, SampleSet, Voice};
use crate::transport::Transport;

pub mod clave;
pub mod glass;

use clave::{Bounces, ClaveParams};
use glass::{GlassLoops, GlassParams};

/// How the driver advances the transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    /// How often the driver wakes up.
    pub tick: Duration,
    /// How far past the rendered position events are scheduled.
    pub lookahead: Duration,
}

/// Everything needed to build a soundscape.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub glass: GlassParams,
    pub clave: ClaveParams,
    pub pacing: Pacing,
}

/// Draws from `[min, max)`, or returns `min` for an empty range.
pub(crate) fn uniform<R: Rng + ?Sized>(rng: &mut R, (min, max): (f64, f64)) -> f64 {
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}

/// Loaded instruments, ready to be assembled.
pub struct Instruments {
    glass: Vec<(Voice, Note)>,
    claves: Arc<SampleSet>,
}

impl Instruments {
    /// Pairs each glass voice with the note it loops.
    pub fn new(glass: Vec<(Voice, Note)>, claves: Arc<SampleSet>) -> Instruments {
        Instruments { glass, claves }
    }
}

/// The state scheduled callbacks act on.
pub struct Ensemble {
    graph: Box<dyn AudioGraph>,
    rng: StdRng,
    glass: GlassLoops,
    clave: Bounces,
}

impl Ensemble {
    /// Hands each natural completion to the pool that owns it.
    fn route_completions(&mut self) {
        for tag in self.graph.drain_completed() {
            if !self.glass.on_ended(tag) && !self.clave.on_ended(tag) {
                debug!(tag = ?tag, "Completion for a node that is already gone");
            }
        }
    }
}

/// A running soundscape.
pub struct Soundscape {
    transport: Transport<Ensemble>,
    ensemble: Ensemble,
    pacing: Pacing,
    torn_down: bool,
}

impl Soundscape {
    /// Loads the glass voices and the clave samples. Voice `i` plays `notes[i]`.
    pub async fn load(params: &Params, library: &SampleLibrary) -> Result<Instruments, LoadError> {
        let glass = &params.glass;
        let mut voices = Vec::with_capacity(glass.notes.len());
        for (index, note) in glass.notes.iter().enumerate() {
            let voice = Voice::create(
                library,
                &glass.instrument,
                glass.transposition(index),
                glass.fade,
            )
            .await?;
            voices.push((voice, *note));
        }
        let claves = library.load(&params.clave.instrument).await?;

        info!(
            glass_voices = voices.len(),
            claves = claves.len(),
            "Instruments loaded"
        );
        Ok(Instruments::new(voices, claves))
    }

    /// Builds the sends and channels on `graph`. Nothing plays until [`Soundscape::start`].
    pub fn assemble(
        params: &Params,
        instruments: Instruments,
        mut graph: Box<dyn AudioGraph>,
        mut rng: StdRng,
    ) -> Soundscape {
        let glass = GlassLoops::assemble(graph.as_mut(), &mut rng, instruments.glass, &params.glass);
        let clave = Bounces::assemble(graph.as_mut(), instruments.claves, &params.clave);

        Soundscape {
            transport: Transport::new(graph.sample_rate()),
            ensemble: Ensemble {
                graph,
                rng,
                glass,
                clave,
            },
            pacing: params.pacing,
            torn_down: false,
        }
    }

    /// Starts the transport at the graph's current frame and arms both generators.
    pub fn start(&mut self) {
        if self.torn_down || self.transport.is_started() {
            return;
        }
        self.transport.start(self.ensemble.graph.current_frame());
        self.ensemble
            .glass
            .arm(&mut self.transport, &mut self.ensemble.rng);
        self.ensemble
            .clave
            .arm(&mut self.transport, &mut self.ensemble.rng);
        info!(
            frame = self.transport.now(),
            voices = self.ensemble.glass.len(),
            "Soundscape started"
        );
    }

    /// Processes completions, then fires everything due up to `frame`.
    pub fn advance(&mut self, frame: u64) -> usize {
        if self.torn_down {
            return 0;
        }
        self.ensemble.route_completions();
        self.transport.advance_to(frame, &mut self.ensemble)
    }

    /// Advances to the graph's position plus the lookahead.
    pub fn tick(&mut self) -> usize {
        let lookahead = self.transport.seconds_to_frames(self.pacing.lookahead);
        let frame = self.ensemble.graph.current_frame();
        self.advance(frame + lookahead)
    }

    /// Stops scheduling and releases every node. Safe to call twice.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.transport.clear();
        self.ensemble.route_completions();
        let live = self.live_nodes();
        let graph = self.ensemble.graph.as_mut();
        self.ensemble.clave.dispose(graph);
        self.ensemble.glass.dispose(graph);
        info!(released = live, "Soundscape torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Playbacks that haven't ended or been released.
    pub fn live_nodes(&self) -> usize {
        self.ensemble.glass.live_count() + self.ensemble.clave.live_count()
    }

    /// The transport position.
    pub fn now(&self) -> u64 {
        self.transport.now()
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Drives the soundscape from its graph's clock on a tokio task.
    pub fn run(mut self) -> SoundscapeHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(
            async move {
                self.start();
                let mut interval = tokio::time::interval(self.pacing.tick);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        // Also taken when the handle is dropped.
                        _ = &mut stop_rx => break,
                        _ = interval.tick() => {
                            self.tick();
                        }
                    }
                }
                self.teardown();
                self
            }
            .instrument(info_span!("soundscape driver")),
        );

        SoundscapeHandle {
            stop: Some(stop_tx),
            task,
        }
    }

    /// Renders `duration` of the soundscape through `renderer`, then tears it down.
    /// The soundscape must have been assembled on the renderer's graph.
    pub fn render_offline(&mut self, renderer: &mut OfflineRenderer, duration: Duration) {
        self.start();
        let frames = self.transport.seconds_to_frames(duration);
        let lookahead = self.transport.seconds_to_frames(self.pacing.lookahead);
        renderer.render(frames, |frame| {
            self.advance(frame + lookahead);
        });
        self.teardown();
    }
}

/// Controls a soundscape running on a tokio task.
pub struct SoundscapeHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Soundscape>,
}

impl SoundscapeHandle {
    /// Stops the driver, tears the soundscape down and hands it back.
    pub async fn teardown(mut self) -> Result<Soundscape, JoinError> {
        if let Some(stop) = self.stop.take() {
            // The driver may already be gone.
            let _ = stop.send(());
        }
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::SeedableRng;

    use super::*;
    use crate::audio::mock::{MockGraph, MockHandle};
    use crate::audio::{db_to_gain, ChannelId, Level, PlaybackRequest};
    use crate::testutil::{eventually_async, pitched_set, unpitched_set};

    const RATE: u32 = 1000;

    fn make_params() -> Params {
        Params {
            glass: GlassParams {
                instrument: "glass".to_string(),
                notes: ["C4", "E4", "F4", "G4", "B5", "A5"]
                    .iter()
                    .map(|note| note.parse().unwrap())
                    .collect(),
                transpositions: vec![-36.0, -24.0],
                loop_period: Duration::from_secs(60),
                trigger_offset: Duration::from_secs(1),
                fade: Duration::from_secs(3),
                lfo_min_db: -500.0,
                lfo_max_db: 30.0,
                lfo_max_frequency: 0.01,
                filter_frequency: 1000.0,
            },
            clave: ClaveParams {
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
            },
            pacing: Pacing {
                tick: Duration::from_millis(10),
                lookahead: Duration::from_millis(100),
            },
        }
    }

    fn make_instruments(params: &Params, rate: u32) -> Instruments {
        let glass = Arc::new(pitched_set("glass", &["C4", "G4", "A5"], (rate / 10) as usize, rate));
        let voices = params
            .glass
            .notes
            .iter()
            .enumerate()
            .map(|(index, note)| {
                let transposition = params.glass.transposition(index);
                let voice = Voice::from_set(glass.clone(), transposition, params.glass.fade);
                (voice, *note)
            })
            .collect();
        Instruments::new(voices, Arc::new(unpitched_set("claves", 4, (rate / 20) as usize, rate)))
    }

    fn make_soundscape(seed: u64) -> (Soundscape, MockHandle) {
        let params = make_params();
        let (graph, handle) = MockGraph::new(RATE);
        let soundscape = Soundscape::assemble(
            &params,
            make_instruments(&params, RATE),
            Box::new(graph),
            StdRng::seed_from_u64(seed),
        );
        (soundscape, handle)
    }

    /// Steps the clock like the live driver, ending playbacks as they run out.
    fn drive(soundscape: &mut Soundscape, handle: &MockHandle, until: Duration) {
        let step = (RATE / 10) as u64;
        let end = until.as_millis() as u64 * RATE as u64 / 1000;
        let mut frame = soundscape.now();
        while frame < end {
            frame += step;
            handle.set_frame(frame);
            handle.complete_due(frame, RATE);
            soundscape.tick();
        }
    }

    fn requests_by_channel(handle: &MockHandle) -> HashMap<ChannelId, Vec<PlaybackRequest>> {
        let mut by_channel: HashMap<ChannelId, Vec<PlaybackRequest>> = HashMap::new();
        for request in handle.started() {
            by_channel.entry(request.channel).or_default().push(request);
        }
        by_channel
    }

    #[test]
    fn test_assemble_builds_graph() {
        let (soundscape, handle) = make_soundscape(1);
        assert_eq!(handle.send_names(), vec!["clave", "glass"]);
        assert_eq!(handle.channel_count(), 6);
        for spec in handle.channels() {
            match spec.level {
                Level::Lfo {
                    min_db,
                    max_db,
                    frequency,
                    phase_degrees,
                } => {
                    assert_eq!((min_db, max_db), (-500.0, 30.0));
                    assert!((0.0..0.01).contains(&frequency));
                    assert!((0.0..360.0).contains(&phase_degrees));
                }
                other => panic!("unexpected level {:?}", other),
            }
        }
        assert_eq!(soundscape.live_nodes(), 0);
    }

    #[test]
    fn test_nothing_plays_before_start() {
        let (mut soundscape, handle) = make_soundscape(2);
        handle.set_frame(100_000);
        assert_eq!(soundscape.tick(), 0);
        assert!(handle.started().is_empty());
    }

    #[test]
    fn test_glass_loops() {
        let (mut soundscape, handle) = make_soundscape(3);
        soundscape.start();
        drive(&mut soundscape, &handle, Duration::from_secs(200));

        let glass_channels = soundscape.ensemble.glass.channels();
        let by_channel = requests_by_channel(&handle);

        let mut first_starts = Vec::new();
        for (index, channel) in glass_channels.iter().enumerate() {
            let requests = &by_channel[channel];
            assert!(requests.len() >= 3, "voice {} played {}", index, requests.len());
            // Exactly one loop period apart.
            for pair in requests.windows(2) {
                assert_eq!(pair[1].start_frame - pair[0].start_frame, 60 * RATE as u64);
            }
            first_starts.push(requests[0].start_frame);

            let transposition = if index % 2 == 0 { -36.0 } else { -24.0 };
            assert!(requests[0].rate < 2f64.powf((transposition + 12.0) / 12.0));
            assert_eq!(requests[0].fade_in, Duration::from_secs(3));
        }
        // The earliest voice fires one second in and plays one second later.
        assert_eq!(first_starts.iter().min(), Some(&(2 * RATE as u64)));
        assert!(first_starts.iter().all(|start| *start < 62 * RATE as u64));
    }

    #[test]
    fn test_clave_trains() {
        let (mut soundscape, handle) = make_soundscape(4);
        soundscape.start();
        drive(&mut soundscape, &handle, Duration::from_secs(150));

        let glass_channels = soundscape.ensemble.glass.channels();
        let mut train_starts: Vec<u64> = requests_by_channel(&handle)
            .into_iter()
            .filter(|(channel, _)| !glass_channels.contains(channel))
            .map(|(_, requests)| {
                for request in &requests {
                    assert!((request.gain - db_to_gain(-35.0)).abs() < 1e-9);
                    assert!((0.5..1.5).contains(&request.rate));
                    assert_eq!(request.rate, requests[0].rate);
                }
                requests[0].start_frame
            })
            .collect();
        train_starts.sort();

        // Trains start 10 to 20 seconds apart; the first hit lands 1 to 2 seconds in.
        assert!(train_starts.len() >= 6);
        assert!((11 * RATE as u64..22 * RATE as u64).contains(&train_starts[0]));
        for pair in train_starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((9 * RATE as u64..21 * RATE as u64).contains(&gap), "gap {}", gap);
        }

        // Trains older than their lifetime have had their panners released.
        assert!(!handle.disposed_channels().is_empty());
        assert!(soundscape.ensemble.clave.active_trains() <= 7);
    }

    #[test]
    fn test_clave_train_release_timing() {
        let (mut soundscape, handle) = make_soundscape(6);
        soundscape.start();
        let lifetime = 60 * RATE as u64;
        let end = 150 * RATE as u64;
        // Frame by frame with no lookahead, so every event fires at its own frame.
        for frame in 1..=end {
            handle.set_frame(frame);
            if frame % 100 == 0 {
                handle.complete_due(frame, RATE);
            }
            soundscape.advance(frame);
        }

        let glass_channels = soundscape.ensemble.glass.channels();
        let mut trains: Vec<(u64, Option<u64>)> = requests_by_channel(&handle)
            .into_iter()
            .filter(|(channel, _)| !glass_channels.contains(channel))
            .map(|(channel, requests)| {
                let (created, disposed) = handle.channel_frames(channel).unwrap();
                let first_hit = requests[0].start_frame - created;
                assert!((RATE as u64..=2 * RATE as u64).contains(&first_hit));
                (created, disposed)
            })
            .collect();
        trains.sort();
        assert!(trains.len() >= 6);

        for (created, disposed) in &trains {
            if created + lifetime <= end {
                assert_eq!(*disposed, Some(created + lifetime), "train at {}", created);
            } else {
                assert_eq!(*disposed, None, "train at {}", created);
            }
        }

        // Each train is still sounding when the next one drops.
        for pair in trains.windows(2) {
            let (_, disposed) = pair[0];
            let (next_created, _) = pair[1];
            assert!(disposed.map_or(true, |disposed| next_created < disposed));
        }
        let live_at_end = trains.iter().filter(|(_, disposed)| disposed.is_none()).count();
        assert!(live_at_end >= 2);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (mut soundscape, handle) = make_soundscape(5);
        soundscape.start();
        // Stop mid-loop, without ending anything naturally.
        for step in 1..=700u64 {
            handle.set_frame(step * 100);
            soundscape.tick();
        }
        assert!(soundscape.live_nodes() > 0);
        assert!(handle.live_playbacks() > 0);

        soundscape.teardown();
        assert!(soundscape.is_torn_down());
        assert_eq!(soundscape.live_nodes(), 0);
        assert_eq!(handle.live_playbacks(), 0);
        assert_eq!(handle.channel_count(), 0);
        assert_eq!(handle.send_count(), 0);

        let stopped = handle.stopped().len();
        let disposed_channels = handle.disposed_channels().len();
        soundscape.teardown();
        assert_eq!(handle.stopped().len(), stopped);
        assert_eq!(handle.disposed_channels().len(), disposed_channels);
        assert_eq!(handle.disposed_sends().len(), 2);

        // Nothing fires after teardown.
        let started = handle.started().len();
        handle.set_frame(1_000_000);
        assert_eq!(soundscape.tick(), 0);
        assert_eq!(handle.started().len(), started);
    }

    #[test]
    fn test_render_offline() {
        let params = make_params();
        let (mut renderer, graph) = OfflineRenderer::new(8000, 256);
        let mut soundscape = Soundscape::assemble(
            &params,
            make_instruments(&params, 8000),
            Box::new(graph),
            StdRng::seed_from_u64(6),
        );

        soundscape.render_offline(&mut renderer, Duration::from_secs(30));
        assert_eq!(renderer.frames(), 30 * 8000);
        assert!(soundscape.is_torn_down());
        assert_eq!(soundscape.live_nodes(), 0);
        assert!(renderer.samples().iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_and_teardown() {
        let (mut soundscape, handle) = make_soundscape(7);
        soundscape.start();
        let running = soundscape.run();

        // Jump the clock past every glass voice's first firing.
        handle.set_frame(70 * RATE as u64);
        let probe = handle.clone();
        eventually_async(
            || {
                let probe = probe.clone();
                async move { probe.started().len() >= 6 }
            },
            "glass voices never played",
        )
        .await;

        let soundscape = running.teardown().await.unwrap();
        assert!(soundscape.is_torn_down());
        assert_eq!(soundscape.live_nodes(), 0);
        assert_eq!(handle.send_count(), 0);
    }

    #[tokio::test]
    async fn test_load_reports_missing_instrument() {
        let params = make_params();
        let library = SampleLibrary::new(std::path::Path::new("."), HashMap::new(), RATE);
        let result = Soundscape::load(&params, &library).await;
        assert!(matches!(result, Err(LoadError::UnknownInstrument(name)) if name == "glass"));
    }
}
