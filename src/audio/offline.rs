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
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{info, span, Level};

use super::mixer::{AudioMixer, MixerGraph, NUM_CHANNELS};
use super::AudioError;

/// Renders a mixer as fast as possible instead of in real time.
pub struct OfflineRenderer {
    mixer: AudioMixer,
    block_frames: usize,
    rendered: Vec<f32>,
}

impl OfflineRenderer {
    /// Creates a renderer and the graph handle that feeds it.
    pub fn new(sample_rate: u32, block_frames: usize) -> (OfflineRenderer, MixerGraph) {
        let (mixer, graph) = AudioMixer::new(sample_rate);
        (
            OfflineRenderer {
                mixer,
                block_frames: block_frames.max(1),
                rendered: Vec::new(),
            },
            graph,
        )
    }

    /// Gets the sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    /// Renders `total_frames` frames. `before_block` runs ahead of every block with the
    /// frame the block starts at, which is where scheduling happens.
    pub fn render<F>(&mut self, total_frames: u64, mut before_block: F)
    where
        F: FnMut(u64),
    {
        let span = span!(Level::INFO, "offline render");
        let _enter = span.enter();

        let mut block = vec![0.0f32; self.block_frames * NUM_CHANNELS];
        let end = self.mixer.current_frame() + total_frames;
        self.rendered.reserve(total_frames as usize * NUM_CHANNELS);

        while self.mixer.current_frame() < end {
            let frame = self.mixer.current_frame();
            before_block(frame);

            let frames = (end - frame).min(self.block_frames as u64) as usize;
            let block = &mut block[..frames * NUM_CHANNELS];
            self.mixer.process_into_output(block);
            self.rendered.extend_from_slice(block);
        }

        info!(
            frames = self.frames(),
            seconds = self.frames() as f64 / self.sample_rate() as f64,
            "Rendered audio"
        );
    }

    /// Number of frames rendered so far.
    pub fn frames(&self) -> usize {
        self.rendered.len() / NUM_CHANNELS
    }

    /// The rendered interleaved stereo samples.
    pub fn samples(&self) -> &[f32] {
        &self.rendered
    }

    /// Writes everything rendered so far as a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), AudioError> {
        let mut writer = WavWriter::create(
            path,
            WavSpec {
                channels: NUM_CHANNELS as u16,
                sample_rate: self.sample_rate(),
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            },
        )?;
        for sample in &self.rendered {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;

        info!(path = ?path, frames = self.frames(), "Wrote rendered audio");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::{AudioGraph, ChannelSpec, Level, PlaybackRequest, SendSpec};
    use crate::samples::NodePool;
    use crate::testutil::mono_sample;

    #[test]
    fn test_renders_requested_frames() {
        let (mut renderer, _graph) = OfflineRenderer::new(44100, 512);
        let mut block_starts = Vec::new();
        renderer.render(1300, |frame| block_starts.push(frame));

        assert_eq!(renderer.frames(), 1300);
        assert_eq!(renderer.samples().len(), 2600);
        assert_eq!(block_starts, vec![0, 512, 1024]);
    }

    #[test]
    fn test_render_and_write() {
        let (mut renderer, mut graph) = OfflineRenderer::new(1000, 4);
        let send = graph.create_send(SendSpec {
            name: "main".to_string(),
            effects: vec![],
        });
        let channel = graph.create_channel(ChannelSpec {
            send,
            level: Level::Fixed { db: 0.0 },
            pan: None,
        });
        let mut pool = NodePool::new();
        let node = pool.insert(());
        let tag = pool.tag(node);

        let mut scheduled = 0;
        renderer.render(10, |frame| {
            // Scheduled from inside the render loop, like the soundscape driver.
            if frame == 4 {
                scheduled += 1;
                graph.start_playback(PlaybackRequest {
                    tag,
                    sample: mono_sample(vec![0.5; 2], 1000),
                    channel,
                    start_frame: 5,
                    rate: 1.0,
                    gain: 1.0,
                    fade_in: Duration::ZERO,
                    fade_out: Duration::ZERO,
                });
            }
        });
        assert_eq!(scheduled, 1);
        let left: Vec<f32> = renderer.samples().chunks(2).map(|f| f[0]).collect();
        assert_eq!(left, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.0, 0.0, 0.0]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        renderer.write_wav(&path).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 1000);
        assert_eq!(reader.len(), 20);
    }
}
