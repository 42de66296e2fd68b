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
use std::{
    fmt,
    sync::{atomic::AtomicBool, Arc},
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use tracing::{error, info, span, Level};

use super::mixer::{AudioMixer, NUM_CHANNELS};
use super::AudioError;
use crate::{config, playsync::CancelHandle};

/// How long the producer waits on a full queue before re-checking for cancellation.
const PRODUCER_POLL: Duration = Duration::from_millis(50);

/// A small wrapper around a cpal::Device.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

/// Lists the output devices known to cpal.
pub fn list_device_names() -> Result<Vec<String>, AudioError> {
    Ok(Device::list()?
        .into_iter()
        .map(|device| device.to_string())
        .collect())
}

impl Device {
    /// Lists cpal output devices.
    fn list() -> Result<Vec<Device>, AudioError> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout()?;
        let _shh_stderr = shh::stderr()?;

        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host = cpal::host_from_id(host_id).map_err(|e| AudioError::Device(e.to_string()))?;
            let host_devices = match host.output_devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(output_configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = output_configs
                    .map(|output_config| output_config.channels())
                    .max()
                    .unwrap_or(0);

                if max_channels > 0 {
                    let Ok(name) = device.name() else {
                        continue;
                    };
                    devices.push(Device {
                        name,
                        max_channels,
                        host_id,
                        device,
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets the given cpal device. "default" picks the default host's default output.
    pub fn get(name: &str) -> Result<Device, AudioError> {
        if name == "default" {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| AudioError::UnknownDevice(name.to_string()))?;
            let max_channels = device
                .supported_output_configs()
                .map_err(|e| AudioError::Device(e.to_string()))?
                .map(|output_config| output_config.channels())
                .max()
                .unwrap_or(0);
            return Ok(Device {
                name: device
                    .name()
                    .map_err(|e| AudioError::Device(e.to_string()))?,
                max_channels,
                host_id: host.id(),
                device,
            });
        }

        Device::list()?
            .into_iter()
            .find(|device| device.name.trim() == name)
            .ok_or_else(|| AudioError::UnknownDevice(name.to_string()))
    }

    /// Gets the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts streaming the mixer to this device. The mixer renders on its own thread,
    /// ahead of the output callback by at most the configured number of blocks.
    pub fn start(
        &self,
        mixer: AudioMixer,
        audio: &config::Audio,
    ) -> Result<OutputStream, AudioError> {
        let span = span!(Level::INFO, "output stream (cpal)");
        let _enter = span.enter();

        if self.max_channels < NUM_CHANNELS as u16 {
            return Err(AudioError::Device(format!(
                "{} channels requested, audio device {} only has {}",
                NUM_CHANNELS, self.name, self.max_channels
            )));
        }

        let sample_format = self
            .device
            .default_output_config()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .sample_format();
        let stream_config = cpal::StreamConfig {
            channels: NUM_CHANNELS as u16,
            sample_rate: cpal::SampleRate(mixer.sample_rate()),
            buffer_size: cpal::BufferSize::Default,
        };

        let cancel_handle = CancelHandle::new();
        let (block_tx, block_rx) = crossbeam_channel::bounded(audio.buffered_blocks());
        let (recycle_tx, recycle_rx) = crossbeam_channel::bounded(audio.buffered_blocks() + 2);
        let block_samples = audio.block_frames() * NUM_CHANNELS;

        let producer_thread = {
            let cancel_handle = cancel_handle.clone();
            thread::spawn(move || {
                produce(mixer, block_samples, block_tx, recycle_rx, cancel_handle)
            })
        };

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let output_thread = {
            let cancel_handle = cancel_handle.clone();
            let device = self.device.clone();
            let stream_config = stream_config.clone();
            thread::spawn(move || {
                let reader = BlockReader::new(block_rx, recycle_tx);
                let stream = match sample_format {
                    cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, reader),
                    cpal::SampleFormat::F64 => build_stream::<f64>(&device, &stream_config, reader),
                    cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, reader),
                    cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, reader),
                    cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, reader),
                    other => {
                        let _ = ready_tx.send(Err(format!("unsupported sample format {}", other)));
                        return;
                    }
                };
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // The stream lives as long as this thread.
                cancel_handle.wait(Arc::new(AtomicBool::new(false)));
                drop(stream);
            })
        };

        let mut output = OutputStream {
            cancel_handle,
            threads: vec![producer_thread, output_thread],
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    device = %self.name,
                    sample_rate = stream_config.sample_rate.0,
                    format = %sample_format,
                    "Output stream started"
                );
                Ok(output)
            }
            Ok(Err(e)) => {
                output.stop();
                Err(AudioError::Stream(e))
            }
            Err(_) => {
                output.stop();
                Err(AudioError::Stream("output thread exited".to_string()))
            }
        }
    }
}

/// Renders blocks until cancelled, blocking while the queue is full.
fn produce(
    mut mixer: AudioMixer,
    block_samples: usize,
    blocks: Sender<Vec<f32>>,
    recycled: Receiver<Vec<f32>>,
    cancel_handle: CancelHandle,
) {
    while !cancel_handle.is_cancelled() {
        let mut block = recycled
            .try_recv()
            .unwrap_or_else(|_| Vec::with_capacity(block_samples));
        block.clear();
        block.resize(block_samples, 0.0);
        mixer.process_into_output(&mut block);

        let mut pending = block;
        loop {
            match blocks.send_timeout(pending, PRODUCER_POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(block)) => {
                    if cancel_handle.is_cancelled() {
                        return;
                    }
                    pending = block;
                }
                Err(SendTimeoutError::Disconnected(_)) => return,
            }
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut reader: BlockReader,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            reader.read(&mut scratch);
            for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                *dst = T::from_sample(src);
            }
        },
        |err| error!("CPAL output stream error: {}", err),
        None,
    )
}

/// Pulls rendered blocks from the producer for the output callback.
struct BlockReader {
    blocks: Receiver<Vec<f32>>,
    recycle: Sender<Vec<f32>>,
    current: Vec<f32>,
    position: usize,
}

impl BlockReader {
    fn new(blocks: Receiver<Vec<f32>>, recycle: Sender<Vec<f32>>) -> Self {
        Self {
            blocks,
            recycle,
            current: Vec::new(),
            position: 0,
        }
    }

    /// Fills `output`, zero-filling any shortfall when the producer falls behind.
    fn read(&mut self, output: &mut [f32]) {
        let mut written = 0;
        while written < output.len() {
            if self.position >= self.current.len() {
                let finished = std::mem::take(&mut self.current);
                if finished.capacity() > 0 {
                    let _ = self.recycle.try_send(finished);
                }
                match self.blocks.try_recv() {
                    Ok(block) => {
                        self.current = block;
                        self.position = 0;
                        continue;
                    }
                    Err(_) => {
                        output[written..].fill(0.0);
                        return;
                    }
                }
            }

            let count = (self.current.len() - self.position).min(output.len() - written);
            output[written..written + count]
                .copy_from_slice(&self.current[self.position..self.position + count]);
            written += count;
            self.position += count;
        }
    }
}

/// A running output stream. Dropping it stops playback.
pub struct OutputStream {
    cancel_handle: CancelHandle,
    threads: Vec<thread::JoinHandle<()>>,
}

impl OutputStream {
    /// Stops the stream and waits for its threads to exit.
    pub fn stop(&mut self) {
        self.cancel_handle.cancel();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("Audio thread panicked");
            }
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.stop();
    }
}
