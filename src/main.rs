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
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use glassfall::audio::{
    self, cpal::Device, cpal::OutputStream, mixer::AudioMixer, mock::MockGraph,
    offline::OfflineRenderer, AudioGraph,
};
use glassfall::config;
use glassfall::samples::SampleLibrary;
use glassfall::soundscape::{Instruments, Params, Soundscape};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A generative ambient soundscape."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plays the soundscape through the configured audio device until interrupted.
    Play {
        /// The path to the soundscape config.
        config_path: String,
    },
    /// Renders the soundscape to a WAV file.
    Render {
        /// The path to the soundscape config.
        config_path: String,
        /// How many seconds to render.
        seconds: f64,
        /// The WAV file to write.
        output_path: String,
    },
    /// Lists the available audio output devices.
    Devices {},
}

/// Reads the config and loads every instrument it needs.
async fn load(
    config_path: &str,
) -> Result<(config::Soundscape, Params, Instruments), Box<dyn Error>> {
    let config = config::Soundscape::deserialize(&PathBuf::from(config_path))?;
    let params = config.params()?;
    let library = SampleLibrary::from_config(&config);
    let instruments = Soundscape::load(&params, &library).await?;
    Ok((config, params, instruments))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play { config_path } => {
            let (config, params, instruments) = load(&config_path).await?;
            let audio = config.audio();

            // The output stream has to outlive the soundscape's teardown.
            let (graph, output): (Box<dyn AudioGraph>, Option<OutputStream>) =
                if audio.device().starts_with("mock") {
                    let graph: Box<dyn AudioGraph> =
                        Box::new(MockGraph::realtime(audio.device(), audio.sample_rate()));
                    (graph, None)
                } else {
                    let device = Device::get(audio.device())?;
                    let (mixer, graph) = AudioMixer::new(audio.sample_rate());
                    let output = device.start(mixer, audio)?;
                    let graph: Box<dyn AudioGraph> = Box::new(graph);
                    (graph, Some(output))
                };

            let handle =
                Soundscape::assemble(&params, instruments, graph, StdRng::from_entropy()).run();
            info!(device = audio.device(), "Playing, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Stopping");
            handle.teardown().await?;
            drop(output);
        }
        Commands::Render {
            config_path,
            seconds,
            output_path,
        } => {
            if !(seconds.is_finite() && seconds > 0.0) {
                return Err(format!("invalid render length {}", seconds).into());
            }
            let (config, params, instruments) = load(&config_path).await?;
            let audio = config.audio();

            let (mut renderer, graph) =
                OfflineRenderer::new(audio.sample_rate(), audio.block_frames());
            let mut soundscape =
                Soundscape::assemble(&params, instruments, Box::new(graph), StdRng::from_entropy());
            soundscape.render_offline(&mut renderer, Duration::from_secs_f64(seconds));
            renderer.write_wav(Path::new(&output_path))?;
        }
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
    };

    Ok(())
}
