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
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, File};
use duration_string::DurationString;
use serde::Deserialize;

use super::audio::Audio;
use super::error::ConfigError;
use super::instrument::Instrument;
use crate::samples::Note;
use crate::soundscape::clave::ClaveParams;
use crate::soundscape::glass::GlassParams;
use crate::soundscape::{Pacing, Params};

const DEFAULT_GLASS_INSTRUMENT: &str = "vcsl-wine-glasses-slow";
const DEFAULT_GLASS_NOTES: [&str; 6] = ["C4", "E4", "F4", "G4", "B5", "A5"];
const DEFAULT_GLASS_TRANSPOSITIONS: [f64; 2] = [-36.0, -24.0];
const DEFAULT_LOOP_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_TRIGGER_OFFSET: Duration = Duration::from_secs(1);
const DEFAULT_FADE: Duration = Duration::from_secs(3);
const DEFAULT_LFO_MIN_DB: f32 = -500.0;
const DEFAULT_LFO_MAX_DB: f32 = 30.0;
const DEFAULT_LFO_MAX_FREQUENCY: f64 = 0.01;
const DEFAULT_FILTER_FREQUENCY: f32 = 1000.0;

const DEFAULT_CLAVE_INSTRUMENT: &str = "vcsl-claves";
const DEFAULT_CLAVE_GAIN_DB: f32 = -35.0;
const DEFAULT_DECAY_MIN: f64 = 0.75;
const DEFAULT_DECAY_MAX: f64 = 0.85;
const DEFAULT_RATE_MIN: f64 = 0.5;
const DEFAULT_RATE_MAX: f64 = 1.5;
const DEFAULT_TRAIN_INTERVAL_MIN: Duration = Duration::from_secs(10);
const DEFAULT_TRAIN_INTERVAL_MAX: Duration = Duration::from_secs(20);
const DEFAULT_TRAIN_LIFETIME: Duration = Duration::from_secs(60);
const DEFAULT_REVERB_ROOM_SIZE: f32 = 0.6;
const DEFAULT_DELAY_TIME: Duration = Duration::from_secs(3);
const DEFAULT_DELAY_FEEDBACK: f32 = 0.3;
const DEFAULT_DELAY_WET: f32 = 0.2;

const DEFAULT_TICK: Duration = Duration::from_millis(10);
const DEFAULT_LOOKAHEAD: Duration = Duration::from_millis(100);

/// Decays at or above this value never satisfy the bounce cutoff.
const DECAY_LIMIT: f64 = 0.85;

/// The top level soundscape configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct Soundscape {
    /// Output settings.
    #[serde(default)]
    audio: Audio,

    /// Instruments by name.
    instruments: HashMap<String, Instrument>,

    /// The wine glass loops.
    #[serde(default)]
    glass: Glass,

    /// The bouncing claves.
    #[serde(default)]
    clave: Clave,

    /// How the transport is driven.
    #[serde(default)]
    transport: Transport,

    /// The directory relative instrument paths are resolved against.
    #[serde(skip)]
    base_path: PathBuf,
}

/// A YAML representation of the glass loop settings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Glass {
    instrument: Option<String>,
    notes: Option<Vec<String>>,
    transpositions: Option<Vec<f64>>,
    loop_period: Option<String>,
    trigger_offset: Option<String>,
    fade: Option<String>,
    lfo_min_db: Option<f32>,
    lfo_max_db: Option<f32>,
    lfo_max_frequency: Option<f64>,
    filter_frequency: Option<f32>,
}

/// A YAML representation of the bouncing clave settings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Clave {
    instrument: Option<String>,
    gain_db: Option<f32>,
    decay_min: Option<f64>,
    decay_max: Option<f64>,
    rate_min: Option<f64>,
    rate_max: Option<f64>,
    train_interval_min: Option<String>,
    train_interval_max: Option<String>,
    lifetime: Option<String>,
    reverb_room_size: Option<f32>,
    delay_time: Option<String>,
    delay_feedback: Option<f32>,
    delay_wet: Option<f32>,
}

/// A YAML representation of the transport driver settings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Transport {
    /// How often the driver wakes up.
    tick: Option<String>,
    /// How far ahead of the audio clock events are scheduled.
    lookahead: Option<String>,
}

impl Soundscape {
    /// Parse a soundscape from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Soundscape, ConfigError> {
        let mut soundscape = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Soundscape>()?;
        soundscape.base_path = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(soundscape)
    }

    /// Creates a soundscape configuration with default generator settings.
    pub fn new(audio: Audio, instruments: HashMap<String, Instrument>, base_path: PathBuf) -> Self {
        Soundscape {
            audio,
            instruments,
            glass: Glass::default(),
            clave: Clave::default(),
            transport: Transport::default(),
            base_path,
        }
    }

    /// Gets the audio configuration.
    pub fn audio(&self) -> &Audio {
        &self.audio
    }

    /// Gets the instrument configurations.
    pub fn instruments(&self) -> &HashMap<String, Instrument> {
        &self.instruments
    }

    /// Gets the directory instrument paths are relative to.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolves and validates all generator parameters.
    pub fn params(&self) -> Result<Params, ConfigError> {
        let params = Params {
            glass: self.glass.params()?,
            clave: self.clave.params()?,
            pacing: self.transport.pacing()?,
        };

        for instrument in [&params.glass.instrument, &params.clave.instrument] {
            if !self.instruments.contains_key(instrument) {
                return Err(ConfigError::Invalid(format!(
                    "instrument '{}' is not defined",
                    instrument
                )));
            }
        }

        Ok(params)
    }
}

impl Glass {
    fn params(&self) -> Result<GlassParams, ConfigError> {
        let names = self.notes.clone().unwrap_or_else(|| {
            DEFAULT_GLASS_NOTES
                .iter()
                .map(|note| note.to_string())
                .collect()
        });
        let notes = names
            .iter()
            .map(|note| note.parse::<Note>())
            .collect::<Result<Vec<Note>, _>>()
            .map_err(|source| ConfigError::Note {
                field: "glass.notes",
                source,
            })?;
        if notes.is_empty() {
            return Err(ConfigError::Invalid("glass.notes must not be empty".into()));
        }

        let transpositions = self
            .transpositions
            .clone()
            .unwrap_or_else(|| DEFAULT_GLASS_TRANSPOSITIONS.to_vec());
        if transpositions.is_empty() {
            return Err(ConfigError::Invalid(
                "glass.transpositions must not be empty".into(),
            ));
        }

        let loop_period =
            parse_duration("glass.loop_period", &self.loop_period, DEFAULT_LOOP_PERIOD)?;
        if loop_period.is_zero() {
            return Err(ConfigError::Invalid(
                "glass.loop_period must be greater than zero".into(),
            ));
        }

        let lfo_min_db = self.lfo_min_db.unwrap_or(DEFAULT_LFO_MIN_DB);
        let lfo_max_db = self.lfo_max_db.unwrap_or(DEFAULT_LFO_MAX_DB);
        if lfo_min_db > lfo_max_db {
            return Err(ConfigError::Invalid(format!(
                "glass.lfo_min_db ({}) is above glass.lfo_max_db ({})",
                lfo_min_db, lfo_max_db
            )));
        }

        let lfo_max_frequency = self.lfo_max_frequency.unwrap_or(DEFAULT_LFO_MAX_FREQUENCY);
        if lfo_max_frequency < 0.0 {
            return Err(ConfigError::Invalid(
                "glass.lfo_max_frequency must not be negative".into(),
            ));
        }

        let filter_frequency = self.filter_frequency.unwrap_or(DEFAULT_FILTER_FREQUENCY);
        if filter_frequency <= 0.0 {
            return Err(ConfigError::Invalid(
                "glass.filter_frequency must be greater than zero".into(),
            ));
        }

        Ok(GlassParams {
            instrument: self
                .instrument
                .clone()
                .unwrap_or_else(|| DEFAULT_GLASS_INSTRUMENT.to_string()),
            notes,
            transpositions,
            loop_period,
            trigger_offset: parse_duration(
                "glass.trigger_offset",
                &self.trigger_offset,
                DEFAULT_TRIGGER_OFFSET,
            )?,
            fade: parse_duration("glass.fade", &self.fade, DEFAULT_FADE)?,
            lfo_min_db,
            lfo_max_db,
            lfo_max_frequency,
            filter_frequency,
        })
    }
}

impl Clave {
    fn params(&self) -> Result<ClaveParams, ConfigError> {
        let decay_min = self.decay_min.unwrap_or(DEFAULT_DECAY_MIN);
        let decay_max = self.decay_max.unwrap_or(DEFAULT_DECAY_MAX);
        // Decays are drawn from [min, max), so max itself may sit on the limit.
        if decay_min <= 0.0
            || decay_min > decay_max
            || decay_max > DECAY_LIMIT
            || decay_min >= DECAY_LIMIT
        {
            return Err(ConfigError::Invalid(format!(
                "clave decay range [{}, {}) must lie within (0, {})",
                decay_min, decay_max, DECAY_LIMIT
            )));
        }

        let rate_min = self.rate_min.unwrap_or(DEFAULT_RATE_MIN);
        let rate_max = self.rate_max.unwrap_or(DEFAULT_RATE_MAX);
        if rate_min <= 0.0 || rate_min > rate_max {
            return Err(ConfigError::Invalid(format!(
                "clave rate range [{}, {}) must be positive and ordered",
                rate_min, rate_max
            )));
        }

        let train_interval_min = parse_duration(
            "clave.train_interval_min",
            &self.train_interval_min,
            DEFAULT_TRAIN_INTERVAL_MIN,
        )?;
        let train_interval_max = parse_duration(
            "clave.train_interval_max",
            &self.train_interval_max,
            DEFAULT_TRAIN_INTERVAL_MAX,
        )?;
        if train_interval_min.is_zero() || train_interval_min > train_interval_max {
            return Err(ConfigError::Invalid(format!(
                "clave train interval [{:?}, {:?}) must be positive and ordered",
                train_interval_min, train_interval_max
            )));
        }

        let lifetime = parse_duration("clave.lifetime", &self.lifetime, DEFAULT_TRAIN_LIFETIME)?;
        if lifetime.is_zero() {
            return Err(ConfigError::Invalid(
                "clave.lifetime must be greater than zero".into(),
            ));
        }

        let delay_feedback = self.delay_feedback.unwrap_or(DEFAULT_DELAY_FEEDBACK);
        if !(0.0..1.0).contains(&delay_feedback) {
            return Err(ConfigError::Invalid(
                "clave.delay_feedback must be within [0, 1)".into(),
            ));
        }

        Ok(ClaveParams {
            instrument: self
                .instrument
                .clone()
                .unwrap_or_else(|| DEFAULT_CLAVE_INSTRUMENT.to_string()),
            gain_db: self.gain_db.unwrap_or(DEFAULT_CLAVE_GAIN_DB),
            decay: (decay_min, decay_max),
            rate: (rate_min, rate_max),
            train_interval: (train_interval_min, train_interval_max),
            lifetime,
            reverb_room_size: self
                .reverb_room_size
                .unwrap_or(DEFAULT_REVERB_ROOM_SIZE)
                .clamp(0.0, 1.0),
            delay_time: parse_duration("clave.delay_time", &self.delay_time, DEFAULT_DELAY_TIME)?,
            delay_feedback,
            delay_wet: self.delay_wet.unwrap_or(DEFAULT_DELAY_WET).clamp(0.0, 1.0),
        })
    }
}

impl Transport {
    fn pacing(&self) -> Result<Pacing, ConfigError> {
        let tick = parse_duration("transport.tick", &self.tick, DEFAULT_TICK)?;
        if tick.is_zero() {
            return Err(ConfigError::Invalid(
                "transport.tick must be greater than zero".into(),
            ));
        }
        Ok(Pacing {
            tick,
            lookahead: parse_duration("transport.lookahead", &self.lookahead, DEFAULT_LOOKAHEAD)?,
        })
    }
}

fn parse_duration(
    field: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    value.as_ref().map_or(Ok(default), |duration| {
        DurationString::from_string(duration.clone())
            .map(Into::into)
            .map_err(|e| ConfigError::Duration {
                field,
                value: duration.clone(),
                reason: e.to_string(),
            })
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soundscape.yaml");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    const INSTRUMENTS: &str = r#"
instruments:
  vcsl-wine-glasses-slow:
    path: glass
    samples:
      C4: glass-c4.wav
      G4: glass-g4.wav
  vcsl-claves:
    samples:
      - clave-1.wav
      - clave-2.wav
"#;

    #[test]
    fn test_defaults() {
        let (dir, path) = write_config(INSTRUMENTS);
        let soundscape = Soundscape::deserialize(&path).unwrap();
        assert_eq!(soundscape.base_path(), dir.path());
        assert_eq!(soundscape.audio().sample_rate(), 44100);
        assert_eq!(soundscape.instruments().len(), 2);

        let params = soundscape.params().unwrap();
        assert_eq!(params.glass.instrument, "vcsl-wine-glasses-slow");
        assert_eq!(
            params
                .glass
                .notes
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>(),
            vec!["C4", "E4", "F4", "G4", "B5", "A5"]
        );
        assert_eq!(params.glass.transpositions, vec![-36.0, -24.0]);
        assert_eq!(params.glass.loop_period, Duration::from_secs(60));
        assert_eq!(params.glass.trigger_offset, Duration::from_secs(1));
        assert_eq!(params.glass.fade, Duration::from_secs(3));
        assert_eq!(params.glass.lfo_min_db, -500.0);
        assert_eq!(params.glass.lfo_max_db, 30.0);

        assert_eq!(params.clave.instrument, "vcsl-claves");
        assert_eq!(params.clave.gain_db, -35.0);
        assert_eq!(params.clave.decay, (0.75, 0.85));
        assert_eq!(params.clave.rate, (0.5, 1.5));
        assert_eq!(
            params.clave.train_interval,
            (Duration::from_secs(10), Duration::from_secs(20))
        );
        assert_eq!(params.clave.lifetime, Duration::from_secs(60));
        assert_eq!(params.clave.delay_time, Duration::from_secs(3));

        assert_eq!(params.pacing.tick, Duration::from_millis(10));
        assert_eq!(params.pacing.lookahead, Duration::from_millis(100));
    }

    #[test]
    fn test_overrides() {
        let (_dir, path) = write_config(&format!(
            r#"{}
audio:
  device: mock
  sample_rate: 48000
glass:
  notes: [D4, Bb3]
  transpositions: [0]
  loop_period: 30s
  fade: 500ms
clave:
  decay_min: 0.8
  decay_max: 0.8
  lifetime: 2m
transport:
  lookahead: 250ms
"#,
            INSTRUMENTS
        ));
        let soundscape = Soundscape::deserialize(&path).unwrap();
        assert_eq!(soundscape.audio().device(), "mock");
        assert_eq!(soundscape.audio().sample_rate(), 48000);

        let params = soundscape.params().unwrap();
        assert_eq!(params.glass.notes[1].to_string(), "A#3");
        assert_eq!(params.glass.transpositions, vec![0.0]);
        assert_eq!(params.glass.loop_period, Duration::from_secs(30));
        assert_eq!(params.glass.fade, Duration::from_millis(500));
        assert_eq!(params.clave.decay, (0.8, 0.8));
        assert_eq!(params.clave.lifetime, Duration::from_secs(120));
        assert_eq!(params.pacing.lookahead, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_unbounded_decay() {
        let (_dir, path) = write_config(&format!(
            "{}\nclave:\n  decay_max: 0.9\n",
            INSTRUMENTS
        ));
        let soundscape = Soundscape::deserialize(&path).unwrap();
        assert!(matches!(soundscape.params(), Err(ConfigError::Invalid(_))));

        let (_dir, path) = write_config(&format!(
            "{}\nclave:\n  decay_min: 0.85\n  decay_max: 0.85\n",
            INSTRUMENTS
        ));
        let soundscape = Soundscape::deserialize(&path).unwrap();
        assert!(matches!(soundscape.params(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        let (_dir, path) = write_config(&format!("{}\nglass:\n  notes: [H4]\n", INSTRUMENTS));
        let soundscape = Soundscape::deserialize(&path).unwrap();
        assert!(matches!(
            soundscape.params(),
            Err(ConfigError::Note {
                field: "glass.notes",
                ..
            })
        ));

        let (_dir, path) = write_config(&format!(
            "{}\nglass:\n  loop_period: forever\n",
            INSTRUMENTS
        ));
        let soundscape = Soundscape::deserialize(&path).unwrap();
        assert!(matches!(
            soundscape.params(),
            Err(ConfigError::Duration {
                field: "glass.loop_period",
                ..
            })
        ));

        let (_dir, path) = write_config(&format!(
            "{}\nglass:\n  instrument: theremin\n",
            INSTRUMENTS
        ));
        let soundscape = Soundscape::deserialize(&path).unwrap();
        assert!(matches!(soundscape.params(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Soundscape::deserialize(Path::new("/definitely/not/here.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
