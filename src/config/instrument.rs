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
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// A YAML representation of an instrument's sample files.
#[derive(Deserialize, Clone, Debug)]
pub struct Instrument {
    /// Directory containing the sample files. Relative paths are resolved against the
    /// config file's directory. Defaults to a directory named after the instrument.
    path: Option<String>,

    /// The sample files, either keyed by note name or as an ordered list.
    samples: SampleManifest,
}

/// The files making up an instrument.
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum SampleManifest {
    /// Pitched samples keyed by note name, e.g. `C4: glass-c4.wav`.
    Notes(BTreeMap<String, String>),
    /// Unpitched samples addressed by position.
    List(Vec<String>),
}

impl Instrument {
    /// Creates a new instrument configuration.
    pub fn new(path: Option<String>, samples: SampleManifest) -> Instrument {
        Instrument { path, samples }
    }

    /// Resolves the sample directory for this instrument.
    pub fn directory(&self, name: &str, base_path: &Path) -> PathBuf {
        let dir = self.path.as_deref().unwrap_or(name);
        if Path::new(dir).is_absolute() {
            PathBuf::from(dir)
        } else {
            base_path.join(dir)
        }
    }

    /// Gets the sample manifest.
    pub fn samples(&self) -> &SampleManifest {
        &self.samples
    }
}

impl SampleManifest {
    /// Returns each file with its note name, if it has one. Lists keep their order;
    /// note-keyed files come back in key order.
    pub fn entries(&self) -> Vec<(Option<&str>, &str)> {
        match self {
            SampleManifest::Notes(notes) => notes
                .iter()
                .map(|(note, file)| (Some(note.as_str()), file.as_str()))
                .collect(),
            SampleManifest::List(files) => files.iter().map(|f| (None, f.as_str())).collect(),
        }
    }

    /// Returns the number of files in the manifest.
    pub fn len(&self) -> usize {
        match self {
            SampleManifest::Notes(notes) => notes.len(),
            SampleManifest::List(files) => files.len(),
        }
    }

    /// Returns true if the manifest lists no files.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
