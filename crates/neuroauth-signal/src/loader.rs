//! Recording loader.
//!
//! Reads acquisition files that already contain segmented trials, validates
//! them against the channel manifest, and emits canonical [`Trial`]s.
//!
//! Two on-disk forms are supported:
//!
//! - the multi-trial binary recording format (`.eegr`, described below);
//! - a single-trial JSON form used for probe uploads and test fixtures.
//!
//! # Binary recording format (version 1)
//!
//! ```text
//! magic            4 bytes  "EEGR"
//! format version   u16 LE
//! sample rate      f32 LE   (Hz)
//! channel count    u16 LE
//! trial count      u32 LE
//! channel names    repeated: u8 length + UTF-8 bytes
//! trials           repeated: u32 LE sample count,
//!                  then channel-major f32 LE samples (channels × samples)
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use neuroauth_core::error::{CoreResult, SignalError, StorageError};
use neuroauth_core::{ChannelManifest, Trial};

const MAGIC: [u8; 4] = *b"EEGR";
const FORMAT_VERSION: u16 = 1;

/// A parsed multi-trial recording, before channel selection.
#[derive(Debug, Clone)]
pub struct Recording {
    /// Channel names in on-disk order.
    pub channel_names: Vec<String>,
    /// Acquisition sample rate in Hz.
    pub sample_rate_hz: f32,
    /// Channel-major trial data, in on-disk channel order.
    pub trials: Vec<Array2<f32>>,
}

impl Recording {
    /// Reads a binary recording file.
    pub fn read_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| StorageError::io(path.display().to_string(), e))?;
        let mut reader = BufReader::new(file);
        let recording = Self::read(&mut reader)?;
        info!(
            path = %path.display(),
            trials = recording.trials.len(),
            channels = recording.channel_names.len(),
            "loaded recording"
        );
        Ok(recording)
    }

    /// Reads a binary recording from any reader.
    pub fn read(reader: &mut impl Read) -> CoreResult<Self> {
        let mut magic = [0u8; 4];
        read_exact(reader, &mut magic)?;
        if magic != MAGIC {
            return Err(SignalError::input_format("bad magic, not an EEGR recording").into());
        }
        let version = read_u16(reader)?;
        if version != FORMAT_VERSION {
            return Err(SignalError::input_format(format!(
                "unsupported recording format version {version} (expected {FORMAT_VERSION})"
            ))
            .into());
        }
        let sample_rate_hz = read_f32(reader)?;
        if !(sample_rate_hz.is_finite() && sample_rate_hz > 0.0) {
            return Err(SignalError::input_format("invalid sample rate").into());
        }
        let n_channels = read_u16(reader)? as usize;
        let n_trials = read_u32(reader)? as usize;
        if n_channels == 0 {
            return Err(SignalError::input_format("recording has no channels").into());
        }

        let mut channel_names = Vec::with_capacity(n_channels);
        for _ in 0..n_channels {
            let mut len = [0u8; 1];
            read_exact(reader, &mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            read_exact(reader, &mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_| SignalError::input_format("channel name is not UTF-8"))?;
            channel_names.push(name);
        }

        let mut trials = Vec::with_capacity(n_trials);
        for trial_index in 0..n_trials {
            let n_samples = read_u32(reader)? as usize;
            if n_samples == 0 {
                return Err(SignalError::input_format(format!(
                    "trial {trial_index} has zero samples"
                ))
                .into());
            }
            let mut data = Array2::<f32>::zeros((n_channels, n_samples));
            let mut buffer = vec![0u8; n_samples * 4];
            for channel in 0..n_channels {
                read_exact(reader, &mut buffer)?;
                for (sample, chunk) in buffer.chunks_exact(4).enumerate() {
                    data[[channel, sample]] =
                        f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
            trials.push(data);
        }

        Ok(Self {
            channel_names,
            sample_rate_hz,
            trials,
        })
    }

    /// Writes the recording in the binary format.
    pub fn write_file(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| StorageError::io(path.display().to_string(), e))?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer)
            .map_err(|e| StorageError::io(path.display().to_string(), e))?;
        Ok(())
    }

    fn write(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&self.sample_rate_hz.to_le_bytes())?;
        writer.write_all(&(self.channel_names.len() as u16).to_le_bytes())?;
        writer.write_all(&(self.trials.len() as u32).to_le_bytes())?;
        for name in &self.channel_names {
            writer.write_all(&[name.len() as u8])?;
            writer.write_all(name.as_bytes())?;
        }
        for trial in &self.trials {
            writer.write_all(&(trial.ncols() as u32).to_le_bytes())?;
            for row in trial.rows() {
                for &value in row {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
        }
        writer.flush()
    }

    /// Selects the canonical channel subset of every trial, in manifest
    /// order, and validates finiteness.
    ///
    /// # Errors
    ///
    /// [`SignalError::ChannelCountMismatch`] when fewer channels are present
    /// than the manifest requires, [`SignalError::MissingChannel`] when a
    /// canonical name is absent.
    pub fn select_trials(&self, manifest: &ChannelManifest) -> CoreResult<Vec<Trial>> {
        if self.channel_names.len() < manifest.len() {
            return Err(SignalError::ChannelCountMismatch {
                expected: manifest.len(),
                actual: self.channel_names.len(),
            }
            .into());
        }
        let indices = manifest.select_indices(&self.channel_names)?;
        self.trials
            .iter()
            .map(|data| {
                let mut selected = Array2::<f32>::zeros((indices.len(), data.ncols()));
                for (target, &source) in indices.iter().enumerate() {
                    selected.row_mut(target).assign(&data.row(source));
                }
                Trial::new(selected, self.sample_rate_hz)
            })
            .collect()
    }
}

/// Single-trial JSON representation, used for probe uploads and fixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialFile {
    /// Acquisition sample rate in Hz.
    pub sample_rate_hz: f32,
    /// Channel names, sample-row order.
    pub channels: Vec<String>,
    /// Per-channel sample rows.
    pub samples: Vec<Vec<f32>>,
}

impl TrialFile {
    /// Reads and validates a JSON trial against the manifest.
    pub fn read_file(path: impl AsRef<Path>, manifest: &ChannelManifest) -> CoreResult<Trial> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StorageError::io(path.display().to_string(), e))?;
        let parsed: TrialFile = serde_json::from_str(&text)
            .map_err(|e| SignalError::input_format(format!("bad trial JSON: {e}")))?;
        parsed.into_trial(manifest)
    }

    /// Converts to a canonical [`Trial`].
    pub fn into_trial(self, manifest: &ChannelManifest) -> CoreResult<Trial> {
        if self.channels.len() != self.samples.len() {
            return Err(SignalError::input_format(
                "channel name count does not match sample row count",
            )
            .into());
        }
        if self.channels.len() < manifest.len() {
            return Err(SignalError::ChannelCountMismatch {
                expected: manifest.len(),
                actual: self.channels.len(),
            }
            .into());
        }
        let n_samples = self.samples.first().map_or(0, Vec::len);
        if self.samples.iter().any(|row| row.len() != n_samples) {
            return Err(SignalError::input_format("ragged sample rows").into());
        }
        let indices = manifest.select_indices(&self.channels)?;
        let mut data = Array2::<f32>::zeros((manifest.len(), n_samples));
        for (target, &source) in indices.iter().enumerate() {
            for (column, &value) in self.samples[source].iter().enumerate() {
                data[[target, column]] = value;
            }
        }
        Trial::new(data, self.sample_rate_hz)
    }

    /// Builds a JSON trial file from a canonical trial.
    #[must_use]
    pub fn from_trial(trial: &Trial, manifest: &ChannelManifest) -> Self {
        Self {
            sample_rate_hz: trial.sample_rate_hz(),
            channels: manifest.names().to_vec(),
            samples: trial
                .data()
                .rows()
                .into_iter()
                .map(|row| row.to_vec())
                .collect(),
        }
    }

    /// Writes the JSON form.
    pub fn write_file(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let text = serde_json::to_string(self)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        Ok(())
    }
}

fn read_exact(reader: &mut impl Read, buffer: &mut [u8]) -> CoreResult<()> {
    reader
        .read_exact(buffer)
        .map_err(|e| SignalError::input_format(format!("truncated recording: {e}")).into())
}

fn read_u16(reader: &mut impl Read) -> CoreResult<u16> {
    let mut buffer = [0u8; 2];
    read_exact(reader, &mut buffer)?;
    Ok(u16::from_le_bytes(buffer))
}

fn read_u32(reader: &mut impl Read) -> CoreResult<u32> {
    let mut buffer = [0u8; 4];
    read_exact(reader, &mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

fn read_f32(reader: &mut impl Read) -> CoreResult<f32> {
    let mut buffer = [0u8; 4];
    read_exact(reader, &mut buffer)?;
    Ok(f32::from_le_bytes(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuroauth_core::utils::Xorshift64;

    fn manifest_names() -> Vec<String> {
        ChannelManifest::builtin().names().to_vec()
    }

    fn synthetic_recording(n_trials: usize, n_samples: usize) -> Recording {
        let names = manifest_names();
        let mut rng = Xorshift64::new(11);
        let trials = (0..n_trials)
            .map(|_| {
                Array2::from_shape_fn((names.len(), n_samples), |_| rng.next_gaussian())
            })
            .collect();
        Recording {
            channel_names: names,
            sample_rate_hz: 512.0,
            trials,
        }
    }

    #[test]
    fn binary_round_trip() {
        let recording = synthetic_recording(2, 64);
        let mut buffer = Vec::new();
        recording.write(&mut buffer).unwrap();
        let restored = Recording::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(restored.channel_names, recording.channel_names);
        assert_eq!(restored.trials.len(), 2);
        assert_eq!(restored.trials[0], recording.trials[0]);
        assert!((restored.sample_rate_hz - 512.0).abs() < f32::EPSILON);
    }

    #[test]
    fn bad_magic_is_input_format_error() {
        let bytes = b"NOPE\x01\x00";
        let err = Recording::read(&mut bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn truncated_file_is_input_format_error() {
        let recording = synthetic_recording(1, 64);
        let mut buffer = Vec::new();
        recording.write(&mut buffer).unwrap();
        buffer.truncate(buffer.len() / 2);
        assert!(Recording::read(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn select_trials_follows_manifest_order() {
        let manifest = ChannelManifest::builtin();
        let mut recording = synthetic_recording(1, 32);
        // Shuffle on-disk channel order; selection must undo it.
        recording.channel_names.reverse();
        let original = recording.trials[0].clone();
        let trials = recording.select_trials(&manifest).unwrap();
        assert_eq!(trials.len(), 1);
        // Manifest channel 0 ("Fp1") is the last on-disk row after reversal.
        let last_row = original.nrows() - 1;
        assert_eq!(trials[0].data().row(0), original.row(last_row));
    }

    #[test]
    fn select_trials_rejects_wrong_channel_count() {
        let manifest = ChannelManifest::builtin();
        let names: Vec<String> = manifest_names().into_iter().take(32).collect();
        let recording = Recording {
            trials: vec![Array2::zeros((32, 16))],
            channel_names: names,
            sample_rate_hz: 512.0,
        };
        let err = recording.select_trials(&manifest).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn trial_file_round_trip() {
        let manifest = ChannelManifest::builtin();
        let recording = synthetic_recording(1, 16);
        let trial = &recording.select_trials(&manifest).unwrap()[0];
        let file = TrialFile::from_trial(trial, &manifest);
        let restored = file.into_trial(&manifest).unwrap();
        assert_eq!(restored.data(), trial.data());
    }

    #[test]
    fn trial_file_rejects_ragged_rows() {
        let manifest = ChannelManifest::builtin();
        let mut file = TrialFile {
            sample_rate_hz: 512.0,
            channels: manifest_names(),
            samples: vec![vec![0.0; 16]; 48],
        };
        file.samples[3].pop();
        assert!(file.into_trial(&manifest).is_err());
    }
}
