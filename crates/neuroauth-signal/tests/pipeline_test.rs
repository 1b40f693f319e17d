//! End-to-end signal path: recording file → trials → preprocess → windows.

use ndarray::Array2;
use tempfile::tempdir;

use neuroauth_core::utils::Xorshift64;
use neuroauth_core::ChannelManifest;
use neuroauth_signal::loader::{Recording, TrialFile};
use neuroauth_signal::preprocess::{PreprocessConfig, Preprocessor};
use neuroauth_signal::windowing::WindowConfig;

fn synthetic_recording(n_trials: usize, fs: f32, seconds: f32) -> Recording {
    let manifest = ChannelManifest::builtin();
    let n = (fs * seconds) as usize;
    let mut rng = Xorshift64::new(99);
    let trials = (0..n_trials)
        .map(|trial| {
            Array2::from_shape_fn((manifest.len(), n), |(channel, sample)| {
                let t = sample as f32 / fs;
                let base = 6.0 + trial as f32 + channel as f32 * 0.05;
                (2.0 * std::f32::consts::PI * base * t).sin() + 0.3 * rng.next_gaussian()
            })
        })
        .collect();
    Recording {
        channel_names: manifest.names().to_vec(),
        sample_rate_hz: fs,
        trials,
    }
}

#[test]
fn recording_to_windows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.eegr");
    synthetic_recording(3, 512.0, 6.0).write_file(&path).unwrap();

    let manifest = ChannelManifest::builtin();
    let recording = Recording::read_file(&path).unwrap();
    let trials = recording.select_trials(&manifest).unwrap();
    assert_eq!(trials.len(), 3);

    let preprocessor = Preprocessor::new(PreprocessConfig::fast()).unwrap();
    let window_config = WindowConfig::default();
    for trial in &trials {
        let processed = preprocessor.run(trial).unwrap();
        assert_eq!(processed.n_channels(), 48);
        // 6 s at 128 Hz = 768 samples → (768 - 256) / 128 + 1 windows.
        let windows = window_config.slide(&processed).unwrap();
        assert_eq!(windows.len(), 5);
        for window in &windows {
            assert_eq!(window.n_channels(), 48);
            assert_eq!(window.n_samples(), 256);
        }
    }
}

#[test]
fn json_trial_file_round_trips_through_pipeline() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("probe.json");
    let manifest = ChannelManifest::builtin();

    let recording = synthetic_recording(1, 512.0, 4.0);
    let trial = &recording.select_trials(&manifest).unwrap()[0];
    TrialFile::from_trial(trial, &manifest)
        .write_file(&path)
        .unwrap();

    let restored = TrialFile::read_file(&path, &manifest).unwrap();
    assert_eq!(restored.n_channels(), 48);

    let preprocessor = Preprocessor::new(PreprocessConfig::fast()).unwrap();
    let processed = preprocessor.run(&restored).unwrap();
    let windows = WindowConfig::default().slide(&processed).unwrap();
    assert_eq!(windows.len(), 3);
}

#[test]
fn channel_count_mismatch_is_rejected_at_load() {
    let manifest = ChannelManifest::builtin();
    let mut recording = synthetic_recording(1, 512.0, 4.0);
    recording.channel_names.truncate(32);
    recording.trials[0] = recording.trials[0].slice(ndarray::s![..32, ..]).to_owned();
    assert!(recording.select_trials(&manifest).is_err());
}
