//! Subcommand implementations.

use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use tracing::info;

use neuroauth_core::{ChannelManifest, ProcessedTrial, ScoreAggregation, UserId};
use neuroauth_signal::loader::{Recording, TrialFile};
use neuroauth_signal::preprocess::{PreprocessConfig, Preprocessor};
use neuroauth_signal::windowing::WindowConfig;
use neuroauth_train::{artifacts, DatasetSplits, Trainer, TrainingConfig};
use neuroauth_verify::{ArtifactStore, EngineConfig, ModelBundle, VerificationEngine};

/// `preprocess`: raw recording → standardized trial files.
pub fn preprocess(input: &Path, user: &str, output_dir: &Path, fast: bool) -> anyhow::Result<()> {
    let manifest = ChannelManifest::builtin();
    let recording = Recording::read_file(input)?;
    let trials = recording.select_trials(&manifest)?;
    let config = if fast {
        PreprocessConfig::fast()
    } else {
        PreprocessConfig::default()
    };
    let preprocessor = Preprocessor::with_manifest(config, &manifest)?;

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    for (index, trial) in trials.iter().enumerate() {
        let processed = preprocessor.run(trial)?;
        let path = output_dir.join(format!("{user}_trial{index:02}.json"));
        write_processed(&processed, &manifest, &path)?;
    }
    info!(user, trials = trials.len(), "preprocessing complete");
    Ok(())
}

/// `train`: processed trials → trained encoder + serving artifacts.
pub fn train(
    data_dir: &Path,
    config_path: Option<&Path>,
    bundle_dir: &Path,
    fast: bool,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<TrainingConfig>(&json)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => TrainingConfig::default(),
    };
    config.fast = config.fast || fast;
    config.validate()?;

    let corpus = load_processed_dir(data_dir)?;
    let window_config = WindowConfig {
        window_seconds: config.window_seconds,
        step_seconds: config.step_seconds,
    };
    let splits = DatasetSplits::build(&corpus, &window_config)?;

    let mut trainer = Trainer::new(config.clone())?;
    let outcome = trainer.train(&splits)?;
    info!(
        epochs = outcome.history.len(),
        best_val_loss = outcome.best_val_loss,
        "training complete"
    );

    let fitted = artifacts::fit_serving_artifacts(trainer.encoder(), &splits, &config)?;
    println!(
        "held-out EER {:.2}% at threshold {:.4}",
        fitted.report.eer * 100.0,
        fitted.report.eer_threshold
    );

    let bundle = ModelBundle {
        encoder: trainer.encoder().clone(),
        prototypes: fitted.prototypes,
        calibrator: fitted.calibrator,
        anomaly: fitted.anomaly,
        threshold: fitted.threshold,
    };
    bundle.save(bundle_dir)?;
    println!("bundle written to {}", bundle_dir.display());
    Ok(())
}

/// `enroll`: build and persist a user's prototype set.
pub fn enroll(
    bundle_dir: &Path,
    store_dir: &Path,
    user: &str,
    trial_paths: &[PathBuf],
) -> anyhow::Result<()> {
    let engine = open_engine(bundle_dir, store_dir)?;
    let manifest = ChannelManifest::builtin();
    let mut trials = Vec::with_capacity(trial_paths.len());
    for path in trial_paths {
        trials.push(read_processed(path, &manifest)?);
    }
    let prototypes = engine.enroll(&UserId::new(user), &trials)?;
    println!(
        "enrolled '{user}' with {} prototypes from {} trials",
        prototypes.k(),
        trials.len()
    );
    Ok(())
}

/// `verify`: one probe against a claimed identity.
pub fn verify(
    bundle_dir: &Path,
    store_dir: &Path,
    user: &str,
    probe_path: &Path,
    deadline_ms: Option<u64>,
) -> anyhow::Result<()> {
    let engine = open_engine(bundle_dir, store_dir)?;
    let manifest = ChannelManifest::builtin();
    let probe = read_processed(probe_path, &manifest)?;
    let result = engine.verify(&UserId::new(user), &probe, deadline_ms);
    // The external response: decision plus scores, never the failure kind.
    let external = serde_json::json!({
        "decision": result.decision,
        "raw_score": result.raw_score,
        "calibrated_probability": result.calibrated_probability,
        "spoof_score": result.spoof_score,
        "is_spoof": result.is_spoof,
        "artifact_id": result.artifact_id,
    });
    println!("{}", serde_json::to_string_pretty(&external)?);
    Ok(())
}

/// `explain`: dump a stored attribution artifact.
pub fn explain(store_dir: &Path, artifact_id: &str) -> anyhow::Result<()> {
    let store = ArtifactStore::open_default(store_dir)?;
    let bytes = store.fetch_bytes(artifact_id)?;
    println!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}

/// `eval`: score a processed dataset against a bundle.
pub fn eval(data_dir: &Path, bundle_dir: &Path) -> anyhow::Result<()> {
    let bundle = ModelBundle::load(bundle_dir)?;
    let corpus = load_processed_dir(data_dir)?;
    let window_config = WindowConfig::default();
    let splits = DatasetSplits::build(&corpus, &window_config)?;
    let (genuine, impostor) = artifacts::score_against_prototypes(
        &bundle.encoder,
        &splits.test,
        &splits.users,
        &bundle.prototypes,
        ScoreAggregation::Max,
    )?;
    if genuine.is_empty() || impostor.is_empty() {
        bail!("dataset produced no test scores; need at least two enrolled users");
    }
    let report = neuroauth_train::eval::evaluate(&genuine, &impostor)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn open_engine(bundle_dir: &Path, store_dir: &Path) -> anyhow::Result<VerificationEngine> {
    let store = ArtifactStore::open_default(store_dir)?;
    Ok(VerificationEngine::from_dir(
        bundle_dir,
        store,
        EngineConfig::default(),
    )?)
}

/// Processed trials are stored in the same JSON trial format as probes,
/// at the output sample rate.
fn write_processed(
    processed: &ProcessedTrial,
    manifest: &ChannelManifest,
    path: &Path,
) -> anyhow::Result<()> {
    let file = TrialFile {
        sample_rate_hz: processed.sample_rate_hz(),
        channels: manifest.names().to_vec(),
        samples: processed
            .data()
            .rows()
            .into_iter()
            .map(|row| row.to_vec())
            .collect(),
    };
    file.write_file(path)?;
    Ok(())
}

fn read_processed(path: &Path, manifest: &ChannelManifest) -> anyhow::Result<ProcessedTrial> {
    let trial = TrialFile::read_file(path, manifest)?;
    let sample_rate = trial.sample_rate_hz();
    Ok(ProcessedTrial::new(trial.into_data(), sample_rate)?)
}

/// Scan a directory of `<user>_trialNN.json` files and group by user.
fn load_processed_dir(dir: &Path) -> anyhow::Result<Vec<(UserId, Vec<ProcessedTrial>)>> {
    let manifest = ChannelManifest::builtin();
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") {
            names.push(name);
        }
    }
    names.sort();
    if names.is_empty() {
        bail!("no processed trial files in {}", dir.display());
    }

    let mut corpus: Vec<(UserId, Vec<ProcessedTrial>)> = Vec::new();
    for name in names {
        let Some(user) = name.rsplit_once("_trial").map(|(user, _)| user.to_owned()) else {
            continue;
        };
        let trial = read_processed(&dir.join(&name), &manifest)?;
        match corpus.iter_mut().find(|(u, _)| u.as_str() == user) {
            Some((_, trials)) => trials.push(trial),
            None => corpus.push((UserId::new(user), vec![trial])),
        }
    }
    Ok(corpus)
}

/// `version`: workspace component versions.
pub fn version() {
    println!("neuroauth {}", env!("CARGO_PKG_VERSION"));
    println!("  core   {}", neuroauth_core::VERSION);
    println!("  signal {}", neuroauth_signal::VERSION);
    println!("  train  {}", neuroauth_train::VERSION);
    println!("  verify {}", neuroauth_verify::VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use neuroauth_core::utils::Xorshift64;
    use tempfile::tempdir;

    fn processed_trial(seed: u64) -> ProcessedTrial {
        let mut rng = Xorshift64::new(seed);
        let mut data = Array2::from_shape_fn((48, 512), |_| rng.next_gaussian());
        for mut row in data.rows_mut() {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let std = (row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n)
                .sqrt()
                .max(1e-8);
            row.mapv_inplace(|v| (v - mean) / std);
        }
        ProcessedTrial::new(data, 128.0).unwrap()
    }

    #[test]
    fn processed_dir_round_trip_groups_by_user() {
        let dir = tempdir().unwrap();
        let manifest = ChannelManifest::builtin();
        for user in ["alice", "bob"] {
            for index in 0..3 {
                let path = dir.path().join(format!("{user}_trial{index:02}.json"));
                write_processed(&processed_trial(index as u64), &manifest, &path).unwrap();
            }
        }
        let corpus = load_processed_dir(dir.path()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus[0].0.as_str(), "alice");
        assert_eq!(corpus[0].1.len(), 3);
        assert_eq!(corpus[1].0.as_str(), "bob");
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load_processed_dir(dir.path()).is_err());
    }
}
