//! Command definitions for the `neuroauth` CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// EEG biometric verification toolkit.
#[derive(Parser)]
#[command(name = "neuroauth", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Preprocess a raw recording into standardized trial files.
    Preprocess {
        /// Input recording (.eegr).
        #[arg(long)]
        input: PathBuf,
        /// Label of the user the recording belongs to.
        #[arg(long)]
        user: String,
        /// Output directory for processed trial JSON files.
        #[arg(long, default_value = "data/processed")]
        output_dir: PathBuf,
        /// Skip ICA artifact removal.
        #[arg(long)]
        fast: bool,
    },

    /// Train the encoder and fit the serving artifacts.
    Train {
        /// Directory of processed trial files (`<user>_trialNN.json`).
        #[arg(long, default_value = "data/processed")]
        data_dir: PathBuf,
        /// Optional training config JSON (defaults apply otherwise).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output bundle directory.
        #[arg(long, default_value = "models/bundle")]
        bundle_dir: PathBuf,
        /// Fast mode: one epoch per phase.
        #[arg(long)]
        fast: bool,
    },

    /// Enroll a user from processed trial files.
    Enroll {
        /// Bundle directory to serve from and update.
        #[arg(long, default_value = "models/bundle")]
        bundle_dir: PathBuf,
        /// Attribution/audit artifact directory.
        #[arg(long, default_value = "artifacts")]
        store_dir: PathBuf,
        /// User to enroll.
        #[arg(long)]
        user: String,
        /// Processed trial JSON files.
        #[arg(required = true)]
        trials: Vec<PathBuf>,
    },

    /// Verify a claimed identity against a probe trial.
    Verify {
        /// Bundle directory to serve from.
        #[arg(long, default_value = "models/bundle")]
        bundle_dir: PathBuf,
        /// Attribution/audit artifact directory.
        #[arg(long, default_value = "artifacts")]
        store_dir: PathBuf,
        /// Claimed user.
        #[arg(long)]
        user: String,
        /// Processed probe trial JSON file.
        probe: PathBuf,
        /// Hard deadline in milliseconds.
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Fetch a stored attribution artifact by id.
    Explain {
        /// Attribution/audit artifact directory.
        #[arg(long, default_value = "artifacts")]
        store_dir: PathBuf,
        /// Artifact identifier returned by `verify`.
        artifact_id: String,
    },

    /// Evaluate a bundle against a processed dataset (EER, FAR/FRR).
    Eval {
        /// Directory of processed trial files.
        #[arg(long, default_value = "data/processed")]
        data_dir: PathBuf,
        /// Bundle directory.
        #[arg(long, default_value = "models/bundle")]
        bundle_dir: PathBuf,
    },

    /// Print version information.
    Version,
}
