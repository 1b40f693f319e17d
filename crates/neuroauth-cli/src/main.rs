//! `neuroauth` CLI entry point.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use neuroauth_cli::{commands, Cli, Commands};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Preprocess {
            input,
            user,
            output_dir,
            fast,
        } => commands::preprocess(&input, &user, &output_dir, fast)?,
        Commands::Train {
            data_dir,
            config,
            bundle_dir,
            fast,
        } => commands::train(&data_dir, config.as_deref(), &bundle_dir, fast)?,
        Commands::Enroll {
            bundle_dir,
            store_dir,
            user,
            trials,
        } => commands::enroll(&bundle_dir, &store_dir, &user, &trials)?,
        Commands::Verify {
            bundle_dir,
            store_dir,
            user,
            probe,
            deadline_ms,
        } => commands::verify(&bundle_dir, &store_dir, &user, &probe, deadline_ms)?,
        Commands::Explain {
            store_dir,
            artifact_id,
        } => commands::explain(&store_dir, &artifact_id)?,
        Commands::Eval {
            data_dir,
            bundle_dir,
        } => commands::eval(&data_dir, &bundle_dir)?,
        Commands::Version => commands::version(),
    }
    Ok(())
}
