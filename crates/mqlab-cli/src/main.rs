mod cli;
mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use commands::App;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // SIGINT becomes a cancellation, which the sequencer treats as a
    // failure with reason "cancelled" and still drives teardown.
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling and reclaiming");
            signal_token.cancel();
        }
    });

    let app = App {
        root: cli.root,
        region: cli.region,
        cancel,
    };

    let result = match cli.command {
        Command::Full { config, test_plan, experiment_id, tags } => {
            commands::full(&app, &config, &test_plan, experiment_id, tags).await
        }
        Command::Setup { config, experiment_id, tags } => {
            commands::setup(&app, &config, experiment_id, tags).await
        }
        Command::Run { test_plan, experiment_id } => {
            commands::run(&app, &test_plan, &experiment_id).await
        }
        Command::Report { experiment_id } => commands::report(&app, &experiment_id).await,
        Command::Teardown { experiment_id, dry_run } => {
            commands::teardown(&app, &experiment_id, dry_run).await
        }
        Command::List => commands::list(&app),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
