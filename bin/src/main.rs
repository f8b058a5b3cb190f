use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod server;
mod services;

use cli::{Cli, Command, LogFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let common = cli.command.common();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&common.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match common.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    let service = cli.command.name();
    info!(service, version = env!("CARGO_PKG_VERSION"), "starting");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            cancel.cancel();
        }
    });

    let result = match cli.command {
        Command::Batcher(args) => services::batcher(args, cancel).await,
        Command::Node(args) => services::node(args, cancel).await,
        Command::Challenger(args) => services::challenger(args, cancel).await,
        Command::Conductor(args) => services::conductor(args, cancel).await,
    };

    match result {
        Ok(()) => {
            info!(service, "stopped");
            ExitCode::SUCCESS
        }
        Err(failure) => {
            match &failure {
                services::Failure::Config(err) => error!(service, "configuration error: {err:?}"),
                services::Failure::Fatal(err) => error!(service, "fatal error: {err:?}"),
            }
            ExitCode::from(failure.exit_code())
        }
    }
}
