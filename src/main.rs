use clap::Parser;
use tracing_subscriber::EnvFilter;

use spectra_updater::commands::{self, Cli};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,spectra_updater=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = commands::run(cli).await {
        tracing::error!("{error}");
        std::process::exit(1);
    }
}
