use std::time::Duration;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use watchpost_server::console::Console;
use watchpost_server::{Cli, Surveillance};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    log::info!("watchpost {} starting", watchpost_server::VERSION);
    let (surveillance, services) = Surveillance::new(&args).into_diagnostic()?;
    let console = args.console;

    Toplevel::new(move |s| async move {
        services.start(&s);
        if console {
            let console = Console::new(surveillance);
            s.start(SubsystemBuilder::new("Console", |c| console.run(c)));
        }
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}
