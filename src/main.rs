use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use logship::cli::{Command, Opts};
use logship::{agent, archiver, cleaner, dumper};

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    let debug = match &opts.command {
        Command::Agent(agent) => agent.runtime.debug,
        Command::Dumper(dumper) => dumper.runtime.debug,
        Command::Archiver(archiver) => archiver.runtime.debug,
        Command::Cleaner(cleaner) => cleaner.runtime.debug,
    };
    init_tracing(debug);

    let result = match opts.command {
        Command::Agent(opts) => agent::run(opts).await.map_err(|e| e.to_string()),
        Command::Dumper(opts) => dumper::run(opts).await.map_err(|e| e.to_string()),
        Command::Archiver(opts) => archiver::run(opts).await.map_err(|e| e.to_string()),
        Command::Cleaner(opts) => cleaner::run(opts).await.map_err(|e| e.to_string()),
    };

    if let Err(error) = result {
        error!(message = "Startup failed.", %error);
        std::process::exit(exitcode::CONFIG);
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "logship=debug,tail_source=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
