use clap::Parser as _;
use gencomm_monitor::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_VARIABLE: &str = "GENCOMM_MONITOR_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Monitor(commands::monitor::Args),
    Read(commands::read::Args),
    Registers(commands::registers::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_VARIABLE).unwrap_or_else(|_| "info".into());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => return end(Err(e)),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Monitor(args) => end(commands::monitor::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Registers(args) => end(commands::registers::run(args)),
    }
}
