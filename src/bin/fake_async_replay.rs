//! Replay a JSON scheduling scenario and print its firing trace.
#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use fake_async::error::Result;
use fake_async::scenario::Scenario;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fake_async_replay")]
#[command(about = "Replay a virtual-time scheduling scenario and print the trace as JSON")]
struct Args {
    /// Path to the scenario JSON file.
    scenario: PathBuf,
    /// Pretty-print the report.
    #[arg(long)]
    pretty: bool,
    /// Tracing filter directive (overrides `RUST_LOG`).
    #[arg(long, env = "FAKE_ASYNC_LOG")]
    log: Option<String>,
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    }
}

fn init_tracing(directive: Option<&str>) {
    let filter = directive.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        EnvFilter::new,
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<bool> {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let scenario = Scenario::from_path(&args.scenario)?;
    let report = scenario.replay();
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{rendered}");
    Ok(report.is_ok())
}
