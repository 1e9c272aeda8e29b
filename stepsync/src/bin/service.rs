//! Reference service daemon.
//!
//! Answers the step handshake on one address until killed.
//!
//! # Usage
//!
//! ```sh
//! stepsync-service 'tcp://*:9999' 0.2
//! ```

use clap::Parser;

use stepsync::service::{DEFAULT_SERVICE_TIME, service_main};

#[derive(Parser)]
#[command(name = "stepsync-service")]
#[command(about = "Reference service for the step synchronization handshake")]
#[command(version)]
struct Cli {
    /// Address to bind, e.g. tcp://*:9999
    bind: String,

    /// Simulated task duration in seconds
    #[arg(default_value_t = DEFAULT_SERVICE_TIME.as_secs_f64())]
    service_time: f64,
}

fn main() {
    stepsync::init_tracing();
    let cli = Cli::parse();
    eprintln!(
        "stepsync-service: serving on {} (service time {}s)",
        cli.bind, cli.service_time
    );
    if let Err(e) = service_main(&cli.bind, cli.service_time) {
        eprintln!("stepsync-service: {e}");
        std::process::exit(1);
    }
}
