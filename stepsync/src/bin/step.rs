//! Runs a single synchronized step against a live service.
//!
//! Exits 0 when the service reports completion within the timeout, 1 otherwise.
//!
//! # Usage
//!
//! ```sh
//! stepsync-step --address tcp://127.0.0.1:9999 --timeout 5.0
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use clap::Parser;

use stepsync::plugin::DEFAULT_PLUGIN_NAME;
use stepsync::runtime::timing::{SystemClock, WheelTicker};
use stepsync::{
    AppOptions, Collaborators, ServicePlugin, SharedOptions, StepOptions, StepOutcome, TcpConnector,
};

#[derive(Parser)]
#[command(name = "stepsync-step")]
#[command(about = "Run one step synchronized with an external service")]
#[command(version)]
struct Cli {
    /// Service address, e.g. tcp://127.0.0.1:9999
    #[arg(short, long, default_value = "")]
    address: String,

    /// Seconds to wait for completion after the service acknowledged start
    #[arg(short, long, default_value_t = 5.0)]
    timeout: f64,

    /// Run the step without contacting the service
    #[arg(long)]
    disabled: bool,
}

fn main() {
    stepsync::init_tracing();
    let cli = Cli::parse();

    let clock = Rc::new(SystemClock::new());
    let ticker = Rc::new(WheelTicker::new(Rc::clone(&clock)));
    let options = Rc::new(SharedOptions::new(
        AppOptions {
            service_address: cli.address,
        },
        StepOptions {
            service_enabled: !cli.disabled,
            timeout_sec: cli.timeout,
        },
    ));
    let outcome: Rc<RefCell<Option<StepOutcome>>> = Rc::default();
    let driver = {
        let outcome = Rc::clone(&outcome);
        move |result: StepOutcome| *outcome.borrow_mut() = Some(result)
    };

    let plugin = ServicePlugin::new(
        DEFAULT_PLUGIN_NAME,
        TcpConnector,
        Collaborators {
            ticker: ticker.clone(),
            clock,
            driver: Rc::new(driver),
            options,
        },
    );
    if let Err(e) = plugin.on_plugin_enable() {
        eprintln!("stepsync-step: {e}");
    }

    let started = Instant::now();
    plugin.run_step();
    ticker.run_until(|| outcome.borrow().is_some());
    let elapsed = started.elapsed();
    plugin.on_plugin_disable();

    let result = outcome.borrow_mut().take();
    match result {
        Some(StepOutcome::Success) => {
            eprintln!("stepsync-step: success after {elapsed:.3?}");
        }
        Some(StepOutcome::Failure(e)) => {
            eprintln!("stepsync-step: failure after {elapsed:.3?}: {e}");
            std::process::exit(1);
        }
        None => std::process::exit(1),
    }
}
