// geoinv/src/main.rs

use clap::Parser;
use geoinv::driver::{Driver, DriverRegistry};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, about = "Run a geophysical inversion from a ui.json parameter file", long_about = None)]
#[command(version = env!("GEOINV_VERSION"))]
struct Cli {
    /// Path to the ui.json parameter file.
    filepath: PathBuf,
}

fn entrypoint() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();
    let registry = DriverRegistry::default();
    let driver = registry.start(&cli.filepath)?;
    if let Some(driver) = driver {
        log::debug!("Driver finished in state {:?}", driver.state());
    }
    Ok(())
}

fn main() -> ExitCode {
    match entrypoint() {
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
        Ok(_) => ExitCode::SUCCESS,
    }
}
