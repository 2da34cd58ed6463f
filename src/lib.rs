// geoinv/src/lib.rs

use std::sync::Once;

static INIT: Once = Once::new();

pub fn setup_pretty_env_logger_default() {
    INIT.call_once(|| {
        pretty_env_logger::init();
    });
}

pub mod components;
pub mod directives;
pub mod driver;
pub mod misfit;
pub mod optimization;
pub mod params;
pub mod regularization;
pub mod simulation;
pub mod tiling;
pub mod workspace;

pub use driver::{start, DriverError, DriverRegistry, InversionDriver};
pub use params::{InversionParams, InversionType};
