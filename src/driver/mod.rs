// geoinv/src/driver/mod.rs

//! Drivers wiring parameters, resolvers, misfit, regularization, optimizer
//! and directives into runnable applications.

mod compute;
mod errors;
mod inversion_driver;
mod joint;
mod line_sweep;
mod logger;
mod registry;
pub mod sweep;

pub use compute::{default_n_cpu, ComputeConfig};
pub use errors::DriverError;
pub use inversion_driver::{DriverState, InversionDriver};
pub use joint::JointSingleDriver;
pub use line_sweep::{collect_line_data, LineSweepDriver};
pub use logger::{InversionLogger, LogSession};
pub use registry::{start, Driver, DriverConstructor, DriverRegistry};
