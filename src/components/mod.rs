// geoinv/src/components/mod.rs

//! Resolvers turning parameters and workspace objects into the survey,
//! mesh, active-cell mask and models consumed by the drivers.

mod active_cells;
mod cell_mesh;
mod data;
mod mesh;
mod models;
mod nearest;
mod topography;
mod window;

pub use active_cells::ActiveCells;
pub use cell_mesh::{CellMesh, CellPair};
pub use data::{ElectrodeSurvey, IgnoreRule, InversionData};
pub use mesh::InversionMesh;
pub use models::InversionModelCollection;
pub use nearest::{horizontal, nearest_indices};
pub use topography::InversionTopography;
pub use window::InversionWindow;

use crate::workspace::WorkspaceError;
use linfa_nn::{BuildError, NnError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error(transparent)]
    WorkspaceError(#[from] WorkspaceError),
    #[error("Parameter '{0}' is required")]
    MissingParameter(&'static str),
    #[error("No data components selected for a {0} inversion")]
    NoComponents(String),
    #[error("No data left in '{0}' after filtering")]
    EmptySurvey(String),
    #[error("Invalid ignore_values '{0}': expected '<value', '>value' or 'value'")]
    InvalidIgnoreValue(String),
    #[error("Object '{name}' must be a {expected}, found {found}")]
    UnexpectedGeometry {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Row {row} of '{name}' refers to a missing current dipole")]
    InvalidSourceReference { name: String, row: usize },
    #[error("Mesh '{mesh}' does not cover any location of data object '{data}'")]
    IncompatibleMesh { mesh: String, data: String },
    #[error("No cells of mesh '{mesh}' lie below topography '{topography}'")]
    NoActiveCells { mesh: String, topography: String },
    #[error("Nearest-neighbour lookup on an empty set of points")]
    EmptyReference,
    #[error(transparent)]
    NearestNeighbourBuildError(#[from] BuildError),
    #[error(transparent)]
    NearestNeighbourError(#[from] NnError),
}
