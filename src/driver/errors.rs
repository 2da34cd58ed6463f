// geoinv/src/driver/errors.rs

use super::inversion_driver::DriverState;
use super::sweep::SweepError;
use crate::components::ComponentError;
use crate::directives::DirectiveError;
use crate::misfit::MisfitError;
use crate::optimization::{OptimizationError, ProjectedGncgBuilderError};
use crate::params::{InputFileError, ParamsError, UnknownInversionType};
use crate::regularization::RegularizationError;
use crate::tiling::TilingError;
use crate::workspace::WorkspaceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Inversion type {name:?} is not supported. Valid inversions are: {valid}")]
    UnsupportedInversionType { name: String, valid: String },
    #[error("Input file {0} does not declare an inversion_type")]
    MissingInversionType(String),
    #[error("Driver cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: DriverState, to: DriverState },
    #[error("The {0} has not been built")]
    NotBuilt(&'static str),
    #[error("Joint inversion needs at least one of group_a, group_b or group_c")]
    NoJointGroups,
    #[error("Joint surveys must share one physical property: {0}")]
    MixedPhysicalProperties(String),
    #[error("{kind} cannot take part in a joint inversion")]
    UnsupportedJointMember { kind: String },
    #[error("Line sweep needs a line_object channel on the data object")]
    MissingLineObject,
    #[error(transparent)]
    UnknownInversionType(#[from] UnknownInversionType),
    #[error(transparent)]
    InputFileError(#[from] InputFileError),
    #[error(transparent)]
    ParamsError(#[from] ParamsError),
    #[error(transparent)]
    WorkspaceError(#[from] WorkspaceError),
    #[error(transparent)]
    ComponentError(#[from] ComponentError),
    #[error(transparent)]
    TilingError(#[from] TilingError),
    #[error(transparent)]
    MisfitError(#[from] MisfitError),
    #[error(transparent)]
    RegularizationError(#[from] RegularizationError),
    #[error(transparent)]
    ProjectedGncgBuilderError(#[from] ProjectedGncgBuilderError),
    #[error(transparent)]
    OptimizationError(#[from] OptimizationError),
    #[error(transparent)]
    DirectiveError(#[from] DirectiveError),
    #[error(transparent)]
    SweepError(#[from] SweepError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
