// geoinv/src/params/mod.rs

mod input_file;
mod inversion_params;
mod inversion_type;

pub use input_file::{InputFile, InputFileError};
pub use inversion_params::{
    GradientType, InversionParams, ModelSource, ParamsError, UncertaintySource,
};
pub use inversion_type::{InversionType, PhysicalProperty, TilingStrategy, UnknownInversionType};
