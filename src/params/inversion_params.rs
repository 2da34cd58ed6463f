// geoinv/src/params/inversion_params.rs

use super::input_file::{InputFile, InputFileError};
use super::inversion_type::{InversionType, UnknownInversionType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

/// A model input: either a constant or the name of a channel on the mesh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelSource {
    Constant(f64),
    Channel(String),
}

/// Uncertainty input: a floor applied to every datum or a channel name.
#[derive(Clone, Debug, PartialEq)]
pub enum UncertaintySource {
    Constant(f64),
    Channel(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradientType {
    Total,
    Components,
}

/// Typed view over a validated ui.json parameter file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InversionParams {
    pub title: Option<String>,
    pub inversion_type: String,
    pub geoh5: PathBuf,
    pub forward_only: bool,
    pub data_object: Option<String>,
    pub line_object: Option<String>,
    pub line_id: Option<f64>,
    pub topography_object: Option<String>,
    pub topography: Option<String>,
    pub z_from_topo: bool,
    pub receivers_offset_x: f64,
    pub receivers_offset_y: f64,
    pub receivers_offset_z: f64,
    pub ignore_values: Option<String>,
    pub resolution: Option<f64>,
    pub window_center_x: Option<f64>,
    pub window_center_y: Option<f64>,
    pub window_width: Option<f64>,
    pub window_height: Option<f64>,
    pub window_azimuth: f64,
    pub mesh: Option<String>,
    pub u_cell_size: f64,
    pub v_cell_size: f64,
    pub w_cell_size: f64,
    pub depth_core: f64,
    pub horizontal_padding: f64,
    pub vertical_padding: f64,
    pub starting_model: Option<ModelSource>,
    pub reference_model: Option<ModelSource>,
    pub lower_bound: Option<ModelSource>,
    pub upper_bound: Option<ModelSource>,
    pub starting_inclination: Option<f64>,
    pub starting_declination: Option<f64>,
    pub inducing_field_strength: f64,
    pub inducing_field_inclination: f64,
    pub inducing_field_declination: f64,
    pub tile_spatial: usize,
    pub max_distance: Option<f64>,
    pub parallelized: bool,
    pub n_cpu: Option<usize>,
    pub max_chunk_size: f64,
    pub chi_factor: f64,
    pub starting_chi_factor: Option<f64>,
    pub sens_wts_threshold: f64,
    pub every_iteration_bool: bool,
    pub f_min_change: f64,
    pub beta_tol: f64,
    pub prctile: f64,
    #[serde(rename = "coolingRate")]
    pub cooling_rate: usize,
    #[serde(rename = "coolingFactor")]
    pub cooling_factor: f64,
    #[serde(rename = "coolEps_q")]
    pub cool_eps_q: bool,
    #[serde(rename = "coolEpsFact")]
    pub cool_eps_fact: f64,
    #[serde(alias = "max_iterations")]
    pub max_irls_iterations: usize,
    pub max_line_search_iterations: usize,
    pub max_cg_iterations: usize,
    pub max_global_iterations: usize,
    pub initial_beta: Option<f64>,
    pub initial_beta_ratio: f64,
    pub tol_cg: f64,
    pub alpha_s: f64,
    pub alpha_x: f64,
    pub alpha_y: f64,
    pub alpha_z: f64,
    pub s_norm: f64,
    pub x_norm: f64,
    pub y_norm: f64,
    pub z_norm: f64,
    pub gradient_type: GradientType,
    pub ga_group_name: String,
    pub monitoring_directory: Option<PathBuf>,
    pub generate_sweep: bool,
    pub cleanup: bool,
    pub group_a: Option<PathBuf>,
    pub group_b: Option<PathBuf>,
    pub group_c: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for InversionParams {
    fn default() -> Self {
        Self {
            title: None,
            inversion_type: String::new(),
            geoh5: PathBuf::new(),
            forward_only: false,
            data_object: None,
            line_object: None,
            line_id: None,
            topography_object: None,
            topography: None,
            z_from_topo: false,
            receivers_offset_x: 0.0,
            receivers_offset_y: 0.0,
            receivers_offset_z: 0.0,
            ignore_values: None,
            resolution: None,
            window_center_x: None,
            window_center_y: None,
            window_width: None,
            window_height: None,
            window_azimuth: 0.0,
            mesh: None,
            u_cell_size: 25.0,
            v_cell_size: 25.0,
            w_cell_size: 25.0,
            depth_core: 500.0,
            horizontal_padding: 1000.0,
            vertical_padding: 1000.0,
            starting_model: None,
            reference_model: None,
            lower_bound: None,
            upper_bound: None,
            starting_inclination: None,
            starting_declination: None,
            inducing_field_strength: 50000.0,
            inducing_field_inclination: 90.0,
            inducing_field_declination: 0.0,
            tile_spatial: 1,
            max_distance: None,
            parallelized: true,
            n_cpu: None,
            max_chunk_size: 128.0,
            chi_factor: 1.0,
            starting_chi_factor: None,
            sens_wts_threshold: 1e-3,
            every_iteration_bool: true,
            f_min_change: 1e-4,
            beta_tol: 0.5,
            prctile: 95.0,
            cooling_rate: 1,
            cooling_factor: 2.0,
            cool_eps_q: true,
            cool_eps_fact: 1.2,
            max_irls_iterations: 25,
            max_line_search_iterations: 20,
            max_cg_iterations: 30,
            max_global_iterations: 50,
            initial_beta: None,
            initial_beta_ratio: 10.0,
            tol_cg: 1e-4,
            alpha_s: 1.0,
            alpha_x: 1.0,
            alpha_y: 1.0,
            alpha_z: 1.0,
            s_norm: 2.0,
            x_norm: 2.0,
            y_norm: 2.0,
            z_norm: 2.0,
            gradient_type: GradientType::Total,
            ga_group_name: "Inversion".to_string(),
            monitoring_directory: None,
            generate_sweep: false,
            cleanup: true,
            group_a: None,
            group_b: None,
            group_c: None,
            extra: Map::new(),
        }
    }
}

impl InversionParams {
    pub fn from_input_file(file: &InputFile) -> Result<Self, ParamsError> {
        let mut params: InversionParams = serde_json::from_value(Value::Object(file.data()))?;
        params.geoh5 = file.resolve(&params.geoh5);
        for group in [&mut params.group_a, &mut params.group_b, &mut params.group_c] {
            if let Some(path) = group.as_mut() {
                *path = file.resolve(path);
            }
        }
        params.validate()?;
        Ok(params)
    }

    pub fn kind(&self) -> Result<InversionType, UnknownInversionType> {
        self.inversion_type.parse()
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.tile_spatial == 0 {
            return Err(ParamsError::invalid("tile_spatial", "must be at least 1"));
        }
        if self.chi_factor <= 0.0 {
            return Err(ParamsError::invalid("chi_factor", "must be positive"));
        }
        if !(0.0 < self.prctile && self.prctile <= 100.0) {
            return Err(ParamsError::invalid("prctile", "must be in (0, 100]"));
        }
        if self.cooling_factor <= 1.0 {
            return Err(ParamsError::invalid("coolingFactor", "must be greater than 1"));
        }
        if self.cooling_rate == 0 {
            return Err(ParamsError::invalid("coolingRate", "must be at least 1"));
        }
        for (name, norm) in ["s_norm", "x_norm", "y_norm", "z_norm"]
            .iter()
            .zip(self.model_norms())
        {
            if !(0.0..=2.0).contains(&norm) {
                return Err(ParamsError::invalid(name, "must be within [0, 2]"));
            }
        }
        for (name, cell_size) in [
            ("u_cell_size", self.u_cell_size),
            ("v_cell_size", self.v_cell_size),
            ("w_cell_size", self.w_cell_size),
        ] {
            if cell_size <= 0.0 {
                return Err(ParamsError::invalid(name, "must be positive"));
            }
        }
        Ok(())
    }

    /// Components with an assigned data channel, in canonical order.
    pub fn components(&self, kind: InversionType) -> Vec<String> {
        kind.components()
            .iter()
            .filter(|component| self.channel(component).is_some())
            .map(|component| component.to_string())
            .collect()
    }

    pub fn channel(&self, component: &str) -> Option<String> {
        if matches!(
            self.extra.get(&format!("{}_channel_bool", component)),
            Some(Value::Bool(false))
        ) {
            return None;
        }
        match self.extra.get(&format!("{}_channel", component)) {
            Some(Value::String(name)) if !name.is_empty() => Some(name.clone()),
            _ => None,
        }
    }

    pub fn uncertainty(&self, component: &str) -> Option<UncertaintySource> {
        match self.extra.get(&format!("{}_uncertainty", component)) {
            Some(Value::Number(value)) => value.as_f64().map(UncertaintySource::Constant),
            Some(Value::String(name)) if !name.is_empty() => {
                Some(UncertaintySource::Channel(name.clone()))
            }
            _ => None,
        }
    }

    pub fn model_norms(&self) -> [f64; 4] {
        [self.s_norm, self.x_norm, self.y_norm, self.z_norm]
    }

    pub fn alphas(&self) -> [f64; 4] {
        [self.alpha_s, self.alpha_x, self.alpha_y, self.alpha_z]
    }

    pub fn is_sparse(&self) -> bool {
        self.model_norms().iter().any(|&norm| norm < 2.0)
    }

    pub fn receiver_offset(&self) -> Option<[f64; 3]> {
        let offset = [
            self.receivers_offset_x,
            self.receivers_offset_y,
            self.receivers_offset_z,
        ];
        if offset.iter().any(|&value| value != 0.0) {
            Some(offset)
        } else {
            None
        }
    }

    pub fn group_files(&self) -> Vec<PathBuf> {
        [&self.group_a, &self.group_b, &self.group_c]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error(transparent)]
    InputFileError(#[from] InputFileError),
    #[error("Invalid parameter values: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("Missing required parameter '{0}'")]
    MissingParameter(String),
}

impl ParamsError {
    pub fn invalid(name: &str, reason: &str) -> Self {
        ParamsError::InvalidValue {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn input_file(value: Value) -> InputFile {
        match value {
            Value::Object(map) => InputFile::from_map(Path::new("/data/run/grav.ui.json"), map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_defaults_and_renamed_fields() {
        let file = input_file(json!({
            "inversion_type": "gravity",
            "geoh5": "survey.ws.json",
            "gz_channel": {"label": "gz", "value": "gz_obs"},
            "gz_uncertainty": 0.05,
            "coolingRate": 2,
            "max_iterations": 7,
            "n_cpu": null,
        }));
        let params = InversionParams::from_input_file(&file).unwrap();
        assert_eq!(params.kind().unwrap(), InversionType::Gravity);
        assert_eq!(params.geoh5, PathBuf::from("/data/run/survey.ws.json"));
        assert_eq!(params.cooling_rate, 2);
        assert_eq!(params.max_irls_iterations, 7);
        assert_eq!(params.tile_spatial, 1);
        assert_eq!(params.gradient_type, GradientType::Total);
        assert_eq!(params.components(InversionType::Gravity), vec!["gz"]);
        assert_eq!(
            params.uncertainty("gz"),
            Some(UncertaintySource::Constant(0.05))
        );
        assert!(!params.is_sparse());
    }

    #[test]
    fn test_model_sources_accept_numbers_and_channels() {
        let file = input_file(json!({
            "inversion_type": "magnetic scalar",
            "starting_model": 1e-4,
            "reference_model": "ref_susc",
        }));
        let params = InversionParams::from_input_file(&file).unwrap();
        assert_eq!(params.starting_model, Some(ModelSource::Constant(1e-4)));
        assert_eq!(
            params.reference_model,
            Some(ModelSource::Channel("ref_susc".to_string()))
        );
    }

    #[test]
    fn test_validation_rejects_zero_tiles_and_bad_norms() {
        let file = input_file(json!({"inversion_type": "gravity", "tile_spatial": 0}));
        assert!(matches!(
            InversionParams::from_input_file(&file),
            Err(ParamsError::InvalidValue { .. })
        ));
        let file = input_file(json!({"inversion_type": "gravity", "s_norm": 3.0}));
        assert!(InversionParams::from_input_file(&file).is_err());
    }

    #[test]
    fn test_disabled_channel_is_not_a_component() {
        let params = InversionParams {
            extra: match json!({"gz_channel": "gz", "gx_channel": "gx", "gx_channel_bool": false}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
            ..Default::default()
        };
        assert_eq!(params.components(InversionType::Gravity), vec!["gz"]);
    }
}
