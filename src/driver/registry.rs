// geoinv/src/driver/registry.rs

use super::errors::DriverError;
use super::inversion_driver::{DriverState, InversionDriver};
use super::joint::JointSingleDriver;
use super::line_sweep::LineSweepDriver;
use super::sweep::generate_sweep;
use crate::params::{InputFile, InversionParams, InversionType};
use log::debug;
use std::collections::BTreeMap;
use std::path::Path;

/// A runnable application built from one parameter file.
pub trait Driver {
    fn params(&self) -> &InversionParams;
    fn state(&self) -> DriverState;
    fn run(&mut self) -> Result<DriverState, DriverError>;
}

pub type DriverConstructor =
    fn(InversionParams, InversionType) -> Result<Box<dyn Driver>, DriverError>;

fn inversion_driver(
    params: InversionParams,
    kind: InversionType,
) -> Result<Box<dyn Driver>, DriverError> {
    Ok(Box::new(InversionDriver::new(params, kind)?))
}

fn line_sweep_driver(
    params: InversionParams,
    kind: InversionType,
) -> Result<Box<dyn Driver>, DriverError> {
    Ok(Box::new(LineSweepDriver::new(params, kind)?))
}

fn joint_driver(
    params: InversionParams,
    _kind: InversionType,
) -> Result<Box<dyn Driver>, DriverError> {
    Ok(Box::new(JointSingleDriver::new(params)?))
}

/// Maps every inversion type to the constructor of its driver.
pub struct DriverRegistry {
    constructors: BTreeMap<InversionType, DriverConstructor>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in InversionType::ALL {
            let constructor: DriverConstructor = match kind {
                InversionType::DirectCurrentPseudo3d
                | InversionType::InducedPolarizationPseudo3d => line_sweep_driver,
                InversionType::JointSingleProperty => joint_driver,
                _ => inversion_driver,
            };
            registry.register(kind, constructor);
        }
        registry
    }
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, kind: InversionType, constructor: DriverConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn valid_types(&self) -> Vec<&'static str> {
        self.constructors.keys().map(|kind| kind.as_str()).collect()
    }

    /// Constructor registered for `name`. Unknown names fail with the full
    /// list of registered types.
    pub fn resolve(&self, name: &str) -> Result<(InversionType, DriverConstructor), DriverError> {
        let unsupported = || DriverError::UnsupportedInversionType {
            name: name.to_string(),
            valid: self.valid_types().join(", "),
        };
        let kind: InversionType = name.parse().map_err(|_| unsupported())?;
        let constructor = self.constructors.get(&kind).ok_or_else(unsupported)?;
        Ok((kind, *constructor))
    }

    /// Read the parameter file at `path` and run the driver it declares.
    /// Files asking for a sweep only get their sweep template written and
    /// return `None`.
    pub fn start(&self, path: &Path) -> Result<Option<Box<dyn Driver>>, DriverError> {
        println!("Loading input file . . .");
        let mut input_file = InputFile::read(path)?;
        let name = input_file
            .get_str("inversion_type")
            .ok_or_else(|| DriverError::MissingInversionType(path.display().to_string()))?;
        let (kind, constructor) = self.resolve(&name)?;
        debug!("Resolved {} from {}", kind, path.display());

        if input_file.get_bool("generate_sweep") {
            let sweep = generate_sweep(&mut input_file)?;
            println!("Sweep file written to {}", sweep.display());
            return Ok(None);
        }

        let params = InversionParams::from_input_file(&input_file)?;
        let geoh5 = params.geoh5.clone();
        println!("Initializing application . . .");
        let mut driver = constructor(params, kind)?;
        println!("Running application . . .");
        driver.run()?;
        println!("Results saved to {}", geoh5.display());
        Ok(Some(driver))
    }
}

/// Run the parameter file at `path` with the default registry.
pub fn start(path: &Path) -> Result<Option<Box<dyn Driver>>, DriverError> {
    DriverRegistry::default().start(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::inversion_driver::tests::gravity_workspace;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_default_registry_covers_every_type() {
        let registry = DriverRegistry::default();
        assert_eq!(registry.valid_types().len(), InversionType::ALL.len());
        for kind in InversionType::ALL {
            assert_eq!(registry.resolve(kind.as_str()).unwrap().0, kind);
        }
    }

    #[test]
    fn test_unregistered_type_lists_valid_types() {
        let mut registry = DriverRegistry::empty();
        registry.register(InversionType::Gravity, inversion_driver);
        match registry.resolve("magnetic vector") {
            Err(DriverError::UnsupportedInversionType { name, valid }) => {
                assert_eq!(name, "magnetic vector");
                assert_eq!(valid, "gravity");
            }
            _ => panic!("expected an unsupported type error"),
        }
        let message = DriverRegistry::default()
            .resolve("seismic")
            .err()
            .map(|e| e.to_string())
            .unwrap();
        assert!(message.contains("magnetic scalar") && message.contains("tdem"));
    }

    #[test]
    fn test_start_fails_fast_on_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ui.json");
        fs::write(&path, json!({"inversion_type": "seismic"}).to_string()).unwrap();
        assert!(matches!(
            start(&path),
            Err(DriverError::UnsupportedInversionType { .. })
        ));
        fs::write(&path, json!({"geoh5": "x.ws.json"}).to_string()).unwrap();
        assert!(matches!(
            start(&path),
            Err(DriverError::MissingInversionType(_))
        ));
    }

    #[test]
    fn test_start_generate_sweep_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grav.ui.json");
        let ui = json!({
            "inversion_type": "gravity",
            "geoh5": "missing.ws.json",
            "generate_sweep": {"label": "Generate sweep", "value": true},
            "chi_factor": 1.0,
        });
        fs::write(&path, ui.to_string()).unwrap();
        assert!(start(&path).unwrap().is_none());
        assert!(!InputFile::read(&path).unwrap().get_bool("generate_sweep"));
        assert!(dir.path().join("grav_sweep.ui.json").exists());
    }

    #[test]
    fn test_start_runs_forward_simulation() {
        let dir = tempfile::tempdir().unwrap();
        gravity_workspace(&dir.path().join("grav.ws.json"));
        let path = dir.path().join("grav.ui.json");
        let ui = json!({
            "inversion_type": "gravity",
            "forward_only": true,
            "geoh5": "grav.ws.json",
            "data_object": "survey",
            "topography_object": "topo",
            "mesh": "mesh",
            "starting_model": 0.2,
            "gz_channel_bool": true,
        });
        fs::write(&path, ui.to_string()).unwrap();
        let driver = start(&path).unwrap().unwrap();
        assert_eq!(driver.state(), DriverState::Closed);
        assert!(driver.params().forward_only);
    }
}
