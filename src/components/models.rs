// geoinv/src/components/models.rs

use super::active_cells::ActiveCells;
use super::mesh::InversionMesh;
use super::ComponentError;
use crate::params::{InversionParams, InversionType, ModelSource, PhysicalProperty};
use crate::workspace::{Workspace, WorkspaceError};
use ndarray::{Array1, ArrayView1};
use std::sync::Arc;

/// Starting, reference and bound models over the active cells. Vector
/// models are stored component-major: all x values, then y, then z.
#[derive(Clone, Debug)]
pub struct InversionModelCollection {
    active_cells: Arc<ActiveCells>,
    n_components: usize,
    starting: Array1<f64>,
    reference: Array1<f64>,
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl InversionModelCollection {
    pub fn new(active_cells: Arc<ActiveCells>, n_components: usize, starting: Array1<f64>) -> Self {
        let n = starting.len();
        Self {
            active_cells,
            n_components,
            reference: starting.clone(),
            starting,
            lower: Array1::from_elem(n, f64::NEG_INFINITY),
            upper: Array1::from_elem(n, f64::INFINITY),
        }
    }

    pub fn resolve(
        workspace: &Workspace,
        params: &InversionParams,
        kind: InversionType,
        mesh: &InversionMesh,
        active_cells: Arc<ActiveCells>,
    ) -> Result<Self, ComponentError> {
        let default = default_starting_value(kind.physical_property());
        let reader = ModelReader {
            workspace,
            mesh,
            active_cells: &active_cells,
        };
        let starting = reader.read(params.starting_model.as_ref(), default)?;
        let n_components = kind.model_components();
        if kind.is_vector() {
            let inclination = params
                .starting_inclination
                .unwrap_or(params.inducing_field_inclination);
            let declination = params
                .starting_declination
                .unwrap_or(params.inducing_field_declination);
            let starting = to_cartesian(starting.view(), inclination, declination);
            let reference = match params.reference_model.as_ref() {
                Some(source) => to_cartesian(
                    reader.read(Some(source), 0.0)?.view(),
                    inclination,
                    declination,
                ),
                None => Array1::zeros(starting.len()),
            };
            let mut models = Self::new(active_cells, n_components, starting);
            models.reference = reference;
            return Ok(models);
        }
        let reference = match params.reference_model.as_ref() {
            Some(source) => reader.read(Some(source), default)?,
            None => starting.clone(),
        };
        let lower = reader.read(params.lower_bound.as_ref(), f64::NEG_INFINITY)?;
        let upper = reader.read(params.upper_bound.as_ref(), f64::INFINITY)?;
        Ok(Self {
            active_cells,
            n_components,
            starting,
            reference,
            lower,
            upper,
        })
    }

    pub fn active_cells(&self) -> &Arc<ActiveCells> {
        &self.active_cells
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn n_parameters(&self) -> usize {
        self.starting.len()
    }

    pub fn starting(&self) -> &Array1<f64> {
        &self.starting
    }

    pub fn reference(&self) -> &Array1<f64> {
        &self.reference
    }

    pub fn lower_bound(&self) -> &Array1<f64> {
        &self.lower
    }

    pub fn upper_bound(&self) -> &Array1<f64> {
        &self.upper
    }

    /// Slice of component `index` in a model vector.
    pub fn component<'a>(&self, model: &'a Array1<f64>, index: usize) -> ArrayView1<'a, f64> {
        let n = self.active_cells.n_active();
        model.slice(ndarray::s![index * n..(index + 1) * n])
    }

    /// Per-cell magnitude of a vector model.
    pub fn amplitude(&self, model: &Array1<f64>) -> Array1<f64> {
        let mut squared = Array1::<f64>::zeros(self.active_cells.n_active());
        for index in 0..self.n_components {
            squared += &self.component(model, index).mapv(|v| v * v);
        }
        squared.mapv(f64::sqrt)
    }
}

struct ModelReader<'a> {
    workspace: &'a Workspace,
    mesh: &'a InversionMesh,
    active_cells: &'a ActiveCells,
}

impl ModelReader<'_> {
    fn read(&self, source: Option<&ModelSource>, default: f64) -> Result<Array1<f64>, ComponentError> {
        let n_active = self.active_cells.n_active();
        match source {
            None => Ok(Array1::from_elem(n_active, default)),
            Some(ModelSource::Constant(value)) => Ok(Array1::from_elem(n_active, *value)),
            Some(ModelSource::Channel(channel)) => {
                let missing = || WorkspaceError::ChannelNotFound {
                    entity: self.mesh.name().to_string(),
                    channel: channel.clone(),
                };
                if !self.mesh.is_workspace_entity() {
                    return Err(missing().into());
                }
                let values = self
                    .workspace
                    .get_entity(self.mesh.name())?
                    .get_data(channel)
                    .ok_or_else(missing)?;
                Ok(self.active_cells.restrict(ArrayView1::from(values)))
            }
        }
    }
}

fn default_starting_value(property: Option<PhysicalProperty>) -> f64 {
    match property {
        Some(PhysicalProperty::Susceptibility) => 1e-4,
        Some(PhysicalProperty::Conductivity) => 1e-3,
        _ => 0.0,
    }
}

/// Expand amplitudes along an inclination (positive down) and declination
/// (clockwise from north), both in degrees, into x, y, z blocks.
fn to_cartesian(amplitude: ArrayView1<f64>, inclination: f64, declination: f64) -> Array1<f64> {
    let (inc, dec) = (inclination.to_radians(), declination.to_radians());
    let x = amplitude.mapv(|a| a * inc.cos() * dec.sin());
    let y = amplitude.mapv(|a| a * inc.cos() * dec.cos());
    let z = amplitude.mapv(|a| -a * inc.sin());
    x.iter().chain(y.iter()).chain(z.iter()).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{Entity, Geometry};
    use std::path::Path;

    fn mesh_workspace() -> (Workspace, InversionMesh) {
        let geometry = Geometry::TensorMesh {
            origin: [0.0; 3],
            hx: vec![1.0; 4],
            hy: vec![1.0],
            hz: vec![1.0],
        };
        let mut workspace = Workspace::new(Path::new("unused.ws.json"));
        let mut entity = Entity::new("mesh", geometry.clone());
        entity.add_data("ref", vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        workspace.add_entity(entity);
        let mut params = InversionParams::default();
        params.mesh = Some("mesh".to_string());
        let mesh = InversionMesh::resolve(
            &workspace,
            &params,
            InversionType::Gravity,
            &crate::components::InversionData::new(
                "d",
                ndarray::array![[0.5, 0.5, 2.0]],
                vec!["gz".to_string()],
                ndarray::Array2::zeros((1, 1)),
                ndarray::Array2::ones((1, 1)),
            ),
            &crate::components::InversionTopography::new(ndarray::array![[0.0, 0.0, 1.0]], "t"),
        )
        .unwrap();
        (workspace, mesh)
    }

    #[test]
    fn test_channel_models_are_reduced_to_active_cells() {
        let (workspace, mesh) = mesh_workspace();
        let active = Arc::new(ActiveCells::new(vec![true, false, true, false]));
        let mut params = InversionParams::default();
        params.reference_model = Some(ModelSource::Channel("ref".to_string()));
        params.lower_bound = Some(ModelSource::Constant(-1.0));
        let models =
            InversionModelCollection::resolve(&workspace, &params, InversionType::Gravity, &mesh, active)
                .unwrap();
        assert_eq!(models.reference().to_vec(), vec![1.0, 3.0]);
        assert_eq!(models.starting().to_vec(), vec![0.0, 0.0]);
        assert_eq!(models.lower_bound().to_vec(), vec![-1.0, -1.0]);
        assert!(models.upper_bound()[0].is_infinite());
    }

    #[test]
    fn test_vector_starting_model_follows_inducing_field() {
        let (workspace, mesh) = mesh_workspace();
        let active = Arc::new(ActiveCells::all(4));
        let mut params = InversionParams::default();
        params.starting_model = Some(ModelSource::Constant(2.0));
        params.inducing_field_inclination = 90.0;
        let models = InversionModelCollection::resolve(
            &workspace,
            &params,
            InversionType::MagneticVector,
            &mesh,
            active,
        )
        .unwrap();
        assert_eq!(models.n_parameters(), 12);
        assert!(models.starting()[0].abs() < 1e-12);
        assert!((models.starting()[8] + 2.0).abs() < 1e-12);
        assert!((models.amplitude(models.starting())[3] - 2.0).abs() < 1e-12);
        assert_eq!(models.reference().sum(), 0.0);
    }
}
