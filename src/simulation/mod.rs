// geoinv/src/simulation/mod.rs

//! Forward simulation seam. Each tile gets its own [`Simulation`] built by a
//! [`SimulationFactory`]; the default backend assembles a dense linearised
//! sensitivity matrix.

mod kernels;
mod tile_map;

pub use kernels::{field_direction, Kernel, Receiver};
pub use tile_map::{active_centers, TileMap};

use crate::components::{ActiveCells, CellMesh, ComponentError, InversionData};
use crate::params::{InversionParams, InversionType};
use log::debug;
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis, ShapeError};
use rayon::prelude::*;
use thiserror::Error;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Forward operator of one tile over the global active-cell model.
pub trait Simulation: Send + Sync {
    fn n_data(&self) -> usize;

    fn n_params(&self) -> usize;

    fn dpred(&self, model: &Array1<f64>) -> Array1<f64>;

    /// J v
    fn jvec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64>;

    /// Jᵀ v
    fn jtvec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64>;

    /// diag(Jᵀ W² J) for data weights `w`.
    fn jtj_diag(&self, model: &Array1<f64>, w: &Array1<f64>) -> Array1<f64>;
}

/// Everything needed to simulate the rows of one tile.
pub struct SimulationRequest<'a> {
    pub kind: InversionType,
    pub data: &'a InversionData,
    pub rows: &'a [usize],
    pub mesh: &'a CellMesh,
    pub active_cells: &'a ActiveCells,
    pub n_components: usize,
    /// Strength (nT), inclination and declination (degrees).
    pub inducing_field: [f64; 3],
    pub max_distance: Option<f64>,
    pub max_chunk_size: f64,
}

impl<'a> SimulationRequest<'a> {
    pub fn new(
        kind: InversionType,
        params: &InversionParams,
        data: &'a InversionData,
        rows: &'a [usize],
        mesh: &'a CellMesh,
        active_cells: &'a ActiveCells,
    ) -> Self {
        Self {
            kind,
            data,
            rows,
            mesh,
            active_cells,
            n_components: kind.model_components(),
            inducing_field: [
                params.inducing_field_strength,
                params.inducing_field_inclination,
                params.inducing_field_declination,
            ],
            max_distance: params.max_distance,
            max_chunk_size: params.max_chunk_size,
        }
    }

    fn receivers(&self) -> Result<Vec<Receiver>, SimulationError> {
        if self.kind.is_electrode_survey() {
            let survey = self
                .data
                .electrodes()
                .ok_or_else(|| SimulationError::MissingElectrodes(self.data.entity_name().to_string()))?;
            let point = |array: &Array2<f64>, row: usize| {
                [array[[row, 0]], array[[row, 1]], array[[row, 2]]]
            };
            return Ok(self
                .rows
                .iter()
                .map(|&row| Receiver::Dipole {
                    a: point(survey.a(), row),
                    b: point(survey.b(), row),
                    m: point(survey.m(), row),
                    n: point(survey.n(), row),
                })
                .collect());
        }
        let locations = self.data.locations();
        Ok(self
            .rows
            .iter()
            .map(|&row| Receiver::Point([locations[[row, 0]], locations[[row, 1]], locations[[row, 2]]]))
            .collect())
    }
}

pub trait SimulationFactory: Send + Sync {
    fn build(&self, request: &SimulationRequest<'_>) -> Result<Box<dyn Simulation>, SimulationError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LinearSimulationFactory;

impl SimulationFactory for LinearSimulationFactory {
    fn build(&self, request: &SimulationRequest<'_>) -> Result<Box<dyn Simulation>, SimulationError> {
        Ok(Box::new(LinearSimulation::build(request)?))
    }
}

/// Dense sensitivity matrix restricted to the tile's local cells. Data are
/// ordered row-major: every component of a row before the next row.
#[derive(Clone, Debug)]
pub struct LinearSimulation {
    sensitivities: Array2<f64>,
    map: TileMap,
}

impl LinearSimulation {
    pub fn new(sensitivities: Array2<f64>, map: TileMap) -> Self {
        Self { sensitivities, map }
    }

    pub fn build(request: &SimulationRequest<'_>) -> Result<Self, SimulationError> {
        let kernels = request
            .data
            .components()
            .iter()
            .map(|component| Kernel::for_component(request.kind, component, request.inducing_field))
            .collect::<Result<Vec<_>, _>>()?;
        let receivers = request.receivers()?;
        let tile_locations = request.data.locations().select(Axis(0), request.rows);
        let map = TileMap::new(
            request.mesh,
            request.active_cells,
            tile_locations.view(),
            request.n_components,
            request.max_distance,
        )?;
        let centers = active_centers(request.mesh, request.active_cells).select(Axis(0), map.cells());
        let volumes: Array1<f64> = map
            .cells()
            .iter()
            .map(|&cell| request.mesh.volumes()[request.active_cells.global_index()[cell]])
            .collect();

        let n_local = map.n_local();
        let n_components = kernels.len();
        let n_data = receivers.len() * n_components;
        let rows_per_chunk =
            ((request.max_chunk_size * BYTES_PER_MIB) / (8.0 * n_local.max(1) as f64)).max(1.0) as usize;
        let n_chunks = n_data.div_ceil(rows_per_chunk);
        debug!(
            "Sensitivities of {} data x {} parameters in {} chunks",
            n_data, n_local, n_chunks
        );

        let blocks: Vec<Array2<f64>> = (0..n_chunks)
            .into_par_iter()
            .map(|chunk| {
                let start = chunk * rows_per_chunk;
                let end = (start + rows_per_chunk).min(n_data);
                let mut block = Array2::<f64>::zeros((end - start, n_local));
                for (datum, out) in (start..end).zip(block.rows_mut()) {
                    let receiver = &receivers[datum / n_components];
                    kernels[datum % n_components].row(
                        receiver,
                        centers.view(),
                        volumes.view(),
                        out,
                    );
                }
                block
            })
            .collect();
        let sensitivities = if blocks.is_empty() {
            Array2::zeros((0, n_local))
        } else {
            let views: Vec<ArrayView2<f64>> = blocks.iter().map(|block| block.view()).collect();
            concatenate(Axis(0), &views)?
        };
        Ok(Self::new(sensitivities, map))
    }

    pub fn sensitivities(&self) -> &Array2<f64> {
        &self.sensitivities
    }
}

impl Simulation for LinearSimulation {
    fn n_data(&self) -> usize {
        self.sensitivities.nrows()
    }

    fn n_params(&self) -> usize {
        self.map.n_global()
    }

    fn dpred(&self, model: &Array1<f64>) -> Array1<f64> {
        self.sensitivities.dot(&self.map.project(model))
    }

    fn jvec(&self, _model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        self.sensitivities.dot(&self.map.project(v))
    }

    fn jtvec(&self, _model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        let mut global = Array1::zeros(self.map.n_global());
        self.map.scatter_add(&self.sensitivities.t().dot(v), &mut global);
        global
    }

    fn jtj_diag(&self, _model: &Array1<f64>, w: &Array1<f64>) -> Array1<f64> {
        let local: Array1<f64> = self
            .sensitivities
            .columns()
            .into_iter()
            .map(|column| {
                column
                    .iter()
                    .zip(w.iter())
                    .map(|(g, w)| (g * w).powi(2))
                    .sum::<f64>()
            })
            .collect();
        let mut global = Array1::zeros(self.map.n_global());
        self.map.scatter_add(&local, &mut global);
        global
    }
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Component '{component}' cannot be simulated for a {kind} survey")]
    UnsupportedComponent { kind: String, component: String },
    #[error("Data object '{0}' has no electrode topology")]
    MissingElectrodes(String),
    #[error(transparent)]
    ComponentError(#[from] ComponentError),
    #[error(transparent)]
    NDArrayShapeError(#[from] ShapeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn gravity_request_data() -> (InversionData, CellMesh, ActiveCells) {
        let locations = array![[5.0, 5.0, 1.0], [15.0, 5.0, 1.0], [25.0, 5.0, 1.0]];
        let data = InversionData::new(
            "survey",
            locations,
            vec!["gz".to_string(), "gx".to_string()],
            ndarray::Array2::zeros((3, 2)),
            ndarray::Array2::ones((3, 2)),
        );
        let mesh = CellMesh::tensor([0.0, 0.0, -20.0], &[10.0; 3], &[10.0], &[10.0, 10.0]);
        let active = ActiveCells::all(mesh.n_cells());
        (data, mesh, active)
    }

    #[test]
    fn test_chunked_assembly_matches_single_chunk() {
        let (data, mesh, active) = gravity_request_data();
        let params = InversionParams::default();
        let rows = [0, 2];
        let mut request =
            SimulationRequest::new(InversionType::Gravity, &params, &data, &rows, &mesh, &active);
        let whole = LinearSimulation::build(&request).unwrap();
        // One sensitivity row per chunk.
        request.max_chunk_size = 1e-9;
        let chunked = LinearSimulation::build(&request).unwrap();
        assert_eq!(whole.sensitivities().dim(), (4, 6));
        assert_eq!(whole.sensitivities(), chunked.sensitivities());
    }

    #[test]
    fn test_adjoint_identity() {
        let (data, mesh, active) = gravity_request_data();
        let params = InversionParams::default();
        let rows = [0, 1, 2];
        let request =
            SimulationRequest::new(InversionType::Gravity, &params, &data, &rows, &mesh, &active);
        let simulation = LinearSimulationFactory.build(&request).unwrap();
        let model = Array1::zeros(simulation.n_params());
        let v = Array1::from_iter((0..simulation.n_params()).map(|i| 1.0 + i as f64));
        let u = Array1::from_iter((0..simulation.n_data()).map(|i| 0.5 - i as f64));
        let left = simulation.jvec(&model, &v).dot(&u);
        let right = v.dot(&simulation.jtvec(&model, &u));
        assert!((left - right).abs() <= 1e-12 * left.abs().max(1.0));
    }

    #[test]
    fn test_empty_tile_has_no_data() {
        let (data, mesh, active) = gravity_request_data();
        let params = InversionParams::default();
        let rows: [usize; 0] = [];
        let request =
            SimulationRequest::new(InversionType::Gravity, &params, &data, &rows, &mesh, &active);
        let simulation = LinearSimulation::build(&request).unwrap();
        assert_eq!(simulation.n_data(), 0);
        assert_eq!(simulation.dpred(&Array1::zeros(6)).len(), 0);
    }
}
