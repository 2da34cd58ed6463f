// geoinv/src/misfit.rs

//! Tiled data misfit: one local L2 term per tile, summed into a composite
//! objective, plus the permutation restoring global data order.

use crate::components::{ActiveCells, CellMesh, InversionData};
use crate::driver::InversionLogger;
use crate::params::{InversionParams, InversionType};
use crate::simulation::{Simulation, SimulationError, SimulationFactory, SimulationRequest};
use crate::tiling::Tile;
use humantime::format_duration;
use log::debug;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Weighted least-squares misfit of one tile, `0.5 |W (d_pred - d_obs)|²`
/// with `W = 1 / uncertainty` (zero for ignored data).
pub struct L2DataMisfit {
    simulation: Box<dyn Simulation>,
    observed: Array1<f64>,
    weights: Array1<f64>,
}

impl L2DataMisfit {
    pub fn new(
        simulation: Box<dyn Simulation>,
        observed: Array1<f64>,
        uncertainties: &Array1<f64>,
    ) -> Self {
        let weights = uncertainties.mapv(|std| {
            if std.is_finite() && std > 0.0 {
                1.0 / std
            } else {
                0.0
            }
        });
        Self {
            simulation,
            observed,
            weights,
        }
    }

    pub fn n_data(&self) -> usize {
        self.observed.len()
    }

    pub fn simulation(&self) -> &dyn Simulation {
        self.simulation.as_ref()
    }

    pub fn observed(&self) -> &Array1<f64> {
        &self.observed
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// Data that take part in the misfit.
    pub fn n_weighted(&self) -> usize {
        self.weights.iter().filter(|w| **w > 0.0).count()
    }

    pub fn dpred(&self, model: &Array1<f64>) -> Array1<f64> {
        self.simulation.dpred(model)
    }

    pub fn residual(&self, model: &Array1<f64>) -> Array1<f64> {
        (self.simulation.dpred(model) - &self.observed) * &self.weights
    }

    pub fn eval(&self, model: &Array1<f64>) -> f64 {
        0.5 * self.residual(model).mapv(|r| r * r).sum()
    }

    pub fn deriv(&self, model: &Array1<f64>) -> Array1<f64> {
        let weighted = self.residual(model) * &self.weights;
        self.simulation.jtvec(model, &weighted)
    }

    pub fn deriv2_vec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        let jv = self.simulation.jvec(model, v) * &self.weights * &self.weights;
        self.simulation.jtvec(model, &jv)
    }

    pub fn jtj_diag(&self, model: &Array1<f64>) -> Array1<f64> {
        self.simulation.jtj_diag(model, &self.weights)
    }
}

/// Sum of local misfit terms. Terms are evaluated in parallel; the sum
/// does not depend on evaluation order beyond floating-point association.
#[derive(Clone)]
pub struct ComboObjective {
    terms: Vec<Arc<L2DataMisfit>>,
    n_params: usize,
}

impl ComboObjective {
    pub fn combine(terms: Vec<Arc<L2DataMisfit>>) -> Self {
        let n_params = terms
            .first()
            .map(|term| term.simulation().n_params())
            .unwrap_or_default();
        Self { terms, n_params }
    }

    pub fn terms(&self) -> &[Arc<L2DataMisfit>] {
        &self.terms
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn n_data(&self) -> usize {
        self.terms.iter().map(|term| term.n_data()).sum()
    }

    pub fn n_weighted(&self) -> usize {
        self.terms.iter().map(|term| term.n_weighted()).sum()
    }

    pub fn eval(&self, model: &Array1<f64>) -> f64 {
        self.terms.par_iter().map(|term| term.eval(model)).sum()
    }

    pub fn deriv(&self, model: &Array1<f64>) -> Array1<f64> {
        self.sum_terms(|term| term.deriv(model))
    }

    pub fn deriv2_vec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        self.sum_terms(|term| term.deriv2_vec(model, v))
    }

    pub fn jtj_diag(&self, model: &Array1<f64>) -> Array1<f64> {
        self.sum_terms(|term| term.jtj_diag(model))
    }

    /// Predictions of every term, in term order.
    pub fn dpred_terms(&self, model: &Array1<f64>) -> Vec<Array1<f64>> {
        self.terms.par_iter().map(|term| term.dpred(model)).collect()
    }

    fn sum_terms<F>(&self, f: F) -> Array1<f64>
    where
        F: Fn(&L2DataMisfit) -> Array1<f64> + Sync + Send,
    {
        let n_params = self.n_params;
        self.terms
            .par_iter()
            .map(|term| f(term.as_ref()))
            .reduce(|| Array1::zeros(n_params), |a, b| a + b)
    }
}

/// `sorting` holds the survey rows of every tile; `ordering` gives the
/// (component, row) of every datum of the tile-concatenated data vector.
#[derive(Clone, Debug, PartialEq)]
pub struct SortingPermutation {
    sorting: Vec<Tile>,
    ordering: Vec<[usize; 2]>,
    n_rows: usize,
    n_components: usize,
}

impl SortingPermutation {
    /// Fails unless the tiles cover every row exactly once.
    pub fn new(sorting: Vec<Tile>, n_rows: usize, n_components: usize) -> Result<Self, MisfitError> {
        let mut seen = vec![false; n_rows];
        for &row in sorting.iter().flatten() {
            match seen.get_mut(row) {
                Some(flag) if !*flag => *flag = true,
                Some(_) => return Err(MisfitError::InvalidSorting(format!("row {} appears twice", row))),
                None => {
                    return Err(MisfitError::InvalidSorting(format!(
                        "row {} is outside the {} survey rows",
                        row, n_rows
                    )))
                }
            }
        }
        if let Some(missing) = seen.iter().position(|flag| !flag) {
            return Err(MisfitError::InvalidSorting(format!(
                "row {} is not assigned to any tile",
                missing
            )));
        }
        let ordering = sorting
            .iter()
            .flatten()
            .flat_map(|&row| (0..n_components).map(move |component| [component, row]))
            .collect();
        Ok(Self {
            sorting,
            ordering,
            n_rows,
            n_components,
        })
    }

    pub fn sorting(&self) -> &[Tile] {
        &self.sorting
    }

    pub fn ordering(&self) -> &[[usize; 2]] {
        &self.ordering
    }

    pub fn n_tiles(&self) -> usize {
        self.sorting.len()
    }

    /// Position of every survey row in the tile concatenation, i.e.
    /// `argsort(hstack(sorting))`.
    pub fn argsort(&self) -> Vec<usize> {
        let stacked: Vec<usize> = self.sorting.iter().flatten().copied().collect();
        let mut positions: Vec<usize> = (0..stacked.len()).collect();
        positions.sort_by_key(|&position| stacked[position]);
        positions
    }

    /// Reorder a tile-concatenated per-row vector into survey row order.
    pub fn restore_rows<T: Copy>(&self, stacked: &[T]) -> Vec<T> {
        self.argsort()
            .into_iter()
            .map(|position| stacked[position])
            .collect()
    }

    /// Scatter a tile-concatenated data vector into (rows, components).
    pub fn restore(&self, stacked: &Array1<f64>) -> Array2<f64> {
        let mut restored = Array2::from_elem((self.n_rows, self.n_components), f64::NAN);
        for (&[component, row], value) in self.ordering.iter().zip(stacked.iter()) {
            restored[[row, component]] = *value;
        }
        restored
    }
}

/// Builds one simulation and local misfit per tile.
pub struct MisfitFactory<'a> {
    params: &'a InversionParams,
    kind: InversionType,
    simulations: &'a dyn SimulationFactory,
}

impl<'a> MisfitFactory<'a> {
    pub fn new(
        params: &'a InversionParams,
        kind: InversionType,
        simulations: &'a dyn SimulationFactory,
    ) -> Self {
        Self {
            params,
            kind,
            simulations,
        }
    }

    pub fn build(
        &self,
        tiles: Vec<Tile>,
        data: &InversionData,
        mesh: &CellMesh,
        active_cells: &ActiveCells,
    ) -> Result<(ComboObjective, SortingPermutation), MisfitError> {
        let permutation = SortingPermutation::new(tiles, data.n_rows(), data.components().len())?;
        let now = Instant::now();
        let terms = permutation
            .sorting()
            .par_iter()
            .map(|rows| -> Result<Arc<L2DataMisfit>, MisfitError> {
                let request =
                    SimulationRequest::new(self.kind, self.params, data, rows, mesh, active_cells);
                let simulation = self.simulations.build(&request)?;
                Ok(Arc::new(L2DataMisfit::new(
                    simulation,
                    data.observed_rows(rows),
                    &data.uncertainty_rows(rows),
                )))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "Took {} to build {} local misfits.",
            format_duration(now.elapsed()),
            terms.len()
        );
        Ok((ComboObjective::combine(terms), permutation))
    }
}

/// Composite data misfit of a run and the permutation of its data.
#[derive(Clone)]
pub struct DataMisfit {
    objective_function: Arc<ComboObjective>,
    permutation: SortingPermutation,
}

impl DataMisfit {
    pub fn new(
        factory: &MisfitFactory<'_>,
        tiles: Vec<Tile>,
        data: &InversionData,
        mesh: &CellMesh,
        active_cells: &ActiveCells,
        logger: &InversionLogger,
    ) -> Result<Self, MisfitError> {
        logger.write_line(&format!("Setting up {} tile(s) . . .", tiles.len()));
        let (objective_function, permutation) = factory.build(tiles, data, mesh, active_cells)?;
        logger.write_line("Done.");
        Ok(Self {
            objective_function: Arc::new(objective_function),
            permutation,
        })
    }

    pub fn objective_function(&self) -> &Arc<ComboObjective> {
        &self.objective_function
    }

    pub fn sorting(&self) -> &[Tile] {
        self.permutation.sorting()
    }

    pub fn ordering(&self) -> &[[usize; 2]] {
        self.permutation.ordering()
    }

    pub fn permutation(&self) -> &SortingPermutation {
        &self.permutation
    }

    /// Predicted data in survey order, (rows, components).
    pub fn predicted(&self, model: &Array1<f64>) -> Array2<f64> {
        let predictions = self.objective_function.dpred_terms(model);
        let stacked: Array1<f64> = predictions
            .iter()
            .flat_map(|prediction| prediction.iter().copied())
            .collect();
        self.permutation.restore(&stacked)
    }
}

#[derive(Error, Debug)]
pub enum MisfitError {
    #[error("Tiles do not form a permutation of the survey rows: {0}")]
    InvalidSorting(String),
    #[error(transparent)]
    SimulationError(#[from] SimulationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::LinearSimulationFactory;
    use crate::tiling::tile_locations;
    use ndarray::array;

    fn survey() -> (InversionData, CellMesh, ActiveCells) {
        let n = 9;
        let mut locations = Array2::<f64>::zeros((n, 3));
        let mut observed = Array2::<f64>::zeros((n, 1));
        for i in 0..n {
            locations[[i, 0]] = 10.0 * (i % 3) as f64 + 100.0 * (i / 3) as f64;
            locations[[i, 2]] = 5.0;
            observed[[i, 0]] = i as f64;
        }
        let data = InversionData::new(
            "survey",
            locations,
            vec!["gz".to_string()],
            observed,
            Array2::ones((n, 1)),
        );
        let mesh = CellMesh::tensor([-10.0, -10.0, -20.0], &[30.0; 8], &[20.0], &[10.0, 10.0]);
        let active = ActiveCells::all(mesh.n_cells());
        (data, mesh, active)
    }

    #[test]
    fn test_sorting_must_be_a_permutation() {
        assert!(SortingPermutation::new(vec![vec![0, 2], vec![1]], 3, 1).is_ok());
        for tiles in [vec![vec![0, 1], vec![1]], vec![vec![0]], vec![vec![0, 1, 5]]] {
            assert!(matches!(
                SortingPermutation::new(tiles, 3, 1),
                Err(MisfitError::InvalidSorting(_))
            ));
        }
    }

    #[test]
    fn test_argsort_restores_original_order() {
        let permutation =
            SortingPermutation::new(vec![vec![4, 1], vec![0, 3], vec![2]], 5, 2).unwrap();
        let original = [10.0, 11.0, 12.0, 13.0, 14.0];
        let stacked: Vec<f64> = permutation
            .sorting()
            .iter()
            .flatten()
            .map(|&row| original[row])
            .collect();
        assert_eq!(permutation.restore_rows(&stacked), original.to_vec());
        assert_eq!(permutation.ordering()[0], [0, 4]);
        assert_eq!(permutation.ordering()[1], [1, 4]);
    }

    #[test]
    fn test_tiled_predictions_match_single_tile() {
        let (data, mesh, active) = survey();
        let params = InversionParams::default();
        let factory = MisfitFactory::new(&params, InversionType::Gravity, &LinearSimulationFactory);
        let model = Array1::from_iter((0..active.n_active()).map(|i| 0.1 * i as f64));

        let single = factory
            .build(vec![(0..data.n_rows()).collect()], &data, &mesh, &active)
            .unwrap();
        let tiles = tile_locations(data.locations().view(), 3).unwrap();
        let tiled = factory.build(tiles, &data, &mesh, &active).unwrap();

        let restore = |(objective, permutation): &(ComboObjective, SortingPermutation)| {
            let stacked: Array1<f64> = objective
                .dpred_terms(&model)
                .iter()
                .flat_map(|prediction| prediction.iter().copied())
                .collect();
            permutation.restore(&stacked)
        };
        let expected = restore(&single);
        let found = restore(&tiled);
        for (a, b) in expected.iter().zip(found.iter()) {
            assert!((a - b).abs() <= 1e-12 * a.abs().max(1.0));
        }
        let phi_single = single.0.eval(&model);
        let phi_tiled = tiled.0.eval(&model);
        assert!((phi_single - phi_tiled).abs() <= 1e-9 * phi_single.max(1.0));
    }

    #[test]
    fn test_ignored_data_carry_no_weight() {
        let (data, mesh, active) = survey();
        let params = InversionParams::default();
        let rows = [0usize, 1];
        let request =
            SimulationRequest::new(InversionType::Gravity, &params, &data, &rows, &mesh, &active);
        let simulation = LinearSimulationFactory.build(&request).unwrap();
        let misfit = L2DataMisfit::new(simulation, array![1.0, 2.0], &array![f64::INFINITY, 0.5]);
        assert_eq!(misfit.weights().to_vec(), vec![0.0, 2.0]);
        assert_eq!(misfit.n_weighted(), 1);
        let model = Array1::zeros(active.n_active());
        assert_eq!(misfit.eval(&model), 0.5 * 16.0);
    }
}
