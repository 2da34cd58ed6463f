// geoinv/src/simulation/tile_map.rs

use crate::components::{horizontal, nearest_indices, ActiveCells, CellMesh, ComponentError};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Active cells seen by one tile, and the model parameters they own.
#[derive(Clone, Debug)]
pub struct TileMap {
    n_active: usize,
    n_components: usize,
    cells: Vec<usize>,
    parameters: Vec<usize>,
}

impl TileMap {
    /// Every active cell, or those within `max_distance` (horizontally) of
    /// one of `receivers`.
    pub fn new(
        mesh: &CellMesh,
        active_cells: &ActiveCells,
        receivers: ArrayView2<f64>,
        n_components: usize,
        max_distance: Option<f64>,
    ) -> Result<Self, ComponentError> {
        let n_active = active_cells.n_active();
        let cells: Vec<usize> = match max_distance {
            Some(distance) if receivers.nrows() > 0 => {
                let centers = active_centers(mesh, active_cells);
                let reference = horizontal(receivers);
                let queries = horizontal(centers.view());
                let nearest = nearest_indices(reference.view(), queries.view())?;
                nearest
                    .iter()
                    .enumerate()
                    .filter(|(cell, &receiver)| {
                        let dx = queries[[*cell, 0]] - reference[[receiver, 0]];
                        let dy = queries[[*cell, 1]] - reference[[receiver, 1]];
                        dx.hypot(dy) <= distance
                    })
                    .map(|(cell, _)| cell)
                    .collect()
            }
            _ => (0..n_active).collect(),
        };
        Ok(Self::from_cells(n_active, cells, n_components))
    }

    pub fn from_cells(n_active: usize, cells: Vec<usize>, n_components: usize) -> Self {
        let parameters = (0..n_components)
            .flat_map(|component| cells.iter().map(move |cell| component * n_active + cell))
            .collect();
        Self {
            n_active,
            n_components,
            cells,
            parameters,
        }
    }

    /// Local cells, as indices into the active cells.
    pub fn cells(&self) -> &[usize] {
        &self.cells
    }

    pub fn n_local(&self) -> usize {
        self.parameters.len()
    }

    pub fn n_global(&self) -> usize {
        self.n_active * self.n_components
    }

    pub fn project(&self, model: &Array1<f64>) -> Array1<f64> {
        self.parameters.iter().map(|&p| model[p]).collect()
    }

    /// Add local values into a global parameter vector.
    pub fn scatter_add(&self, local: &Array1<f64>, global: &mut Array1<f64>) {
        for (&p, value) in self.parameters.iter().zip(local.iter()) {
            global[p] += value;
        }
    }
}

/// Centres of the active cells, in active order.
pub fn active_centers(mesh: &CellMesh, active_cells: &ActiveCells) -> Array2<f64> {
    mesh.centers().select(Axis(0), active_cells.global_index())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_max_distance_limits_cells() {
        let mesh = CellMesh::tensor([0.0, 0.0, -10.0], &[10.0; 5], &[10.0], &[10.0]);
        let active = ActiveCells::all(5);
        let receivers = array![[5.0, 5.0, 1.0]];
        let map = TileMap::new(&mesh, &active, receivers.view(), 1, Some(15.0)).unwrap();
        assert_eq!(map.cells(), &[0, 1]);
        let all = TileMap::new(&mesh, &active, receivers.view(), 1, None).unwrap();
        assert_eq!(all.n_local(), 5);
    }

    #[test]
    fn test_vector_parameters_span_component_blocks() {
        let map = TileMap::from_cells(4, vec![1, 3], 3);
        assert_eq!(map.n_local(), 6);
        assert_eq!(map.n_global(), 12);
        let model = Array1::from_iter((0..12).map(|v| v as f64));
        assert_eq!(map.project(&model).to_vec(), vec![1.0, 3.0, 5.0, 7.0, 9.0, 11.0]);
        let mut global = Array1::zeros(12);
        map.scatter_add(&Array1::ones(6), &mut global);
        assert_eq!(global.sum(), 6.0);
        assert_eq!(global[7], 1.0);
    }
}
