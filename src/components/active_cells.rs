// geoinv/src/components/active_cells.rs

use super::cell_mesh::{CellMesh, CellPair};
use ndarray::{Array1, ArrayView1};

/// Read-only mask of mesh cells taking part in the model.
#[derive(Clone, Debug)]
pub struct ActiveCells {
    mask: Vec<bool>,
    index: Vec<usize>,
    lookup: Vec<Option<usize>>,
}

impl ActiveCells {
    pub fn new(mask: Vec<bool>) -> Self {
        let mut index = Vec::new();
        let mut lookup = vec![None; mask.len()];
        for (cell, &active) in mask.iter().enumerate() {
            if active {
                lookup[cell] = Some(index.len());
                index.push(cell);
            }
        }
        Self {
            mask,
            index,
            lookup,
        }
    }

    pub fn all(n_cells: usize) -> Self {
        Self::new(vec![true; n_cells])
    }

    pub fn n_cells(&self) -> usize {
        self.mask.len()
    }

    pub fn n_active(&self) -> usize {
        self.index.len()
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Mesh cell index of every active cell.
    pub fn global_index(&self) -> &[usize] {
        &self.index
    }

    pub fn local(&self, cell: usize) -> Option<usize> {
        self.lookup.get(cell).copied().flatten()
    }

    /// Neighbour pairs along `axis` with both cells active, in active numbering.
    pub fn reduce_faces(&self, mesh: &CellMesh, axis: usize) -> Vec<CellPair> {
        mesh.faces(axis)
            .iter()
            .filter_map(|pair| match (self.local(pair.a), self.local(pair.b)) {
                (Some(a), Some(b)) => Some(CellPair {
                    a,
                    b,
                    length: pair.length,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn restrict(&self, values: ArrayView1<f64>) -> Array1<f64> {
        self.index.iter().map(|&cell| values[cell]).collect()
    }

    /// Full-mesh vector with NaN on inactive cells.
    pub fn expand(&self, values: ArrayView1<f64>) -> Vec<f64> {
        let mut full = vec![f64::NAN; self.mask.len()];
        for (&cell, &value) in self.index.iter().zip(values.iter()) {
            full[cell] = value;
        }
        full
    }
}
