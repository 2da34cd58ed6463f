// geoinv/src/components/nearest.rs

use super::ComponentError;
use linfa_nn::{distance::L2Dist, CommonNearestNeighbour, NearestNeighbour};
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Index of the closest `reference` row for every `queries` row.
pub fn nearest_indices(
    reference: ArrayView2<f64>,
    queries: ArrayView2<f64>,
) -> Result<Vec<usize>, ComponentError> {
    if reference.nrows() == 0 {
        return Err(ComponentError::EmptyReference);
    }
    let reference: Array2<f64> = reference.to_owned();
    let index = CommonNearestNeighbour::KdTree.from_batch(&reference, L2Dist)?;
    queries
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|query| {
            let found = index.k_nearest(query, 1)?;
            found
                .first()
                .map(|(_, position)| *position)
                .ok_or(ComponentError::EmptyReference)
        })
        .collect()
}

/// First two columns of a location array.
pub fn horizontal(locations: ArrayView2<f64>) -> Array2<f64> {
    locations.slice(ndarray::s![.., 0..2]).to_owned()
}
