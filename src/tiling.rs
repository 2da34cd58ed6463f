// geoinv/src/tiling.rs

//! Partition of the survey rows into tiles evaluated independently.

use crate::components::{horizontal, ElectrodeSurvey, InversionData};
use crate::params::{InversionType, TilingStrategy};
use humantime::format_duration;
use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_clustering::{KMeans, KMeansError};
use ndarray::{ArrayView2, ShapeError};
use std::collections::{BTreeSet, HashSet};
use std::time::Instant;
use thiserror::Error;

/// Row indices into the retained survey, ascending.
pub type Tile = Vec<usize>;

pub fn get_tiles(
    data: &InversionData,
    kind: InversionType,
    tile_spatial: usize,
) -> Result<Vec<Tile>, TilingError> {
    if data.n_rows() == 0 {
        return Err(TilingError::EmptySurvey);
    }
    match kind.tiling_strategy() {
        TilingStrategy::SingleTile => Ok(vec![(0..data.n_rows()).collect()]),
        TilingStrategy::ElectrodeLines => {
            let survey = data
                .electrodes()
                .ok_or_else(|| TilingError::MissingElectrodes(data.entity_name().to_string()))?;
            Ok(tile_electrode_lines(survey, tile_spatial))
        }
        TilingStrategy::Clustering => tile_locations(data.locations().view(), tile_spatial),
    }
}

/// Cluster horizontal locations into at most `n_tiles` groups. Fewer
/// distinct locations than tiles yields fewer tiles.
pub fn tile_locations(
    locations: ArrayView2<f64>,
    n_tiles: usize,
) -> Result<Vec<Tile>, TilingError> {
    let n_rows = locations.nrows();
    if n_rows == 0 {
        return Err(TilingError::EmptySurvey);
    }
    let unique = locations
        .rows()
        .into_iter()
        .map(|row| (row[0].to_bits(), row[1].to_bits()))
        .collect::<HashSet<_>>()
        .len();
    let n_clusters = n_tiles.clamp(1, unique);
    if n_clusters == 1 {
        return Ok(vec![(0..n_rows).collect()]);
    }
    log::info!(
        "Begin clustering {} locations into {} tiles",
        n_rows,
        n_clusters
    );
    let now = Instant::now();
    let observations = DatasetBase::from(horizontal(locations));
    let model = KMeans::params(n_clusters).fit(&observations)?;
    let predictions = model.predict(observations);
    let targets = predictions.targets();
    let mut tiles: Vec<Tile> = vec![Vec::new(); n_clusters];
    for (row, &cluster) in targets.iter().enumerate() {
        tiles[cluster].push(row);
    }
    tiles.retain(|tile| !tile.is_empty());
    log::debug!(
        "Took {} to cluster {} tiles.",
        format_duration(now.elapsed()),
        tiles.len()
    );
    Ok(tiles)
}

/// Split the survey lines into contiguous chunks so that no line is shared
/// between tiles. A chunk whose lines carry no data gives an empty tile.
pub fn tile_electrode_lines(survey: &ElectrodeSurvey, n_tiles: usize) -> Vec<Tile> {
    let lines = survey.lines();
    let row_lines = survey.row_lines();
    split_contiguous(&lines, n_tiles)
        .into_iter()
        .map(|chunk| {
            let chunk: BTreeSet<i64> = chunk.iter().copied().collect();
            let tile: Tile = row_lines
                .iter()
                .enumerate()
                .filter(|(_, line)| chunk.contains(line))
                .map(|(row, _)| row)
                .collect();
            if tile.is_empty() {
                log::warn!("Survey lines {:?} have no data; keeping an empty tile", chunk);
            }
            tile
        })
        .collect()
}

/// `n` contiguous chunks differing in length by at most one, the longer
/// chunks first. Never more chunks than items.
fn split_contiguous<T>(items: &[T], n: usize) -> Vec<&[T]> {
    let n = n.clamp(1, items.len().max(1));
    let base = items.len() / n;
    let extra = items.len() % n;
    let mut chunks = Vec::with_capacity(n);
    let mut start = 0;
    for chunk in 0..n {
        let len = base + usize::from(chunk < extra);
        chunks.push(&items[start..start + len]);
        start += len;
    }
    chunks
}

#[derive(Error, Debug)]
pub enum TilingError {
    #[error("Cannot tile a survey without data")]
    EmptySurvey,
    #[error("Data object '{0}' has no electrode topology")]
    MissingElectrodes(String),
    #[error(transparent)]
    NDArrayShapeError(#[from] ShapeError),
    #[error(transparent)]
    KMeansError(#[from] KMeansError),
}
