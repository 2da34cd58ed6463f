// geoinv/src/components/topography.rs

use super::active_cells::ActiveCells;
use super::cell_mesh::CellMesh;
use super::data::InversionData;
use super::mesh::InversionMesh;
use super::nearest::{horizontal, nearest_indices};
use super::ComponentError;
use crate::params::InversionParams;
use crate::workspace::{Geometry, Workspace, WorkspaceError};
use log::debug;
use ndarray::{Array1, Array2, ArrayView2};

/// Topographic surface sampled at scattered vertices.
#[derive(Clone, Debug)]
pub struct InversionTopography {
    name: String,
    locations: Array2<f64>,
}

impl InversionTopography {
    pub fn new(locations: Array2<f64>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            locations,
        }
    }

    pub fn from_workspace(
        workspace: &Workspace,
        params: &InversionParams,
    ) -> Result<Self, ComponentError> {
        let name = params
            .topography_object
            .as_deref()
            .ok_or(ComponentError::MissingParameter("topography_object"))?;
        let entity = workspace.get_entity(name)?;
        let mut locations = entity.geometry.element_locations();
        if let Some(channel) = params.topography.as_deref() {
            let elevation =
                entity
                    .get_data(channel)
                    .ok_or_else(|| WorkspaceError::ChannelNotFound {
                        entity: name.to_string(),
                        channel: channel.to_string(),
                    })?;
            for (mut row, z) in locations.rows_mut().into_iter().zip(elevation) {
                row[2] = *z;
            }
        }
        debug!("Topography '{}' with {} vertices", name, locations.nrows());
        Ok(Self::new(locations, name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locations(&self) -> &Array2<f64> {
        &self.locations
    }

    /// Elevation of the closest topography vertex for every location.
    pub fn elevation_at(&self, locations: ArrayView2<f64>) -> Result<Array1<f64>, ComponentError> {
        let reference = horizontal(self.locations.view());
        let queries = horizontal(locations);
        let nearest = nearest_indices(reference.view(), queries.view())?;
        Ok(nearest
            .into_iter()
            .map(|vertex| self.locations[[vertex, 2]])
            .collect())
    }

    /// Mask of the cells of `cells` whose centre lies below the surface.
    pub fn below_surface(&self, cells: &CellMesh) -> Result<ActiveCells, ComponentError> {
        let elevation = self.elevation_at(cells.centers().view())?;
        let mask: Vec<bool> = cells
            .centers()
            .column(2)
            .iter()
            .zip(elevation.iter())
            .map(|(z, surface)| z < surface)
            .collect();
        Ok(ActiveCells::new(mask))
    }

    /// Cells whose centre lies below the local topography. Drape models
    /// already follow the surface, so all their cells are active.
    pub fn active_cells(
        &self,
        mesh: &InversionMesh,
        data: &InversionData,
    ) -> Result<ActiveCells, ComponentError> {
        let cells = mesh.mesh();
        if matches!(mesh.geometry(), Geometry::DrapeModel { .. }) {
            return Ok(ActiveCells::all(cells.n_cells()));
        }
        let [xmin, xmax, ymin, ymax] = cells.horizontal_extent();
        let overlaps = data.locations().rows().into_iter().any(|row| {
            row[0] >= xmin && row[0] <= xmax && row[1] >= ymin && row[1] <= ymax
        });
        if !overlaps {
            return Err(ComponentError::IncompatibleMesh {
                mesh: mesh.name().to_string(),
                data: data.entity_name().to_string(),
            });
        }
        let active = self.below_surface(cells)?;
        if active.n_active() == 0 {
            return Err(ComponentError::NoActiveCells {
                mesh: mesh.name().to_string(),
                topography: self.name.clone(),
            });
        }
        debug!(
            "{} of {} cells active below '{}'",
            active.n_active(),
            active.n_cells(),
            self.name
        );
        Ok(active)
    }
}
