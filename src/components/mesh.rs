// geoinv/src/components/mesh.rs

use super::cell_mesh::CellMesh;
use super::data::InversionData;
use super::topography::InversionTopography;
use super::ComponentError;
use crate::params::{InversionParams, InversionType};
use crate::workspace::{Geometry, Workspace};
use log::info;

/// Growth factor of padding cells.
const PADDING_EXPANSION: f64 = 1.3;

/// Mesh the model lives on, either read from the workspace or designed
/// around the survey.
#[derive(Clone, Debug)]
pub struct InversionMesh {
    name: String,
    geometry: Geometry,
    mesh: CellMesh,
    from_workspace: bool,
}

impl InversionMesh {
    pub fn from_geometry(name: &str, geometry: Geometry) -> Result<Self, ComponentError> {
        let mesh = CellMesh::from_geometry(&geometry).ok_or_else(|| {
            ComponentError::UnexpectedGeometry {
                name: name.to_string(),
                expected: "TensorMesh or DrapeModel",
                found: geometry.kind(),
            }
        })?;
        Ok(Self {
            name: name.to_string(),
            geometry,
            mesh,
            from_workspace: false,
        })
    }

    pub fn resolve(
        workspace: &Workspace,
        params: &InversionParams,
        kind: InversionType,
        data: &InversionData,
        topography: &InversionTopography,
    ) -> Result<Self, ComponentError> {
        if kind.is_2d() {
            let geometry = drape_along_line(params, data, topography)?;
            return Self::from_geometry("Line mesh", geometry);
        }
        if let Some(name) = params.mesh.as_deref() {
            let entity = workspace.get_entity(name)?;
            let mut mesh = Self::from_geometry(name, entity.geometry.clone())?;
            mesh.from_workspace = true;
            info!("Using mesh '{}' with {} cells", name, mesh.mesh.n_cells());
            return Ok(mesh);
        }
        let geometry = tensor_around_survey(params, data, topography);
        let mesh = Self::from_geometry("Inversion mesh", geometry)?;
        info!("Designed tensor mesh with {} cells", mesh.mesh.n_cells());
        Ok(mesh)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn mesh(&self) -> &CellMesh {
        &self.mesh
    }

    /// True when the mesh is an existing workspace entity carrying model channels.
    pub fn is_workspace_entity(&self) -> bool {
        self.from_workspace
    }
}

/// Geometrically growing cells covering at least `distance`, smallest first.
fn padding_cells(size: f64, distance: f64) -> Vec<f64> {
    let mut cells = Vec::new();
    let mut covered = 0.0;
    let mut width = size;
    while covered < distance {
        width *= PADDING_EXPANSION;
        covered += width;
        cells.push(width);
    }
    cells
}

fn core_cells(length: f64, size: f64) -> usize {
    ((length / size).ceil() as usize).max(1)
}

/// Core cells of width `size` over `length` flanked by padding on both
/// sides. Returns the padding thickness and the cell widths.
fn padded_widths(length: f64, size: f64, padding: f64) -> (f64, Vec<f64>) {
    let pad = padding_cells(size, padding);
    let mut widths: Vec<f64> = pad.iter().rev().copied().collect();
    widths.extend(std::iter::repeat(size).take(core_cells(length, size)));
    widths.extend(pad.iter().copied());
    (pad.iter().sum(), widths)
}

fn tensor_around_survey(
    params: &InversionParams,
    data: &InversionData,
    topography: &InversionTopography,
) -> Geometry {
    let locations = data.locations();
    let (mut xmin, mut xmax, mut ymin, mut ymax, mut ztop) = (
        f64::INFINITY,
        f64::NEG_INFINITY,
        f64::INFINITY,
        f64::NEG_INFINITY,
        f64::NEG_INFINITY,
    );
    for row in locations.rows() {
        xmin = xmin.min(row[0]);
        xmax = xmax.max(row[0]);
        ymin = ymin.min(row[1]);
        ymax = ymax.max(row[1]);
        ztop = ztop.max(row[2]);
    }
    for row in topography.locations().rows() {
        if row[0] >= xmin && row[0] <= xmax && row[1] >= ymin && row[1] <= ymax {
            ztop = ztop.max(row[2]);
        }
    }

    let (pad_x, hx) = padded_widths(xmax - xmin, params.u_cell_size, params.horizontal_padding);
    let (pad_y, hy) = padded_widths(ymax - ymin, params.v_cell_size, params.horizontal_padding);
    // Bottom padding, the core, and one layer of air above the highest point.
    let w = params.w_cell_size;
    let mut hz: Vec<f64> = padding_cells(w, params.vertical_padding)
        .into_iter()
        .rev()
        .collect();
    hz.extend(std::iter::repeat(w).take(core_cells(params.depth_core, w) + 1));
    let depth: f64 = hz.iter().sum();
    Geometry::TensorMesh {
        origin: [xmin - pad_x, ymin - pad_y, ztop + w - depth],
        hx,
        hy,
        hz,
    }
}

fn drape_along_line(
    params: &InversionParams,
    data: &InversionData,
    topography: &InversionTopography,
) -> Result<Geometry, ComponentError> {
    let locations = data.locations();
    let mut stations: Vec<[f64; 3]> = locations
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1], row[2]])
        .collect();
    let spans_x = span(&stations, 0) >= span(&stations, 1);
    let axis = if spans_x { 0 } else { 1 };
    stations.sort_by(|a, b| a[axis].total_cmp(&b[axis]));
    stations.dedup_by(|a, b| (a[0] - b[0]).hypot(a[1] - b[1]) < 0.5 * params.u_cell_size);

    let mut points = ndarray::Array2::<f64>::zeros((stations.len(), 3));
    for (mut row, station) in points.rows_mut().into_iter().zip(&stations) {
        row[0] = station[0];
        row[1] = station[1];
    }
    let elevation = topography.elevation_at(points.view())?;
    for (station, z) in stations.iter_mut().zip(elevation.iter()) {
        station[2] = *z;
    }

    let mut layers = vec![params.w_cell_size; core_cells(params.depth_core, params.w_cell_size)];
    layers.extend(padding_cells(params.w_cell_size, params.vertical_padding));
    Ok(Geometry::DrapeModel {
        stations,
        layers,
        width: params.u_cell_size,
    })
}

fn span(points: &[[f64; 3]], axis: usize) -> f64 {
    let (lo, hi) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        (lo.min(p[axis]), hi.max(p[axis]))
    });
    hi - lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn survey() -> InversionData {
        let locations = array![[0.0, 0.0, 10.0], [100.0, 0.0, 10.0], [50.0, 100.0, 10.0]];
        InversionData::new(
            "survey",
            locations,
            vec!["gz".to_string()],
            Array2::zeros((3, 1)),
            Array2::ones((3, 1)),
        )
    }

    #[test]
    fn test_padding_grows_geometrically() {
        let (covered, widths) = padded_widths(100.0, 10.0, 25.0);
        assert_eq!(widths.len(), 10 + 2 * 2);
        assert!(covered >= 25.0);
        assert!(widths[0] > widths[1]);
        assert_eq!(widths[2], 10.0);
    }

    #[test]
    fn test_designed_mesh_covers_survey_below_surface() {
        let mut params = InversionParams::default();
        params.u_cell_size = 10.0;
        params.v_cell_size = 10.0;
        params.w_cell_size = 10.0;
        params.depth_core = 50.0;
        params.horizontal_padding = 20.0;
        params.vertical_padding = 20.0;
        let topography = InversionTopography::new(array![[50.0, 50.0, 0.0]], "topo");
        let geometry = tensor_around_survey(&params, &survey(), &topography);
        let mesh = CellMesh::from_geometry(&geometry).unwrap();
        let [xmin, xmax, ymin, ymax] = mesh.horizontal_extent();
        assert!(xmin < 0.0 && xmax > 100.0 && ymin < 0.0 && ymax > 100.0);
        let top = mesh
            .centers()
            .column(2)
            .iter()
            .fold(f64::NEG_INFINITY, |acc, z| acc.max(*z));
        assert!(top > 10.0);
    }

    #[test]
    fn test_two_dimensional_runs_drape_the_line() {
        let mut params = InversionParams::default();
        params.u_cell_size = 5.0;
        params.depth_core = 20.0;
        params.w_cell_size = 10.0;
        params.vertical_padding = 0.0;
        let locations = array![[20.0, 0.0, 0.0], [0.0, 0.0, 0.0], [10.0, 0.0, 0.0]];
        let data = InversionData::new(
            "line",
            locations,
            vec!["potential".to_string()],
            Array2::zeros((3, 1)),
            Array2::ones((3, 1)),
        );
        let topography = InversionTopography::new(array![[0.0, 0.0, 7.0]], "topo");
        let geometry = drape_along_line(&params, &data, &topography).unwrap();
        match geometry {
            Geometry::DrapeModel {
                stations, layers, ..
            } => {
                assert_eq!(stations.len(), 3);
                assert_eq!(stations[0], [0.0, 0.0, 7.0]);
                assert_eq!(stations[2][0], 20.0);
                assert_eq!(layers, vec![10.0, 10.0]);
            }
            other => panic!("unexpected geometry {}", other.kind()),
        }
    }
}
