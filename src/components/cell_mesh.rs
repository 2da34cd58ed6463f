// geoinv/src/components/cell_mesh.rs

use crate::workspace::Geometry;
use ndarray::{Array1, Array2};

/// Two neighbouring cells sharing a face, `length` apart.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellPair {
    pub a: usize,
    pub b: usize,
    pub length: f64,
}

/// Geometry-agnostic view of a mesh: cell centres, volumes and the
/// neighbour pairs along each axis used by the smoothness operators.
#[derive(Clone, Debug)]
pub struct CellMesh {
    centers: Array2<f64>,
    volumes: Array1<f64>,
    faces: [Vec<CellPair>; 3],
}

impl CellMesh {
    pub fn tensor(origin: [f64; 3], hx: &[f64], hy: &[f64], hz: &[f64]) -> Self {
        let (nx, ny, nz) = (hx.len(), hy.len(), hz.len());
        let cx = cell_centres(origin[0], hx);
        let cy = cell_centres(origin[1], hy);
        let cz = cell_centres(origin[2], hz);
        let n_cells = nx * ny * nz;
        let index = |i: usize, j: usize, k: usize| i + nx * (j + ny * k);

        let mut centers = Array2::<f64>::zeros((n_cells, 3));
        let mut volumes = Array1::<f64>::zeros(n_cells);
        let mut faces: [Vec<CellPair>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let c = index(i, j, k);
                    centers[[c, 0]] = cx[i];
                    centers[[c, 1]] = cy[j];
                    centers[[c, 2]] = cz[k];
                    volumes[c] = hx[i] * hy[j] * hz[k];
                    if i + 1 < nx {
                        faces[0].push(CellPair {
                            a: c,
                            b: index(i + 1, j, k),
                            length: cx[i + 1] - cx[i],
                        });
                    }
                    if j + 1 < ny {
                        faces[1].push(CellPair {
                            a: c,
                            b: index(i, j + 1, k),
                            length: cy[j + 1] - cy[j],
                        });
                    }
                    if k + 1 < nz {
                        faces[2].push(CellPair {
                            a: c,
                            b: index(i, j, k + 1),
                            length: cz[k + 1] - cz[k],
                        });
                    }
                }
            }
        }
        Self {
            centers,
            volumes,
            faces,
        }
    }

    pub fn drape(stations: &[[f64; 3]], layers: &[f64], width: f64) -> Self {
        let n_layers = layers.len();
        let n_cells = stations.len() * n_layers;
        let mut depth_to_centre = Vec::with_capacity(n_layers);
        let mut top = 0.0;
        for thickness in layers {
            depth_to_centre.push(top + 0.5 * thickness);
            top += thickness;
        }

        let mut centers = Array2::<f64>::zeros((n_cells, 3));
        let mut volumes = Array1::<f64>::zeros(n_cells);
        let mut faces: [Vec<CellPair>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for (s, station) in stations.iter().enumerate() {
            for (l, thickness) in layers.iter().enumerate() {
                let c = s * n_layers + l;
                centers[[c, 0]] = station[0];
                centers[[c, 1]] = station[1];
                centers[[c, 2]] = station[2] - depth_to_centre[l];
                volumes[c] = width * width * thickness;
                if let Some(next) = stations.get(s + 1) {
                    let spacing =
                        ((next[0] - station[0]).powi(2) + (next[1] - station[1]).powi(2)).sqrt();
                    faces[0].push(CellPair {
                        a: c,
                        b: c + n_layers,
                        length: spacing.max(f64::EPSILON),
                    });
                }
                if l + 1 < n_layers {
                    faces[2].push(CellPair {
                        a: c,
                        b: c + 1,
                        length: 0.5 * (thickness + layers[l + 1]),
                    });
                }
            }
        }
        Self {
            centers,
            volumes,
            faces,
        }
    }

    pub fn from_geometry(geometry: &Geometry) -> Option<Self> {
        match geometry {
            Geometry::TensorMesh { origin, hx, hy, hz } => Some(Self::tensor(*origin, hx, hy, hz)),
            Geometry::DrapeModel {
                stations,
                layers,
                width,
            } => Some(Self::drape(stations, layers, *width)),
            _ => None,
        }
    }

    pub fn n_cells(&self) -> usize {
        self.volumes.len()
    }

    pub fn centers(&self) -> &Array2<f64> {
        &self.centers
    }

    pub fn volumes(&self) -> &Array1<f64> {
        &self.volumes
    }

    pub fn faces(&self, axis: usize) -> &[CellPair] {
        &self.faces[axis]
    }

    /// [xmin, xmax, ymin, ymax] of the cell centres.
    pub fn horizontal_extent(&self) -> [f64; 4] {
        let mut extent = [
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
        ];
        for row in self.centers.rows() {
            extent[0] = extent[0].min(row[0]);
            extent[1] = extent[1].max(row[0]);
            extent[2] = extent[2].min(row[1]);
            extent[3] = extent[3].max(row[1]);
        }
        extent
    }
}

fn cell_centres(origin: f64, widths: &[f64]) -> Vec<f64> {
    let mut edge = origin;
    widths
        .iter()
        .map(|width| {
            let centre = edge + 0.5 * width;
            edge += width;
            centre
        })
        .collect()
}
