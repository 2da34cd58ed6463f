// geoinv/src/workspace/entity.rs

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Channel values; NaN marks "no value" and is stored as JSON null.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Option<f64>>", into = "Vec<Option<f64>>")]
pub struct Values(pub Vec<f64>);

impl From<Vec<Option<f64>>> for Values {
    fn from(values: Vec<Option<f64>>) -> Self {
        Values(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

impl From<Values> for Vec<Option<f64>> {
    fn from(values: Values) -> Self {
        values
            .0
            .into_iter()
            .map(|v| if v.is_nan() { None } else { Some(v) })
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Points {
        vertices: Vec<[f64; 3]>,
    },
    /// Transmitter dipoles; `parts` holds the survey line of every vertex.
    CurrentElectrodes {
        vertices: Vec<[f64; 3]>,
        cells: Vec<[usize; 2]>,
        parts: Vec<i64>,
    },
    /// Receiver dipoles; `ab_cell_id` is the 1-based current dipole of each cell.
    PotentialElectrodes {
        vertices: Vec<[f64; 3]>,
        cells: Vec<[usize; 2]>,
        ab_cell_id: Vec<usize>,
        current_electrodes: String,
    },
    /// Rectilinear mesh; `origin` is the south-west-bottom corner, cells are
    /// numbered x fastest, then y, then z (bottom up).
    TensorMesh {
        origin: [f64; 3],
        hx: Vec<f64>,
        hy: Vec<f64>,
        hz: Vec<f64>,
    },
    /// Columns of cells hanging below line stations; `layers` are thicknesses
    /// from the top down. Cells are numbered station-major.
    DrapeModel {
        stations: Vec<[f64; 3]>,
        layers: Vec<f64>,
        width: f64,
    },
}

impl Geometry {
    /// Number of values a data channel must carry.
    pub fn n_elements(&self) -> usize {
        match self {
            Geometry::Points { vertices } => vertices.len(),
            Geometry::CurrentElectrodes { cells, .. } => cells.len(),
            Geometry::PotentialElectrodes { cells, .. } => cells.len(),
            Geometry::TensorMesh { hx, hy, hz, .. } => hx.len() * hy.len() * hz.len(),
            Geometry::DrapeModel {
                stations, layers, ..
            } => stations.len() * layers.len(),
        }
    }

    /// Connectivity of electrode cells against their vertices.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Geometry::CurrentElectrodes {
                vertices,
                cells,
                parts,
            } => {
                check_cells(cells, vertices.len())?;
                if parts.len() != vertices.len() {
                    return Err(format!(
                        "{} parts for {} vertices",
                        parts.len(),
                        vertices.len()
                    ));
                }
                Ok(())
            }
            Geometry::PotentialElectrodes {
                vertices,
                cells,
                ab_cell_id,
                ..
            } => {
                check_cells(cells, vertices.len())?;
                if ab_cell_id.len() != cells.len() {
                    return Err(format!(
                        "{} ab_cell_id values for {} cells",
                        ab_cell_id.len(),
                        cells.len()
                    ));
                }
                Ok(())
            }
            Geometry::Points { .. } | Geometry::TensorMesh { .. } | Geometry::DrapeModel { .. } => {
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Points { .. } => "Points",
            Geometry::CurrentElectrodes { .. } => "CurrentElectrodes",
            Geometry::PotentialElectrodes { .. } => "PotentialElectrodes",
            Geometry::TensorMesh { .. } => "TensorMesh",
            Geometry::DrapeModel { .. } => "DrapeModel",
        }
    }

    /// One location per data element (dipole midpoints for electrodes).
    pub fn element_locations(&self) -> Array2<f64> {
        let rows: Vec<[f64; 3]> = match self {
            Geometry::Points { vertices } => vertices.clone(),
            Geometry::CurrentElectrodes {
                vertices, cells, ..
            }
            | Geometry::PotentialElectrodes {
                vertices, cells, ..
            } => cells
                .iter()
                .map(|&[a, b]| {
                    let (pa, pb) = (vertices[a], vertices[b]);
                    [
                        0.5 * (pa[0] + pb[0]),
                        0.5 * (pa[1] + pb[1]),
                        0.5 * (pa[2] + pb[2]),
                    ]
                })
                .collect(),
            Geometry::TensorMesh { .. } | Geometry::DrapeModel { .. } => {
                return crate::components::CellMesh::from_geometry(self)
                    .map(|mesh| mesh.centers().to_owned())
                    .unwrap_or_else(|| Array2::zeros((0, 3)))
            }
        };
        let mut locations = Array2::<f64>::zeros((rows.len(), 3));
        for (mut row, xyz) in locations.rows_mut().into_iter().zip(rows.iter()) {
            row[0] = xyz[0];
            row[1] = xyz[1];
            row[2] = xyz[2];
        }
        locations
    }
}

fn check_cells(cells: &[[usize; 2]], n_vertices: usize) -> Result<(), String> {
    match cells.iter().flatten().find(|&&vertex| vertex >= n_vertices) {
        Some(vertex) => Err(format!(
            "cell refers to vertex {} of {}",
            vertex, n_vertices
        )),
        None => Ok(()),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub geometry: Geometry,
    #[serde(default)]
    pub data: BTreeMap<String, Values>,
}

impl Entity {
    pub fn new(name: &str, geometry: Geometry) -> Self {
        Self {
            name: name.to_string(),
            group: None,
            geometry,
            data: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn n_elements(&self) -> usize {
        self.geometry.n_elements()
    }

    pub fn get_data(&self, name: &str) -> Option<&[f64]> {
        self.data.get(name).map(|values| values.0.as_slice())
    }

    /// Copy of the entity geometry without any data channels.
    pub fn copy_geometry(&self, name: &str) -> Entity {
        Entity::new(name, self.geometry.clone())
    }

    /// Geometry connectivity and the length of every channel.
    pub fn validate(&self) -> Result<(), EntityError> {
        self.geometry
            .check()
            .map_err(|reason| EntityError::InvalidGeometry {
                entity: self.name.clone(),
                reason,
            })?;
        let expected = self.n_elements();
        for (channel, values) in &self.data {
            if values.0.len() != expected {
                return Err(DataLengthError {
                    entity: self.name.clone(),
                    channel: channel.clone(),
                    expected,
                    found: values.0.len(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn add_data(&mut self, name: &str, values: Vec<f64>) -> Result<(), DataLengthError> {
        if values.len() != self.n_elements() {
            return Err(DataLengthError {
                entity: self.name.clone(),
                channel: name.to_string(),
                expected: self.n_elements(),
                found: values.len(),
            });
        }
        self.data.insert(name.to_string(), Values(values));
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Channel '{channel}' on '{entity}' needs {expected} values, got {found}")]
pub struct DataLengthError {
    pub entity: String,
    pub channel: String,
    pub expected: usize,
    pub found: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum EntityError {
    #[error("Entity '{entity}' has an invalid geometry: {reason}")]
    InvalidGeometry { entity: String, reason: String },
    #[error(transparent)]
    DataLengthError(#[from] DataLengthError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_survives_serialization() {
        let mut entity = Entity::new(
            "obs",
            Geometry::Points {
                vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            },
        );
        entity.add_data("Iteration_0_gz", vec![1.5, f64::NAN]).unwrap();
        let text = serde_json::to_string(&entity).unwrap();
        assert!(text.contains("null"));
        let back: Entity = serde_json::from_str(&text).unwrap();
        let values = back.get_data("Iteration_0_gz").unwrap();
        assert_eq!(values[0], 1.5);
        assert!(values[1].is_nan());
    }

    #[test]
    fn test_electrode_locations_are_dipole_midpoints() {
        let geometry = Geometry::CurrentElectrodes {
            vertices: vec![[0.0, 0.0, 0.0], [10.0, 0.0, -2.0]],
            cells: vec![[0, 1]],
            parts: vec![1, 1],
        };
        let locations = geometry.element_locations();
        assert_eq!(locations.nrows(), 1);
        assert_eq!(locations[[0, 0]], 5.0);
        assert_eq!(locations[[0, 2]], -1.0);
    }

    #[test]
    fn test_add_data_checks_length() {
        let mut entity = Entity::new(
            "mesh",
            Geometry::TensorMesh {
                origin: [0.0; 3],
                hx: vec![1.0; 2],
                hy: vec![1.0; 2],
                hz: vec![1.0; 2],
            },
        );
        assert!(entity.add_data("model", vec![0.0; 8]).is_ok());
        assert!(entity.add_data("model", vec![0.0; 7]).is_err());
    }

    #[test]
    fn test_validate_rejects_short_channel() {
        let mut entity = Entity::new(
            "obs",
            Geometry::Points {
                vertices: vec![[0.0; 3]; 3],
            },
        );
        entity.data.insert("gz".to_string(), Values(vec![1.0]));
        assert!(matches!(
            entity.validate(),
            Err(EntityError::DataLengthError(DataLengthError {
                expected: 3,
                found: 1,
                ..
            }))
        ));
    }

    #[test]
    fn test_validate_rejects_dangling_electrode_references() {
        let dangling_vertex = Entity::new(
            "currents",
            Geometry::CurrentElectrodes {
                vertices: vec![[0.0; 3]; 2],
                cells: vec![[0, 2]],
                parts: vec![1, 1],
            },
        );
        assert!(matches!(
            dangling_vertex.validate(),
            Err(EntityError::InvalidGeometry { .. })
        ));

        let short_sources = Entity::new(
            "dc",
            Geometry::PotentialElectrodes {
                vertices: vec![[0.0; 3]; 4],
                cells: vec![[0, 1], [2, 3]],
                ab_cell_id: vec![1],
                current_electrodes: "currents".to_string(),
            },
        );
        assert!(matches!(
            short_sources.validate(),
            Err(EntityError::InvalidGeometry { .. })
        ));
    }
}
