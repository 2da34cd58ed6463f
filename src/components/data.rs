// geoinv/src/components/data.rs

use super::topography::InversionTopography;
use super::window::InversionWindow;
use super::ComponentError;
use crate::params::{InversionParams, InversionType, UncertaintySource};
use crate::workspace::{DataLengthError, Entity, Geometry, Workspace, WorkspaceError};
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

/// Components whose sign is flipped so that positive means "up".
const FLIPPED_COMPONENTS: [&str; 1] = ["gz"];

/// Rule marking observed values that must not contribute to the misfit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IgnoreRule {
    Below(f64),
    Above(f64),
    Equal(f64),
}

impl IgnoreRule {
    pub fn parse(text: &str) -> Result<Self, ComponentError> {
        let text = text.trim();
        let (rule, number): (fn(f64) -> IgnoreRule, &str) = if let Some(rest) = text.strip_prefix('<') {
            (IgnoreRule::Below, rest)
        } else if let Some(rest) = text.strip_prefix('>') {
            (IgnoreRule::Above, rest)
        } else {
            (IgnoreRule::Equal, text)
        };
        number
            .trim()
            .parse::<f64>()
            .map(rule)
            .map_err(|_| ComponentError::InvalidIgnoreValue(text.to_string()))
    }

    pub fn ignores(&self, value: f64) -> bool {
        match *self {
            IgnoreRule::Below(limit) => value < limit,
            IgnoreRule::Above(limit) => value > limit,
            IgnoreRule::Equal(target) => value == target,
        }
    }
}

/// Source/receiver electrode positions of a dipole-dipole survey, one row
/// per retained datum.
#[derive(Clone, Debug)]
pub struct ElectrodeSurvey {
    current_entity: String,
    a: Array2<f64>,
    b: Array2<f64>,
    m: Array2<f64>,
    n: Array2<f64>,
    source: Vec<usize>,
    source_lines: Vec<i64>,
}

impl ElectrodeSurvey {
    fn from_entities(
        receivers: &Entity,
        currents: &Entity,
        rows: &[usize],
    ) -> Result<Self, ComponentError> {
        let (rx_vertices, rx_cells, ab_cell_id) = match &receivers.geometry {
            Geometry::PotentialElectrodes {
                vertices,
                cells,
                ab_cell_id,
                ..
            } => (vertices, cells, ab_cell_id),
            other => {
                return Err(ComponentError::UnexpectedGeometry {
                    name: receivers.name.clone(),
                    expected: "PotentialElectrodes",
                    found: other.kind(),
                })
            }
        };
        let (tx_vertices, tx_cells, parts) = match &currents.geometry {
            Geometry::CurrentElectrodes {
                vertices,
                cells,
                parts,
            } => (vertices, cells, parts),
            other => {
                return Err(ComponentError::UnexpectedGeometry {
                    name: currents.name.clone(),
                    expected: "CurrentElectrodes",
                    found: other.kind(),
                })
            }
        };
        let source_lines = tx_cells
            .iter()
            .map(|[a, _]| parts.get(*a).copied().unwrap_or_default())
            .collect();

        let n_rows = rows.len();
        let mut survey = Self {
            current_entity: currents.name.clone(),
            a: Array2::zeros((n_rows, 3)),
            b: Array2::zeros((n_rows, 3)),
            m: Array2::zeros((n_rows, 3)),
            n: Array2::zeros((n_rows, 3)),
            source: Vec::with_capacity(n_rows),
            source_lines,
        };
        for (row, &element) in rows.iter().enumerate() {
            let invalid = || ComponentError::InvalidSourceReference {
                name: receivers.name.clone(),
                row: element,
            };
            let source = ab_cell_id
                .get(element)
                .and_then(|id| id.checked_sub(1))
                .filter(|cell| *cell < tx_cells.len())
                .ok_or_else(invalid)?;
            let [ia, ib] = tx_cells[source];
            let [im, in_] = *rx_cells.get(element).ok_or_else(invalid)?;
            let (Some(a), Some(b), Some(m), Some(n)) = (
                tx_vertices.get(ia),
                tx_vertices.get(ib),
                rx_vertices.get(im),
                rx_vertices.get(in_),
            ) else {
                return Err(invalid());
            };
            for axis in 0..3 {
                survey.a[[row, axis]] = a[axis];
                survey.b[[row, axis]] = b[axis];
                survey.m[[row, axis]] = m[axis];
                survey.n[[row, axis]] = n[axis];
            }
            survey.source.push(source);
        }
        Ok(survey)
    }

    pub fn current_entity(&self) -> &str {
        &self.current_entity
    }

    pub fn a(&self) -> &Array2<f64> {
        &self.a
    }

    pub fn b(&self) -> &Array2<f64> {
        &self.b
    }

    pub fn m(&self) -> &Array2<f64> {
        &self.m
    }

    pub fn n(&self) -> &Array2<f64> {
        &self.n
    }

    /// Current dipole driving each datum.
    pub fn sources(&self) -> &[usize] {
        &self.source
    }

    /// Survey line of a current dipole.
    pub fn source_line(&self, source: usize) -> i64 {
        self.source_lines[source]
    }

    /// Survey line of each datum.
    pub fn row_lines(&self) -> Vec<i64> {
        self.source
            .iter()
            .map(|&source| self.source_lines[source])
            .collect()
    }

    /// Every line of the current electrodes, including lines without data.
    pub fn lines(&self) -> Vec<i64> {
        self.source_lines
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Observed survey reduced to the rows taking part in the inversion.
#[derive(Clone, Debug)]
pub struct InversionData {
    entity_name: String,
    n_elements: usize,
    indices: Vec<usize>,
    locations: Array2<f64>,
    components: Vec<String>,
    observed: Array2<f64>,
    uncertainties: Array2<f64>,
    normalizations: Vec<f64>,
    electrodes: Option<ElectrodeSurvey>,
}

impl InversionData {
    /// In-memory survey with every row retained. `observed` and
    /// `uncertainties` are (rows, components).
    pub fn new(
        entity_name: &str,
        locations: Array2<f64>,
        components: Vec<String>,
        observed: Array2<f64>,
        uncertainties: Array2<f64>,
    ) -> Self {
        let n_rows = locations.nrows();
        let normalizations = vec![1.0; components.len()];
        Self {
            entity_name: entity_name.to_string(),
            n_elements: n_rows,
            indices: (0..n_rows).collect(),
            locations,
            components,
            observed,
            uncertainties,
            normalizations,
            electrodes: None,
        }
    }

    pub fn with_electrodes(mut self, electrodes: ElectrodeSurvey) -> Self {
        self.electrodes = Some(electrodes);
        self
    }

    pub fn from_workspace(
        workspace: &Workspace,
        params: &InversionParams,
        kind: InversionType,
        window: Option<&InversionWindow>,
        topography: Option<&InversionTopography>,
    ) -> Result<Self, ComponentError> {
        let name = params
            .data_object
            .as_deref()
            .ok_or(ComponentError::MissingParameter("data_object"))?;
        let entity = workspace.get_entity(name)?;
        let components = survey_components(params, kind);
        if components.is_empty() {
            return Err(ComponentError::NoComponents(kind.to_string()));
        }
        let n_elements = entity.n_elements();
        let all_locations = entity.geometry.element_locations();

        let mut mask = match window {
            Some(window) => window.mask(all_locations.view()),
            None => vec![true; n_elements],
        };
        if let (Some(line_channel), Some(line_id)) = (params.line_object.as_deref(), params.line_id)
        {
            let lines = channel(entity, line_channel)?;
            for (keep, line) in mask.iter_mut().zip(lines) {
                *keep &= *line == line_id;
            }
        }
        if let Some(resolution) = params.resolution.filter(|r| *r > 0.0) {
            decimate(&all_locations, resolution, &mut mask);
        }
        let indices: Vec<usize> = (0..n_elements).filter(|&row| mask[row]).collect();
        if indices.is_empty() {
            return Err(ComponentError::EmptySurvey(name.to_string()));
        }

        let mut locations = all_locations.select(Axis(0), &indices);
        if params.z_from_topo {
            if let Some(topography) = topography {
                let elevation = topography.elevation_at(locations.view())?;
                locations.column_mut(2).assign(&elevation);
            }
        }
        if let Some(offset) = params.receiver_offset() {
            for mut row in locations.rows_mut() {
                for axis in 0..3 {
                    row[axis] += offset[axis];
                }
            }
        }

        let ignore = params
            .ignore_values
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(IgnoreRule::parse)
            .transpose()?;

        let n_rows = indices.len();
        let mut observed = Array2::<f64>::zeros((n_rows, components.len()));
        let mut uncertainties = Array2::<f64>::ones((n_rows, components.len()));
        let mut normalizations = Vec::with_capacity(components.len());
        for (column, component) in components.iter().enumerate() {
            let normalization = if FLIPPED_COMPONENTS.contains(&component.as_str()) {
                -1.0
            } else {
                1.0
            };
            normalizations.push(normalization);
            let values = match params.channel(component) {
                Some(channel_name) => Some(channel(entity, &channel_name)?),
                None => None,
            };
            let floor = match params.uncertainty(component) {
                Some(UncertaintySource::Channel(channel_name)) => {
                    Some(channel(entity, &channel_name)?)
                }
                Some(UncertaintySource::Constant(value)) => {
                    uncertainties.column_mut(column).fill(value);
                    None
                }
                None => None,
            };
            for (row, &element) in indices.iter().enumerate() {
                if let Some(floor) = floor {
                    uncertainties[[row, column]] = floor[element];
                }
                let Some(values) = values else {
                    continue;
                };
                let value = values[element];
                if value.is_nan() || ignore.map_or(false, |rule| rule.ignores(value)) {
                    uncertainties[[row, column]] = f64::INFINITY;
                    observed[[row, column]] = 0.0;
                } else {
                    observed[[row, column]] = normalization * value;
                }
            }
        }

        let electrodes = match &entity.geometry {
            Geometry::PotentialElectrodes {
                current_electrodes, ..
            } => {
                let currents = workspace.get_entity(current_electrodes)?;
                Some(ElectrodeSurvey::from_entities(entity, currents, &indices)?)
            }
            _ => None,
        };

        info!(
            "Survey '{}': {} of {} rows retained, components {:?}",
            name, n_rows, n_elements, components
        );
        Ok(Self {
            entity_name: name.to_string(),
            n_elements,
            indices,
            locations,
            components,
            observed,
            uncertainties,
            normalizations,
            electrodes,
        })
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Number of elements on the source entity before filtering.
    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    /// Entity row of every retained datum.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn n_rows(&self) -> usize {
        self.indices.len()
    }

    pub fn n_data(&self) -> usize {
        self.n_rows() * self.components.len()
    }

    pub fn locations(&self) -> &Array2<f64> {
        &self.locations
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn normalizations(&self) -> &[f64] {
        &self.normalizations
    }

    pub fn observed(&self) -> &Array2<f64> {
        &self.observed
    }

    pub fn uncertainties(&self) -> &Array2<f64> {
        &self.uncertainties
    }

    pub fn electrodes(&self) -> Option<&ElectrodeSurvey> {
        self.electrodes.as_ref()
    }

    /// Observed values of `rows`, row-major over components.
    pub fn observed_rows(&self, rows: &[usize]) -> Array1<f64> {
        flatten_rows(&self.observed, rows)
    }

    pub fn uncertainty_rows(&self, rows: &[usize]) -> Array1<f64> {
        flatten_rows(&self.uncertainties, rows)
    }

    /// Undo the component normalisation of a (rows, components) array.
    pub fn denormalize(&self, values: &mut Array2<f64>) {
        for (mut column, normalization) in values.columns_mut().into_iter().zip(&self.normalizations)
        {
            column.mapv_inplace(|v| v * normalization);
        }
    }
}

fn flatten_rows(values: &Array2<f64>, rows: &[usize]) -> Array1<f64> {
    rows.iter()
        .flat_map(|&row| values.row(row).to_vec())
        .collect()
}

/// Channel `name` of `entity`, holding one value per element.
fn channel<'a>(entity: &'a Entity, name: &str) -> Result<&'a [f64], WorkspaceError> {
    let values = entity
        .get_data(name)
        .ok_or_else(|| WorkspaceError::ChannelNotFound {
            entity: entity.name.clone(),
            channel: name.to_string(),
        })?;
    if values.len() != entity.n_elements() {
        return Err(DataLengthError {
            entity: entity.name.clone(),
            channel: name.to_string(),
            expected: entity.n_elements(),
            found: values.len(),
        }
        .into());
    }
    Ok(values)
}

fn survey_components(params: &InversionParams, kind: InversionType) -> Vec<String> {
    let components = params.components(kind);
    if !components.is_empty() || !params.forward_only {
        return components;
    }
    // Forward runs only need to know which components to simulate.
    let requested: Vec<String> = kind
        .components()
        .iter()
        .filter(|component| {
            matches!(
                params.extra.get(&format!("{}_channel_bool", component)),
                Some(Value::Bool(true))
            )
        })
        .map(|component| component.to_string())
        .collect();
    if requested.is_empty() {
        kind.components()
            .first()
            .map(|component| vec![component.to_string()])
            .unwrap_or_default()
    } else {
        requested
    }
}

/// Keep at most one location per `resolution`-sized grid cell.
fn decimate(locations: &Array2<f64>, resolution: f64, mask: &mut [bool]) {
    let mut occupied = HashSet::new();
    let before = mask.iter().filter(|keep| **keep).count();
    for (row, keep) in mask.iter_mut().enumerate() {
        if !*keep {
            continue;
        }
        let key = (
            (locations[[row, 0]] / resolution).floor() as i64,
            (locations[[row, 1]] / resolution).floor() as i64,
        );
        *keep = occupied.insert(key);
    }
    debug!(
        "Resolution {} kept {} of {} locations",
        resolution,
        mask.iter().filter(|keep| **keep).count(),
        before
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Entity;
    use serde_json::json;
    use std::path::Path;

    fn params(value: Value) -> InversionParams {
        let mut params: InversionParams = serde_json::from_value(value).unwrap();
        params.data_object = Some("survey".to_string());
        params
    }

    fn gravity_workspace() -> Workspace {
        let mut workspace = Workspace::new(Path::new("unused.ws.json"));
        let vertices = (0..6).map(|i| [10.0 * i as f64, 0.0, 5.0]).collect();
        let mut survey = Entity::new("survey", Geometry::Points { vertices });
        survey
            .add_data("gz_obs", vec![1.0, 2.0, -99.0, 4.0, 5.0, f64::NAN])
            .unwrap();
        survey
            .add_data("line", vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0])
            .unwrap();
        workspace.add_entity(survey);
        workspace
    }

    #[test]
    fn test_ignore_rule_parsing() {
        assert_eq!(IgnoreRule::parse("<0").unwrap(), IgnoreRule::Below(0.0));
        assert_eq!(IgnoreRule::parse(" >1e3").unwrap(), IgnoreRule::Above(1e3));
        assert_eq!(IgnoreRule::parse("-99").unwrap(), IgnoreRule::Equal(-99.0));
        assert!(IgnoreRule::parse("<abc").is_err());
    }

    #[test]
    fn test_ignored_values_get_infinite_uncertainty() {
        let workspace = gravity_workspace();
        let params = params(json!({
            "inversion_type": "gravity",
            "gz_channel": "gz_obs",
            "gz_uncertainty": 0.1,
            "ignore_values": "-99",
        }));
        let data = InversionData::from_workspace(
            &workspace,
            &params,
            InversionType::Gravity,
            None,
            None,
        )
        .unwrap();
        assert_eq!(data.n_rows(), 6);
        assert_eq!(data.normalizations(), &[-1.0]);
        assert_eq!(data.observed()[[0, 0]], -1.0);
        assert!(data.uncertainties()[[2, 0]].is_infinite());
        assert!(data.uncertainties()[[5, 0]].is_infinite());
        assert_eq!(data.uncertainties()[[1, 0]], 0.1);
    }

    #[test]
    fn test_line_selection_keeps_original_indices() {
        let workspace = gravity_workspace();
        let params = params(json!({
            "inversion_type": "gravity",
            "gz_channel": "gz_obs",
            "line_object": "line",
            "line_id": 2.0,
            "receivers_offset_z": 1.0,
        }));
        let data = InversionData::from_workspace(
            &workspace,
            &params,
            InversionType::Gravity,
            None,
            None,
        )
        .unwrap();
        assert_eq!(data.indices(), &[3, 4, 5]);
        assert_eq!(data.locations()[[0, 0]], 30.0);
        assert_eq!(data.locations()[[0, 2]], 6.0);
        assert_eq!(data.n_elements(), 6);
    }

    #[test]
    fn test_missing_components_is_an_error() {
        let workspace = gravity_workspace();
        let params = params(json!({"inversion_type": "gravity"}));
        let result = InversionData::from_workspace(
            &workspace,
            &params,
            InversionType::Gravity,
            None,
            None,
        );
        assert!(matches!(result, Err(ComponentError::NoComponents(_))));
    }

    #[test]
    fn test_short_channel_is_an_error() {
        let mut workspace = gravity_workspace();
        let survey = workspace.get_entity_mut("survey").unwrap();
        survey
            .data
            .insert("gz_obs".to_string(), crate::workspace::Values(vec![1.0]));
        let params = params(json!({
            "inversion_type": "gravity",
            "gz_channel": "gz_obs",
        }));
        let result = InversionData::from_workspace(
            &workspace,
            &params,
            InversionType::Gravity,
            None,
            None,
        );
        assert!(matches!(
            result,
            Err(ComponentError::WorkspaceError(WorkspaceError::DataLengthError(_)))
        ));
    }

    #[test]
    fn test_short_uncertainty_channel_is_an_error() {
        let mut workspace = gravity_workspace();
        let survey = workspace.get_entity_mut("survey").unwrap();
        survey
            .data
            .insert("gz_floor".to_string(), crate::workspace::Values(vec![0.1; 2]));
        let params = params(json!({
            "inversion_type": "gravity",
            "gz_channel": "gz_obs",
            "gz_uncertainty": "gz_floor",
        }));
        let result = InversionData::from_workspace(
            &workspace,
            &params,
            InversionType::Gravity,
            None,
            None,
        );
        assert!(matches!(
            result,
            Err(ComponentError::WorkspaceError(WorkspaceError::DataLengthError(_)))
        ));
    }

    #[test]
    fn test_missing_source_dipole_is_an_error() {
        let mut workspace = Workspace::new(Path::new("unused.ws.json"));
        workspace.add_entity(Entity::new(
            "currents",
            Geometry::CurrentElectrodes {
                vertices: vec![[0.0; 3], [10.0, 0.0, 0.0]],
                cells: vec![[0, 1]],
                parts: vec![1, 1],
            },
        ));
        let mut receivers = Entity::new(
            "survey",
            Geometry::PotentialElectrodes {
                vertices: vec![[20.0, 0.0, 0.0], [30.0, 0.0, 0.0]],
                cells: vec![[0, 1]],
                ab_cell_id: vec![4],
                current_electrodes: "currents".to_string(),
            },
        );
        receivers.add_data("v", vec![1.0]).unwrap();
        workspace.add_entity(receivers);
        let params = params(json!({"potential_channel": "v"}));
        let result = InversionData::from_workspace(
            &workspace,
            &params,
            InversionType::DirectCurrent3d,
            None,
            None,
        );
        assert!(matches!(
            result,
            Err(ComponentError::InvalidSourceReference { row: 0, .. })
        ));
    }

    #[test]
    fn test_resolution_decimates_close_points() {
        let locations = ndarray::array![[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [30.0, 0.0, 0.0]];
        let mut mask = vec![true; 3];
        decimate(&locations, 20.0, &mut mask);
        assert_eq!(mask, vec![true, false, true]);
    }
}
