// geoinv/src/driver/line_sweep.rs

use super::errors::DriverError;
use super::inversion_driver::DriverState;
use super::logger::InversionLogger;
use super::sweep::{
    read_lookup, sweep_path, write_lookup, write_sweep_file, ProcessSweepRunner, SweepParams,
    SweepRunner, Trial, LOOKUP_FILE, UI_EXTENSION,
};
use super::Driver;
use crate::components::{
    nearest_indices, ActiveCells, CellMesh, ComponentError, InversionTopography,
};
use crate::directives::SaveOutput;
use crate::params::{InputFile, InversionParams, InversionType};
use crate::workspace::{
    artifact_path, workspace_stem, Entity, ResultSink, Workspace, WorkspaceError,
    WORKSPACE_EXTENSION,
};
use humantime::format_duration;
use log::{debug, info, warn};
use ndarray::Array2;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

const MODELS_GROUP: &str = "Models";
/// Entities written by every inversion into its output group.
const DATA_ENTITY: &str = "Data";
const MODELS_ENTITY: &str = "Models";

/// Runs a pseudo-3D survey as one 2D inversion per line and stitches the
/// line results back into the survey workspace.
pub struct LineSweepDriver {
    params: InversionParams,
    kind: InversionType,
    state: DriverState,
    logger: InversionLogger,
    runner: Box<dyn SweepRunner>,
    lines: Vec<f64>,
    trials: Vec<Trial>,
}

impl LineSweepDriver {
    pub fn new(params: InversionParams, kind: InversionType) -> Result<Self, DriverError> {
        let runner = Box::new(ProcessSweepRunner::current_exe()?);
        let mut driver = Self {
            params,
            kind,
            state: DriverState::Configured,
            logger: InversionLogger::console(),
            runner,
            lines: Vec::new(),
            trials: Vec::new(),
        };
        driver.setup_params()?;
        Ok(driver)
    }

    pub fn with_runner(mut self, runner: Box<dyn SweepRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn lines(&self) -> &[f64] {
        &self.lines
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    fn directory(&self) -> PathBuf {
        self.params
            .geoh5
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Write the per-line parameter files and workspaces and the lookup
    /// table relating them to their line.
    fn setup_params(&mut self) -> Result<(), DriverError> {
        let counterpart = self.kind.line_counterpart().ok_or_else(|| {
            DriverError::UnsupportedInversionType {
                name: self.kind.to_string(),
                valid: InversionType::ALL
                    .iter()
                    .filter(|kind| kind.line_counterpart().is_some())
                    .map(|kind| kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })?;
        let workspace = Workspace::open(&self.params.geoh5)?;
        self.lines = survey_lines(&workspace, &self.params)?;
        let directory = self.directory();
        let stem = workspace_stem(&self.params.geoh5);

        let worker_path = directory.join(format!("{}{}", stem, UI_EXTENSION));
        if !worker_path.is_file() {
            let ui = match serde_json::to_value(&self.params) {
                Ok(Value::Object(ui)) => ui,
                Ok(_) => serde_json::Map::new(),
                Err(e) => return Err(DriverError::SweepError(e.into())),
            };
            InputFile::from_map(&worker_path, ui).write(&worker_path)?;
        }
        let worker = InputFile::read(&worker_path)?;
        let template_path = write_sweep_file(&worker, Some(&["line_id"]))?;
        let mut template = InputFile::read(&template_path)?;
        let (first, last) = match (self.lines.first(), self.lines.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(DriverError::MissingLineObject),
        };
        template.set_value("line_id_start", json!(first));
        template.set_value("line_id_end", json!(last));
        template.set_value("line_id_n", json!(self.lines.len()));
        template.set_value("line_id_values", json!(self.lines));
        template.write(&template_path)?;
        let sweep = SweepParams::from_input_file(&template)?;

        let mut trials = Vec::new();
        for values in sweep.combinations() {
            let Some(line) = values.get("line_id").and_then(Value::as_f64) else {
                continue;
            };
            let trial = Trial::new(&directory, &format!("{}_line_{}", stem, line), values);
            let mut ui = worker.clone();
            ui.set_value("inversion_type", json!(counterpart.as_str()));
            ui.set_value("line_id", json!(line));
            ui.set_value("geoh5", json!(trial.workspace.display().to_string()));
            ui.set_value("monitoring_directory", Value::Null);
            ui.set_value("generate_sweep", json!(false));
            ui.write(&trial.ui_json)?;
            fs::copy(&self.params.geoh5, &trial.workspace)?;
            debug!("Prepared trial {} for line {}", trial.stem, line);
            trials.push(trial);
        }
        write_lookup(&directory, &trials)?;
        info!(
            "Line sweep over {} lines written to {}",
            trials.len(),
            sweep_path(&worker_path).display()
        );
        self.trials = trials;
        Ok(())
    }

    pub fn run(&mut self) -> Result<DriverState, DriverError> {
        let _session = self.logger.session(&self.params.geoh5, self.kind.as_str())?;
        self.state = DriverState::Running;
        let now = Instant::now();
        self.runner.run(&self.trials)?;
        self.logger.write_line(&format!(
            "{} line inversions finished in {}",
            self.trials.len(),
            format_duration(std::time::Duration::from_secs(now.elapsed().as_secs()))
        ));
        self.collect_results()?;
        self.state = DriverState::ArtifactsWritten;
        if self.params.cleanup {
            self.file_cleanup()?;
        }
        self.state = DriverState::Closed;
        Ok(self.state)
    }

    /// Merge the line results into the survey workspace: iteration data on
    /// a copy of the data object, each drape model under `Models`, and the
    /// drape models interpolated onto the global mesh when one is given.
    /// The copies are named like the outputs of a single inversion.
    pub fn collect_results(&self) -> Result<(), DriverError> {
        let directory = self.directory();
        let line_files: Vec<(f64, String)> = read_lookup(&directory)?
            .into_iter()
            .filter_map(|(stem, values)| {
                let line = values.get("line_id").and_then(Value::as_f64)?;
                Some((line, stem))
            })
            .collect();
        let workspace = Workspace::open(&self.params.geoh5)?;
        let data_name = self
            .params
            .data_object
            .as_deref()
            .ok_or(ComponentError::MissingParameter("data_object"))?;
        let group = self.params.ga_group_name.as_str();
        let mut data_result = workspace
            .get_entity(data_name)?
            .copy_geometry(DATA_ENTITY)
            .with_group(group);

        let mut data = BTreeMap::new();
        let mut drapes = Vec::new();
        for line in &self.lines {
            let Some((_, stem)) = line_files.iter().find(|(value, _)| value == line) else {
                warn!("No result recorded for line {}", line);
                continue;
            };
            let path = directory.join(format!("{}{}", stem, WORKSPACE_EXTENSION));
            let trial = Workspace::open(&path)?;
            collect_line_data(trial.get_in_group(DATA_ENTITY, group)?, &mut data);
            let mut drape = trial.get_in_group(MODELS_ENTITY, group)?.clone();
            drape.name = format!("Line {}", line);
            drape.group = Some(MODELS_GROUP.to_string());
            drapes.push(drape);
        }
        for (name, values) in data {
            data_result
                .add_data(&name, values)
                .map_err(WorkspaceError::from)?;
        }

        let global = match self.params.mesh.as_deref() {
            Some(name) => Some(self.interpolate_drapes(&workspace, name, &drapes)?),
            None => None,
        };

        let sink = ResultSink::new(
            &self.params.geoh5,
            self.params.monitoring_directory.as_deref(),
        );
        sink.write(|ws| {
            ws.add_entity(data_result);
            for drape in drapes {
                ws.add_entity(drape);
            }
            if let Some(global) = global {
                ws.add_entity(global);
            }
            Ok(())
        })?;
        sink.publish()?;
        self.logger.write_line(&format!(
            "Line results collected into {}",
            self.params.geoh5.display()
        ));
        Ok(())
    }

    /// Nearest-neighbour transfer of the drape model channels onto the
    /// active cells of the global mesh. Channels present on every drape are
    /// carried over, plus the last iteration of each line as `..._final_...`.
    fn interpolate_drapes(
        &self,
        workspace: &Workspace,
        mesh_name: &str,
        drapes: &[Entity],
    ) -> Result<Entity, DriverError> {
        let now = Instant::now();
        let mesh = workspace.get_entity(mesh_name)?;
        let cells = CellMesh::from_geometry(&mesh.geometry).ok_or_else(|| {
            ComponentError::UnexpectedGeometry {
                name: mesh_name.to_string(),
                expected: "TensorMesh",
                found: mesh.geometry.kind(),
            }
        })?;
        let active = match self.params.topography_object {
            Some(_) => InversionTopography::from_workspace(workspace, &self.params)?
                .below_surface(&cells)?,
            None => ActiveCells::all(cells.n_cells()),
        };
        let targets = cells.centers().select(ndarray::Axis(0), active.global_index());
        let mut result = mesh
            .copy_geometry(MODELS_ENTITY)
            .with_group(&self.params.ga_group_name);

        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let common = drapes
            .iter()
            .map(|drape| drape.data.keys().cloned().collect::<BTreeSet<_>>())
            .reduce(|a, b| a.intersection(&b).cloned().collect())
            .unwrap_or_default();
        for name in common {
            children.insert(name.clone(), vec![name; drapes.len()]);
        }
        if let Some((label, last)) = last_iterations(drapes) {
            children.insert(label, last);
        }

        let drape_cells: Vec<CellMesh> = drapes
            .iter()
            .filter_map(|drape| CellMesh::from_geometry(&drape.geometry))
            .collect();
        if drape_cells.len() != drapes.len() || drapes.is_empty() {
            return Ok(result);
        }
        let n_source: usize = drape_cells.iter().map(CellMesh::n_cells).sum();
        let mut sources = Array2::<f64>::zeros((n_source, 3));
        let mut offset = 0;
        for drape in &drape_cells {
            let n = drape.n_cells();
            sources
                .slice_mut(ndarray::s![offset..offset + n, ..])
                .assign(drape.centers());
            offset += n;
        }
        let nearest = nearest_indices(sources.view(), targets.view())?;

        for (label, names) in children {
            let mut stacked = Vec::with_capacity(n_source);
            for (drape, name) in drapes.iter().zip(&names) {
                match drape.get_data(name) {
                    Some(values) => stacked.extend_from_slice(values),
                    None => stacked.extend(std::iter::repeat(f64::NAN).take(drape.n_elements())),
                }
            }
            let local: ndarray::Array1<f64> = nearest.iter().map(|&k| stacked[k]).collect();
            result
                .add_data(&label, active.expand(local.view()))
                .map_err(WorkspaceError::from)?;
        }
        debug!(
            "Took {} to interpolate {} drape models onto '{}'.",
            format_duration(now.elapsed()),
            drapes.len(),
            mesh_name
        );
        Ok(result)
    }

    /// Remove the trial files, the lookup table and sweep templates.
    pub fn file_cleanup(&self) -> Result<(), DriverError> {
        let directory = self.directory();
        let mut files: Vec<PathBuf> = Vec::new();
        for stem in read_lookup(&directory)?.keys() {
            let workspace = directory.join(format!("{}{}", stem, WORKSPACE_EXTENSION));
            files.push(directory.join(format!("{}{}", stem, UI_EXTENSION)));
            files.push(artifact_path(&workspace, InversionLogger::SUFFIX));
            files.push(artifact_path(&workspace, SaveOutput::SUFFIX));
            files.push(workspace);
        }
        files.push(directory.join(LOOKUP_FILE));
        for entry in fs::read_dir(&directory)? {
            let path = entry?.path();
            let is_template = path
                .file_name()
                .map(|name| name.to_string_lossy().ends_with(&format!("_sweep{}", UI_EXTENSION)))
                .unwrap_or(false);
            if is_template {
                files.push(path);
            }
        }
        for file in files {
            match fs::remove_file(&file) {
                Ok(()) => debug!("Removed {}", file.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Driver for LineSweepDriver {
    fn params(&self) -> &InversionParams {
        &self.params
    }

    fn state(&self) -> DriverState {
        self.state
    }

    fn run(&mut self) -> Result<DriverState, DriverError> {
        LineSweepDriver::run(self)
    }
}

/// Sorted distinct line identifiers of the data object.
fn survey_lines(workspace: &Workspace, params: &InversionParams) -> Result<Vec<f64>, DriverError> {
    let channel = params
        .line_object
        .as_deref()
        .ok_or(DriverError::MissingLineObject)?;
    let data_name = params
        .data_object
        .as_deref()
        .ok_or(ComponentError::MissingParameter("data_object"))?;
    let entity = workspace.get_entity(data_name)?;
    let values = entity.get_data(channel).ok_or_else(|| {
        WorkspaceError::ChannelNotFound {
            entity: data_name.to_string(),
            channel: channel.to_string(),
        }
    })?;
    let mut lines: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    lines.sort_by(f64::total_cmp);
    lines.dedup();
    if lines.is_empty() {
        return Err(DriverError::MissingLineObject);
    }
    Ok(lines)
}

/// Fold the `Iteration*` channels of one line result into `data`. New
/// channels start at zero; only the rows a line actually produced (non-NaN)
/// are overwritten, so rows owned by other lines keep their values.
pub fn collect_line_data(survey: &Entity, data: &mut BTreeMap<String, Vec<f64>>) {
    let n = survey.n_elements();
    for (name, values) in &survey.data {
        if !name.contains("Iteration") {
            continue;
        }
        let merged = data.entry(name.clone()).or_insert_with(|| vec![0.0; n]);
        for (target, value) in merged.iter_mut().zip(values.0.iter()) {
            if !value.is_nan() {
                *target = *value;
            }
        }
    }
}

fn iteration_number(name: &str) -> Option<(usize, usize, usize)> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let end = name[start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(name.len(), |offset| start + offset);
    name[start..end].parse().ok().map(|n| (n, start, end))
}

/// Last iteration channel of every drape, labelled with its number
/// replaced by `final`.
fn last_iterations(drapes: &[Entity]) -> Option<(String, Vec<String>)> {
    let mut label = None;
    let mut last = Vec::with_capacity(drapes.len());
    for drape in drapes {
        let best = drape
            .data
            .keys()
            .filter(|name| name.to_lowercase().contains("iteration"))
            .filter_map(|name| iteration_number(name).map(|(n, _, _)| (n, name)))
            .max_by_key(|(n, _)| *n)?;
        if label.is_none() {
            let (_, start, end) = iteration_number(best.1)?;
            label = Some(format!("{}final{}", &best.1[..start], &best.1[end..]));
        }
        last.push(best.1.clone());
    }
    label.map(|label| (label, last))
}
