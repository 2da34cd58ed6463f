// geoinv/src/driver/sweep.rs

//! Parameter sweeps: template generation, trial bookkeeping and execution.

use super::registry::DriverRegistry;
use crate::params::{InputFile, InputFileError};
use crate::workspace::WORKSPACE_EXTENSION;
use humantime::format_duration;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Instant;
use thiserror::Error;

pub const UI_EXTENSION: &str = ".ui.json";
pub const LOOKUP_FILE: &str = "lookup.json";

/// File name of a ui.json without its extension.
pub fn ui_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    match name.strip_suffix(UI_EXTENSION) {
        Some(stem) => stem.to_string(),
        None => path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or(name),
    }
}

pub fn sweep_path(worker: &Path) -> PathBuf {
    worker.with_file_name(format!("{}_sweep{}", ui_stem(worker), UI_EXTENSION))
}

fn form(label: String, value: Value) -> Value {
    json!({ "label": label, "value": value })
}

/// Write the sweep template of `worker`: a `<p>_start`, `<p>_end` and `<p>_n`
/// entry for every numeric parameter (or only `parameters` when given).
pub fn write_sweep_file(
    worker: &InputFile,
    parameters: Option<&[&str]>,
) -> Result<PathBuf, SweepError> {
    let mut ui = Map::new();
    ui.insert("title".to_string(), json!("Parameter sweep"));
    ui.insert(
        "worker_uijson".to_string(),
        json!(worker.path().display().to_string()),
    );
    for (name, value) in worker.data() {
        if let Some(selected) = parameters {
            if !selected.contains(&name.as_str()) {
                continue;
            }
        }
        if !value.is_number() {
            continue;
        }
        ui.insert(format!("{}_start", name), form(format!("{} start", name), value.clone()));
        ui.insert(format!("{}_end", name), form(format!("{} end", name), value));
        ui.insert(format!("{}_n", name), form(format!("{} n", name), json!(1)));
    }
    let path = sweep_path(worker.path());
    InputFile::from_map(&path, ui).write(&path)?;
    debug!("Sweep template written to {}", path.display());
    Ok(path)
}

/// Reset the `generate_sweep` flag in the source file and write its template.
pub fn generate_sweep(input_file: &mut InputFile) -> Result<PathBuf, SweepError> {
    input_file.set_value("generate_sweep", Value::Bool(false));
    input_file.write(input_file.path())?;
    write_sweep_file(input_file, None)
}

/// One swept parameter. Explicit `values` take precedence over the range.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepParameter {
    pub name: String,
    pub start: f64,
    pub end: f64,
    pub n: usize,
    pub values: Option<Vec<f64>>,
}

impl SweepParameter {
    pub fn values(&self) -> Vec<f64> {
        if let Some(values) = &self.values {
            return values.clone();
        }
        match self.n {
            0 => Vec::new(),
            1 => vec![self.start],
            n => (0..n)
                .map(|k| self.start + (self.end - self.start) * k as f64 / (n - 1) as f64)
                .collect(),
        }
    }
}

/// A parsed sweep template.
#[derive(Clone, Debug)]
pub struct SweepParams {
    pub worker_uijson: PathBuf,
    pub parameters: Vec<SweepParameter>,
}

impl SweepParams {
    pub fn from_input_file(file: &InputFile) -> Result<Self, SweepError> {
        let data = file.data();
        let worker = file
            .get_str("worker_uijson")
            .ok_or(SweepError::MissingEntry("worker_uijson".to_string()))?;
        let number = |key: &str| -> Result<f64, SweepError> {
            data.get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| SweepError::MissingEntry(key.to_string()))
        };
        let mut parameters = Vec::new();
        for key in data.keys() {
            let Some(name) = key.strip_suffix("_start") else {
                continue;
            };
            let values = data
                .get(&format!("{}_values", name))
                .and_then(Value::as_array)
                .map(|values| values.iter().filter_map(Value::as_f64).collect());
            parameters.push(SweepParameter {
                name: name.to_string(),
                start: number(key)?,
                end: number(&format!("{}_end", name))?,
                n: number(&format!("{}_n", name))?.max(0.0) as usize,
                values,
            });
        }
        Ok(Self {
            worker_uijson: file.resolve(Path::new(&worker)),
            parameters,
        })
    }

    /// Every combination of parameter values, first parameter slowest.
    pub fn combinations(&self) -> Vec<Map<String, Value>> {
        let mut combinations = vec![Map::new()];
        for parameter in &self.parameters {
            let values = parameter.values();
            combinations = combinations
                .into_iter()
                .flat_map(|base| {
                    values.iter().map(move |value| {
                        let mut next = base.clone();
                        next.insert(parameter.name.clone(), json!(value));
                        next
                    })
                })
                .collect();
        }
        combinations
    }
}

/// A single sweep run: its parameter file, workspace and swept values.
#[derive(Clone, Debug)]
pub struct Trial {
    pub stem: String,
    pub ui_json: PathBuf,
    pub workspace: PathBuf,
    pub values: Map<String, Value>,
}

impl Trial {
    pub fn new(directory: &Path, stem: &str, values: Map<String, Value>) -> Self {
        Self {
            stem: stem.to_string(),
            ui_json: directory.join(format!("{}{}", stem, UI_EXTENSION)),
            workspace: directory.join(format!("{}{}", stem, WORKSPACE_EXTENSION)),
            values,
        }
    }
}

/// Record `stem -> values` of every trial in `directory/lookup.json`.
pub fn write_lookup(directory: &Path, trials: &[Trial]) -> Result<PathBuf, SweepError> {
    let lookup: Map<String, Value> = trials
        .iter()
        .map(|trial| (trial.stem.clone(), Value::Object(trial.values.clone())))
        .collect();
    let path = directory.join(LOOKUP_FILE);
    let contents = serde_json::to_string_pretty(&lookup)?;
    fs::write(&path, contents).map_err(|source| SweepError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

pub fn read_lookup(directory: &Path) -> Result<BTreeMap<String, Map<String, Value>>, SweepError> {
    let path = directory.join(LOOKUP_FILE);
    let contents = fs::read_to_string(&path).map_err(|source| SweepError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(serde_json::from_str(&contents)?)
}

/// Executes the trials of a sweep. Trials share nothing but the file system.
pub trait SweepRunner {
    fn run(&self, trials: &[Trial]) -> Result<(), SweepError>;
}

/// One OS process of `program` per trial, all started before any is awaited.
pub struct ProcessSweepRunner {
    program: PathBuf,
}

impl ProcessSweepRunner {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
        }
    }

    pub fn current_exe() -> Result<Self, SweepError> {
        let program = std::env::current_exe().map_err(|source| SweepError::Io {
            path: PathBuf::from("current executable"),
            source,
        })?;
        Ok(Self::new(&program))
    }
}

/// Trials started but not yet awaited. Dropping the set kills and reaps
/// whatever is still in it, so an early return never leaves trials running.
struct RunningTrials<'a> {
    children: Vec<(&'a Trial, Child)>,
}

impl Drop for RunningTrials<'_> {
    fn drop(&mut self) {
        for (trial, child) in self.children.iter_mut() {
            if let Err(e) = child.kill() {
                debug!("Could not kill trial {}: {}", trial.stem, e);
            }
            match child.wait() {
                Ok(status) => warn!("Stopped trial {} ({})", trial.stem, status),
                Err(e) => warn!("Could not reap trial {}: {}", trial.stem, e),
            }
        }
    }
}

impl SweepRunner for ProcessSweepRunner {
    fn run(&self, trials: &[Trial]) -> Result<(), SweepError> {
        let now = Instant::now();
        let mut running = RunningTrials {
            children: Vec::with_capacity(trials.len()),
        };
        for trial in trials {
            let child = Command::new(&self.program)
                .arg(&trial.ui_json)
                .spawn()
                .map_err(|source| SweepError::Io {
                    path: self.program.clone(),
                    source,
                })?;
            info!("Started trial {} (pid {})", trial.stem, child.id());
            running.children.push((trial, child));
        }
        let mut failures = Vec::new();
        while let Some((trial, child)) = running.children.first_mut() {
            let status = child.wait().map_err(|source| SweepError::Io {
                path: trial.ui_json.clone(),
                source,
            })?;
            if !status.success() {
                failures.push(SweepError::TrialFailed {
                    stem: trial.stem.clone(),
                    reason: status.to_string(),
                });
            }
            running.children.remove(0);
        }
        info!(
            "Took {} to run {} trials.",
            format_duration(now.elapsed()),
            trials.len()
        );
        match failures.into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Runs trials one after the other in this process.
pub struct InProcessSweepRunner {
    registry: DriverRegistry,
}

impl Default for InProcessSweepRunner {
    fn default() -> Self {
        Self {
            registry: DriverRegistry::default(),
        }
    }
}

impl SweepRunner for InProcessSweepRunner {
    fn run(&self, trials: &[Trial]) -> Result<(), SweepError> {
        for trial in trials {
            self.registry
                .start(&trial.ui_json)
                .map_err(|e| SweepError::TrialFailed {
                    stem: trial.stem.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Sweep file is missing entry '{0}'")]
    MissingEntry(String),
    #[error("Trial {stem} failed: {reason}")]
    TrialFailed { stem: String, reason: String },
    #[error("Sweep I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    InputFileError(#[from] InputFileError),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}
