// geoinv/src/directives.rs

//! Hooks run by the optimization loop: once before the first iteration and
//! after every iteration, in list order.

use crate::components::{InversionData, InversionMesh, InversionModelCollection};
use crate::misfit::DataMisfit;
use crate::optimization::{InverseProblem, InversionState};
use crate::params::InversionParams;
use crate::workspace::{artifact_path, Entity, Geometry, ResultSink, WorkspaceError};
use log::{debug, info};
use ndarray::Array1;
use ndarray_stats::errors::MinMaxError;
use ndarray_stats::QuantileExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub trait Directive: Send {
    fn name(&self) -> &'static str;

    fn initialize(
        &mut self,
        _state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        Ok(())
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError>;

    fn finish(
        &mut self,
        _state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        Ok(())
    }
}

/// Directives that read regularization weights must run after the
/// sensitivity weights they depend on.
const ORDER_CONSTRAINTS: [(&str, &str); 2] = [
    ("UpdateSensitivityWeights", "BetaEstimate"),
    ("UpdateSensitivityWeights", "UpdateIrls"),
];

#[derive(Default)]
pub struct DirectiveList {
    directives: Vec<Box<dyn Directive>>,
}

impl DirectiveList {
    pub fn new(directives: Vec<Box<dyn Directive>>) -> Result<Self, DirectiveError> {
        let list = Self { directives };
        list.validate_order()?;
        Ok(list)
    }

    pub fn push(&mut self, directive: Box<dyn Directive>) -> Result<(), DirectiveError> {
        self.directives.push(directive);
        self.validate_order()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.directives.iter().map(|d| d.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn validate_order(&self) -> Result<(), DirectiveError> {
        let names = self.names();
        let position = |name: &str| names.iter().position(|n| *n == name);
        for (before, after) in ORDER_CONSTRAINTS {
            if let (Some(first), Some(second)) = (position(before), position(after)) {
                if first > second {
                    return Err(DirectiveError::Order {
                        before: before.to_string(),
                        after: after.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn initialize(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        for directive in self.directives.iter_mut() {
            debug!("Initializing directive {}", directive.name());
            directive.initialize(state, problem)?;
        }
        Ok(())
    }

    pub fn end_iteration(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        for directive in self.directives.iter_mut() {
            directive.end_iteration(state, problem)?;
        }
        Ok(())
    }

    pub fn finish(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        for directive in self.directives.iter_mut() {
            directive.finish(state, problem)?;
        }
        Ok(())
    }
}

/// Cell weights from the normalised sensitivity `sqrt(diag(JᵀWᵀWJ))`,
/// floored at `threshold`.
pub struct UpdateSensitivityWeights {
    threshold: f64,
    every_iteration: bool,
}

impl UpdateSensitivityWeights {
    pub fn new(threshold: f64, every_iteration: bool) -> Self {
        Self {
            threshold,
            every_iteration,
        }
    }

    fn update(&self, state: &InversionState, problem: &mut InverseProblem) -> Result<(), DirectiveError> {
        let diagonal = problem.data_misfit().jtj_diag(&state.model);
        for term in problem.regularization_mut().terms_mut() {
            let sensitivity = term.mapping().project(&diagonal).mapv(|v| v.max(0.0).sqrt());
            let peak = *sensitivity.max()?;
            let weights = if peak > 0.0 {
                sensitivity.mapv(|v| (v / peak).max(self.threshold))
            } else {
                Array1::ones(sensitivity.len())
            };
            term.set_cell_weights(weights);
        }
        Ok(())
    }
}

impl Directive for UpdateSensitivityWeights {
    fn name(&self) -> &'static str {
        "UpdateSensitivityWeights"
    }

    fn initialize(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.update(state, problem)
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        if self.every_iteration {
            self.update(state, problem)?;
        }
        Ok(())
    }
}

/// Initial trade-off `ratio * (xᵀ H_d x) / (xᵀ H_m x)` from seeded random
/// probes `x`.
pub struct BetaEstimate {
    ratio: f64,
    seed: u64,
    n_probes: usize,
}

impl BetaEstimate {
    pub fn new(ratio: f64, seed: u64) -> Self {
        Self {
            ratio,
            seed,
            n_probes: 3,
        }
    }
}

impl Directive for BetaEstimate {
    fn name(&self) -> &'static str {
        "BetaEstimate"
    }

    fn initialize(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        let n = state.model.len();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let (mut data_curvature, mut model_curvature) = (0.0, 0.0);
        for _ in 0..self.n_probes {
            let x = Array1::from_shape_fn(n, |_| rng.gen_range(-1.0..1.0));
            data_curvature += x.dot(&problem.data_misfit().deriv2_vec(&state.model, &x));
            model_curvature += x.dot(&problem.regularization().deriv2_vec(&state.model, &x));
        }
        if data_curvature > 0.0 && model_curvature > 0.0 {
            state.beta = self.ratio * data_curvature / model_curvature;
        }
        info!("Initial beta estimated at {:.4e}", state.beta);
        Ok(())
    }

    fn end_iteration(
        &mut self,
        _state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        Ok(())
    }
}

/// Divide beta by `factor` every `rate` iterations until IRLS takes over.
pub struct BetaSchedule {
    factor: f64,
    rate: usize,
}

impl BetaSchedule {
    pub fn new(factor: f64, rate: usize) -> Self {
        Self {
            factor,
            rate: rate.max(1),
        }
    }
}

impl Directive for BetaSchedule {
    fn name(&self) -> &'static str {
        "BetaSchedule"
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        if !state.irls_started && state.iteration % self.rate == 0 {
            state.beta /= self.factor;
        }
        Ok(())
    }
}

/// Stop once the data misfit reaches the target.
#[derive(Default)]
pub struct TargetMisfit;

impl Directive for TargetMisfit {
    fn name(&self) -> &'static str {
        "TargetMisfit"
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        if state.phi_d <= state.target_misfit {
            info!(
                "Target misfit {:.4e} reached at iteration {}",
                state.target_misfit, state.iteration
            );
            state.stop = true;
        }
        Ok(())
    }
}

/// Two-phase sparse inversion: l2 iterations until the starting target is
/// met, then IRLS reweighting with beta adjusted towards the target misfit.
pub struct UpdateIrls {
    starting_target: f64,
    max_irls_iterations: usize,
    f_min_change: f64,
    beta_tol: f64,
    prctile: f64,
    cool_eps: Option<f64>,
    irls_iteration: usize,
    phi_m_last: Option<f64>,
}

impl UpdateIrls {
    pub fn from_params(params: &InversionParams, n_weighted: usize) -> Self {
        let starting_chi = params.starting_chi_factor.unwrap_or(params.chi_factor);
        Self {
            starting_target: 0.5 * starting_chi * n_weighted as f64,
            max_irls_iterations: params.max_irls_iterations,
            f_min_change: params.f_min_change,
            beta_tol: params.beta_tol,
            prctile: params.prctile,
            cool_eps: params.cool_eps_q.then_some(params.cool_eps_fact),
            irls_iteration: 0,
            phi_m_last: None,
        }
    }

    pub fn irls_iteration(&self) -> usize {
        self.irls_iteration
    }

    fn start(&mut self, state: &mut InversionState, problem: &mut InverseProblem) {
        for term in problem.regularization_mut().terms_mut() {
            term.start_irls(&state.model, self.prctile);
        }
        state.irls_started = true;
        self.phi_m_last = Some(problem.phi_m(&state.model));
        info!(
            "Reached starting chi factor at iteration {}; IRLS started",
            state.iteration
        );
    }
}

impl Directive for UpdateIrls {
    fn name(&self) -> &'static str {
        "UpdateIrls"
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        if !state.irls_started {
            if state.phi_d <= self.starting_target {
                self.start(state, problem);
            }
            return Ok(());
        }
        self.irls_iteration += 1;

        let misfit_ratio = state.phi_d / state.target_misfit;
        let fits_target = (1.0 - misfit_ratio).abs() <= self.beta_tol;
        if !fits_target && state.phi_d > 0.0 {
            state.beta *= state.target_misfit / state.phi_d;
        }

        let phi_m = problem.phi_m(&state.model);
        if let Some(last) = self.phi_m_last {
            let change = (phi_m - last).abs() / last.abs().max(f64::EPSILON);
            if change < self.f_min_change && fits_target {
                info!("Minimum model change reached after {} IRLS iterations", self.irls_iteration);
                state.stop = true;
                return Ok(());
            }
        }
        if self.irls_iteration >= self.max_irls_iterations {
            info!("Reached the maximum of {} IRLS iterations", self.max_irls_iterations);
            state.stop = true;
            return Ok(());
        }

        for term in problem.regularization_mut().terms_mut() {
            if let Some(factor) = self.cool_eps {
                term.cool_eps(factor);
            }
            term.update_irls(&state.model);
        }
        self.phi_m_last = Some(problem.phi_m(&state.model));
        Ok(())
    }
}

/// Predicted data per iteration on the output copy of the survey.
pub struct SaveIterationData {
    sink: ResultSink,
    group: String,
    entity: String,
    data: InversionData,
    data_misfit: DataMisfit,
}

impl SaveIterationData {
    pub fn new(
        sink: ResultSink,
        group: &str,
        entity: &str,
        data: InversionData,
        data_misfit: DataMisfit,
    ) -> Self {
        Self {
            sink,
            group: group.to_string(),
            entity: entity.to_string(),
            data,
            data_misfit,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Values on every element of the survey entity; rows outside the run
    /// are NaN.
    fn scatter(&self, values: &ndarray::Array2<f64>, column: usize) -> Vec<f64> {
        let mut full = vec![f64::NAN; self.data.n_elements()];
        for (row, &element) in self.data.indices().iter().enumerate() {
            full[element] = values[[row, column]];
        }
        full
    }

    fn ensure_entity(&self, with_observed: bool) -> Result<(), DirectiveError> {
        let mut observed = self.data.observed().clone();
        self.data.denormalize(&mut observed);
        let channels: Vec<(String, Vec<f64>)> = if with_observed {
            self.data
                .components()
                .iter()
                .enumerate()
                .map(|(column, component)| {
                    (format!("Observed_{}", component), self.scatter(&observed, column))
                })
                .collect()
        } else {
            Vec::new()
        };
        self.sink.write(|ws| {
            if ws.find_in_group(&self.entity, &self.group).is_none() {
                let source = ws.get_entity(self.data.entity_name())?;
                let copy = source.copy_geometry(&self.entity).with_group(&self.group);
                ws.add_entity(copy);
            }
            let entity = ws.get_in_group_mut(&self.entity, &self.group)?;
            for (name, values) in channels {
                entity.add_data(&name, values)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn save(&self, iteration: usize, model: &Array1<f64>) -> Result<(), DirectiveError> {
        let mut predicted = self.data_misfit.predicted(model);
        self.data.denormalize(&mut predicted);
        let channels: Vec<(String, Vec<f64>)> = self
            .data
            .components()
            .iter()
            .enumerate()
            .map(|(column, component)| {
                (
                    format!("Iteration_{}_{}", iteration, component),
                    self.scatter(&predicted, column),
                )
            })
            .collect();
        self.sink.write(|ws| {
            let entity = ws.get_in_group_mut(&self.entity, &self.group)?;
            for (name, values) in channels {
                entity.add_data(&name, values)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Forward-only output: the entity and the predictions of `model` as
    /// iteration 0.
    pub fn save_forward(&self, model: &Array1<f64>) -> Result<(), DirectiveError> {
        self.ensure_entity(false)?;
        self.save(0, model)
    }
}

impl Directive for SaveIterationData {
    fn name(&self) -> &'static str {
        "SaveIterationData"
    }

    fn initialize(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.ensure_entity(true)?;
        self.save(0, &state.model)
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.save(state.iteration, &state.model)
    }
}

/// Model per iteration on the output copy of the mesh, NaN outside the
/// active cells.
pub struct SaveIterationModel {
    sink: ResultSink,
    group: String,
    entity: String,
    geometry: Geometry,
    models: InversionModelCollection,
}

impl SaveIterationModel {
    pub fn new(
        sink: ResultSink,
        group: &str,
        mesh: &InversionMesh,
        models: InversionModelCollection,
    ) -> Self {
        Self {
            sink,
            group: group.to_string(),
            entity: "Models".to_string(),
            geometry: mesh.geometry().clone(),
            models,
        }
    }

    /// Channels for `model`; `prefix` is prepended with an underscore.
    pub fn channels(&self, prefix: &str, model: &Array1<f64>) -> Vec<(String, Vec<f64>)> {
        let active = self.models.active_cells();
        let name = |suffix: &str| {
            if prefix.is_empty() {
                suffix.to_string()
            } else {
                format!("{}_{}", prefix, suffix)
            }
        };
        if self.models.n_components() == 1 {
            return vec![(name("model"), active.expand(model.view()))];
        }
        let mut channels = vec![(
            name("model_amplitude"),
            active.expand(self.models.amplitude(model).view()),
        )];
        for (index, axis) in ["x", "y", "z"].iter().enumerate() {
            channels.push((
                name(&format!("model_{}", axis)),
                active.expand(self.models.component(model, index)),
            ));
        }
        channels
    }

    fn save(&self, prefix: &str, model: &Array1<f64>) -> Result<(), DirectiveError> {
        let channels = self.channels(prefix, model);
        self.sink.write(|ws| {
            if ws.find_in_group(&self.entity, &self.group).is_none() {
                ws.add_entity(Entity::new(&self.entity, self.geometry.clone()).with_group(&self.group));
            }
            let entity = ws.get_in_group_mut(&self.entity, &self.group)?;
            for (name, values) in channels {
                entity.add_data(&name, values)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl Directive for SaveIterationModel {
    fn name(&self) -> &'static str {
        "SaveIterationModel"
    }

    fn initialize(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.save("Iteration_0", &state.model)
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.save(&format!("Iteration_{}", state.iteration), &state.model)
    }

    fn finish(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.save("", &state.model)
    }
}

/// Convergence history as csv next to the workspace.
pub struct SaveOutput {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl SaveOutput {
    pub const SUFFIX: &'static str = ".inversion.out";

    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(&mut self, state: &InversionState) -> Result<(), DirectiveError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_record(&[
                state.iteration.to_string(),
                format!("{:e}", state.beta),
                format!("{:e}", state.phi_d),
                format!("{:e}", state.phi_m),
                format!("{:e}", state.phi()),
            ])?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl Directive for SaveOutput {
    fn name(&self) -> &'static str {
        "SaveOutput"
    }

    fn initialize(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        let mut writer = csv::Writer::from_path(&self.path)?;
        writer.write_record(["iteration", "beta", "phi_d", "phi_m", "phi"])?;
        self.writer = Some(writer);
        self.record(state)
    }

    fn end_iteration(
        &mut self,
        state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.record(state)
    }
}

/// Mirrors the workspace into the monitoring directory once per iteration,
/// after every other directive has written its results.
pub struct PublishResults {
    sink: ResultSink,
}

impl PublishResults {
    pub fn new(sink: ResultSink) -> Self {
        Self { sink }
    }

    fn publish(&self) -> Result<(), DirectiveError> {
        if let Some(path) = self.sink.publish()? {
            debug!("Published {}", path.display());
        }
        Ok(())
    }
}

impl Directive for PublishResults {
    fn name(&self) -> &'static str {
        "PublishResults"
    }

    fn initialize(
        &mut self,
        _state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.publish()
    }

    fn end_iteration(
        &mut self,
        _state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.publish()
    }

    fn finish(
        &mut self,
        _state: &mut InversionState,
        _problem: &mut InverseProblem,
    ) -> Result<(), DirectiveError> {
        self.publish()
    }
}

/// Assembles the directive list of a run in its fixed order.
pub struct DirectivesFactory<'a> {
    params: &'a InversionParams,
    sink: ResultSink,
    data: &'a InversionData,
    data_misfit: &'a DataMisfit,
    mesh: &'a InversionMesh,
    models: &'a InversionModelCollection,
    data_entity: String,
    n_weighted: Option<usize>,
}

impl<'a> DirectivesFactory<'a> {
    pub fn new(
        params: &'a InversionParams,
        sink: ResultSink,
        data: &'a InversionData,
        data_misfit: &'a DataMisfit,
        mesh: &'a InversionMesh,
        models: &'a InversionModelCollection,
    ) -> Self {
        Self {
            params,
            sink,
            data,
            data_misfit,
            mesh,
            models,
            data_entity: "Data".to_string(),
            n_weighted: None,
        }
    }

    pub fn with_data_entity(mut self, name: &str) -> Self {
        self.data_entity = name.to_string();
        self
    }

    /// Count of weighted data the IRLS targets refer to, when the objective
    /// spans more surveys than this factory saves.
    pub fn with_n_weighted(mut self, n_weighted: usize) -> Self {
        self.n_weighted = Some(n_weighted);
        self
    }

    pub fn save_data(&self) -> SaveIterationData {
        SaveIterationData::new(
            self.sink.clone(),
            &self.params.ga_group_name,
            &self.data_entity,
            self.data.clone(),
            self.data_misfit.clone(),
        )
    }

    pub fn save_model(&self) -> SaveIterationModel {
        SaveIterationModel::new(
            self.sink.clone(),
            &self.params.ga_group_name,
            self.mesh,
            self.models.clone(),
        )
    }

    pub fn build(&self) -> Result<DirectiveList, DirectiveError> {
        self.build_with(Vec::new())
    }

    /// Full list with `savers` run after this factory's own save directives
    /// and before the history and publishing steps.
    pub fn build_with(
        &self,
        savers: Vec<Box<dyn Directive>>,
    ) -> Result<DirectiveList, DirectiveError> {
        let params = self.params;
        let n_weighted = self
            .n_weighted
            .unwrap_or_else(|| self.data_misfit.objective_function().n_weighted());
        let mut directives: Vec<Box<dyn Directive>> = vec![Box::new(UpdateSensitivityWeights::new(
            params.sens_wts_threshold,
            params.every_iteration_bool,
        ))];
        if params.initial_beta.is_none() {
            directives.push(Box::new(BetaEstimate::new(params.initial_beta_ratio, 518_936)));
        }
        if params.is_sparse() {
            directives.push(Box::new(UpdateIrls::from_params(params, n_weighted)));
        }
        directives.push(Box::new(BetaSchedule::new(
            params.cooling_factor,
            params.cooling_rate,
        )));
        if !params.is_sparse() {
            directives.push(Box::new(TargetMisfit));
        }
        directives.push(Box::new(self.save_data()));
        directives.push(Box::new(self.save_model()));
        directives.extend(savers);
        let history = artifact_path(self.sink.workspace(), SaveOutput::SUFFIX);
        directives.push(Box::new(SaveOutput::new(&history)));
        directives.push(Box::new(PublishResults::new(self.sink.clone())));
        DirectiveList::new(directives)
    }
}

#[derive(Error, Debug)]
pub enum DirectiveError {
    #[error("Directive {before} must run before {after}")]
    Order { before: String, after: String },
    #[error(transparent)]
    WorkspaceError(#[from] WorkspaceError),
    #[error(transparent)]
    MinMaxError(#[from] MinMaxError),
    #[error(transparent)]
    CsvError(#[from] csv::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{ActiveCells, CellMesh};
    use crate::misfit::{ComboObjective, L2DataMisfit};
    use crate::regularization::RegularizationBuilder;
    use crate::simulation::{LinearSimulation, TileMap};
    use ndarray::array;
    use std::sync::Arc;

    fn problem(params: &InversionParams) -> InverseProblem {
        let sensitivities = array![[1.0, 0.5, 0.0, 0.0], [0.0, 0.5, 1.0, 0.1]];
        let simulation = LinearSimulation::new(sensitivities, TileMap::from_cells(4, vec![0, 1, 2, 3], 1));
        let term = L2DataMisfit::new(Box::new(simulation), array![1.0, -1.0], &array![0.1, 0.1]);
        let mesh = CellMesh::tensor([0.0; 3], &[1.0; 4], &[1.0], &[1.0]);
        let models = InversionModelCollection::new(Arc::new(ActiveCells::all(4)), 1, Array1::zeros(4));
        let regularization = RegularizationBuilder::default()
            .params(params)
            .mesh(&mesh)
            .models(&models)
            .build()
            .unwrap();
        InverseProblem::new(Arc::new(ComboObjective::combine(vec![Arc::new(term)])), regularization)
    }

    struct Named(&'static str);

    impl Directive for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn end_iteration(
            &mut self,
            _state: &mut InversionState,
            _problem: &mut InverseProblem,
        ) -> Result<(), DirectiveError> {
            Ok(())
        }
    }

    #[test]
    fn test_sensitivity_weights_must_precede_irls() {
        let valid = DirectiveList::new(vec![
            Box::new(Named("UpdateSensitivityWeights")),
            Box::new(Named("UpdateIrls")),
        ]);
        assert!(valid.is_ok());
        let invalid = DirectiveList::new(vec![
            Box::new(Named("UpdateIrls")),
            Box::new(Named("UpdateSensitivityWeights")),
        ]);
        assert!(matches!(invalid, Err(DirectiveError::Order { .. })));
    }

    #[test]
    fn test_sensitivity_weights_are_normalised_and_floored() {
        let params = InversionParams {
            sens_wts_threshold: 0.2,
            ..Default::default()
        };
        let mut problem = problem(&params);
        let mut state = InversionState::new(Array1::zeros(4), 1.0);
        let mut directive = UpdateSensitivityWeights::new(params.sens_wts_threshold, true);
        directive.initialize(&mut state, &mut problem).unwrap();
        let weights = problem.regularization().terms()[0].cell_weights().clone();
        assert!((weights.iter().cloned().fold(f64::MIN, f64::max) - 1.0).abs() < 1e-12);
        assert!(weights.iter().all(|&w| w >= 0.2));
        assert_eq!(weights[3], 0.2);
    }

    #[test]
    fn test_beta_estimate_is_seeded() {
        let params = InversionParams::default();
        let mut first = InversionState::new(Array1::zeros(4), 1.0);
        let mut second = first.clone();
        BetaEstimate::new(10.0, 7)
            .initialize(&mut first, &mut problem(&params))
            .unwrap();
        BetaEstimate::new(10.0, 7)
            .initialize(&mut second, &mut problem(&params))
            .unwrap();
        assert!(first.beta > 0.0);
        assert_eq!(first.beta, second.beta);
    }

    #[test]
    fn test_beta_schedule_cools_every_rate_iterations() {
        let params = InversionParams::default();
        let mut problem = problem(&params);
        let mut schedule = BetaSchedule::new(2.0, 2);
        let mut state = InversionState::new(Array1::zeros(4), 1.0);
        state.beta = 8.0;
        for iteration in 1..=4 {
            state.iteration = iteration;
            schedule.end_iteration(&mut state, &mut problem).unwrap();
        }
        assert_eq!(state.beta, 2.0);
        state.irls_started = true;
        state.iteration = 6;
        schedule.end_iteration(&mut state, &mut problem).unwrap();
        assert_eq!(state.beta, 2.0);
    }

    #[test]
    fn test_irls_starts_at_target_and_stops_at_cap() {
        let params = InversionParams {
            s_norm: 0.0,
            max_irls_iterations: 2,
            ..Default::default()
        };
        let mut problem = problem(&params);
        let mut irls = UpdateIrls::from_params(&params, 2);
        let mut state = InversionState::new(array![1.0, 0.0, -1.0, 0.0], 1.0);

        state.phi_d = 10.0;
        irls.end_iteration(&mut state, &mut problem).unwrap();
        assert!(!state.irls_started);

        state.phi_d = 0.5;
        irls.end_iteration(&mut state, &mut problem).unwrap();
        assert!(state.irls_started);
        assert!(problem.regularization().terms()[0].is_irls_active());

        state.phi_d = 5.0;
        irls.end_iteration(&mut state, &mut problem).unwrap();
        assert!(!state.stop);
        irls.end_iteration(&mut state, &mut problem).unwrap();
        assert!(state.stop);
        assert_eq!(irls.irls_iteration(), 2);
    }

    #[test]
    fn test_target_misfit_stops() {
        let params = InversionParams::default();
        let mut problem = problem(&params);
        let mut state = InversionState::new(Array1::zeros(4), 1.0);
        state.phi_d = 2.0;
        TargetMisfit.end_iteration(&mut state, &mut problem).unwrap();
        assert!(!state.stop);
        state.phi_d = 0.9;
        TargetMisfit.end_iteration(&mut state, &mut problem).unwrap();
        assert!(state.stop);
    }

    #[test]
    fn test_save_output_writes_history() {
        let dir = tempfile::tempdir().unwrap();
        let params = InversionParams::default();
        let mut problem = problem(&params);
        let mut output = SaveOutput::new(&dir.path().join("run.inversion.out"));
        let mut state = InversionState::new(Array1::zeros(4), 1.0);
        output.initialize(&mut state, &mut problem).unwrap();
        state.iteration = 1;
        output.end_iteration(&mut state, &mut problem).unwrap();
        let text = std::fs::read_to_string(output.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "iteration,beta,phi_d,phi_m,phi");
        assert!(lines[2].starts_with("1,"));
    }

    #[test]
    fn test_publish_results_copies_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let monitored = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ws.json");
        crate::workspace::Workspace::new(&path).save().unwrap();
        let params = InversionParams::default();
        let mut problem = problem(&params);
        let mut state = InversionState::new(Array1::zeros(4), 1.0);

        let mut publish = PublishResults::new(ResultSink::new(&path, Some(monitored.path())));
        publish.initialize(&mut state, &mut problem).unwrap();
        let copies = std::fs::read_dir(monitored.path()).unwrap().count();
        assert_eq!(copies, 1);
    }
}
