// geoinv/src/driver/inversion_driver.rs

use super::compute::ComputeConfig;
use super::errors::DriverError;
use super::logger::InversionLogger;
use super::Driver;
use crate::components::{
    ActiveCells, InversionData, InversionMesh, InversionModelCollection, InversionTopography,
    InversionWindow,
};
use crate::directives::{DirectiveList, DirectivesFactory};
use crate::misfit::{DataMisfit, MisfitFactory};
use crate::optimization::{
    Inversion, InversionOutcome, InversionStatus, InverseProblem, ProjectedGncg,
    ProjectedGncgBuilder,
};
use crate::params::{InversionParams, InversionType};
use crate::regularization::{Regularization, RegularizationBuilder};
use crate::simulation::{LinearSimulationFactory, SimulationFactory};
use crate::tiling::{get_tiles, Tile};
use crate::workspace::{ResultSink, Workspace};
use log::{debug, info};
use std::sync::Arc;

/// Progress of a driver. Runs only ever move forward through these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriverState {
    Configured,
    Resolving,
    MisfitBuilt,
    RegularizationBuilt,
    OptimizerBuilt,
    Running,
    ForwardOnlyDone,
    Converged,
    IterationCap,
    ArtifactsWritten,
    Closed,
}

impl DriverState {
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            DriverState::ForwardOnlyDone | DriverState::Converged | DriverState::IterationCap
        )
    }

    pub fn can_advance_to(&self, next: DriverState) -> bool {
        match next {
            DriverState::Closed => *self != DriverState::Closed,
            _ if next.is_outcome() => *self == DriverState::Running,
            DriverState::ArtifactsWritten => self.is_outcome(),
            _ => next > *self && !self.is_outcome(),
        }
    }
}

impl From<InversionStatus> for DriverState {
    fn from(status: InversionStatus) -> Self {
        match status {
            InversionStatus::Converged => DriverState::Converged,
            InversionStatus::IterationCap => DriverState::IterationCap,
        }
    }
}

fn built<'a, T>(slot: &'a Option<T>, what: &'static str) -> Result<&'a T, DriverError> {
    slot.as_ref().ok_or(DriverError::NotBuilt(what))
}

/// Wires resolvers, tiling, misfit, regularization, optimizer and
/// directives into one run. Every derived object is built at most once.
pub struct InversionDriver {
    params: InversionParams,
    kind: InversionType,
    workspace: Workspace,
    logger: InversionLogger,
    compute: ComputeConfig,
    simulations: Box<dyn SimulationFactory>,
    state: DriverState,
    window: Option<InversionWindow>,
    topography: Option<InversionTopography>,
    data: Option<InversionData>,
    mesh: Option<InversionMesh>,
    active_cells: Option<Arc<ActiveCells>>,
    models: Option<InversionModelCollection>,
    tiles: Option<Vec<Tile>>,
    data_misfit: Option<DataMisfit>,
    regularization: Option<Regularization>,
    optimization: Option<ProjectedGncg>,
    outcome: Option<InversionOutcome>,
}

impl InversionDriver {
    pub fn new(params: InversionParams, kind: InversionType) -> Result<Self, DriverError> {
        let workspace = Workspace::open(&params.geoh5)?;
        let compute = ComputeConfig::from_params(&params);
        compute.configure();
        let window = InversionWindow::from_params(&params);
        Ok(Self {
            params,
            kind,
            workspace,
            logger: InversionLogger::console(),
            compute,
            simulations: Box::new(LinearSimulationFactory),
            state: DriverState::Configured,
            window,
            topography: None,
            data: None,
            mesh: None,
            active_cells: None,
            models: None,
            tiles: None,
            data_misfit: None,
            regularization: None,
            optimization: None,
            outcome: None,
        })
    }

    pub fn from_params(params: InversionParams) -> Result<Self, DriverError> {
        let kind = params.kind()?;
        Self::new(params, kind)
    }

    pub fn with_logger(mut self, logger: InversionLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_simulation_factory(mut self, simulations: Box<dyn SimulationFactory>) -> Self {
        self.simulations = simulations;
        self
    }

    /// Adopt a mesh and active set resolved elsewhere (joint inversions).
    pub fn share_mesh(&mut self, mesh: InversionMesh, active_cells: Arc<ActiveCells>) {
        self.mesh = Some(mesh);
        self.active_cells = Some(active_cells);
    }

    pub fn kind(&self) -> InversionType {
        self.kind
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn logger(&self) -> &InversionLogger {
        &self.logger
    }

    pub fn compute(&self) -> &ComputeConfig {
        &self.compute
    }

    pub fn outcome(&self) -> Option<&InversionOutcome> {
        self.outcome.as_ref()
    }

    pub fn window(&self) -> Option<&InversionWindow> {
        self.window.as_ref()
    }

    pub fn sink(&self) -> ResultSink {
        ResultSink::new(&self.params.geoh5, self.params.monitoring_directory.as_deref())
    }

    fn reach(&mut self, state: DriverState) {
        if state > self.state && !self.state.is_outcome() {
            debug!("Driver state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn transition(&mut self, next: DriverState) -> Result<(), DriverError> {
        if !self.state.can_advance_to(next) {
            return Err(DriverError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Driver state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn ensure_topography(&mut self) -> Result<(), DriverError> {
        if self.topography.is_some() {
            return Ok(());
        }
        self.reach(DriverState::Resolving);
        let topography = if self.params.topography_object.is_some() {
            InversionTopography::from_workspace(&self.workspace, &self.params)?
        } else {
            self.ensure_data()?;
            let data = built(&self.data, "inversion data")?;
            InversionTopography::new(data.locations().clone(), data.entity_name())
        };
        self.topography = Some(topography);
        Ok(())
    }

    fn ensure_data(&mut self) -> Result<(), DriverError> {
        if self.data.is_some() {
            return Ok(());
        }
        self.reach(DriverState::Resolving);
        if self.params.z_from_topo && self.params.topography_object.is_some() {
            self.ensure_topography()?;
        }
        let data = InversionData::from_workspace(
            &self.workspace,
            &self.params,
            self.kind,
            self.window.as_ref(),
            self.topography.as_ref(),
        )?;
        self.data = Some(data);
        Ok(())
    }

    pub fn inversion_topography(&mut self) -> Result<&InversionTopography, DriverError> {
        self.ensure_topography()?;
        built(&self.topography, "inversion topography")
    }

    pub fn inversion_data(&mut self) -> Result<&InversionData, DriverError> {
        self.ensure_data()?;
        built(&self.data, "inversion data")
    }

    pub fn inversion_mesh(&mut self) -> Result<&InversionMesh, DriverError> {
        if self.mesh.is_none() {
            self.ensure_data()?;
            self.ensure_topography()?;
            let mesh = InversionMesh::resolve(
                &self.workspace,
                &self.params,
                self.kind,
                built(&self.data, "inversion data")?,
                built(&self.topography, "inversion topography")?,
            )?;
            self.mesh = Some(mesh);
        }
        built(&self.mesh, "inversion mesh")
    }

    pub fn active_cells(&mut self) -> Result<Arc<ActiveCells>, DriverError> {
        if self.active_cells.is_none() {
            self.inversion_mesh()?;
            let active = built(&self.topography, "inversion topography")?.active_cells(
                built(&self.mesh, "inversion mesh")?,
                built(&self.data, "inversion data")?,
            )?;
            self.active_cells = Some(Arc::new(active));
        }
        built(&self.active_cells, "active cells").map(Arc::clone)
    }

    pub fn inversion_models(&mut self) -> Result<&InversionModelCollection, DriverError> {
        if self.models.is_none() {
            let active = self.active_cells()?;
            let models = InversionModelCollection::resolve(
                &self.workspace,
                &self.params,
                self.kind,
                built(&self.mesh, "inversion mesh")?,
                active,
            )?;
            self.models = Some(models);
        }
        built(&self.models, "inversion models")
    }

    pub fn tiles(&mut self) -> Result<&[Tile], DriverError> {
        if self.tiles.is_none() {
            self.ensure_data()?;
            let tiles = get_tiles(
                built(&self.data, "inversion data")?,
                self.kind,
                self.params.tile_spatial,
            )?;
            self.tiles = Some(tiles);
        }
        built(&self.tiles, "tiles").map(Vec::as_slice)
    }

    pub fn data_misfit(&mut self) -> Result<&DataMisfit, DriverError> {
        if self.data_misfit.is_none() {
            let tiles = self.tiles()?.to_vec();
            let active = self.active_cells()?;
            let factory = MisfitFactory::new(&self.params, self.kind, self.simulations.as_ref());
            let data_misfit = DataMisfit::new(
                &factory,
                tiles,
                built(&self.data, "inversion data")?,
                built(&self.mesh, "inversion mesh")?.mesh(),
                &active,
                &self.logger,
            )?;
            self.data_misfit = Some(data_misfit);
            self.reach(DriverState::MisfitBuilt);
        }
        built(&self.data_misfit, "data misfit")
    }

    pub fn regularization(&mut self) -> Result<&Regularization, DriverError> {
        if self.regularization.is_none() {
            self.inversion_models()?;
            let regularization = RegularizationBuilder::default()
                .params(&self.params)
                .mesh(built(&self.mesh, "inversion mesh")?.mesh())
                .models(built(&self.models, "inversion models")?)
                .build()?;
            self.regularization = Some(regularization);
            self.reach(DriverState::RegularizationBuilt);
        }
        built(&self.regularization, "regularization")
    }

    pub fn optimization(&mut self) -> Result<&ProjectedGncg, DriverError> {
        if self.optimization.is_none() {
            self.inversion_models()?;
            let models = built(&self.models, "inversion models")?;
            let optimization = ProjectedGncgBuilder::default()
                .max_iterations(self.params.max_global_iterations)
                .max_line_search_iterations(self.params.max_line_search_iterations)
                .max_cg_iterations(self.params.max_cg_iterations)
                .tol_cg(self.params.tol_cg)
                .lower(models.lower_bound().clone())
                .upper(models.upper_bound().clone())
                .build()?;
            self.optimization = Some(optimization);
            self.reach(DriverState::OptimizerBuilt);
        }
        built(&self.optimization, "optimization")
    }

    /// Directives are rebuilt on every call; they carry per-run state.
    pub fn directives(&mut self) -> Result<DirectiveList, DriverError> {
        self.inversion_models()?;
        self.data_misfit()?;
        let sink = self.sink();
        let factory = DirectivesFactory::new(
            &self.params,
            sink,
            built(&self.data, "inversion data")?,
            built(&self.data_misfit, "data misfit")?,
            built(&self.mesh, "inversion mesh")?,
            built(&self.models, "inversion models")?,
        );
        Ok(factory.build()?)
    }

    /// Target misfit `0.5 chi N` over the weighted data.
    pub fn target_misfit(&mut self) -> Result<f64, DriverError> {
        let n = self.data_misfit()?.objective_function().n_weighted();
        Ok(0.5 * self.params.chi_factor * n as f64)
    }

    fn start_inversion_message(&mut self) -> Result<(), DriverError> {
        let n = self.data_misfit()?.objective_function().n_weighted();
        let chi = self.params.chi_factor;
        let chi_start = self.params.starting_chi_factor.unwrap_or(chi);
        self.logger.write_line(&format!(
            "Target Misfit: {:.2e} ({} data with chifact = {}) / 2",
            0.5 * chi * n as f64,
            n,
            chi
        ));
        self.logger.write_line(&format!(
            "IRLS Start Misfit: {:.2e} ({} data with chifact = {}) / 2",
            0.5 * chi_start * n as f64,
            n,
            chi_start
        ));
        Ok(())
    }

    fn forward(&mut self) -> Result<(), DriverError> {
        self.logger.write_line("Running the forward simulation ...");
        self.data_misfit()?;
        self.inversion_models()?;
        self.transition(DriverState::Running)?;
        let factory = DirectivesFactory::new(
            &self.params,
            self.sink(),
            built(&self.data, "inversion data")?,
            built(&self.data_misfit, "data misfit")?,
            built(&self.mesh, "inversion mesh")?,
            built(&self.models, "inversion models")?,
        );
        let starting = built(&self.models, "inversion models")?.starting();
        factory.save_data().save_forward(starting)?;
        self.sink().publish()?;
        self.transition(DriverState::ForwardOnlyDone)
    }

    fn invert(&mut self) -> Result<(), DriverError> {
        let objective = Arc::clone(self.data_misfit()?.objective_function());
        let regularization = self.regularization()?.clone();
        let optimization = self.optimization()?.clone();
        let directives = self.directives()?;
        let target = self.target_misfit()?;
        let starting = self.inversion_models()?.starting().clone();
        self.start_inversion_message()?;
        self.transition(DriverState::Running)?;

        let problem = InverseProblem::new(objective, regularization);
        let mut inversion = Inversion::new(problem, optimization, directives);
        let outcome = inversion.run(starting, target, &self.logger)?;
        info!(
            "{} after {} iterations: phi_d {:.4e}, phi_m {:.4e}",
            outcome.status, outcome.iterations, outcome.phi_d, outcome.phi_m
        );
        self.transition(outcome.status.into())?;
        self.outcome = Some(outcome);
        Ok(())
    }

    pub fn run(&mut self) -> Result<DriverState, DriverError> {
        let _session = self.logger.session(&self.params.geoh5, self.kind.as_str())?;
        self.reach(DriverState::Resolving);
        if self.params.forward_only {
            self.forward()?;
        } else {
            self.invert()?;
        }
        self.transition(DriverState::ArtifactsWritten)?;
        self.transition(DriverState::Closed)?;
        Ok(self.state)
    }
}

impl Driver for InversionDriver {
    fn params(&self) -> &InversionParams {
        &self.params
    }

    fn state(&self) -> DriverState {
        self.state
    }

    fn run(&mut self) -> Result<DriverState, DriverError> {
        InversionDriver::run(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::params::InputFile;
    use crate::workspace::{Entity, Geometry};
    use serde_json::{json, Value};
    use std::path::Path;

    /// Gravity survey of 3 x 3 stations above a 4 x 4 x 4 tensor mesh.
    pub(crate) fn gravity_workspace(path: &Path) {
        let mut workspace = Workspace::new(path);
        let mut vertices = Vec::new();
        let mut gz = Vec::new();
        for j in 0..3 {
            for i in 0..3 {
                let (x, y) = (-30.0 + 30.0 * i as f64, -30.0 + 30.0 * j as f64);
                vertices.push([x, y, 5.0]);
                gz.push(-0.01 * (1.0 + ((x * x + y * y) / 900.0)).recip());
            }
        }
        let mut survey = Entity::new("survey", Geometry::Points { vertices });
        survey.add_data("gz", gz).unwrap();
        workspace.add_entity(survey);
        let topography = (0..25)
            .map(|k| [-100.0 + 50.0 * (k % 5) as f64, -100.0 + 50.0 * (k / 5) as f64, 0.0])
            .collect();
        workspace.add_entity(Entity::new("topo", Geometry::Points { vertices: topography }));
        workspace.add_entity(Entity::new(
            "mesh",
            Geometry::TensorMesh {
                origin: [-50.0, -50.0, -100.0],
                hx: vec![25.0; 4],
                hy: vec![25.0; 4],
                hz: vec![25.0; 4],
            },
        ));
        workspace.save().unwrap();
    }

    pub(crate) fn gravity_params(dir: &Path, extra: Value) -> InversionParams {
        let mut ui = json!({
            "inversion_type": "gravity",
            "geoh5": "grav.ws.json",
            "data_object": "survey",
            "gz_channel": "gz",
            "gz_uncertainty": 0.001,
            "topography_object": "topo",
            "mesh": "mesh",
            "starting_model": 0.0,
            "max_global_iterations": 3,
            "tile_spatial": 2,
            "n_cpu": 2,
        });
        if let (Some(base), Value::Object(more)) = (ui.as_object_mut(), extra) {
            base.extend(more);
        }
        let map = match ui {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        InversionParams::from_input_file(&InputFile::from_map(&dir.join("grav.ui.json"), map))
            .unwrap()
    }

    /// Dipole-dipole survey with one current dipole on each line
    /// `1..=n_lines` at y = 50 (line - 1) and four receiver dipoles on each
    /// line of `with_data`. The `line` channel holds the line of every datum.
    pub(crate) fn dc_workspace(path: &Path, n_lines: usize, with_data: &[i64]) {
        let mut workspace = Workspace::new(path);
        let mut tx_vertices = Vec::new();
        let mut tx_cells = Vec::new();
        let mut parts = Vec::new();
        for line in 1..=n_lines as i64 {
            let y = 50.0 * (line - 1) as f64;
            let start = tx_vertices.len();
            tx_vertices.push([0.0, y, 0.0]);
            tx_vertices.push([10.0, y, 0.0]);
            tx_cells.push([start, start + 1]);
            parts.extend([line, line]);
        }
        workspace.add_entity(Entity::new(
            "currents",
            Geometry::CurrentElectrodes {
                vertices: tx_vertices,
                cells: tx_cells,
                parts,
            },
        ));

        let mut vertices = Vec::new();
        let mut cells = Vec::new();
        let mut ab_cell_id = Vec::new();
        let mut lines = Vec::new();
        let mut potential = Vec::new();
        for &line in with_data {
            let y = 50.0 * (line - 1) as f64;
            for j in 0..4 {
                let x = 20.0 + 10.0 * j as f64;
                let start = vertices.len();
                vertices.push([x, y, 0.0]);
                vertices.push([x + 10.0, y, 0.0]);
                cells.push([start, start + 1]);
                ab_cell_id.push(line as usize);
                lines.push(line as f64);
                potential.push(0.1 / (j + 1) as f64);
            }
        }
        let mut survey = Entity::new(
            "dc",
            Geometry::PotentialElectrodes {
                vertices,
                cells,
                ab_cell_id,
                current_electrodes: "currents".to_string(),
            },
        );
        survey.add_data("line", lines).unwrap();
        survey.add_data("potential", potential).unwrap();
        workspace.add_entity(survey);
        workspace.add_entity(Entity::new(
            "mesh",
            Geometry::TensorMesh {
                origin: [-25.0, -25.0, -100.0],
                hx: vec![25.0; 5],
                hy: vec![25.0; 2 * n_lines + 1],
                hz: vec![25.0; 4],
            },
        ));
        workspace.save().unwrap();
    }

    pub(crate) fn dc_ui(inversion_type: &str, extra: Value) -> serde_json::Map<String, Value> {
        let mut ui = json!({
            "inversion_type": inversion_type,
            "geoh5": "dc.ws.json",
            "data_object": "dc",
            "potential_channel": "potential",
            "potential_uncertainty": 0.01,
            "mesh": "mesh",
            "depth_core": 100.0,
            "vertical_padding": 50.0,
            "max_global_iterations": 2,
            "n_cpu": 1,
        });
        if let (Some(base), Value::Object(more)) = (ui.as_object_mut(), extra) {
            base.extend(more);
        }
        match ui {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn driver(extra: Value) -> (tempfile::TempDir, InversionDriver) {
        let dir = tempfile::tempdir().unwrap();
        gravity_workspace(&dir.path().join("grav.ws.json"));
        let params = gravity_params(dir.path(), extra);
        let driver = InversionDriver::from_params(params).unwrap();
        (dir, driver)
    }

    #[test]
    fn test_state_machine_only_moves_forward() {
        use DriverState::*;
        assert!(Configured.can_advance_to(Resolving));
        assert!(MisfitBuilt.can_advance_to(Running));
        assert!(Running.can_advance_to(ForwardOnlyDone));
        assert!(Converged.can_advance_to(ArtifactsWritten));
        assert!(!Converged.can_advance_to(IterationCap));
        assert!(!Resolving.can_advance_to(Converged));
        assert!(!OptimizerBuilt.can_advance_to(MisfitBuilt));
        assert!(!Closed.can_advance_to(Closed));
        assert!(Resolving.can_advance_to(Closed));
    }

    #[test]
    fn test_derived_objects_are_built_once() {
        let (_dir, mut driver) = driver(json!({}));
        let first = driver.data_misfit().unwrap() as *const DataMisfit;
        let objective = Arc::clone(driver.data_misfit().unwrap().objective_function());
        let second = driver.data_misfit().unwrap() as *const DataMisfit;
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(
            &objective,
            driver.data_misfit().unwrap().objective_function()
        ));

        let mesh = driver.inversion_mesh().unwrap() as *const InversionMesh;
        assert_eq!(mesh, driver.inversion_mesh().unwrap() as *const InversionMesh);
        let regularization = driver.regularization().unwrap() as *const Regularization;
        assert_eq!(
            regularization,
            driver.regularization().unwrap() as *const Regularization
        );
        assert_eq!(driver.state(), DriverState::RegularizationBuilt);
    }

    #[test]
    fn test_tiles_cover_the_survey() {
        let (_dir, mut driver) = driver(json!({}));
        let mut rows: Vec<usize> = driver.tiles().unwrap().iter().flatten().copied().collect();
        rows.sort_unstable();
        assert_eq!(rows, (0..9).collect::<Vec<_>>());
        assert!(driver.tiles().unwrap().len() <= 2);
    }

    #[test]
    fn test_forward_only_writes_predictions() {
        let (dir, mut driver) = driver(json!({"forward_only": true, "starting_model": 0.5}));
        let state = driver.run().unwrap();
        assert_eq!(state, DriverState::Closed);
        assert!(driver.outcome().is_none());
        assert!(driver.regularization.is_none());

        let workspace = Workspace::open(&dir.path().join("grav.ws.json")).unwrap();
        let predicted = workspace.get_entity("Data").unwrap().get_data("Iteration_0_gz").unwrap();
        assert_eq!(predicted.len(), 9);
        assert!(predicted.iter().all(|v| v.is_finite()));
        assert!(dir.path().join("grav.inversion.log").exists());
    }

    #[test]
    fn test_inversion_writes_iterations() {
        crate::setup_pretty_env_logger_default();
        let (dir, mut driver) = driver(json!({}));
        driver.run().unwrap();
        let outcome = driver.outcome().unwrap();
        assert!(outcome.iterations >= 1 && outcome.iterations <= 3);

        let workspace = Workspace::open(&dir.path().join("grav.ws.json")).unwrap();
        let data = workspace.get_entity("Data").unwrap();
        assert!(data.get_data("Observed_gz").is_some());
        assert!(data.get_data("Iteration_1_gz").is_some());
        let models = workspace.get_entity("Models").unwrap();
        assert_eq!(models.get_data("Iteration_1_model").unwrap().len(), 64);
        assert!(models.get_data("model").is_some());
        let history = std::fs::read_to_string(dir.path().join("grav.inversion.out")).unwrap();
        assert_eq!(history.lines().count(), outcome.iterations + 2);
    }

    #[test]
    fn test_incompatible_mesh_names_objects() {
        let (_dir, mut driver) = driver(json!({"receivers_offset_x": 5000.0}));
        match driver.active_cells() {
            Err(DriverError::ComponentError(error)) => {
                let message = error.to_string();
                assert!(message.contains("mesh") && message.contains("survey"));
            }
            _ => panic!("expected an incompatible mesh error"),
        }
    }

    #[test]
    fn test_line_without_data_keeps_its_empty_tile() {
        let dir = tempfile::tempdir().unwrap();
        dc_workspace(&dir.path().join("dc.ws.json"), 3, &[1, 3]);
        let ui = dc_ui("direct current 3d", json!({"tile_spatial": 3}));
        let params =
            InversionParams::from_input_file(&InputFile::from_map(&dir.path().join("dc.ui.json"), ui))
                .unwrap();
        let mut driver = InversionDriver::from_params(params).unwrap();

        let tiles = driver.tiles().unwrap().to_vec();
        assert_eq!(tiles.len(), 3);
        assert!(tiles[1].is_empty());
        assert_eq!(tiles.iter().map(Vec::len).sum::<usize>(), 8);

        assert_eq!(driver.run().unwrap(), DriverState::Closed);
        let workspace = Workspace::open(&dir.path().join("dc.ws.json")).unwrap();
        let predicted = workspace
            .get_in_group("Data", "Inversion")
            .unwrap()
            .get_data("Iteration_1_potential")
            .unwrap();
        assert_eq!(predicted.len(), 8);
        assert!(predicted.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_monitoring_copies_once_per_iteration() {
        let monitored = tempfile::tempdir().unwrap();
        let (_dir, mut driver) = driver(json!({
            "monitoring_directory": monitored.path().display().to_string(),
        }));
        driver.run().unwrap();
        let iterations = driver.outcome().unwrap().iterations;
        let copies = std::fs::read_dir(monitored.path()).unwrap().count();
        assert!(copies >= 1);
        assert!(copies <= iterations + 2);
    }
}
