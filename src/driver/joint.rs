// geoinv/src/driver/joint.rs

use super::errors::DriverError;
use super::inversion_driver::{DriverState, InversionDriver};
use super::logger::InversionLogger;
use super::Driver;
use crate::components::{InversionData, InversionModelCollection};
use crate::directives::{Directive, DirectivesFactory};
use crate::misfit::{ComboObjective, DataMisfit};
use crate::optimization::{Inversion, InverseProblem, ProjectedGncgBuilder};
use crate::params::{InputFile, InversionParams, InversionType};
use crate::regularization::RegularizationBuilder;
use crate::workspace::{ResultSink, Workspace};
use log::info;
use std::path::Path;
use std::sync::Arc;

/// One survey of a joint inversion and the entity its predictions go to.
struct JointMember {
    label: &'static str,
    driver: InversionDriver,
}

/// Inverts several surveys sensitive to the same physical property for a
/// single model on a shared mesh.
pub struct JointSingleDriver {
    params: InversionParams,
    state: DriverState,
    logger: InversionLogger,
    members: Vec<JointMember>,
}

impl JointSingleDriver {
    pub fn new(params: InversionParams) -> Result<Self, DriverError> {
        let groups = [
            ("Data A", params.group_a.as_deref()),
            ("Data B", params.group_b.as_deref()),
            ("Data C", params.group_c.as_deref()),
        ];
        let mut members = Vec::new();
        for (label, path) in groups {
            if let Some(path) = path {
                members.push(JointMember {
                    label,
                    driver: Self::member(&params, path)?,
                });
            }
        }
        if members.is_empty() {
            return Err(DriverError::NoJointGroups);
        }
        let properties: Vec<_> = members
            .iter()
            .map(|member| member.driver.kind().physical_property())
            .collect();
        if properties.windows(2).any(|pair| pair[0] != pair[1]) {
            let description = members
                .iter()
                .zip(&properties)
                .map(|(member, property)| format!("{}: {:?}", member.driver.kind(), property))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DriverError::MixedPhysicalProperties(description));
        }
        Ok(Self {
            params,
            state: DriverState::Configured,
            logger: InversionLogger::console(),
            members,
        })
    }

    /// Sub-survey driver reading and writing the joint workspace.
    fn member(joint: &InversionParams, path: &Path) -> Result<InversionDriver, DriverError> {
        let mut params = InversionParams::from_input_file(&InputFile::read(path)?)?;
        let kind = params.kind()?;
        if kind.is_2d() || kind.is_pseudo_3d() || kind == InversionType::JointSingleProperty {
            return Err(DriverError::UnsupportedJointMember {
                kind: kind.to_string(),
            });
        }
        params.geoh5 = joint.geoh5.clone();
        params.monitoring_directory = joint.monitoring_directory.clone();
        params.ga_group_name = joint.ga_group_name.clone();
        if joint.mesh.is_some() {
            params.mesh = joint.mesh.clone();
        }
        if joint.topography_object.is_some() {
            params.topography_object = joint.topography_object.clone();
        }
        let logger = InversionLogger::console();
        Ok(InversionDriver::new(params, kind)?.with_logger(logger))
    }

    pub fn kinds(&self) -> Vec<InversionType> {
        self.members.iter().map(|member| member.driver.kind()).collect()
    }

    fn primary_kind(&self) -> Result<InversionType, DriverError> {
        self.members
            .first()
            .map(|member| member.driver.kind())
            .ok_or(DriverError::NoJointGroups)
    }

    fn sink(&self) -> ResultSink {
        ResultSink::new(&self.params.geoh5, self.params.monitoring_directory.as_deref())
    }

    pub fn run(&mut self) -> Result<DriverState, DriverError> {
        let _session = self.logger.session(&self.params.geoh5, "joint single property")?;
        self.state = DriverState::Resolving;

        let (first, rest) = match self.members.split_first_mut() {
            Some(split) => split,
            None => return Err(DriverError::NoJointGroups),
        };
        let mesh = first.driver.inversion_mesh()?.clone();
        let active_cells = first.driver.active_cells()?;
        for member in rest.iter_mut() {
            member.driver.share_mesh(mesh.clone(), Arc::clone(&active_cells));
        }

        let mut surveys: Vec<(&'static str, InversionData, DataMisfit)> = Vec::new();
        for member in self.members.iter_mut() {
            let data = member.driver.inversion_data()?.clone();
            let data_misfit = member.driver.data_misfit()?.clone();
            surveys.push((member.label, data, data_misfit));
        }
        let terms = surveys
            .iter()
            .flat_map(|(_, _, misfit)| misfit.objective_function().terms().to_vec())
            .collect();
        let objective = Arc::new(ComboObjective::combine(terms));
        let n_weighted = objective.n_weighted();
        self.state = DriverState::MisfitBuilt;

        let workspace = Workspace::open(&self.params.geoh5)?;
        let models = InversionModelCollection::resolve(
            &workspace,
            &self.params,
            self.primary_kind()?,
            &mesh,
            active_cells,
        )?;
        let sink = self.sink();

        if self.params.forward_only {
            self.logger.write_line("Running the forward simulation ...");
            for (label, data, misfit) in &surveys {
                DirectivesFactory::new(&self.params, sink.clone(), data, misfit, &mesh, &models)
                    .with_data_entity(label)
                    .save_data()
                    .save_forward(models.starting())?;
            }
            sink.publish()?;
            self.state = DriverState::ForwardOnlyDone;
        } else {
            let regularization = RegularizationBuilder::default()
                .params(&self.params)
                .mesh(mesh.mesh())
                .models(&models)
                .build()?;
            self.state = DriverState::RegularizationBuilt;
            let optimization = ProjectedGncgBuilder::default()
                .max_iterations(self.params.max_global_iterations)
                .max_line_search_iterations(self.params.max_line_search_iterations)
                .max_cg_iterations(self.params.max_cg_iterations)
                .tol_cg(self.params.tol_cg)
                .lower(models.lower_bound().clone())
                .upper(models.upper_bound().clone())
                .build()?;
            self.state = DriverState::OptimizerBuilt;

            let mut factories = surveys.iter().map(|(label, data, misfit)| {
                DirectivesFactory::new(&self.params, sink.clone(), data, misfit, &mesh, &models)
                    .with_data_entity(label)
                    .with_n_weighted(n_weighted)
            });
            let primary = factories.next().ok_or(DriverError::NoJointGroups)?;
            let savers: Vec<Box<dyn Directive>> = factories
                .map(|factory| Box::new(factory.save_data()) as Box<dyn Directive>)
                .collect();
            let directives = primary.build_with(savers)?;

            let target = 0.5 * self.params.chi_factor * n_weighted as f64;
            self.logger.write_line(&format!(
                "Target Misfit: {:.2e} ({} data from {} surveys with chifact = {}) / 2",
                target,
                n_weighted,
                surveys.len(),
                self.params.chi_factor
            ));
            self.state = DriverState::Running;
            let problem = InverseProblem::new(objective, regularization);
            let mut inversion = Inversion::new(problem, optimization, directives);
            let outcome = inversion.run(models.starting().clone(), target, &self.logger)?;
            info!(
                "Joint inversion {} after {} iterations",
                outcome.status, outcome.iterations
            );
            self.state = outcome.status.into();
        }
        self.state = DriverState::ArtifactsWritten;
        self.state = DriverState::Closed;
        Ok(self.state)
    }
}

impl Driver for JointSingleDriver {
    fn params(&self) -> &InversionParams {
        &self.params
    }

    fn state(&self) -> DriverState {
        self.state
    }

    fn run(&mut self) -> Result<DriverState, DriverError> {
        JointSingleDriver::run(self)
    }
}
