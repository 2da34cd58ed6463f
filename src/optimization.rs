// geoinv/src/optimization.rs

//! Projected Gauss-Newton / conjugate-gradient minimisation of
//! `phi_d + beta phi_m`, driven by a directive list.

use crate::directives::{DirectiveError, DirectiveList};
use crate::driver::InversionLogger;
use crate::misfit::ComboObjective;
use crate::regularization::Regularization;
use derive_builder::Builder;
use humantime::format_duration;
use log::{debug, info, warn};
use ndarray::{Array1, Zip};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Sufficient decrease constant of the Armijo rule.
const ARMIJO: f64 = 1e-4;

/// Data misfit and regularization of one run.
pub struct InverseProblem {
    data_misfit: Arc<ComboObjective>,
    regularization: Regularization,
}

impl InverseProblem {
    pub fn new(data_misfit: Arc<ComboObjective>, regularization: Regularization) -> Self {
        Self {
            data_misfit,
            regularization,
        }
    }

    pub fn data_misfit(&self) -> &ComboObjective {
        &self.data_misfit
    }

    pub fn regularization(&self) -> &Regularization {
        &self.regularization
    }

    pub fn regularization_mut(&mut self) -> &mut Regularization {
        &mut self.regularization
    }

    pub fn phi_d(&self, model: &Array1<f64>) -> f64 {
        self.data_misfit.eval(model)
    }

    pub fn phi_m(&self, model: &Array1<f64>) -> f64 {
        self.regularization.eval(model)
    }

    pub fn objective(&self, model: &Array1<f64>, beta: f64) -> f64 {
        self.phi_d(model) + beta * self.phi_m(model)
    }

    pub fn gradient(&self, model: &Array1<f64>, beta: f64) -> Array1<f64> {
        self.data_misfit.deriv(model) + self.regularization.deriv(model) * beta
    }

    pub fn hessian_vec(&self, model: &Array1<f64>, beta: f64, v: &Array1<f64>) -> Array1<f64> {
        self.data_misfit.deriv2_vec(model, v) + self.regularization.deriv2_vec(model, v) * beta
    }

    pub fn hessian_diag(&self, model: &Array1<f64>, beta: f64) -> Array1<f64> {
        self.data_misfit.jtj_diag(model) + self.regularization.deriv2_diag() * beta
    }
}

/// Mutable state shared between the optimizer and the directives.
#[derive(Clone, Debug)]
pub struct InversionState {
    pub iteration: usize,
    pub model: Array1<f64>,
    pub beta: f64,
    pub phi_d: f64,
    pub phi_m: f64,
    /// Misfit at which the data are fit, `0.5 chi_factor N`.
    pub target_misfit: f64,
    pub irls_started: bool,
    pub stop: bool,
}

impl InversionState {
    pub fn new(model: Array1<f64>, target_misfit: f64) -> Self {
        Self {
            iteration: 0,
            model,
            beta: 1.0,
            phi_d: f64::NAN,
            phi_m: f64::NAN,
            target_misfit,
            irls_started: false,
            stop: false,
        }
    }

    pub fn phi(&self) -> f64 {
        self.phi_d + self.beta * self.phi_m
    }
}

#[derive(Builder, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct ProjectedGncg {
    #[builder(default = "50")]
    max_iterations: usize,
    #[builder(default = "20")]
    max_line_search_iterations: usize,
    #[builder(default = "30")]
    max_cg_iterations: usize,
    #[builder(default = "1e-4")]
    tol_cg: f64,
    /// Step reduction factor of the backtracking line search.
    #[builder(default = "0.25")]
    ls_shorten: f64,
    #[builder(default, setter(strip_option))]
    lower: Option<Array1<f64>>,
    #[builder(default, setter(strip_option))]
    upper: Option<Array1<f64>>,
}

impl ProjectedGncgBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(shorten) = self.ls_shorten {
            if !(0.0 < shorten && shorten < 1.0) {
                return Err(format!("ls_shorten must be in (0, 1), got {}", shorten));
            }
        }
        if let (Some(Some(lower)), Some(Some(upper))) = (&self.lower, &self.upper) {
            if lower.len() != upper.len() || lower.iter().zip(upper.iter()).any(|(l, u)| l > u) {
                return Err("lower bounds must not exceed upper bounds".to_string());
            }
        }
        Ok(())
    }
}

impl ProjectedGncg {
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn project(&self, model: &mut Array1<f64>) {
        if let Some(lower) = &self.lower {
            Zip::from(&mut *model).and(lower).for_each(|m, &l| *m = m.max(l));
        }
        if let Some(upper) = &self.upper {
            Zip::from(&mut *model).and(upper).for_each(|m, &u| *m = m.min(u));
        }
    }

    /// Parameters held at a bound by a gradient pushing outwards.
    fn free_mask(&self, model: &Array1<f64>, gradient: &Array1<f64>) -> Array1<f64> {
        let mut free = Array1::<f64>::ones(model.len());
        for (i, flag) in free.iter_mut().enumerate() {
            let at_lower = self.lower.as_ref().map_or(false, |l| model[i] <= l[i] && gradient[i] > 0.0);
            let at_upper = self.upper.as_ref().map_or(false, |u| model[i] >= u[i] && gradient[i] < 0.0);
            if at_lower || at_upper {
                *flag = 0.0;
            }
        }
        free
    }

    /// Jacobi-preconditioned CG on the free parameters.
    fn solve(
        &self,
        problem: &InverseProblem,
        model: &Array1<f64>,
        beta: f64,
        rhs: &Array1<f64>,
        free: &Array1<f64>,
    ) -> Array1<f64> {
        let diagonal = problem.hessian_diag(model, beta);
        let precondition = |r: &Array1<f64>| {
            Zip::from(r)
                .and(&diagonal)
                .and(free)
                .map_collect(|r, d, f| if *d > 0.0 { f * r / d } else { f * r })
        };
        let mut x = Array1::<f64>::zeros(rhs.len());
        let mut r = rhs * free;
        let mut z = precondition(&r);
        let mut p = z.clone();
        let mut rz = r.dot(&z);
        let tolerance = self.tol_cg * r.dot(&r).sqrt();
        for _ in 0..self.max_cg_iterations {
            if r.dot(&r).sqrt() <= tolerance || rz == 0.0 {
                break;
            }
            let hp = problem.hessian_vec(model, beta, &p) * free;
            let curvature = p.dot(&hp);
            if curvature <= 0.0 {
                break;
            }
            let alpha = rz / curvature;
            x.scaled_add(alpha, &p);
            r.scaled_add(-alpha, &hp);
            z = precondition(&r);
            let rz_next = r.dot(&z);
            p = &z + &(p * (rz_next / rz));
            rz = rz_next;
        }
        x
    }

    /// One Gauss-Newton step with backtracking. Returns `false` when no
    /// decrease was found.
    pub fn step(&self, problem: &InverseProblem, state: &mut InversionState) -> bool {
        let model = &state.model;
        let beta = state.beta;
        let gradient = problem.gradient(model, beta);
        let free = self.free_mask(model, &gradient);
        let direction = self.solve(problem, model, beta, &(-&gradient), &free);
        let phi = problem.objective(model, beta);

        let mut t = 1.0;
        for _ in 0..self.max_line_search_iterations.max(1) {
            let mut trial = model + &(&direction * t);
            self.project(&mut trial);
            let decrease = gradient.dot(&(&trial - model));
            let phi_trial = problem.objective(&trial, beta);
            if phi_trial <= phi + ARMIJO * decrease {
                state.model = trial;
                return true;
            }
            t *= self.ls_shorten;
        }
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InversionStatus {
    Converged,
    IterationCap,
}

impl fmt::Display for InversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InversionStatus::Converged => write!(f, "Converged"),
            InversionStatus::IterationCap => write!(f, "Maximum iterations reached"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InversionOutcome {
    pub status: InversionStatus,
    pub model: Array1<f64>,
    pub iterations: usize,
    pub beta: f64,
    pub phi_d: f64,
    pub phi_m: f64,
}

/// The optimization loop: directives are initialised once, then called at
/// the end of every iteration in list order.
pub struct Inversion {
    problem: InverseProblem,
    optimizer: ProjectedGncg,
    directives: DirectiveList,
}

impl Inversion {
    pub fn new(problem: InverseProblem, optimizer: ProjectedGncg, directives: DirectiveList) -> Self {
        Self {
            problem,
            optimizer,
            directives,
        }
    }

    pub fn problem(&self) -> &InverseProblem {
        &self.problem
    }

    pub fn run(
        &mut self,
        starting_model: Array1<f64>,
        target_misfit: f64,
        logger: &InversionLogger,
    ) -> Result<InversionOutcome, OptimizationError> {
        let now = Instant::now();
        let mut state = InversionState::new(starting_model, target_misfit);
        self.optimizer.project(&mut state.model);
        state.phi_d = self.problem.phi_d(&state.model);
        state.phi_m = self.problem.phi_m(&state.model);
        self.directives.initialize(&mut state, &mut self.problem)?;
        info!(
            "Starting inversion: phi_d {:.4e}, beta {:.4e}, target {:.4e}",
            state.phi_d, state.beta, state.target_misfit
        );

        let mut status = InversionStatus::IterationCap;
        while state.iteration < self.optimizer.max_iterations() {
            state.iteration += 1;
            let improved = self.optimizer.step(&self.problem, &mut state);
            state.phi_d = self.problem.phi_d(&state.model);
            state.phi_m = self.problem.phi_m(&state.model);
            logger.write_line(&format!(
                "Iteration {:>3}: beta {:.3e}  phi_d {:.4e}  phi_m {:.4e}  phi {:.4e}",
                state.iteration,
                state.beta,
                state.phi_d,
                state.phi_m,
                state.phi()
            ));
            self.directives.end_iteration(&mut state, &mut self.problem)?;
            if state.stop {
                status = InversionStatus::Converged;
                break;
            }
            if !improved {
                warn!(
                    "Line search found no decrease at iteration {}; stopping",
                    state.iteration
                );
                status = InversionStatus::Converged;
                break;
            }
        }
        self.directives.finish(&mut state, &mut self.problem)?;
        debug!(
            "Took {} for {} iterations.",
            format_duration(now.elapsed()),
            state.iteration
        );
        Ok(InversionOutcome {
            status,
            model: state.model,
            iterations: state.iteration,
            beta: state.beta,
            phi_d: state.phi_d,
            phi_m: state.phi_m,
        })
    }
}

#[derive(Error, Debug)]
pub enum OptimizationError {
    #[error(transparent)]
    ProjectedGncgBuilderError(#[from] ProjectedGncgBuilderError),
    #[error(transparent)]
    DirectiveError(#[from] DirectiveError),
}
