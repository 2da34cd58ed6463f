// geoinv/src/regularization.rs

//! Sparse (IRLS) regularization over the active cells.

use crate::components::{ActiveCells, CellMesh, CellPair, InversionModelCollection};
use crate::params::{GradientType, InversionParams};
use ndarray::{s, Array1};
use ndarray_stats::interpolate::Linear;
use ndarray_stats::Quantile1dExt;
use noisy_float::types::{n64, N64};
use thiserror::Error;

/// Projection of the full model vector onto the cells of one term.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ModelMap {
    Identity { len: usize },
    Wire { offset: usize, len: usize, total: usize },
}

impl ModelMap {
    pub fn len(&self) -> usize {
        match *self {
            ModelMap::Identity { len } | ModelMap::Wire { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_params(&self) -> usize {
        match *self {
            ModelMap::Identity { len } => len,
            ModelMap::Wire { total, .. } => total,
        }
    }

    fn offset(&self) -> usize {
        match *self {
            ModelMap::Identity { .. } => 0,
            ModelMap::Wire { offset, .. } => offset,
        }
    }

    pub fn project(&self, model: &Array1<f64>) -> Array1<f64> {
        let offset = self.offset();
        model.slice(s![offset..offset + self.len()]).to_owned()
    }

    pub fn embed(&self, local: &Array1<f64>) -> Array1<f64> {
        let offset = self.offset();
        let mut global = Array1::zeros(self.n_params());
        global
            .slice_mut(s![offset..offset + self.len()])
            .assign(local);
        global
    }
}

#[derive(Clone, Debug)]
struct IrlsState {
    eps: [f64; 2],
    smallness: Array1<f64>,
    smoothness: [Array1<f64>; 3],
}

/// Smallness and three smoothness terms,
/// `0.5 αs |Ws (m - m_ref)|² + Σ 0.5 αk |Wk ∂k m|²`,
/// reweighted by IRLS towards lp norms once started.
#[derive(Clone, Debug)]
pub struct Sparse {
    mapping: ModelMap,
    volumes: Array1<f64>,
    faces: [Vec<CellPair>; 3],
    alphas: [f64; 4],
    norms: [f64; 4],
    gradient_type: GradientType,
    reference_model: Array1<f64>,
    cell_weights: Array1<f64>,
    irls: Option<IrlsState>,
}

impl Sparse {
    pub fn new(mapping: ModelMap, mesh: &CellMesh, active_cells: &ActiveCells) -> Self {
        let volumes = active_cells.restrict(mesh.volumes().view());
        let mean = volumes.mean().unwrap_or(1.0);
        let volumes = if mean > 0.0 { volumes / mean } else { volumes };
        let n = mapping.len();
        Self {
            mapping,
            volumes,
            faces: [0, 1, 2].map(|axis| active_cells.reduce_faces(mesh, axis)),
            alphas: [1.0; 4],
            norms: [2.0; 4],
            gradient_type: GradientType::Total,
            reference_model: Array1::zeros(n),
            cell_weights: Array1::ones(n),
            irls: None,
        }
    }

    pub fn with_params(mut self, params: &InversionParams) -> Self {
        self.alphas = params.alphas();
        self.norms = params.model_norms();
        self.gradient_type = params.gradient_type;
        self
    }

    pub fn mapping(&self) -> &ModelMap {
        &self.mapping
    }

    pub fn norms(&self) -> [f64; 4] {
        self.norms
    }

    pub fn reference_model(&self) -> &Array1<f64> {
        &self.reference_model
    }

    pub fn set_reference_model(&mut self, reference: Array1<f64>) {
        self.reference_model = reference;
    }

    pub fn cell_weights(&self) -> &Array1<f64> {
        &self.cell_weights
    }

    pub fn set_cell_weights(&mut self, weights: Array1<f64>) {
        self.cell_weights = weights;
    }

    pub fn is_irls_active(&self) -> bool {
        self.irls.is_some()
    }

    pub fn eps(&self) -> Option<[f64; 2]> {
        self.irls.as_ref().map(|irls| irls.eps)
    }

    fn smallness_weights(&self) -> Array1<f64> {
        let mut weights = &self.volumes * &self.cell_weights * self.alphas[0];
        if let Some(irls) = &self.irls {
            weights *= &irls.smallness;
        }
        weights
    }

    fn face_weights(&self, axis: usize) -> Array1<f64> {
        let mut weights: Array1<f64> = self.faces[axis]
            .iter()
            .map(|pair| {
                self.alphas[axis + 1] * 0.5 * (self.cell_weights[pair.a] + self.cell_weights[pair.b])
            })
            .collect();
        if let Some(irls) = &self.irls {
            weights *= &irls.smoothness[axis];
        }
        weights
    }

    fn gradients(&self, local: &Array1<f64>, axis: usize) -> Array1<f64> {
        self.faces[axis]
            .iter()
            .map(|pair| (local[pair.b] - local[pair.a]) / pair.length)
            .collect()
    }

    pub fn eval(&self, model: &Array1<f64>) -> f64 {
        let local = self.mapping.project(model);
        let residual = &local - &self.reference_model;
        let mut phi = 0.5 * (self.smallness_weights() * &residual * &residual).sum();
        for axis in 0..3 {
            let g = self.gradients(&local, axis);
            phi += 0.5 * (self.face_weights(axis) * &g * &g).sum();
        }
        phi
    }

    pub fn deriv(&self, model: &Array1<f64>) -> Array1<f64> {
        let local = self.mapping.project(model);
        let mut out = self.smallness_weights() * (&local - &self.reference_model);
        for axis in 0..3 {
            let weighted = self.face_weights(axis) * self.gradients(&local, axis);
            self.add_divergence(axis, &weighted, &mut out);
        }
        self.mapping.embed(&out)
    }

    pub fn deriv2_vec(&self, _model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        let local = self.mapping.project(v);
        let mut out = self.smallness_weights() * &local;
        for axis in 0..3 {
            let weighted = self.face_weights(axis) * self.gradients(&local, axis);
            self.add_divergence(axis, &weighted, &mut out);
        }
        self.mapping.embed(&out)
    }

    pub fn deriv2_diag(&self) -> Array1<f64> {
        let mut out = self.smallness_weights();
        for axis in 0..3 {
            for (pair, weight) in self.faces[axis].iter().zip(self.face_weights(axis).iter()) {
                let value = weight / (pair.length * pair.length);
                out[pair.a] += value;
                out[pair.b] += value;
            }
        }
        self.mapping.embed(&out)
    }

    /// Gᵀ applied to per-face values.
    fn add_divergence(&self, axis: usize, face_values: &Array1<f64>, out: &mut Array1<f64>) {
        for (pair, value) in self.faces[axis].iter().zip(face_values.iter()) {
            out[pair.a] -= value / pair.length;
            out[pair.b] += value / pair.length;
        }
    }

    /// Magnitudes the IRLS weights are computed from: smallness residual
    /// per cell, then the gradient per face along each axis.
    fn irls_functions(&self, model: &Array1<f64>) -> (Array1<f64>, [Array1<f64>; 3]) {
        let local = self.mapping.project(model);
        let smallness = (&local - &self.reference_model).mapv(f64::abs);
        let mut smoothness = [0, 1, 2].map(|axis| self.gradients(&local, axis).mapv(f64::abs));
        if self.gradient_type == GradientType::Total {
            let mut squared = Array1::<f64>::zeros(local.len());
            let mut count = Array1::<f64>::zeros(local.len());
            for axis in 0..3 {
                for (pair, g) in self.faces[axis].iter().zip(smoothness[axis].iter()) {
                    for cell in [pair.a, pair.b] {
                        squared[cell] += g * g;
                        count[cell] += 1.0;
                    }
                }
            }
            let total = (squared / count.mapv(|c| c.max(1.0))).mapv(f64::sqrt);
            for axis in 0..3 {
                smoothness[axis] = self.faces[axis]
                    .iter()
                    .map(|pair| 0.5 * (total[pair.a] + total[pair.b]))
                    .collect();
            }
        }
        (smallness, smoothness)
    }

    /// Start reweighting with thresholds at the `prctile` percentile of the
    /// current model functions.
    pub fn start_irls(&mut self, model: &Array1<f64>, prctile: f64) {
        let (smallness, smoothness) = self.irls_functions(model);
        let gradients: Vec<f64> = smoothness.iter().flat_map(|f| f.iter().copied()).collect();
        let eps = [
            percentile(smallness.to_vec(), prctile),
            percentile(gradients, prctile),
        ];
        self.irls = Some(IrlsState {
            eps,
            smallness: Array1::ones(smallness.len()),
            smoothness: smoothness.map(|f| Array1::ones(f.len())),
        });
        self.update_irls(model);
    }

    pub fn cool_eps(&mut self, factor: f64) {
        if let Some(irls) = self.irls.as_mut() {
            for eps in irls.eps.iter_mut() {
                *eps = (*eps / factor).max(f64::EPSILON);
            }
        }
    }

    /// Recompute the lp weights `eps^(2-p) (f² + eps²)^(p/2 - 1)`.
    pub fn update_irls(&mut self, model: &Array1<f64>) {
        let (smallness, smoothness) = self.irls_functions(model);
        let norms = self.norms;
        if let Some(irls) = self.irls.as_mut() {
            irls.smallness = lp_weights(&smallness, norms[0], irls.eps[0]);
            for axis in 0..3 {
                irls.smoothness[axis] = lp_weights(&smoothness[axis], norms[axis + 1], irls.eps[1]);
            }
        }
    }
}

fn lp_weights(f: &Array1<f64>, p: f64, eps: f64) -> Array1<f64> {
    let scale = eps.powf(2.0 - p);
    f.mapv(|value| scale * (value * value + eps * eps).powf(0.5 * p - 1.0))
}

/// Linearly interpolated percentile of the finite values, floored at
/// machine epsilon.
fn percentile(values: Vec<f64>, prctile: f64) -> f64 {
    let mut finite: Array1<N64> = values
        .into_iter()
        .filter(|v| v.is_finite())
        .map(n64)
        .collect();
    let q = n64((prctile / 100.0).clamp(0.0, 1.0));
    finite
        .quantile_mut(q, &Linear)
        .map(|value| value.raw().max(f64::EPSILON))
        .unwrap_or(f64::EPSILON)
}

/// Ordered list of terms over disjoint wires of the model. Combining the
/// terms does not carry a reference model; it is attached afterwards with
/// [`CompositeRegularization::set_reference_model`].
#[derive(Clone, Debug)]
pub struct CompositeRegularization {
    terms: Vec<Sparse>,
    reference_model: Option<Array1<f64>>,
}

impl CompositeRegularization {
    pub fn combine(terms: Vec<Sparse>) -> Self {
        Self {
            terms,
            reference_model: None,
        }
    }

    /// Share `reference` (full model vector) with every term.
    pub fn set_reference_model(&mut self, reference: Array1<f64>) {
        for term in self.terms.iter_mut() {
            let projected = term.mapping().project(&reference);
            term.set_reference_model(projected);
        }
        self.reference_model = Some(reference);
    }

    pub fn reference_model(&self) -> Option<&Array1<f64>> {
        self.reference_model.as_ref()
    }
}

/// Regularization of a run: one term over the identity map, or a
/// composite for multi-component models.
#[derive(Clone, Debug)]
pub enum Regularization {
    Sparse(Sparse),
    Composite(CompositeRegularization),
}

impl Regularization {
    pub fn terms(&self) -> &[Sparse] {
        match self {
            Regularization::Sparse(term) => std::slice::from_ref(term),
            Regularization::Composite(composite) => &composite.terms,
        }
    }

    pub fn terms_mut(&mut self) -> &mut [Sparse] {
        match self {
            Regularization::Sparse(term) => std::slice::from_mut(term),
            Regularization::Composite(composite) => &mut composite.terms,
        }
    }

    pub fn n_params(&self) -> usize {
        self.terms()
            .first()
            .map(|term| term.mapping().n_params())
            .unwrap_or_default()
    }

    pub fn reference_model(&self) -> Option<&Array1<f64>> {
        match self {
            Regularization::Sparse(term) => Some(term.reference_model()),
            Regularization::Composite(composite) => composite.reference_model(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.terms()
            .iter()
            .any(|term| term.norms().iter().any(|&p| p < 2.0))
    }

    pub fn eval(&self, model: &Array1<f64>) -> f64 {
        self.terms().iter().map(|term| term.eval(model)).sum()
    }

    pub fn deriv(&self, model: &Array1<f64>) -> Array1<f64> {
        self.sum_terms(|term| term.deriv(model))
    }

    pub fn deriv2_vec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        self.sum_terms(|term| term.deriv2_vec(model, v))
    }

    pub fn deriv2_diag(&self) -> Array1<f64> {
        self.sum_terms(Sparse::deriv2_diag)
    }

    fn sum_terms<F: Fn(&Sparse) -> Array1<f64>>(&self, f: F) -> Array1<f64> {
        self.terms()
            .iter()
            .fold(Array1::zeros(self.n_params()), |sum, term| sum + f(term))
    }
}

#[derive(Default)]
pub struct RegularizationBuilder<'a> {
    params: Option<&'a InversionParams>,
    mesh: Option<&'a CellMesh>,
    models: Option<&'a InversionModelCollection>,
}

impl<'a> RegularizationBuilder<'a> {
    pub fn build(&self) -> Result<Regularization, RegularizationError> {
        let params = self
            .params
            .ok_or_else(|| RegularizationError::UninitializedFieldError("params".to_string()))?;
        let mesh = self
            .mesh
            .ok_or_else(|| RegularizationError::UninitializedFieldError("mesh".to_string()))?;
        let models = self
            .models
            .ok_or_else(|| RegularizationError::UninitializedFieldError("models".to_string()))?;
        let active_cells = models.active_cells();
        let n = active_cells.n_active();
        let n_components = models.n_components();
        let reference = models.reference();
        if reference.len() != n * n_components {
            return Err(RegularizationError::ReferenceLength {
                expected: n * n_components,
                found: reference.len(),
            });
        }
        if n_components == 1 {
            let mut term =
                Sparse::new(ModelMap::Identity { len: n }, mesh, active_cells).with_params(params);
            term.set_reference_model(reference.clone());
            return Ok(Regularization::Sparse(term));
        }
        let terms = (0..n_components)
            .map(|component| {
                let wire = ModelMap::Wire {
                    offset: component * n,
                    len: n,
                    total: n * n_components,
                };
                let mut term = Sparse::new(wire, mesh, active_cells).with_params(params);
                term.set_reference_model(wire.project(reference));
                term
            })
            .collect();
        let mut composite = CompositeRegularization::combine(terms);
        composite.set_reference_model(reference.clone());
        Ok(Regularization::Composite(composite))
    }

    pub fn params(&mut self, params: &'a InversionParams) -> &mut Self {
        self.params = Some(params);
        self
    }

    pub fn mesh(&mut self, mesh: &'a CellMesh) -> &mut Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn models(&mut self, models: &'a InversionModelCollection) -> &mut Self {
        self.models = Some(models);
        self
    }
}

#[derive(Error, Debug)]
pub enum RegularizationError {
    #[error("Unitialized field on RegularizationBuilder: {0}")]
    UninitializedFieldError(String),
    #[error("Reference model has {found} values, expected {expected}")]
    ReferenceLength { expected: usize, found: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn setup(n_components: usize) -> (CellMesh, InversionModelCollection) {
        let mesh = CellMesh::tensor([0.0; 3], &[1.0; 3], &[1.0; 2], &[1.0; 2]);
        let active = Arc::new(ActiveCells::all(mesh.n_cells()));
        let n = active.n_active() * n_components;
        let starting = Array1::from_iter((0..n).map(|i| 0.01 * i as f64));
        (mesh, InversionModelCollection::new(active, n_components, starting))
    }

    fn finite_difference(reg: &Regularization, model: &Array1<f64>, index: usize) -> f64 {
        let h = 1e-6;
        let mut plus = model.clone();
        plus[index] += h;
        let mut minus = model.clone();
        minus[index] -= h;
        (reg.eval(&plus) - reg.eval(&minus)) / (2.0 * h)
    }

    #[test]
    fn test_vector_composite_shares_reference_model() {
        let params = InversionParams::default();
        let (mesh, models) = setup(3);
        let reg = RegularizationBuilder::default()
            .params(&params)
            .mesh(&mesh)
            .models(&models)
            .build()
            .unwrap();
        assert_eq!(reg.terms().len(), 3);
        assert_eq!(reg.reference_model(), Some(models.reference()));
        let n = models.active_cells().n_active();
        for (component, term) in reg.terms().iter().enumerate() {
            assert_eq!(
                term.reference_model(),
                &models.reference().slice(s![component * n..(component + 1) * n])
            );
        }
    }

    #[test]
    fn test_combine_alone_carries_no_reference() {
        let (mesh, models) = setup(1);
        let term = Sparse::new(
            ModelMap::Identity { len: 12 },
            &mesh,
            models.active_cells(),
        );
        let composite = CompositeRegularization::combine(vec![term]);
        assert!(composite.reference_model().is_none());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut params = InversionParams::default();
        params.alpha_x = 2.0;
        let (mesh, models) = setup(1);
        let mut reg = RegularizationBuilder::default()
            .params(&params)
            .mesh(&mesh)
            .models(&models)
            .build()
            .unwrap();
        let model = Array1::from_iter((0..12).map(|i| ((i * 7) % 5) as f64 * 0.3));
        let gradient = reg.deriv(&model);
        for index in [0, 5, 11] {
            assert!((gradient[index] - finite_difference(&reg, &model, index)).abs() < 1e-5);
        }
        // Sparse weights keep the gradient consistent with the objective.
        params.s_norm = 0.0;
        if let Regularization::Sparse(term) = &mut reg {
            *term = term.clone().with_params(&params);
            term.start_irls(&model, 95.0);
        }
        let gradient = reg.deriv(&model);
        assert!((gradient[3] - finite_difference(&reg, &model, 3)).abs() < 1e-5);
    }

    #[test]
    fn test_reference_model_minimises_objective() {
        let params = InversionParams::default();
        let (mesh, _) = setup(1);
        let active = Arc::new(ActiveCells::all(mesh.n_cells()));
        let models = InversionModelCollection::new(active, 1, Array1::from_elem(12, 0.5));
        let reg = RegularizationBuilder::default()
            .params(&params)
            .mesh(&mesh)
            .models(&models)
            .build()
            .unwrap();
        assert_eq!(reg.eval(models.reference()), 0.0);
        assert!(reg.eval(&Array1::zeros(12)) > 0.0);
        assert!(!reg.is_sparse());
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(vec![1.0, 2.0, 3.0, 4.0, 5.0], 50.0), 3.0);
        assert_eq!(percentile(vec![0.0, 0.0], 95.0), f64::EPSILON);
        assert_eq!(percentile(vec![4.0, f64::NAN, 0.0, 2.0], 25.0), 1.0);
        assert_eq!(percentile(Vec::new(), 50.0), f64::EPSILON);
    }

    #[test]
    fn test_missing_builder_field() {
        let result = RegularizationBuilder::default().build();
        assert!(matches!(
            result,
            Err(RegularizationError::UninitializedFieldError(_))
        ));
    }
}
