// geoinv/src/simulation/kernels.rs

//! Linearised sensitivity kernels, one row per datum.

use super::SimulationError;
use crate::params::InversionType;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1};
use std::f64::consts::PI;

/// Newton's constant scaled for g/cc densities and mGal data.
const GRAVITY_MGAL: f64 = 6.674e-3;
/// Newton's constant scaled for g/cc densities and Eotvos data.
const GRAVITY_EOTVOS: f64 = 6.674e1;

/// Unit vector of a field with inclination (positive down) and declination
/// (clockwise from north) in degrees, in (east, north, up) coordinates.
pub fn field_direction(inclination: f64, declination: f64) -> [f64; 3] {
    let (inc, dec) = (inclination.to_radians(), declination.to_radians());
    [inc.cos() * dec.sin(), inc.cos() * dec.cos(), -inc.sin()]
}

#[derive(Clone, Copy, Debug)]
pub enum Receiver {
    Point([f64; 3]),
    Dipole {
        a: [f64; 3],
        b: [f64; 3],
        m: [f64; 3],
        n: [f64; 3],
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GravityComponent {
    First(usize),
    Second(usize, usize),
    Uv,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Kernel {
    Gravity(GravityComponent),
    Magnetic {
        projection: [f64; 3],
        field: [f64; 3],
        strength: f64,
        vector: bool,
    },
    Electrode,
    Decay {
        skin_depth: f64,
    },
}

impl Kernel {
    pub fn for_component(
        kind: InversionType,
        component: &str,
        inducing_field: [f64; 3],
    ) -> Result<Self, SimulationError> {
        let unsupported = || SimulationError::UnsupportedComponent {
            kind: kind.to_string(),
            component: component.to_string(),
        };
        let kernel = match kind {
            InversionType::Gravity => {
                let gravity = match component {
                    "gx" => GravityComponent::First(0),
                    "gy" => GravityComponent::First(1),
                    "gz" => GravityComponent::First(2),
                    "gxx" => GravityComponent::Second(0, 0),
                    "gxy" => GravityComponent::Second(0, 1),
                    "gxz" => GravityComponent::Second(0, 2),
                    "gyy" => GravityComponent::Second(1, 1),
                    "gyz" => GravityComponent::Second(1, 2),
                    "gzz" => GravityComponent::Second(2, 2),
                    "guv" => GravityComponent::Uv,
                    _ => return Err(unsupported()),
                };
                Kernel::Gravity(gravity)
            }
            InversionType::MagneticScalar | InversionType::MagneticVector => {
                let [strength, inclination, declination] = inducing_field;
                let field = field_direction(inclination, declination);
                let projection = match component {
                    "tmi" => field,
                    "bx" => [1.0, 0.0, 0.0],
                    "by" => [0.0, 1.0, 0.0],
                    "bz" => [0.0, 0.0, 1.0],
                    _ => return Err(unsupported()),
                };
                Kernel::Magnetic {
                    projection,
                    field,
                    strength,
                    vector: kind.is_vector(),
                }
            }
            _ if kind.is_electrode_survey() => Kernel::Electrode,
            InversionType::Tdem | InversionType::Magnetotellurics | InversionType::Tipper => {
                let position = kind
                    .components()
                    .iter()
                    .position(|name| *name == component)
                    .ok_or_else(unsupported)?;
                Kernel::Decay {
                    skin_depth: 100.0 * (1.0 + position as f64),
                }
            }
            _ => return Err(unsupported()),
        };
        Ok(kernel)
    }

    /// Model values per cell this kernel expects.
    pub fn n_model_components(&self) -> usize {
        match self {
            Kernel::Magnetic { vector: true, .. } => 3,
            _ => 1,
        }
    }

    /// Write the sensitivity of one datum to every cell (component-major)
    /// into `out`.
    pub fn row(
        &self,
        receiver: &Receiver,
        centers: ArrayView2<f64>,
        volumes: ArrayView1<f64>,
        mut out: ArrayViewMut1<f64>,
    ) {
        let n_cells = centers.nrows();
        for cell in 0..n_cells {
            let x = [centers[[cell, 0]], centers[[cell, 1]], centers[[cell, 2]]];
            let volume = volumes[cell];
            let floor = 0.5 * volume.cbrt();
            match (self, receiver) {
                (Kernel::Electrode, Receiver::Dipole { a, b, m, n }) => {
                    let pair = |s: &[f64; 3], r: &[f64; 3]| pole_pole(s, r, &x, floor);
                    out[cell] = volume
                        * (pair(a, m) - pair(a, n) - pair(b, m) + pair(b, n))
                        / (PI * PI);
                }
                (_, receiver) => {
                    let position = match receiver {
                        Receiver::Point(p) => *p,
                        Receiver::Dipole { m, n, .. } => midpoint(m, n),
                    };
                    let d = sub(&position, &x);
                    let r = norm(&d).max(floor);
                    match self {
                        Kernel::Gravity(component) => {
                            out[cell] = volume * gravity(*component, &d, r);
                        }
                        Kernel::Magnetic {
                            projection,
                            field,
                            strength,
                            vector,
                        } => {
                            let unit = [d[0] / r, d[1] / r, d[2] / r];
                            let scale = volume * strength / (4.0 * PI * r.powi(3));
                            let response = |e: &[f64; 3]| {
                                scale * (3.0 * dot(e, &unit) * dot(projection, &unit) - dot(e, projection))
                            };
                            if *vector {
                                for (axis, e) in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
                                    .iter()
                                    .enumerate()
                                {
                                    out[axis * n_cells + cell] = response(e);
                                }
                            } else {
                                out[cell] = response(field);
                            }
                        }
                        Kernel::Decay { skin_depth } => {
                            out[cell] = volume * (-r / skin_depth).exp() / (r * r);
                        }
                        Kernel::Electrode => out[cell] = 0.0,
                    }
                }
            }
        }
    }
}

fn gravity(component: GravityComponent, d: &[f64; 3], r: f64) -> f64 {
    let second = |i: usize, j: usize| {
        let delta = if i == j { r * r } else { 0.0 };
        GRAVITY_EOTVOS * (3.0 * d[i] * d[j] - delta) / r.powi(5)
    };
    match component {
        GravityComponent::First(axis) => -GRAVITY_MGAL * d[axis] / r.powi(3),
        GravityComponent::Second(i, j) => second(i, j),
        GravityComponent::Uv => 0.5 * (second(1, 1) - second(0, 0)),
    }
}

/// Half-space pole-pole sensitivity of a source/receiver pair to a unit
/// volume at `x`.
fn pole_pole(source: &[f64; 3], receiver: &[f64; 3], x: &[f64; 3], floor: f64) -> f64 {
    let ds = sub(source, x);
    let dr = sub(receiver, x);
    let rs = norm(&ds).max(floor);
    let rr = norm(&dr).max(floor);
    dot(&ds, &dr) / (rs.powi(3) * rr.powi(3))
}

fn midpoint(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        0.5 * (a[0] + b[0]),
        0.5 * (a[1] + b[1]),
        0.5 * (a[2] + b[2]),
    ]
}

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}
