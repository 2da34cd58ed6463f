// geoinv/src/components/window.rs

use crate::params::InversionParams;
use ndarray::ArrayView2;

/// Rotated rectangle restricting the survey to a region of interest.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InversionWindow {
    center: [f64; 2],
    size: [f64; 2],
    azimuth: f64,
}

impl InversionWindow {
    pub fn new(center: [f64; 2], size: [f64; 2], azimuth: f64) -> Self {
        Self {
            center,
            size,
            azimuth,
        }
    }

    /// `None` unless centre and size are all set.
    pub fn from_params(params: &InversionParams) -> Option<Self> {
        match (
            params.window_center_x,
            params.window_center_y,
            params.window_width,
            params.window_height,
        ) {
            (Some(x), Some(y), Some(width), Some(height)) if width > 0.0 && height > 0.0 => {
                Some(Self::new([x, y], [width, height], params.window_azimuth))
            }
            _ => None,
        }
    }

    pub fn center(&self) -> [f64; 2] {
        self.center
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        // Azimuth is clockwise from north; rotate the point into the window frame.
        let theta = self.azimuth.to_radians();
        let (dx, dy) = (x - self.center[0], y - self.center[1]);
        let u = dx * theta.cos() - dy * theta.sin();
        let v = dx * theta.sin() + dy * theta.cos();
        u.abs() <= 0.5 * self.size[0] && v.abs() <= 0.5 * self.size[1]
    }

    pub fn mask(&self, locations: ArrayView2<f64>) -> Vec<bool> {
        locations
            .rows()
            .into_iter()
            .map(|row| self.contains(row[0], row[1]))
            .collect()
    }
}
