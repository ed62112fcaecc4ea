//! M-estimators down-weighting large point-to-plane residuals.

use serde::{Deserialize, Serialize};

/// Robust loss applied to every residual, scaled by `rho_ker`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustKernel {
    /// Heavy-tailed, weight `1 / (1 + (r / scale)²)`.
    #[default]
    Cauchy,
    /// Quadratic up to `scale`, linear beyond, weight `min(1, scale / |r|)`.
    Huber,
}

impl RobustKernel {
    /// IRLS weight in `[0, 1]`.
    #[inline]
    pub fn weight(&self, residual: f64, scale: f64) -> f64 {
        let r = residual.abs();
        match self {
            Self::Cauchy => {
                let u = r / scale;
                1.0 / (1.0 + u * u)
            }
            Self::Huber => {
                if r <= scale {
                    1.0
                } else {
                    scale / r
                }
            }
        }
    }

    /// The loss `ρ(r)` whose IRLS weight is [`Self::weight`].
    #[inline]
    pub fn cost(&self, residual: f64, scale: f64) -> f64 {
        let r = residual.abs();
        match self {
            Self::Cauchy => {
                let u = r / scale;
                0.5 * scale * scale * (u * u).ln_1p()
            }
            Self::Huber => {
                if r <= scale {
                    0.5 * r * r
                } else {
                    scale * (r - 0.5 * scale)
                }
            }
        }
    }
}
