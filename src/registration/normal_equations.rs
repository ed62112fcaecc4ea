use std::{
    iter::Sum,
    ops::{Add, AddAssign},
};

use nalgebra::{Matrix6, Vector3, Vector6};

use crate::utils::solve_with_substitute;

/// Gauss-Newton system of the point-to-plane problem, plus the bookkeeping
/// needed to judge the linearization point.
///
/// The tangent is `[ω, v]`, rotation first, applied on the left of the pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct NormalEquations {
    pub hessian: Matrix6<f64>,
    pub gradient: Vector6<f64>,
    /// Sum of the robust loss over the matched samples.
    pub cost: f64,
    pub correspondences: usize,
    pub inliers: usize,
    /// Samples without an acceptable correspondence.
    pub unmatched: usize,
}

impl Default for NormalEquations {
    fn default() -> Self {
        Self {
            hessian: Matrix6::zeros(),
            gradient: Vector6::zeros(),
            cost: 0.0,
            correspondences: 0,
            inliers: 0,
            unmatched: 0,
        }
    }
}

impl NormalEquations {
    /// Adds one weighted point-to-plane residual `r = n · (p - c)` at world point `p`.
    #[inline]
    pub fn accumulate(
        &mut self,
        point: &Vector3<f64>,
        normal: &Vector3<f64>,
        residual: f64,
        weight: f64,
    ) {
        let moment = point.cross(normal);
        let jacobian = Vector6::from_iterator(moment.iter().chain(normal.iter()).copied());
        self.hessian += jacobian * jacobian.transpose() * weight;
        self.gradient += jacobian * (weight * residual);
        self.correspondences += 1;
    }

    /// Weighted update `δ` solving `H δ = -g`, `None` if the system is degenerate.
    pub fn solve(&self) -> Option<Vector6<f64>> {
        solve_with_substitute(self.hessian, &-self.gradient)
    }

    /// Mean loss per sample, unmatched samples charged `unmatched_cost`.
    pub fn mean_cost(&self, unmatched_cost: f64) -> f64 {
        let samples = self.correspondences + self.unmatched;
        if samples == 0 {
            return f64::INFINITY;
        }
        (self.cost + self.unmatched as f64 * unmatched_cost) / samples as f64
    }
}

impl Add for NormalEquations {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign for NormalEquations {
    fn add_assign(&mut self, rhs: Self) {
        self.hessian += rhs.hessian;
        self.gradient += rhs.gradient;
        self.cost += rhs.cost;
        self.correspondences += rhs.correspondences;
        self.inliers += rhs.inliers;
        self.unmatched += rhs.unmatched;
    }
}

impl Sum for NormalEquations {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}
