use nalgebra::{Point3, Vector3};

use crate::{utils::Surface, voxel_map::IndexConfig};

/// Eigenvalue below which a direction counts as collapsed.
const DEGENERATE_EIGENVALUE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaneEstimate {
    /// Unit normal, the eigenvector of the smallest eigenvalue.
    pub normal: Vector3<f64>,
    /// Covariance eigenvalues `λ0 <= λ1 <= λ2`.
    pub eigenvalues: Vector3<f64>,
    /// `1 - λ0 / λ1`, in `[0, 1]`.
    pub confidence: f64,
}

/// Summary of the points that fell in one leaf of the index.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelCell {
    pub centroid: Point3<f64>,
    pub count: usize,
    /// Edge of the leaf box.
    pub edge: f64,
    /// Zero for a root cell.
    pub depth: u8,
    /// `None` for unreliable cells.
    pub plane: Option<PlaneEstimate>,
}

impl VoxelCell {
    pub(crate) fn new(surface: &Surface<f64>, edge: f64, depth: u8, config: &IndexConfig) -> Self {
        let plane = if surface.count >= config.min_cell_points {
            PlaneEstimate::from_surface(surface)
        } else {
            None
        };
        Self {
            centroid: Point3::from(surface.mean),
            count: surface.count,
            edge,
            depth,
            plane,
        }
    }

    #[inline]
    pub fn is_reliable(&self) -> bool {
        self.plane.is_some()
    }

    /// Confidence of the plane, zero for unreliable cells.
    #[inline]
    pub fn confidence(&self) -> f64 {
        self.plane.as_ref().map_or(0.0, |plane| plane.confidence)
    }

    /// How far from the centroid, along the plane, a point may lie and still
    /// be explained by this cell.
    pub fn support_radius(&self) -> f64 {
        self.plane
            .as_ref()
            .map_or(0.0, |plane| 3.0 * plane.eigenvalues[2].sqrt())
            .max(self.edge)
    }
}

impl PlaneEstimate {
    fn from_surface(surface: &Surface<f64>) -> Option<Self> {
        let eigenvalues = surface.eigenvalues;
        // a line or a single point does not define a plane
        if eigenvalues[1] <= DEGENERATE_EIGENVALUE.max(eigenvalues[2] * DEGENERATE_EIGENVALUE) {
            return None;
        }
        let normal = surface.eigenvectors.column(0).normalize();
        if !normal.iter().all(|x| x.is_finite()) {
            return None;
        }
        Some(Self {
            normal,
            eigenvalues,
            confidence: (1.0 - eigenvalues[0] / eigenvalues[1]).clamp(0.0, 1.0),
        })
    }
}
