use std::hash::{Hash, Hasher};

use nalgebra::{Point3, Vector3};

/// Integer coordinate of a cell on a regular grid.
///
/// Hashes to a single `u64` with the spatial hash of Teschner et al., so it
/// can key a [`nohash_hasher::IntMap`]. Equality still compares the full
/// coordinate, so hash collisions never merge cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoxelCoord(pub [i64; 3]);

impl VoxelCoord {
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self([x, y, z])
    }

    /// see also Optimized Spatial Hashing for Collision Detection of Deformable Objects, Matthias Teschner et. al., VMV 2003
    #[inline]
    pub fn spatial_hash(&self) -> u64 {
        let [x, y, z] = self.0;
        (x.wrapping_mul(73856093) ^ y.wrapping_mul(19349663) ^ z.wrapping_mul(83492791)) as u64
    }

    /// Lowest corner of the cell.
    #[inline]
    pub fn min_corner(&self, voxel_size: f64) -> Point3<f64> {
        Point3::from(Vector3::from(self.0).map(|c| c as f64 * voxel_size))
    }

    #[inline]
    pub fn center(&self, voxel_size: f64) -> Point3<f64> {
        self.min_corner(voxel_size) + Vector3::repeat(voxel_size / 2.0)
    }

    /// Euclidean distance from `point` to the cell box, zero inside.
    pub fn box_distance(&self, point: &Point3<f64>, voxel_size: f64) -> f64 {
        let min = self.min_corner(voxel_size);
        Vector3::from_fn(|i, _| {
            let below = min[i] - point[i];
            let above = point[i] - (min[i] + voxel_size);
            below.max(above).max(0.0)
        })
        .norm()
    }
}

impl Hash for VoxelCoord {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.spatial_hash())
    }
}

impl nohash_hasher::IsEnabled for VoxelCoord {}

pub trait ToVoxelCoord {
    fn to_voxel_coord(&self, voxel_size: f64) -> VoxelCoord;
}

impl ToVoxelCoord for Point3<f64> {
    #[inline]
    fn to_voxel_coord(&self, voxel_size: f64) -> VoxelCoord {
        let scaled = self / voxel_size;
        VoxelCoord([
            scaled.x.floor() as i64,
            scaled.y.floor() as i64,
            scaled.z.floor() as i64,
        ])
    }
}
