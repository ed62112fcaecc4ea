mod cell;
mod index;
mod oct_tree;
mod query;

pub use cell::{PlaneEstimate, VoxelCell};
pub use index::{ToVoxelCoord, VoxelCoord};
pub use query::{CellMatch, Facing};

use log::trace;
use nalgebra::Point3;
use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};

use crate::voxel_map::oct_tree::OctTreeRoot;

/// Multi-resolution index of one point cloud.
///
/// The space is tiled with root cells of edge `b_max`, each refined as an
/// octree where the points are not planar enough. The index is immutable once
/// built, so any number of threads may query it at the same time.
#[derive(Debug)]
pub struct AdaptiveVoxelIndex {
    roots: IntMap<VoxelCoord, OctTreeRoot>,
    root_edge: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Root cell edge.
    pub b_max: f64,
    /// Cells never split below this edge.
    pub b_min: f64,
    /// Split threshold on `λ0 / (λ0 + λ1 + λ2)`.
    pub b_ratio: f64,
    /// Minimum points of a reliable cell.
    pub min_cell_points: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            b_max: 1.0,
            b_min: 0.1,
            b_ratio: 0.02,
            min_cell_points: 5,
        }
    }
}

impl AdaptiveVoxelIndex {
    pub fn build<'p, I>(points: I, config: &IndexConfig) -> Self
    where
        I: IntoIterator<Item = &'p Point3<f64>>,
    {
        let root_edge = config.b_max;

        // Buckets keep first-seen order so the build is reproducible.
        let mut slots: IntMap<VoxelCoord, usize> = IntMap::default();
        let mut buckets: Vec<(VoxelCoord, Vec<Point3<f64>>)> = Vec::new();
        for point in points {
            let coord = point.to_voxel_coord(root_edge);
            let slot = *slots.entry(coord).or_insert_with(|| {
                buckets.push((coord, Vec::new()));
                buckets.len() - 1
            });
            buckets[slot].1.push(*point);
        }

        let roots = buckets
            .into_iter()
            .map(|(coord, points)| (coord, OctTreeRoot::build(coord, points, config)))
            .collect::<IntMap<_, _>>();

        trace!("built voxel index with {} root cells", roots.len());
        Self { roots, root_edge }
    }

    #[inline]
    pub fn root_edge(&self) -> f64 {
        self.root_edge
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Every leaf cell, reliable or not.
    pub fn cells(&self) -> impl Iterator<Item = &VoxelCell> {
        self.roots.values().flat_map(OctTreeRoot::cells)
    }

    /// Leaf cells that carry a plane estimate.
    pub fn reliable_cells(&self) -> impl Iterator<Item = &VoxelCell> {
        self.cells().filter(|cell| cell.is_reliable())
    }

    pub fn len(&self) -> usize {
        self.cells().count()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}
