use std::collections::hash_map::Entry;

use nohash_hasher::IntMap;

use crate::voxel_map::{ToVoxelCoord, VoxelCoord};

use super::StampedPoint;

/// Voxel-grid filter replacing the points of each grid cell by their mean.
///
/// Cells are emitted in the order they were first hit, and a cell keeps the
/// time offset and intensity of its first point.
#[derive(Debug)]
pub struct Downsampler {
    pub resolution: f64,
    slots: IntMap<VoxelCoord, usize>,
    cells: Vec<(usize, StampedPoint)>,
}

impl Downsampler {
    pub fn new(resolution: f64) -> Self {
        Self {
            resolution,
            slots: IntMap::default(),
            cells: Vec::new(),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.resolution > 0.0
    }

    /// Downsample the points by consuming them into the grid, which is then drained.
    pub fn downsample(
        &mut self,
        points: impl IntoIterator<Item = StampedPoint>,
    ) -> impl Iterator<Item = StampedPoint> + '_ {
        self.slots.clear();
        self.cells.clear();
        for point in points {
            let coord = point.position.to_voxel_coord(self.resolution);
            match self.slots.entry(coord) {
                Entry::Occupied(slot) => {
                    let (count, barycenter) = &mut self.cells[*slot.get()];
                    *count += 1;
                    barycenter.position = barycenter
                        .position
                        .lerp(&point.position, (*count as f64).recip());
                }
                Entry::Vacant(slot) => {
                    slot.insert(self.cells.len());
                    self.cells.push((1, point));
                }
            }
        }
        self.cells.drain(..).map(|(_, point)| point)
    }
}
