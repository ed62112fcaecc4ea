use std::collections::VecDeque;

use nalgebra::{Point3, Vector3};

use crate::{
    frame::{SensorToWorld, WorldPoint, WorldToSensor},
    voxel_map::{AdaptiveVoxelIndex, Facing},
};

/// An accepted frame, frozen: its voxel index in its own sensor frame and
/// the pose it was taken at.
#[derive(Debug)]
pub struct Keyframe {
    id: u64,
    sensor_to_world: SensorToWorld,
    world_to_sensor: WorldToSensor,
    index: AdaptiveVoxelIndex,
}

/// A map cell matched to a world point, expressed in the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub centroid: Point3<f64>,
    pub normal: Vector3<f64>,
    /// Signed point-to-plane distance.
    pub distance: f64,
    pub confidence: f64,
}

impl Keyframe {
    pub fn new(id: u64, sensor_to_world: SensorToWorld, index: AdaptiveVoxelIndex) -> Self {
        Self {
            id,
            world_to_sensor: sensor_to_world.inverse(),
            sensor_to_world,
            index,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn pose(&self) -> &SensorToWorld {
        &self.sensor_to_world
    }

    #[inline]
    pub fn index(&self) -> &AdaptiveVoxelIndex {
        &self.index
    }

    /// `facing` is given in the world frame.
    pub fn nearest_cell(
        &self,
        point: &WorldPoint,
        radius: f64,
        facing: Option<&Facing>,
    ) -> Option<Correspondence> {
        let local = point * &self.world_to_sensor;
        let facing = facing.map(|facing| Facing {
            normal: self.world_to_sensor.rotation * facing.normal,
            ..*facing
        });
        let found = self.index.nearest_cell(&local, radius, facing.as_ref())?;
        let rotation = &self.sensor_to_world.rotation;
        Some(Correspondence {
            centroid: self.sensor_to_world.transform_point(&found.cell.centroid),
            normal: rotation * found.plane.normal,
            distance: found.distance_to_plane,
            confidence: found.plane.confidence,
        })
    }
}

/// Bounded window of the most recent keyframes.
#[derive(Debug)]
pub struct LocalMap {
    keyframes: VecDeque<Keyframe>,
    capacity: usize,
}

impl LocalMap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            keyframes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.keyframes.len() >= self.capacity
    }

    /// Oldest first.
    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.iter()
    }

    pub fn newest(&self) -> Option<&Keyframe> {
        self.keyframes.back()
    }

    /// Appends `keyframe`, dropping the oldest one first when full.
    pub(crate) fn push_evicting(&mut self, keyframe: Keyframe) -> Option<Keyframe> {
        let evicted = if self.is_full() {
            self.keyframes.pop_front()
        } else {
            None
        };
        self.keyframes.push_back(keyframe);
        debug_assert!(self.keyframes.len() <= self.capacity);
        evicted
    }

    /// Best match over all keyframes, by absolute point-to-plane distance.
    pub fn nearest_cell(
        &self,
        point: &WorldPoint,
        radius: f64,
        facing: Option<&Facing>,
    ) -> Option<Correspondence> {
        self.keyframes
            .iter()
            .filter_map(|keyframe| keyframe.nearest_cell(point, radius, facing))
            .min_by(|a, b| a.distance.abs().total_cmp(&b.distance.abs()))
    }
}
