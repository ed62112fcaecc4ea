use log::debug;

use crate::{
    config::Config,
    frame::SensorToWorld,
    local_map::{Keyframe, LocalMap},
    registration::RegistrationResult,
    voxel_map::AdaptiveVoxelIndex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeState {
    /// The local map is below capacity.
    Accumulating,
    /// Every insertion evicts the oldest keyframe.
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertReason {
    /// The local map was empty.
    Bootstrap,
    /// The sensor moved or turned past a threshold since the newest keyframe.
    Displacement,
    /// Too few samples were inliers of the local map.
    LowOverlap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeDecision {
    Skip,
    Insert {
        reason: InsertReason,
        /// Id of the keyframe dropped to make room.
        evicted: Option<u64>,
    },
}

impl KeyframeDecision {
    #[inline]
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert { .. })
    }
}

/// Decides which frames join the local map.
#[derive(Debug, Clone)]
pub struct KeyframeManager {
    translation_threshold: f64,
    rotation_threshold: f64,
    overlap_threshold: f64,
}

impl KeyframeManager {
    pub fn new(config: &Config) -> Self {
        Self {
            translation_threshold: config.tuning.keyframe_translation,
            rotation_threshold: config.tuning.keyframe_rotation,
            overlap_threshold: config.params.p_th,
        }
    }

    pub fn state(&self, map: &LocalMap) -> KeyframeState {
        if map.is_full() {
            KeyframeState::Steady
        } else {
            KeyframeState::Accumulating
        }
    }

    /// Why the frame registered as `registration` should become a keyframe,
    /// if at all.
    ///
    /// Unscored registrations, degenerate ones included, only ever bootstrap
    /// an empty map: their overlap says nothing about the pose.
    pub fn should_insert(
        &self,
        map: &LocalMap,
        index: &AdaptiveVoxelIndex,
        registration: &RegistrationResult,
    ) -> Option<InsertReason> {
        if index.reliable_cells().next().is_none() {
            return None;
        }
        let Some(newest) = map.newest() else {
            return Some(InsertReason::Bootstrap);
        };
        if !registration.scored {
            return None;
        }

        let since = since_keyframe(newest.pose(), &registration.pose);
        if since.translation.vector.norm() > self.translation_threshold
            || since.rotation.angle() > self.rotation_threshold
        {
            Some(InsertReason::Displacement)
        } else if registration.overlap < self.overlap_threshold {
            Some(InsertReason::LowOverlap)
        } else {
            None
        }
    }

    /// Decides on the frame and, if accepted, moves its index into `map`.
    ///
    /// `id` and the pose of the keyframe come from the integrated trajectory.
    pub fn apply(
        &self,
        map: &mut LocalMap,
        id: u64,
        pose: &SensorToWorld,
        index: AdaptiveVoxelIndex,
        registration: &RegistrationResult,
    ) -> KeyframeDecision {
        let Some(reason) = self.should_insert(map, &index, registration) else {
            return KeyframeDecision::Skip;
        };
        let evicted = map
            .push_evicting(Keyframe::new(id, *pose, index))
            .map(|keyframe| keyframe.id());
        debug!(
            "keyframe {id} inserted ({reason:?}), {} in map{}",
            map.len(),
            evicted.map_or_else(String::new, |old| format!(", evicted {old}"))
        );
        KeyframeDecision::Insert { reason, evicted }
    }
}

fn since_keyframe(keyframe: &SensorToWorld, pose: &SensorToWorld) -> nalgebra::Isometry3<f64> {
    pose.then(&keyframe.inverse()).into_inner()
}
