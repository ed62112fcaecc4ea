use log::warn;
use nalgebra::Isometry3;

use crate::frame::{Framed, SensorToWorld, frames};

/// Sensor motion between the two most recent frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    /// Pose of the newer frame in the older one.
    pub relative: Isometry3<f64>,
    /// Seconds between the two frames, always positive.
    pub interval: f64,
}

/// Holds the trajectory head and the constant velocity model.
#[derive(Debug)]
pub struct PoseIntegrator {
    pose: SensorToWorld,
    frames: u64,
    last_timestamp: Option<f64>,
    motion: Option<Motion>,
    nominal_interval: f64,
}

impl PoseIntegrator {
    pub fn new(sensor_hz: f64) -> Self {
        Self {
            pose: Framed::new_transform(Isometry3::identity(), frames::Sensor, frames::World),
            frames: 0,
            last_timestamp: None,
            motion: None,
            nominal_interval: sensor_hz.recip(),
        }
    }

    /// Sensor-to-world pose of the latest frame, identity before any frame.
    #[inline]
    pub fn current_pose(&self) -> &SensorToWorld {
        &self.pose
    }

    /// Number of frames integrated so far.
    #[inline]
    pub fn current_id(&self) -> u64 {
        self.frames
    }

    /// Last inter-frame motion, known once two frames were integrated.
    #[inline]
    pub fn motion(&self) -> Option<&Motion> {
        self.motion.as_ref()
    }

    /// Constant velocity guess of the next pose.
    pub fn predict(&self) -> SensorToWorld {
        match &self.motion {
            Some(motion) => Framed::new(self.pose.into_inner() * motion.relative),
            None => self.pose,
        }
    }

    /// Seconds since the previous frame, falling back to the nominal sensor
    /// interval when the timestamps do not increase.
    pub fn interval_to(&self, timestamp: f64) -> f64 {
        match self.last_timestamp {
            Some(last) => {
                let interval = timestamp - last;
                if interval.is_finite() && interval > 0.0 {
                    interval
                } else {
                    warn!(
                        "non-monotonic timestamp {timestamp} after {last}, assuming {}s interval",
                        self.nominal_interval
                    );
                    self.nominal_interval
                }
            }
            None => self.nominal_interval,
        }
    }

    /// Composes the pose with the motion registered for the frame at `timestamp`.
    pub fn integrate(&mut self, timestamp: f64, relative: Isometry3<f64>) -> &SensorToWorld {
        if self.frames > 0 {
            self.motion = Some(Motion {
                relative,
                interval: self.interval_to(timestamp),
            });
        }
        self.pose = Framed::new(self.pose.into_inner() * relative);
        self.last_timestamp = Some(timestamp);
        self.frames += 1;
        &self.pose
    }
}
