use nalgebra::{Isometry3, Point3, Vector3};

use crate::integrator::Motion;

/// Constant velocity of the sensor over one scan, in its own frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    /// Scaled-axis rotation rate, rad/s.
    pub angular: Vector3<f64>,
    /// m/s.
    pub linear: Vector3<f64>,
}

impl Velocity {
    /// The last inter-frame motion spread evenly over its interval.
    pub fn from_motion(motion: &Motion) -> Self {
        let rate = motion.interval.recip();
        Self {
            angular: motion.relative.rotation.scaled_axis() * rate,
            linear: motion.relative.translation.vector * rate,
        }
    }

    /// Rigid motion of the sensor from the scan start to `time_offset`.
    #[inline]
    pub fn displacement(&self, time_offset: f64) -> Isometry3<f64> {
        Isometry3::new(self.linear * time_offset, self.angular * time_offset)
    }

    /// Re-expresses a point measured `time_offset` into the scan in the
    /// scan-start frame.
    #[inline]
    pub fn deskew(&self, time_offset: f64, point: &Point3<f64>) -> Point3<f64> {
        self.displacement(time_offset) * point
    }
}
