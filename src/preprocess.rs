mod deskew;
mod downsample;

pub use deskew::Velocity;
pub use downsample::Downsampler;

use log::trace;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    error::PipelineError,
    frame::SensorPoint,
    integrator::Motion,
    utils::CollectTo,
};

/// A raw LiDAR return in the sensor frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampedPoint {
    pub position: Point3<f64>,
    /// Seconds since the start of the scan.
    pub time_offset: Option<f64>,
    pub intensity: Option<f32>,
}

impl StampedPoint {
    pub const fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            time_offset: None,
            intensity: None,
        }
    }

    pub const fn with_offset(position: Point3<f64>, time_offset: f64) -> Self {
        Self {
            position,
            time_offset: Some(time_offset),
            intensity: None,
        }
    }

    #[inline]
    fn is_finite(&self) -> bool {
        self.position.iter().all(|x| x.is_finite())
    }
}

pub trait LidarPoint {
    fn to_stamped_point(self) -> StampedPoint;
}

impl LidarPoint for [f64; 3] {
    #[inline]
    fn to_stamped_point(self) -> StampedPoint {
        StampedPoint::new(Point3::from(self))
    }
}

impl LidarPoint for (f64, f64, f64) {
    #[inline]
    fn to_stamped_point(self) -> StampedPoint {
        StampedPoint::new(Point3::new(self.0, self.1, self.2))
    }
}

impl LidarPoint for Vector3<f64> {
    #[inline]
    fn to_stamped_point(self) -> StampedPoint {
        StampedPoint::new(Point3::from(self))
    }
}

impl LidarPoint for Point3<f64> {
    #[inline]
    fn to_stamped_point(self) -> StampedPoint {
        StampedPoint::new(self)
    }
}

impl LidarPoint for StampedPoint {
    #[inline(always)]
    fn to_stamped_point(self) -> StampedPoint {
        self
    }
}

impl<P: LidarPoint + Copy> LidarPoint for &P {
    #[inline]
    fn to_stamped_point(self) -> StampedPoint {
        (*self).to_stamped_point()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub min_range: f64,
    pub max_range: f64,
    pub deskew: bool,
    pub sensor_hz: f64,
    /// Disabled when not positive.
    pub downsample_resolution: f64,
}

/// Turns raw scans into registration-ready points.
///
/// Owns its buffers so that steady-state frames do not allocate.
#[derive(Debug)]
pub struct Preprocessor {
    config: PreprocessConfig,
    buffer: Vec<StampedPoint>,
    downsampler: Downsampler,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            downsampler: Downsampler::new(config.downsample_resolution),
            buffer: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Filters, deskews and downsamples one scan.
    ///
    /// `motion` is the last inter-frame motion; deskewing is skipped without
    /// it. Points without their own time offset are spread evenly over the
    /// scan interval by their position in the input.
    pub fn process<P: LidarPoint>(
        &mut self,
        points: impl IntoIterator<Item = P>,
        motion: Option<&Motion>,
    ) -> Result<Vec<SensorPoint>, PipelineError> {
        let Self {
            config,
            buffer,
            downsampler,
        } = self;

        let points = points.into_iter();
        buffer.clear();
        reserve(buffer, points.size_hint().0)?;
        points.map(LidarPoint::to_stamped_point).collect_to(buffer);

        let total = buffer.len();
        let interval = config.sensor_hz.recip();
        let velocity = motion
            .filter(|_| config.deskew)
            .map(Velocity::from_motion);
        let range = config.min_range..=config.max_range;

        let mut kept = Vec::new();
        reserve(&mut kept, total)?;
        buffer
            .drain(..)
            .enumerate()
            .filter(|(_, point)| point.is_finite())
            .filter(|(_, point)| range.contains(&point.position.coords.norm()))
            .map(|(i, point)| {
                let time_offset = point
                    .time_offset
                    .unwrap_or(i as f64 / total as f64 * interval);
                let position = match &velocity {
                    Some(velocity) => velocity.deskew(time_offset, &point.position),
                    None => point.position,
                };
                StampedPoint {
                    position,
                    time_offset: Some(time_offset),
                    ..point
                }
            })
            .collect_to(&mut kept);

        let mut out = Vec::new();
        if downsampler.is_enabled() {
            let before = kept.len();
            reserve(&mut out, before)?;
            downsampler
                .downsample(kept)
                .map(|point| SensorPoint::new(point.position))
                .collect_to(&mut out);
            trace!("downsampled {} points to {}", before, out.len());
        } else {
            reserve(&mut out, kept.len())?;
            kept.into_iter()
                .map(|point| SensorPoint::new(point.position))
                .collect_to(&mut out);
        }

        trace!("preprocessed {} of {} points", out.len(), total);
        Ok(out)
    }
}

fn reserve<T>(buffer: &mut Vec<T>, additional: usize) -> Result<(), PipelineError> {
    buffer
        .try_reserve(additional)
        .map_err(|source| PipelineError::OutOfMemory {
            requested: additional,
            source,
        })
}
