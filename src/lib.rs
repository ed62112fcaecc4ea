#![deny(clippy::unwrap_used)]
#![deny(clippy::undocumented_unsafe_blocks)]
#![deny(unused_must_use)]
pub mod config;
pub mod error;
pub mod frame;
pub mod integrator;
pub mod keyframe;
pub mod local_map;
pub mod pipeline;
pub mod preprocess;
pub mod registration;
pub mod scheduler;
mod utils;
pub mod voxel_map;

#[cfg(test)]
mod test_helpers;

pub use config::{Config, DatasetConfig, EngineParams, Tuning};
pub use error::{ConfigError, PipelineError};
pub use frame::{SensorPoint, SensorToWorld, WorldPoint};
pub use keyframe::{InsertReason, KeyframeDecision, KeyframeState};
pub use pipeline::{FrameReport, Pipeline};
pub use preprocess::{LidarPoint, StampedPoint};
pub use registration::{RegistrationResult, RegistrationStatus, RobustKernel};
