use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::ConfigError,
    preprocess::PreprocessConfig,
    registration::{RegistrationConfig, RobustKernel},
    voxel_map::IndexConfig,
};

/// Sensor and range settings of a dataset.
///
/// Every field is required. Unknown keys (topic names, extrinsics) are
/// ignored so dataset files written for other tools load as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Points closer than this to the sensor are dropped, in meters.
    pub min_range: f64,
    /// Points farther than this from the sensor are dropped, in meters.
    pub max_range: f64,
    /// Scan rate, also the inverse of the nominal inter-frame interval.
    pub sensor_hz: f64,
    /// Motion-compensate every scan with the constant velocity model.
    pub deskew: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            min_range: 0.5,
            max_range: 100.0,
            sensor_hz: 10.0,
            deskew: false,
        }
    }
}

/// Parameters of the registration engine and its voxel index, all required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineParams {
    /// Edge of the root voxel cells, in meters.
    pub b_max: f64,
    /// Smallest edge a cell may be refined down to, in meters.
    pub b_min: f64,
    /// A cell splits while the share of its variance along the normal exceeds this.
    pub b_ratio: f64,
    /// Minimum plane confidence for samples and correspondences, and the
    /// overlap below which a new keyframe is taken.
    pub p_th: f64,
    /// Scale of the robust kernel, in meters.
    pub rho_ker: f64,
    /// Maximum number of Gauss-Newton iterations per frame.
    #[serde(rename = "n")]
    pub max_iterations: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            b_max: 1.0,
            b_min: 0.1,
            b_ratio: 0.02,
            p_th: 0.8,
            rho_ker: 0.1,
            max_iterations: 15,
        }
    }
}

/// Knobs without a counterpart in the parameter files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Fewer points than this make a cell unreliable.
    pub min_cell_points: usize,
    /// Correspondence search radius, as a multiple of `b_max`.
    pub search_radius_factor: f64,
    /// Registration stops once the update norm drops below this.
    pub convergence_threshold: f64,
    /// Registrations with fewer correspondences report a degenerate frame.
    pub min_correspondences: usize,
    /// Minimum `|cos|` between a sample's normal and the normal of the map
    /// cell it is matched to.
    pub normal_agreement: f64,
    /// Translation since the newest keyframe that triggers an insertion, in meters.
    pub keyframe_translation: f64,
    /// Rotation since the newest keyframe that triggers an insertion, in radians.
    pub keyframe_rotation: f64,
    /// Share of the frame interval registration may spend in real-time mode.
    pub realtime_budget_fraction: f64,
    /// Voxel-grid downsampling leaf size, disabled when not positive.
    pub downsample_resolution: f64,
    pub kernel: RobustKernel,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            min_cell_points: 5,
            search_radius_factor: 1.5,
            convergence_threshold: 1e-4,
            min_correspondences: 10,
            normal_agreement: 0.9,
            keyframe_translation: 1.0,
            keyframe_rotation: 0.17,
            realtime_budget_fraction: 0.8,
            downsample_resolution: 0.0,
            kernel: RobustKernel::Cauchy,
        }
    }
}

/// Everything a [`crate::Pipeline`] is initialized with.
///
/// `dataset` and `params` must be present in full, the run settings and
/// `tuning` fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub params: EngineParams,
    /// Capacity of the local map.
    #[serde(default = "default_num_keyframes")]
    pub num_keyframes: usize,
    /// Threads of the registration worker pool.
    #[serde(default = "default_num_cores")]
    pub num_cores: usize,
    /// Bound every frame by the sensor interval.
    #[serde(default)]
    pub realtime: bool,
    #[serde(default)]
    pub tuning: Tuning,
}

fn default_num_keyframes() -> usize {
    4
}

fn default_num_cores() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset: Default::default(),
            params: Default::default(),
            num_keyframes: default_num_keyframes(),
            num_cores: default_num_cores(),
            realtime: false,
            tuning: Default::default(),
        }
    }
}

impl Config {
    /// The full parameter surface of the pipeline, remaining settings at
    /// their defaults.
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        sensor_hz: f64,
        deskew: bool,
        b_max: f64,
        rho_ker: f64,
        p_th: f64,
        b_min: f64,
        b_ratio: f64,
        num_keyframes: usize,
        num_cores: usize,
        realtime: bool,
    ) -> Self {
        let default = Self::default();
        Self {
            dataset: DatasetConfig {
                sensor_hz,
                deskew,
                ..default.dataset
            },
            params: EngineParams {
                b_max,
                rho_ker,
                p_th,
                b_min,
                b_ratio,
                ..default.params
            },
            num_keyframes,
            num_cores,
            realtime,
            tuning: default.tuning,
        }
    }

    /// Combines the two parameter files with the run settings.
    pub fn from_parts(
        dataset: DatasetConfig,
        params: EngineParams,
        num_keyframes: usize,
        num_cores: usize,
        realtime: bool,
    ) -> Self {
        Self {
            dataset,
            params,
            num_keyframes,
            num_cores,
            realtime,
            tuning: Default::default(),
        }
    }

    /// Parse a complete configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_yaml(path)
    }

    pub fn with_tuning(self, tuning: Tuning) -> Self {
        Self { tuning, ..self }
    }

    /// Inter-frame interval implied by the sensor rate, in seconds.
    #[inline]
    pub fn frame_interval(&self) -> f64 {
        self.dataset.sensor_hz.recip()
    }

    #[inline]
    pub fn search_radius(&self) -> f64 {
        self.tuning.search_radius_factor * self.params.b_max
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            b_max: self.params.b_max,
            b_min: self.params.b_min,
            b_ratio: self.params.b_ratio,
            min_cell_points: self.tuning.min_cell_points,
        }
    }

    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            max_iterations: self.params.max_iterations,
            convergence_threshold: self.tuning.convergence_threshold,
            min_correspondences: self.tuning.min_correspondences,
            min_normal_agreement: self.tuning.normal_agreement,
            search_radius: self.search_radius(),
            p_th: self.params.p_th,
            rho_ker: self.params.rho_ker,
            kernel: self.tuning.kernel,
        }
    }

    pub fn preprocess_config(&self) -> PreprocessConfig {
        PreprocessConfig {
            min_range: self.dataset.min_range,
            max_range: self.dataset.max_range,
            deskew: self.dataset.deskew,
            sensor_hz: self.dataset.sensor_hz,
            downsample_resolution: self.tuning.downsample_resolution,
        }
    }

    /// Checks every parameter range.
    ///
    /// The real-time core budget is checked by the scheduler, see
    /// [`crate::scheduler::Scheduler::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::invalid(
                    name,
                    format!("must be positive and finite, got {value}"),
                ))
            }
        }

        let DatasetConfig {
            min_range,
            max_range,
            sensor_hz,
            ..
        } = self.dataset;
        let EngineParams {
            b_max,
            b_min,
            b_ratio,
            p_th,
            rho_ker,
            max_iterations,
        } = self.params;

        positive("sensor_hz", sensor_hz)?;
        if let Err(err) = Duration::try_from_secs_f64(self.frame_interval()) {
            return Err(ConfigError::invalid(
                "sensor_hz",
                format!("{sensor_hz} Hz gives no usable frame interval: {err}"),
            ));
        }
        positive("b_max", b_max)?;
        positive("b_min", b_min)?;
        positive("rho_ker", rho_ker)?;
        positive("max_range", max_range)?;
        if b_min > b_max {
            return Err(ConfigError::invalid(
                "b_min",
                format!("{b_min} exceeds b_max {b_max}"),
            ));
        }
        if !(0.0..=1.0).contains(&p_th) {
            return Err(ConfigError::invalid(
                "p_th",
                format!("must lie in [0, 1], got {p_th}"),
            ));
        }
        if !(b_ratio > 0.0 && b_ratio < 1.0) {
            return Err(ConfigError::invalid(
                "b_ratio",
                format!("must lie in (0, 1), got {b_ratio}"),
            ));
        }
        if !(min_range.is_finite() && min_range >= 0.0 && min_range <= max_range) {
            return Err(ConfigError::invalid(
                "min_range",
                format!("must lie in [0, max_range], got {min_range}"),
            ));
        }
        if max_iterations == 0 {
            return Err(ConfigError::invalid("n", "at least one iteration is needed"));
        }
        if self.num_keyframes == 0 {
            return Err(ConfigError::invalid(
                "num_keyframes",
                "the local map needs room for a keyframe",
            ));
        }
        if self.num_cores == 0 {
            return Err(ConfigError::invalid(
                "num_cores",
                "the worker pool needs a thread",
            ));
        }

        let tuning = &self.tuning;
        positive("search_radius_factor", tuning.search_radius_factor)?;
        positive("keyframe_translation", tuning.keyframe_translation)?;
        positive("keyframe_rotation", tuning.keyframe_rotation)?;
        if !(tuning.realtime_budget_fraction > 0.0 && tuning.realtime_budget_fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "realtime_budget_fraction",
                format!(
                    "must lie in (0, 1], got {}",
                    tuning.realtime_budget_fraction
                ),
            ));
        }
        if !(0.0..=1.0).contains(&tuning.normal_agreement) {
            return Err(ConfigError::invalid(
                "normal_agreement",
                format!("must lie in [0, 1], got {}", tuning.normal_agreement),
            ));
        }
        if tuning.min_cell_points < 3 {
            return Err(ConfigError::invalid(
                "min_cell_points",
                "a plane needs at least three points",
            ));
        }
        Ok(())
    }
}

impl DatasetConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_yaml(path)
    }
}

impl EngineParams {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_yaml(path)
    }
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}
