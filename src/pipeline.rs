use std::time::Instant;

use log::{debug, info, warn};

use crate::{
    config::Config,
    error::{ConfigError, PipelineError},
    frame::SensorToWorld,
    integrator::PoseIntegrator,
    keyframe::{KeyframeDecision, KeyframeManager, KeyframeState},
    local_map::LocalMap,
    preprocess::{LidarPoint, Preprocessor},
    registration::{RegistrationEngine, RegistrationResult, select_samples},
    scheduler::{FrameTiming, Scheduler},
    voxel_map::{AdaptiveVoxelIndex, IndexConfig},
};

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    /// Zero-based position of the frame in the sequence.
    pub id: u64,
    pub timestamp: f64,
    /// Points left after preprocessing.
    pub points: usize,
    pub registration: RegistrationResult,
    pub keyframe: KeyframeDecision,
    pub timing: FrameTiming,
}

/// The odometry context: everything that persists from one frame to the next.
///
/// Frames go through [`Pipeline::compute`] strictly one after the other. The
/// local map is only read while a frame registers and only written after.
#[derive(Debug)]
pub struct Pipeline {
    config: Config,
    index_config: IndexConfig,
    preprocessor: Preprocessor,
    engine: RegistrationEngine,
    integrator: PoseIntegrator,
    local_map: LocalMap,
    keyframes: KeyframeManager,
    scheduler: Scheduler,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let scheduler = Scheduler::new(&config)?;
        let engine = RegistrationEngine::new(config.registration_config(), config.num_cores)?;
        info!(
            "odometry at {} Hz, {} keyframes on {} threads{}",
            config.dataset.sensor_hz,
            config.num_keyframes,
            engine.num_threads(),
            if config.realtime { ", real-time" } else { "" }
        );

        Ok(Self {
            index_config: config.index_config(),
            preprocessor: Preprocessor::new(config.preprocess_config()),
            engine,
            integrator: PoseIntegrator::new(config.dataset.sensor_hz),
            local_map: LocalMap::new(config.num_keyframes),
            keyframes: KeyframeManager::new(&config),
            scheduler,
            config,
        })
    }

    /// Registers one scan taken at `timestamp` and advances the trajectory.
    ///
    /// Frames that cannot be registered keep the previous pose. On error the
    /// state is left as it was.
    pub fn compute<P: LidarPoint>(
        &mut self,
        timestamp: f64,
        points: impl IntoIterator<Item = P>,
    ) -> Result<FrameReport, PipelineError> {
        let started = Instant::now();
        let id = self.integrator.current_id();

        let motion = self.integrator.motion().copied();
        let points = self.preprocessor.process(points, motion.as_ref())?;
        let index = AdaptiveVoxelIndex::build(points.iter().map(|p| &**p), &self.index_config);
        let samples = select_samples(&index, self.config.params.p_th);

        let previous = *self.integrator.current_pose();
        let registration = {
            let mut guard = self.scheduler.begin_frame(started);
            self.engine.register(
                &samples,
                &self.local_map,
                &previous,
                self.integrator.predict(),
                &mut guard,
            )
        };
        if !registration.scored && !self.local_map.is_empty() {
            if registration.is_degenerate() {
                warn!(
                    "frame {id}: {} of {} samples matched, keeping the previous pose",
                    registration.correspondences, registration.samples
                );
            } else {
                warn!("frame {id}: out of time before registration, keeping the prediction");
            }
        }

        let pose = *self.integrator.integrate(timestamp, registration.relative);
        let keyframe = self
            .keyframes
            .apply(&mut self.local_map, id, &pose, index, &registration);
        let timing = self.scheduler.end_frame(started);

        debug!(
            "frame {id} at {timestamp:.3}: {} points, {:?}, {:?} in {:?}",
            points.len(),
            registration.status,
            keyframe,
            timing.elapsed
        );
        Ok(FrameReport {
            id,
            timestamp,
            points: points.len(),
            registration,
            keyframe,
            timing,
        })
    }

    /// Sensor-to-world pose of the latest frame, identity before any frame.
    #[inline]
    pub fn current_pose(&self) -> &SensorToWorld {
        self.integrator.current_pose()
    }

    /// Number of frames processed so far.
    #[inline]
    pub fn current_id(&self) -> u64 {
        self.integrator.current_id()
    }

    #[inline]
    pub fn local_map(&self) -> &LocalMap {
        &self.local_map
    }

    pub fn keyframe_state(&self) -> KeyframeState {
        self.keyframes.state(&self.local_map)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Tuning,
        keyframe::InsertReason,
        local_map::Keyframe,
        preprocess::StampedPoint,
        registration::RegistrationStatus,
        test_helpers::{observe, room_scene, test_config, translation},
    };
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Point3, Vector3};
    use std::time::Duration;

    fn room_frame(x: f64) -> Vec<Point3<f64>> {
        observe(&room_scene(0.25), &translation(x, 0.0, 0.0))
    }

    #[test]
    fn test_identity_before_any_frame() {
        let pipeline = Pipeline::new(test_config()).expect("valid config");
        assert_eq!(pipeline.current_id(), 0);
        assert_eq!(pipeline.current_pose().into_inner(), Isometry3::identity());
        assert!(pipeline.local_map().is_empty());
        assert_eq!(pipeline.keyframe_state(), KeyframeState::Accumulating);
    }

    #[test]
    fn test_empty_and_invalid_frames_keep_the_pose() {
        let mut pipeline = Pipeline::new(test_config()).expect("valid config");

        let report = pipeline
            .compute(0.0, Vec::<[f64; 3]>::new())
            .expect("enough memory");
        assert!(report.registration.is_degenerate());
        assert_eq!(report.registration.overlap, 0.0);
        assert_eq!(report.keyframe, KeyframeDecision::Skip);
        assert_eq!(report.points, 0);

        let report = pipeline
            .compute(0.1, [[f64::NAN, 0.0, 0.0], [0.0, f64::INFINITY, 1.0]])
            .expect("enough memory");
        assert!(report.registration.is_degenerate());
        assert_eq!(report.id, 1);

        assert_eq!(pipeline.current_id(), 2);
        assert_eq!(pipeline.current_pose().into_inner(), Isometry3::identity());
        assert!(pipeline.local_map().is_empty());
    }

    #[test]
    fn test_pose_composes_over_frames() {
        let mut pipeline = Pipeline::new(test_config()).expect("valid config");
        for k in 0..6 {
            let report = pipeline
                .compute(k as f64 * 0.1, &room_frame(k as f64))
                .expect("enough memory");
            assert_eq!(report.id, k);
            if k > 0 {
                assert!(!report.registration.is_degenerate());
            }
        }
        assert_eq!(pipeline.current_id(), 6);
        let pose = pipeline.current_pose();
        assert_relative_eq!(
            pose.translation.vector,
            Vector3::new(5.0, 0.0, 0.0),
            epsilon = 1e-2
        );
        assert!(pose.rotation.angle() < 1e-2);
    }

    #[test]
    fn test_bootstrap_is_deterministic() {
        let frame = room_frame(0.0);
        let mut first = Pipeline::new(test_config()).expect("valid config");
        let mut second = Pipeline::new(test_config()).expect("valid config");

        let a = first.compute(0.0, &frame).expect("enough memory");
        let b = second.compute(0.0, &frame).expect("enough memory");
        let bootstrap = KeyframeDecision::Insert {
            reason: InsertReason::Bootstrap,
            evicted: None,
        };
        assert_eq!(a.keyframe, bootstrap);
        assert_eq!(b.keyframe, bootstrap);

        let cells = |pipeline: &Pipeline| {
            pipeline
                .local_map()
                .keyframes()
                .flat_map(|keyframe| keyframe.index().cells().cloned())
                .collect::<Vec<_>>()
        };
        assert!(!cells(&first).is_empty());
        assert_eq!(cells(&first), cells(&second));

        // the same scan again is fully explained by the map
        let again = first.compute(0.1, &frame).expect("enough memory");
        assert_eq!(again.keyframe, KeyframeDecision::Skip);
        assert!(again.registration.overlap >= test_config().params.p_th);
        assert_eq!(first.local_map().len(), 1);
    }

    #[test]
    fn test_local_map_stays_bounded() {
        let config = Config {
            num_keyframes: 2,
            ..test_config()
        }
        .with_tuning(Tuning {
            keyframe_translation: 0.5,
            ..Default::default()
        });
        let mut pipeline = Pipeline::new(config).expect("valid config");

        let mut last = None;
        for k in 0..6 {
            let report = pipeline
                .compute(k as f64 * 0.1, &room_frame(k as f64))
                .expect("enough memory");
            assert!(pipeline.local_map().len() <= 2);
            last = Some(report);
        }
        assert_eq!(pipeline.local_map().len(), 2);
        assert_eq!(pipeline.keyframe_state(), KeyframeState::Steady);
        assert_eq!(
            pipeline
                .local_map()
                .keyframes()
                .map(Keyframe::id)
                .collect::<Vec<_>>(),
            [4, 5]
        );
        assert!(matches!(
            last.map(|report| report.keyframe),
            Some(KeyframeDecision::Insert {
                reason: InsertReason::Displacement,
                evicted: Some(3)
            })
        ));
    }

    #[test]
    fn test_realtime_oversubscription_is_rejected() {
        let config = Config {
            realtime: true,
            num_keyframes: 8,
            num_cores: 2,
            ..test_config()
        };
        assert!(matches!(
            Pipeline::new(config),
            Err(ConfigError::RealtimeOversubscribed { .. })
        ));
    }

    #[test]
    fn test_realtime_frames_stay_within_interval() {
        // registration never converges, only the deadline ends it
        let mut config = Config {
            realtime: true,
            num_keyframes: 2,
            ..test_config()
        }
        .with_tuning(Tuning {
            convergence_threshold: 0.0,
            ..Default::default()
        });
        config.dataset.sensor_hz = 1.0;
        config.params.max_iterations = 100_000;
        let mut pipeline = Pipeline::new(config).expect("valid config");

        for k in 0..3 {
            let report = pipeline
                .compute(k as f64, &room_frame(0.5 * k as f64))
                .expect("enough memory");
            assert_eq!(report.timing.budget, Some(Duration::from_secs(1)));
            assert!(
                !report.timing.over_budget,
                "frame {k} took {:?}",
                report.timing.elapsed
            );
            if k > 0 {
                assert_eq!(report.registration.status, RegistrationStatus::Truncated);
            }
        }
        assert_eq!(pipeline.scheduler().overruns(), 0);
        assert!(pipeline.scheduler().iteration_cap() < 100_000);
    }

    #[test]
    fn test_tiny_sensor_rate_is_rejected() {
        let config = Config::new(1e-20, false, 1.0, 0.1, 0.8, 0.25, 0.02, 2, 2, true);
        assert!(matches!(
            Pipeline::new(config),
            Err(ConfigError::InvalidParameter {
                name: "sensor_hz",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.params.b_min = 2.0;
        assert!(matches!(
            Pipeline::new(config),
            Err(ConfigError::InvalidParameter { name: "b_min", .. })
        ));
    }

    #[test]
    fn test_point_inputs_with_offsets() {
        let mut pipeline = Pipeline::new(test_config()).expect("valid config");
        let stamped = room_frame(0.0)
            .into_iter()
            .enumerate()
            .map(|(i, p)| StampedPoint::with_offset(p, (i % 10) as f64 * 0.01))
            .collect::<Vec<_>>();
        let report = pipeline.compute(0.0, stamped).expect("enough memory");
        assert!(report.keyframe.is_insert());
        assert!(report.points > 1000);
    }
}
