mod kernel;
mod normal_equations;

pub use kernel::RobustKernel;

use std::time::Instant;

use log::{debug, trace};
use nalgebra::{Isometry3, Vector3, Vector6};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    frame::{Framed, SensorPoint, SensorToWorld},
    local_map::LocalMap,
    registration::normal_equations::NormalEquations,
    scheduler::IterationGuard,
    voxel_map::{AdaptiveVoxelIndex, Facing},
};

/// Samples handed to one worker at a time.
const SAMPLES_PER_CHUNK: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub max_iterations: usize,
    /// Stop once the update norm falls below this.
    pub convergence_threshold: f64,
    /// Fewer matched samples than this make the frame degenerate.
    pub min_correspondences: usize,
    pub search_radius: f64,
    /// Map cells below this confidence are not matched.
    pub p_th: f64,
    /// Minimum `|cos|` between the normals of a sample and its map cell.
    pub min_normal_agreement: f64,
    /// Kernel scale, also the inlier bound.
    pub rho_ker: f64,
    pub kernel: RobustKernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// The update fell below the convergence threshold.
    Converged,
    MaxIterations,
    /// The iteration guard refused to go on.
    Truncated,
    /// Correspondences were lost or the system became singular mid-way.
    Stalled,
    /// Too few correspondences at the initial guess; the pose was not changed.
    Degenerate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationResult {
    pub pose: SensorToWorld,
    /// The pose relative to the previous one.
    pub relative: Isometry3<f64>,
    pub status: RegistrationStatus,
    pub iterations: usize,
    pub samples: usize,
    pub correspondences: usize,
    pub inliers: usize,
    /// Share of the samples that are inliers.
    pub overlap: f64,
    /// Whether the match counts and `overlap` were measured at `pose`.
    ///
    /// Degenerate results, and frames whose deadline passed before anything
    /// was linearized, are not scored.
    pub scored: bool,
}

impl RegistrationResult {
    fn new(
        previous: &SensorToWorld,
        chosen: &Candidate,
        status: RegistrationStatus,
        iterations: usize,
        samples: usize,
    ) -> Self {
        let Candidate {
            pose, equations, ..
        } = chosen;
        Self {
            pose: *pose,
            relative: pose.then(&previous.inverse()).into_inner(),
            status,
            iterations,
            samples,
            correspondences: equations.correspondences,
            inliers: equations.inliers,
            overlap: if samples > 0 {
                equations.inliers as f64 / samples as f64
            } else {
                0.0
            },
            scored: true,
        }
    }

    /// Keeps the previous pose.
    pub fn degenerate(previous: &SensorToWorld, samples: usize, correspondences: usize) -> Self {
        Self {
            pose: *previous,
            relative: Isometry3::identity(),
            status: RegistrationStatus::Degenerate,
            iterations: 0,
            samples,
            correspondences,
            inliers: 0,
            overlap: 0.0,
            scored: false,
        }
    }

    /// Keeps the prediction, the frame had no time left to be registered.
    fn out_of_time(previous: &SensorToWorld, guess: SensorToWorld, samples: usize) -> Self {
        Self {
            pose: guess,
            relative: guess.then(&previous.inverse()).into_inner(),
            status: RegistrationStatus::Truncated,
            iterations: 0,
            samples,
            correspondences: 0,
            inliers: 0,
            overlap: 0.0,
            scored: false,
        }
    }

    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.status == RegistrationStatus::Degenerate
    }
}

/// A linearization point and what it scored.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    pose: SensorToWorld,
    cost: f64,
    equations: NormalEquations,
}

impl Candidate {
    fn new(pose: SensorToWorld, equations: NormalEquations, unmatched_cost: f64) -> Self {
        Self {
            pose,
            cost: equations.mean_cost(unmatched_cost),
            equations,
        }
    }
}

/// A frame cell that gets registered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub point: SensorPoint,
    /// Unit normal of the cell plane, in the sensor frame.
    pub normal: Vector3<f64>,
}

/// The reliable cells of a frame with a plane confidence of at least `p_th`.
pub fn select_samples(index: &AdaptiveVoxelIndex, p_th: f64) -> Vec<Sample> {
    index
        .reliable_cells()
        .filter_map(|cell| {
            let plane = cell.plane.as_ref().filter(|plane| plane.confidence >= p_th)?;
            Some(Sample {
                point: SensorPoint::new(cell.centroid),
                normal: plane.normal,
            })
        })
        .collect()
}

/// Point-to-plane Gauss-Newton with a robust kernel, linearized on a
/// dedicated worker pool.
#[derive(Debug)]
pub struct RegistrationEngine {
    pool: ThreadPool,
    config: RegistrationConfig,
}

impl RegistrationEngine {
    pub fn new(config: RegistrationConfig, num_threads: usize) -> Result<Self, ConfigError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("registration-{i}"))
            .build()?;
        Ok(Self { pool, config })
    }

    #[inline]
    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Aligns `samples` to `map`, starting from `initial_guess`.
    ///
    /// `previous` is the pose of the previous frame; the result carries the
    /// motion relative to it. `guard` is asked before the initial
    /// linearization and before every iteration. Refused up front, the
    /// prediction is kept unscored; refused later, the estimate with the
    /// lowest mean cost so far is returned. Every estimate is linearized
    /// before it can be returned, so the reported match counts always belong
    /// to the reported pose.
    pub fn register<G>(
        &self,
        samples: &[Sample],
        map: &LocalMap,
        previous: &SensorToWorld,
        initial_guess: SensorToWorld,
        guard: &mut G,
    ) -> RegistrationResult
    where
        G: IterationGuard + ?Sized,
    {
        let config = &self.config;
        if samples.is_empty() || map.is_empty() {
            debug!(
                "nothing to register: {} samples against {} keyframes",
                samples.len(),
                map.len()
            );
            return RegistrationResult::degenerate(previous, samples.len(), 0);
        }
        if !guard.allow_iteration() {
            debug!(
                "no time left for {} samples, keeping the prediction",
                samples.len()
            );
            return RegistrationResult::out_of_time(previous, initial_guess, samples.len());
        }

        let unmatched_cost = config.kernel.cost(config.search_radius, config.rho_ker);
        let equations = self.linearize(samples, map, &initial_guess);
        if equations.correspondences < config.min_correspondences {
            debug!(
                "{} correspondences for {} samples, keeping the previous pose",
                equations.correspondences,
                samples.len()
            );
            return RegistrationResult::degenerate(
                previous,
                samples.len(),
                equations.correspondences,
            );
        }

        let mut current = Candidate::new(initial_guess, equations, unmatched_cost);
        let mut best = current;
        let mut iterations = 0;

        let status = loop {
            if iterations >= config.max_iterations {
                break RegistrationStatus::MaxIterations;
            }
            if !guard.allow_iteration() {
                break RegistrationStatus::Truncated;
            }

            let started = Instant::now();
            let Some(delta) = current.equations.solve() else {
                break RegistrationStatus::Stalled;
            };
            let estimate = Framed::new(exp(&delta) * current.pose.into_inner());
            let equations = self.linearize(samples, map, &estimate);
            iterations += 1;
            guard.iteration_finished(started.elapsed());
            trace!(
                "iteration {iterations}: |δ| {:.3e}, {} matched",
                delta.norm(),
                equations.correspondences
            );

            if equations.correspondences < config.min_correspondences {
                break RegistrationStatus::Stalled;
            }
            current = Candidate::new(estimate, equations, unmatched_cost);
            if current.cost <= best.cost {
                best = current;
            }
            if delta.norm() < config.convergence_threshold {
                break RegistrationStatus::Converged;
            }
        };

        let chosen = match status {
            RegistrationStatus::Converged | RegistrationStatus::MaxIterations => &current,
            _ => &best,
        };
        let result = RegistrationResult::new(previous, chosen, status, iterations, samples.len());
        debug!(
            "registration {status:?} after {iterations} iterations: {}/{} matched, overlap {:.2}",
            result.correspondences, result.samples, result.overlap
        );
        result
    }

    /// Builds the normal equations at `estimate`, one partial system per chunk.
    ///
    /// Partials are summed in chunk order so the result does not depend on
    /// scheduling.
    fn linearize(
        &self,
        samples: &[Sample],
        map: &LocalMap,
        estimate: &SensorToWorld,
    ) -> NormalEquations {
        let RegistrationConfig {
            search_radius,
            p_th,
            min_normal_agreement,
            rho_ker,
            kernel,
            ..
        } = self.config;

        let partials: Vec<NormalEquations> = self.pool.install(|| {
            samples
                .par_chunks(SAMPLES_PER_CHUNK)
                .map(|chunk| {
                    chunk
                        .iter()
                        .fold(NormalEquations::default(), |mut equations, sample| {
                            let point = &sample.point * estimate;
                            let facing = Facing {
                                normal: estimate.rotation * sample.normal,
                                min_agreement: min_normal_agreement,
                            };
                            match map.nearest_cell(&point, search_radius, Some(&facing)) {
                                Some(found) if found.confidence >= p_th => {
                                    let residual = found.distance;
                                    equations.accumulate(
                                        &point.coords,
                                        &found.normal,
                                        residual,
                                        kernel.weight(residual, rho_ker),
                                    );
                                    equations.cost += kernel.cost(residual, rho_ker);
                                    if residual.abs() <= rho_ker {
                                        equations.inliers += 1;
                                    }
                                }
                                _ => equations.unmatched += 1,
                            }
                            equations
                        })
                })
                .collect()
        });
        partials.into_iter().sum()
    }
}

/// Left update of a `[ω, v]` tangent step.
#[inline]
fn exp(delta: &Vector6<f64>) -> Isometry3<f64> {
    Isometry3::new(
        delta.fixed_rows::<3>(3).into_owned(),
        delta.fixed_rows::<3>(0).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{
        frame::frames,
        local_map::Keyframe,
        scheduler::{Scheduler, Unbounded},
        test_helpers::{observe, room_scene, test_config},
    };
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn room_map() -> LocalMap {
        let config = test_config();
        let index = AdaptiveVoxelIndex::build(&room_scene(0.25), &config.index_config());
        let mut map = LocalMap::new(config.num_keyframes);
        let _ = map.push_evicting(Keyframe::new(
            0,
            Framed::new_transform(Isometry3::identity(), frames::Sensor, frames::World),
            index,
        ));
        map
    }

    fn frame_samples(points: &[Point3<f64>]) -> Vec<Sample> {
        let config = test_config();
        let index = AdaptiveVoxelIndex::build(points, &config.index_config());
        select_samples(&index, config.params.p_th)
    }

    fn engine() -> RegistrationEngine {
        RegistrationEngine::new(test_config().registration_config(), 2).expect("pool")
    }

    fn truth() -> Isometry3<f64> {
        Isometry3::new(Vector3::new(0.4, -0.3, 0.1), Vector3::z() * 0.02)
    }

    fn assert_pose_near(pose: &SensorToWorld, expected: &Isometry3<f64>, tolerance: f64) {
        assert_relative_eq!(
            pose.translation.vector,
            expected.translation.vector,
            epsilon = tolerance
        );
        assert!((pose.rotation.inverse() * expected.rotation).angle() < tolerance);
    }

    #[test]
    fn test_converges_on_room() {
        let map = room_map();
        let samples = frame_samples(&observe(&room_scene(0.25), &truth()));
        assert!(samples.len() > 100);

        let identity = Framed::new(Isometry3::identity());
        let result = engine().register(&samples, &map, &identity, identity, &mut Unbounded);

        assert_eq!(result.status, RegistrationStatus::Converged);
        assert_pose_near(&result.pose, &truth(), 1e-3);
        assert_relative_eq!(result.relative, result.pose.into_inner(), epsilon = 1e-12);
        assert!(result.overlap > 0.8);
    }

    #[test]
    fn test_outliers_are_down_weighted() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut points = observe(&room_scene(0.25), &truth());
        for point in &mut points {
            if rng.random_bool(0.1) {
                *point += Vector3::new(3.0, 0.0, 4.0);
            }
        }
        let map = room_map();
        let samples = frame_samples(&points);

        let identity = Framed::new(Isometry3::identity());
        let result = engine().register(&samples, &map, &identity, identity, &mut Unbounded);
        assert!(!result.is_degenerate());
        assert_pose_near(&result.pose, &truth(), 5e-3);
    }

    #[test]
    fn test_empty_map_is_degenerate() {
        let samples = frame_samples(&room_scene(0.25));
        let previous = Framed::new(Isometry3::translation(1.0, 2.0, 3.0));
        let guess = Framed::new(Isometry3::translation(2.0, 2.0, 3.0));
        let result = engine().register(
            &samples,
            &LocalMap::new(2),
            &previous,
            guess,
            &mut Unbounded,
        );
        assert!(result.is_degenerate());
        assert_eq!(result.pose, previous);
        assert_eq!(result.relative, Isometry3::identity());

        let result = engine().register(&[], &room_map(), &previous, guess, &mut Unbounded);
        assert!(result.is_degenerate());
    }

    #[test]
    fn test_no_overlap_is_degenerate() {
        // a scene 100 m away from the mapped room
        let far = observe(&room_scene(0.25), &Isometry3::translation(-100.0, 0.0, 0.0));
        let samples = frame_samples(&far);
        let identity = Framed::new(Isometry3::identity());
        let result = engine().register(&samples, &room_map(), &identity, identity, &mut Unbounded);
        assert!(result.is_degenerate());
        assert_eq!(result.correspondences, 0);
    }

    #[test]
    fn test_true_pose_explains_every_match() {
        // floor samples along the walls must not pair with the walls
        let map = room_map();
        let samples = frame_samples(&observe(&room_scene(0.25), &truth()));
        let equations = engine().linearize(&samples, &map, &Framed::new(truth()));

        assert!(equations.correspondences > samples.len() * 4 / 5);
        assert_eq!(equations.inliers, equations.correspondences);
        assert!(equations.cost < 1e-12, "cost {}", equations.cost);
        assert_relative_eq!(equations.gradient.norm(), 0.0, epsilon = 1e-6);
    }

    /// Allows a fixed number of requests.
    struct Countdown(usize);

    impl IterationGuard for Countdown {
        fn allow_iteration(&mut self) -> bool {
            let allowed = self.0 > 0;
            self.0 = self.0.saturating_sub(1);
            allowed
        }
    }

    #[test]
    fn test_truncated_result_is_scored_at_its_pose() {
        let engine = RegistrationEngine::new(
            RegistrationConfig {
                convergence_threshold: 0.0,
                ..test_config().registration_config()
            },
            2,
        )
        .expect("pool");
        let map = room_map();
        let samples = frame_samples(&observe(&room_scene(0.25), &truth()));
        let identity = Framed::new(Isometry3::identity());

        // the initial linearization and two iterations
        let result = engine.register(&samples, &map, &identity, identity, &mut Countdown(3));
        assert_eq!(result.status, RegistrationStatus::Truncated);
        assert_eq!(result.iterations, 2);
        assert!(result.scored);
        let at_pose = engine.linearize(&samples, &map, &result.pose);
        assert_eq!(result.correspondences, at_pose.correspondences);
        assert_eq!(result.inliers, at_pose.inliers);
        assert_eq!(
            result.overlap,
            at_pose.inliers as f64 / samples.len() as f64
        );

        // refused right after the initial linearization
        let result = engine.register(&samples, &map, &identity, identity, &mut Countdown(1));
        assert_eq!(result.status, RegistrationStatus::Truncated);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.pose, identity);
        let at_guess = engine.linearize(&samples, &map, &identity);
        assert_eq!(result.correspondences, at_guess.correspondences);
        assert_eq!(result.inliers, at_guess.inliers);
    }

    #[test]
    fn test_spent_budget_keeps_the_prediction() {
        let config = crate::config::Config {
            realtime: true,
            num_keyframes: 2,
            ..test_config()
        };
        let mut scheduler = Scheduler::new(&config).expect("not oversubscribed");
        let map = room_map();
        let samples = frame_samples(&observe(&room_scene(0.25), &truth()));
        let previous = Framed::new(Isometry3::translation(0.1, 0.0, 0.0));
        let guess = Framed::new(Isometry3::translation(0.3, 0.0, 0.0));

        let mut guard = scheduler.begin_frame(Instant::now() - Duration::from_secs(1));
        let result = engine().register(&samples, &map, &previous, guess, &mut guard);

        assert_eq!(result.status, RegistrationStatus::Truncated);
        assert_eq!(result.iterations, 0);
        assert!(!result.scored);
        assert_eq!(result.pose, guess);
        assert_relative_eq!(
            result.relative,
            Isometry3::translation(0.2, 0.0, 0.0),
            epsilon = 1e-12
        );
        assert_eq!(result.overlap, 0.0);
    }

    /// Sleeps after each iteration, as if linearizing were slow.
    struct Slowed<G> {
        inner: G,
        delay: Duration,
    }

    impl<G: IterationGuard> IterationGuard for Slowed<G> {
        fn allow_iteration(&mut self) -> bool {
            self.inner.allow_iteration()
        }

        fn iteration_finished(&mut self, elapsed: Duration) {
            thread::sleep(self.delay);
            self.inner.iteration_finished(elapsed + self.delay);
        }
    }

    #[test]
    fn test_realtime_registration_stays_within_interval() {
        // a 1 s interval leaves room for a slow linearization in debug builds
        let mut config = crate::config::Config {
            realtime: true,
            num_keyframes: 2,
            ..test_config()
        };
        config.dataset.sensor_hz = 1.0;
        let registration = RegistrationConfig {
            max_iterations: 50,
            convergence_threshold: 0.0,
            ..config.registration_config()
        };
        let engine = RegistrationEngine::new(registration, 2).expect("pool");
        let mut scheduler = Scheduler::new(&config).expect("not oversubscribed");
        let map = room_map();
        let samples = frame_samples(&observe(&room_scene(0.25), &truth()));
        let identity = Framed::new(Isometry3::identity());

        let started = Instant::now();
        let mut guard = Slowed {
            inner: scheduler.begin_frame(started),
            delay: Duration::from_millis(150),
        };
        let result = engine.register(&samples, &map, &identity, identity, &mut guard);
        let elapsed = started.elapsed();

        assert_eq!(result.status, RegistrationStatus::Truncated);
        assert!(result.iterations >= 1);
        assert!(result.scored);
        assert!(elapsed <= scheduler.frame_budget(), "took {elapsed:?}");
    }
}
