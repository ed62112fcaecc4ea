use std::time::{Duration, Instant};

use log::warn;

use crate::{config::Config, error::ConfigError};

/// Smoothing factor of the iteration time estimate.
const EMA_ALPHA: f64 = 0.3;

/// Decides whether registration may run one more iteration.
pub trait IterationGuard {
    /// Asked before the initial linearization and before every iteration.
    fn allow_iteration(&mut self) -> bool;

    /// Reports the wall-clock time of the iteration that just finished.
    fn iteration_finished(&mut self, elapsed: Duration) {
        let _ = elapsed;
    }
}

impl<G: IterationGuard + ?Sized> IterationGuard for &mut G {
    #[inline]
    fn allow_iteration(&mut self) -> bool {
        (**self).allow_iteration()
    }

    #[inline]
    fn iteration_finished(&mut self, elapsed: Duration) {
        (**self).iteration_finished(elapsed)
    }
}

/// Never refuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

impl IterationGuard for Unbounded {
    #[inline]
    fn allow_iteration(&mut self) -> bool {
        true
    }
}

/// Wall-clock account of one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTiming {
    pub elapsed: Duration,
    /// The frame interval, in real-time mode only.
    pub budget: Option<Duration>,
    pub over_budget: bool,
}

/// Keeps every frame within the sensor interval in real-time mode.
///
/// Iteration time is tracked as an exponential moving average; an iteration
/// is only started if it is expected to finish before the registration
/// deadline, and the iteration cap of the next frame is what the budget
/// affords at the current average.
#[derive(Debug)]
pub struct Scheduler {
    realtime: bool,
    frame_budget: Duration,
    registration_budget: Duration,
    max_iterations: usize,
    iteration_cap: usize,
    iteration_ema: Option<Duration>,
    overruns: u64,
}

impl Scheduler {
    /// Checks that the worker pool can serve every keyframe at once in
    /// real-time mode, and only warns about it otherwise.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let Config {
            num_keyframes,
            num_cores,
            realtime,
            ..
        } = *config;
        if num_keyframes > num_cores {
            if realtime {
                return Err(ConfigError::RealtimeOversubscribed {
                    num_keyframes,
                    num_cores,
                });
            }
            warn!(
                "{num_keyframes} keyframes on {num_cores} cores, frames may take longer than the sensor interval"
            );
        }

        let frame_budget = Duration::try_from_secs_f64(config.frame_interval()).map_err(|err| {
            ConfigError::invalid(
                "sensor_hz",
                format!("{} Hz gives no usable frame interval: {err}", config.dataset.sensor_hz),
            )
        })?;
        let fraction = config.tuning.realtime_budget_fraction;
        let registration_budget =
            Duration::try_from_secs_f64(frame_budget.as_secs_f64() * fraction).map_err(|err| {
                ConfigError::invalid(
                    "realtime_budget_fraction",
                    format!("{fraction} of {frame_budget:?}: {err}"),
                )
            })?;
        let max_iterations = config.params.max_iterations;
        Ok(Self {
            realtime,
            frame_budget,
            registration_budget,
            max_iterations,
            iteration_cap: max_iterations,
            iteration_ema: None,
            overruns: 0,
        })
    }

    #[inline]
    pub fn frame_budget(&self) -> Duration {
        self.frame_budget
    }

    /// Iterations the next frame may run at most.
    #[inline]
    pub fn iteration_cap(&self) -> usize {
        self.iteration_cap
    }

    /// Frames that exceeded their budget so far.
    #[inline]
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Opens the registration window of a frame that started at `started`.
    pub fn begin_frame(&mut self, started: Instant) -> FrameDeadline<'_> {
        let deadline = self
            .realtime
            .then(|| started + self.registration_budget);
        FrameDeadline {
            scheduler: self,
            deadline,
            iterations: 0,
        }
    }

    /// Closes the frame and throttles the next one.
    pub fn end_frame(&mut self, started: Instant) -> FrameTiming {
        let elapsed = started.elapsed();
        if !self.realtime {
            return FrameTiming {
                elapsed,
                budget: None,
                over_budget: false,
            };
        }

        let over_budget = elapsed > self.frame_budget;
        if over_budget {
            self.overruns += 1;
            warn!(
                "frame took {elapsed:?}, over the {:?} budget",
                self.frame_budget
            );
        }
        if let Some(ema) = self.iteration_ema.filter(|ema| !ema.is_zero()) {
            let affordable = self.registration_budget.as_secs_f64() / ema.as_secs_f64();
            self.iteration_cap = (affordable.floor() as usize).clamp(1, self.max_iterations);
        }
        FrameTiming {
            elapsed,
            budget: Some(self.frame_budget),
            over_budget,
        }
    }

    fn record_iteration(&mut self, elapsed: Duration) {
        self.iteration_ema = Some(match self.iteration_ema {
            Some(ema) => ema.mul_f64(1.0 - EMA_ALPHA) + elapsed.mul_f64(EMA_ALPHA),
            None => elapsed,
        });
    }
}

/// The [`IterationGuard`] of one frame.
#[derive(Debug)]
pub struct FrameDeadline<'s> {
    scheduler: &'s mut Scheduler,
    deadline: Option<Instant>,
    iterations: usize,
}

impl FrameDeadline<'_> {
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl IterationGuard for FrameDeadline<'_> {
    fn allow_iteration(&mut self) -> bool {
        if self.iterations >= self.scheduler.iteration_cap {
            return false;
        }
        let Some(deadline) = self.deadline else {
            return true;
        };
        let expected = self.scheduler.iteration_ema.unwrap_or_default();
        Instant::now() + expected <= deadline
    }

    fn iteration_finished(&mut self, elapsed: Duration) {
        self.iterations += 1;
        self.scheduler.record_iteration(elapsed);
    }
}
