use std::time::{Duration, Instant};

/// Successive lap measurement for the pipeline stages.
pub(crate) struct LapTimer(Instant);

impl LapTimer {
    pub fn start() -> Self {
        LapTimer(Instant::now())
    }

    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let lap = now - self.0;
        self.0 = now;
        lap
    }
}

/// Wall time spent in each per-plane stage, summed across planes.
#[derive(Clone, Copy, Default)]
pub struct PlaneTimes {
    pub propagate: Duration,
    pub fft_bwd: Duration,
    pub normalise: Duration,
    pub substitute: Duration,
    pub fft_fwd: Duration,
}

impl PlaneTimes {
    pub fn merge(self, other: Self) -> Self {
        PlaneTimes {
            propagate: self.propagate + other.propagate,
            fft_bwd: self.fft_bwd + other.fft_bwd,
            normalise: self.normalise + other.normalise,
            substitute: self.substitute + other.substitute,
            fft_fwd: self.fft_fwd + other.fft_fwd,
        }
    }
}

/// Stage timings of one full iteration, including averaging and output.
#[derive(Clone, Copy, Default)]
pub struct IterTiming {
    pub planes: PlaneTimes,
    pub average: Duration,
    pub output: Duration,
}

impl IterTiming {
    pub fn log(&self) {
        tracing::info!(
            "stage times (ms): propagate {} bwd-fft {} normalise {} substitute {} fwd-fft {} average {} output {}",
            self.planes.propagate.as_millis(),
            self.planes.fft_bwd.as_millis(),
            self.planes.normalise.as_millis(),
            self.planes.substitute.as_millis(),
            self.planes.fft_fwd.as_millis(),
            self.average.as_millis(),
            self.output.as_millis(),
        );
    }
}
