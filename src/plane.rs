use crate::fft2::Fft2;
use crate::optics;
use crate::timing::{LapTimer, PlaneTimes};
use ndarray::{s, Array2, Zip};
use num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{FftDirection, FftPlanner};

/// One observation of the focal series: the measured amplitudes, the defocus
/// value, the precomputed transfer function and a padded work buffer with its
/// two transform engines.
///
/// During an iteration a plane is owned exclusively by one worker; everything
/// it needs besides the shared frequency-domain estimate and the aperture is
/// held here, so the per-plane sweep runs without synchronisation.
pub struct Plane {
    size: usize,
    padding: usize,
    pub(crate) fval: f64,
    pub(crate) amplitude: Array2<f64>,
    pub(crate) prop: Array2<Complex<f64>>,
    pub(crate) wave: Array2<Complex<f64>>,
    fft_fwd: Fft2,
    fft_bwd: Fft2,
}

impl Plane {
    /// `amplitude` is the already-normalised `size x size` measurement.
    pub fn new(
        planner: &mut FftPlanner<f64>,
        size: usize,
        padding: usize,
        fval: f64,
        amplitude: Array2<f64>,
    ) -> Self {
        debug_assert_eq!(amplitude.shape(), [size, size]);
        Plane {
            size,
            padding,
            fval,
            amplitude,
            prop: Array2::zeros((padding, padding)),
            wave: Array2::zeros((padding, padding)),
            fft_fwd: Fft2::new(planner, padding, FftDirection::Forward),
            fft_bwd: Fft2::new(planner, padding, FftDirection::Inverse),
        }
    }

    pub fn fval(&self) -> f64 {
        self.fval
    }

    pub(crate) fn init_propagator(&mut self, lambda: f64, psize: f64) {
        let fval = self.fval;
        optics::fill_propagator(&mut self.prop, lambda, psize, fval);
    }

    /// Propagate the shared frequency-domain estimate to this plane's focus,
    /// substitute the measured amplitudes, and transform back to frequency
    /// space, leaving the result in `wave`.
    ///
    /// The substitution covers only the unpadded interior; the padding halo
    /// keeps its propagated value so the forward transform sees continuous
    /// support. Returns the wall time spent in each stage.
    pub(crate) fn project(
        &mut self,
        ewfft: &Array2<Complex<f64>>,
        tophat: &Array2<bool>,
    ) -> PlaneTimes {
        let mut times = PlaneTimes::default();
        let mut lap = LapTimer::start();

        Zip::from(&mut self.wave)
            .and(ewfft)
            .and(&self.prop)
            .and(tophat)
            .for_each(|w, &e, &h, &inside| {
                *w = if inside { e * h } else { Zero::zero() };
            });
        times.propagate = lap.lap();

        self.fft_bwd.process(&mut self.wave);
        times.fft_bwd = lap.lap();

        let norm = 1.0 / (self.padding * self.padding) as f64;
        self.wave.map_inplace(|w| *w *= norm);
        times.normalise = lap.lap();

        let interior = self.wave.slice_mut(s![..self.size, ..self.size]);
        Zip::from(interior)
            .and(&self.amplitude)
            .for_each(|w, &a| *w = Complex::from_polar(a, w.arg()));
        times.substitute = lap.lap();

        self.fft_fwd.process(&mut self.wave);
        times.fft_fwd = lap.lap();

        times
    }
}
