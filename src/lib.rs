//! Exit-wave reconstruction from an electron-microscope focal series.
//!
//! Given intensity images of one specimen recorded at known defocus values,
//! the [`Reconstructor`] recovers the complex wavefunction at the zero-defocus
//! plane whose Fresnel propagation reproduces every measured amplitude. Each
//! iteration propagates the current estimate to every plane, substitutes the
//! measured amplitudes while keeping the reconstructed phases, and averages
//! the back-propagated planes inside a band-limiting aperture.

pub mod config;
pub mod error;
pub mod fft2;
pub mod io;
pub mod optics;
mod plane;
pub mod schedule;
mod timing;

pub use config::{Config, GuessSpec};
pub use error::{PewrError, Result};
pub use plane::Plane;
pub use schedule::OutputSchedule;
pub use timing::{IterTiming, PlaneTimes};

use crate::fft2::Fft2;
use crate::timing::LapTimer;
use ndarray::{Array2, ArrayView2, Zip};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::num_traits::Zero;
use rustfft::{FftDirection, FftPlanner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Numerical setup of a reconstruction: grid geometry, electron wavelength,
/// pixel pitch and the aperture radius in inverse length units.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    pub size: usize,
    pub padding: usize,
    pub lambda: f64,
    pub psize: f64,
    pub qmax: f64,
    pub verbose: bool,
}

impl From<&Config> for Params {
    fn from(cfg: &Config) -> Params {
        Params {
            size: cfg.size,
            padding: cfg.padding,
            lambda: cfg.lambda,
            psize: cfg.psize,
            qmax: cfg.qmax,
            verbose: cfg.verbose,
        }
    }
}

/// Owns the current estimate in both domains, the aperture, the observation
/// planes and the iteration loop.
///
/// The frequency-domain estimate is the authoritative state between
/// iterations; the space-domain buffer is derived from it on demand at
/// output points. All buffers and transform plans are allocated at
/// construction, so the loop itself never allocates and never fails.
pub struct Reconstructor {
    size: usize,
    padding: usize,
    verbose: bool,
    planes: Vec<Plane>,
    tophat: Array2<bool>,
    ew: Array2<Complex<f64>>,
    ewfft: Array2<Complex<f64>>,
    fft_bwd: Fft2,
    start_iter: usize,
}

impl Reconstructor {
    /// Build the engine from decoded intensity images, one `(defocus, image)`
    /// pair per plane. Images are normalised by the mean raw intensity across
    /// the whole series and converted to amplitudes; an optional space-domain
    /// `guess` seeds the estimate and the iteration counter.
    pub fn new(
        params: &Params,
        series: Vec<(f64, Array2<f64>)>,
        guess: Option<(Array2<Complex<f64>>, usize)>,
    ) -> Result<Self> {
        let Params {
            size,
            padding,
            lambda,
            psize,
            qmax,
            verbose,
        } = *params;

        if series.is_empty() {
            return Err(PewrError::Config("at least one plane is required".into()));
        }
        let mut mean = 0.0;
        for (_, image) in &series {
            if image.dim() != (size, size) {
                return Err(PewrError::Config(format!(
                    "plane image is {}x{}, expected {size}x{size}",
                    image.nrows(),
                    image.ncols()
                )));
            }
            mean += image.mean().unwrap_or(0.0);
        }
        let mean = mean / series.len() as f64;
        if mean == 0.0 {
            return Err(PewrError::DegenerateIntensity);
        }

        let mut planner = FftPlanner::new();
        let mut planes = Vec::with_capacity(series.len());
        for (fval, image) in series {
            let amplitude = image.mapv(|v| (v / mean).abs().sqrt());
            planes.push(Plane::new(&mut planner, size, padding, fval, amplitude));
        }
        planes
            .par_iter_mut()
            .for_each(|plane| plane.init_propagator(lambda, psize));

        let tophat = optics::tophat(padding, psize, qmax);

        let mut fft_fwd = Fft2::new(&mut planner, padding, FftDirection::Forward);
        let fft_bwd = Fft2::new(&mut planner, padding, FftDirection::Inverse);

        let (ew, start_iter) = match guess {
            Some((wave, start_iter)) => {
                if wave.dim() != (padding, padding) {
                    return Err(PewrError::Config(format!(
                        "guess is {}x{}, expected {padding}x{padding}",
                        wave.nrows(),
                        wave.ncols()
                    )));
                }
                (wave, start_iter)
            }
            None => (
                Array2::from_elem((padding, padding), Complex::new(1.0, 0.0)),
                0,
            ),
        };
        let mut ewfft = ew.clone();
        fft_fwd.process(&mut ewfft);

        Ok(Reconstructor {
            size,
            padding,
            verbose,
            planes,
            tophat,
            ew,
            ewfft,
            fft_bwd,
            start_iter,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn start_iter(&self) -> usize {
        self.start_iter
    }

    pub fn aperture(&self) -> ArrayView2<'_, bool> {
        self.tophat.view()
    }

    pub fn frequency_estimate(&self) -> ArrayView2<'_, Complex<f64>> {
        self.ewfft.view()
    }

    /// One full update: sweep every plane through propagation and amplitude
    /// substitution, then replace the frequency-domain estimate with the
    /// masked average of the back-propagated planes.
    ///
    /// Planes are processed in parallel; the averaging is parallel across
    /// pixels with a serial plane-index-ordered sum per pixel, so the result
    /// is identical for any worker count.
    pub fn iterate(&mut self) -> IterTiming {
        let mut timing = IterTiming::default();
        let Reconstructor {
            planes,
            ewfft,
            tophat,
            ..
        } = self;

        {
            let ewfft: &Array2<Complex<f64>> = &*ewfft;
            let tophat: &Array2<bool> = &*tophat;
            timing.planes = planes
                .par_iter_mut()
                .map(|plane| plane.project(ewfft, tophat))
                .reduce(PlaneTimes::default, PlaneTimes::merge);
        }

        let mut lap = LapTimer::start();
        let inv_n = 1.0 / planes.len() as f64;
        let planes: &[Plane] = planes;
        Zip::indexed(&mut *ewfft)
            .and(&*tophat)
            .par_for_each(|(x, y), e, &inside| {
                *e = if inside {
                    let mut sum: Complex<f64> = Zero::zero();
                    for plane in planes {
                        sum += plane.wave[[x, y]] * plane.prop[[x, y]].conj();
                    }
                    sum * inv_n
                } else {
                    Zero::zero()
                };
            });
        timing.average = lap.lap();

        timing
    }

    /// Inverse-transform the frequency-domain estimate and return the full
    /// padded space-domain wave.
    pub fn exit_wave(&mut self) -> ArrayView2<'_, Complex<f64>> {
        self.ew.assign(&self.ewfft);
        self.fft_bwd.process(&mut self.ew);
        let norm = 1.0 / (self.padding * self.padding) as f64;
        self.ew.par_map_inplace(move |e| *e *= norm);
        self.ew.view()
    }

    /// Drive iterations up to `iters`, handing due estimates to `emit`.
    ///
    /// The stop flag is observed between iterations only: once it is seen the
    /// in-flight iteration completes, one final estimate is emitted, and the
    /// loop ends.
    pub fn run<F>(
        &mut self,
        iters: usize,
        schedule: &mut OutputSchedule,
        stop: &AtomicBool,
        mut emit: F,
    ) -> Result<()>
    where
        F: FnMut(usize, ArrayView2<'_, Complex<f64>>) -> Result<()>,
    {
        for iter in self.start_iter + 1..=iters {
            let started = Instant::now();
            let mut timing = self.iterate();

            let interrupted = stop.load(Ordering::Relaxed);
            if schedule.due(iter, interrupted) {
                let mut lap = LapTimer::start();
                emit(iter, self.exit_wave())?;
                timing.output = lap.lap();
            }

            if self.verbose {
                timing.log();
            }
            tracing::info!("iteration {} done in {} ms", iter, started.elapsed().as_millis());

            if interrupted {
                tracing::info!("interrupt observed, stopping after iteration {iter}");
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use num_complex::Complex;

    fn params(size: usize, padding: usize, qmax: f64) -> Params {
        Params {
            size,
            padding,
            lambda: 0.02,
            psize: 1.0,
            qmax,
            verbose: false,
        }
    }

    fn fft(mut grid: Array2<Complex<f64>>) -> Array2<Complex<f64>> {
        let n = grid.nrows();
        let mut planner = FftPlanner::new();
        Fft2::new(&mut planner, n, FftDirection::Forward).process(&mut grid);
        grid
    }

    fn ifft_norm(mut grid: Array2<Complex<f64>>) -> Array2<Complex<f64>> {
        let n = grid.nrows();
        let mut planner = FftPlanner::new();
        Fft2::new(&mut planner, n, FftDirection::Inverse).process(&mut grid);
        let norm = 1.0 / (n * n) as f64;
        grid.map_inplace(|e| *e *= norm);
        grid
    }

    /// A weak object built from a handful of low frequencies, all well inside
    /// an aperture of qmax = 0.3 at unit pixel pitch.
    fn band_limited_truth(padding: usize) -> Array2<Complex<f64>> {
        let p2 = (padding * padding) as f64;
        let mut ewfft = Array2::zeros((padding, padding));
        ewfft[[0, 0]] = Complex::new(1.0, 0.0) * p2;
        ewfft[[2, 0]] = Complex::new(0.02, 0.01) * p2;
        ewfft[[0, 3]] = Complex::new(0.0, 0.015) * p2;
        ewfft[[padding - 1, 1]] = Complex::new(0.01, -0.02) * p2;
        ewfft[[1, padding - 2]] = Complex::new(-0.015, 0.005) * p2;
        ewfft
    }

    /// Forward-propagate a frequency-domain truth to each defocus and record
    /// the interior intensities, the way a focal series is acquired.
    fn synthetic_series(
        truth_f: &Array2<Complex<f64>>,
        fvals: &[f64],
        size: usize,
        lambda: f64,
        psize: f64,
    ) -> Vec<(f64, Array2<f64>)> {
        let padding = truth_f.nrows();
        fvals
            .iter()
            .map(|&fval| {
                let mut prop = Array2::zeros((padding, padding));
                optics::fill_propagator(&mut prop, lambda, psize, fval);
                let field = ifft_norm(truth_f * &prop);
                let intensity =
                    Array2::from_shape_fn((size, size), |(x, y)| field[[x, y]].norm_sqr());
                (fval, intensity)
            })
            .collect()
    }

    fn series_mean(series: &[(f64, Array2<f64>)]) -> f64 {
        series.iter().map(|(_, i)| i.mean().unwrap()).sum::<f64>() / series.len() as f64
    }

    #[test]
    fn zero_defocus_collapses_to_the_averaged_image() {
        let (size, padding) = (4, 6);
        let p = params(size, padding, 1.0);

        let series = vec![
            (0.0, Array2::from_elem((size, size), 2.0)),
            (
                0.0,
                Array2::from_shape_fn((size, size), |(x, y)| 1.0 + (x + 2 * y) as f64),
            ),
        ];
        let mean = series_mean(&series);
        let amplitudes: Vec<Array2<f64>> = series
            .iter()
            .map(|(_, i)| i.mapv(|v| (v / mean).abs().sqrt()))
            .collect();

        let mut rec = Reconstructor::new(&p, series, None).unwrap();
        rec.iterate();

        // With identity propagators and a uniform starting phase, one
        // iteration leaves the amplitude-substituted field averaged across
        // planes: measured amplitudes on the interior, 1 on the halo.
        let mut expected = Array2::from_elem((padding, padding), Complex::new(1.0, 0.0));
        for x in 0..size {
            for y in 0..size {
                let mean_a = (amplitudes[0][[x, y]] + amplitudes[1][[x, y]]) / 2.0;
                expected[[x, y]] = Complex::new(mean_a, 0.0);
            }
        }
        let expected = fft(expected);

        for (a, b) in rec.ewfft.iter().zip(&expected) {
            assert!((a - b).norm() < 1e-9, "{}", (a - b).norm());
        }
    }

    #[test]
    fn single_plane_amplitudes_match_after_one_iteration() {
        let (size, padding) = (6, 8);
        let p = params(size, padding, 2.0);

        let image = Array2::from_shape_fn((size, size), |(x, y)| 1.0 + (x * y) as f64);
        let mean = image.mean().unwrap();
        let amplitude = image.mapv(|v| (v / mean).abs().sqrt());

        let mut rec = Reconstructor::new(&p, vec![(1.5, image)], None).unwrap();
        rec.iterate();

        let field = ifft_norm(&rec.ewfft * &rec.planes[0].prop);
        for x in 0..size {
            for y in 0..size {
                assert!((field[[x, y]].norm() - amplitude[[x, y]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn frequencies_outside_the_aperture_stay_zero() {
        let (size, padding) = (6, 8);
        let p = params(size, padding, 0.2);

        let series = vec![
            (
                3.0,
                Array2::from_shape_fn((size, size), |(x, y)| 1.0 + ((x * 3 + y) % 5) as f64),
            ),
            (
                -3.0,
                Array2::from_shape_fn((size, size), |(x, y)| 2.0 + ((x + y * 2) % 3) as f64),
            ),
        ];
        let mut rec = Reconstructor::new(&p, series, None).unwrap();
        for _ in 0..3 {
            rec.iterate();
        }

        for x in 0..padding {
            for y in 0..padding {
                if !rec.tophat[[x, y]] {
                    assert_eq!(rec.ewfft[[x, y]], Complex::new(0.0, 0.0));
                }
            }
        }
    }

    #[test]
    fn emitted_wave_is_band_limited() {
        let (size, padding) = (6, 8);
        let p = params(size, padding, 0.25);

        let series = vec![(
            2.0,
            Array2::from_shape_fn((size, size), |(x, y)| 1.0 + (x + y) as f64),
        )];
        let mut rec = Reconstructor::new(&p, series, None).unwrap();
        for _ in 0..2 {
            rec.iterate();
        }

        let spectrum = fft(rec.exit_wave().to_owned());
        for x in 0..padding {
            for y in 0..padding {
                if !rec.tophat[[x, y]] {
                    assert!(spectrum[[x, y]].norm() < 1e-7);
                }
            }
        }
    }

    #[test]
    fn consistent_data_is_a_fixed_point() {
        let (size, padding) = (24, 32);
        let p = params(size, padding, 0.3);

        let truth_f = band_limited_truth(padding);
        let series = synthetic_series(&truth_f, &[-4.0, 7.0], size, p.lambda, p.psize);
        let scale = 1.0 / series_mean(&series).sqrt();

        let mut rec = Reconstructor::new(&p, series, None).unwrap();
        rec.ewfft.assign(&truth_f);
        rec.ewfft.map_inplace(|e| *e *= scale);

        let before = rec.ewfft.clone();
        rec.iterate();

        for (a, b) in rec.ewfft.iter().zip(&before) {
            assert!((a - b).norm() < 1e-8, "{}", (a - b).norm());
        }
    }

    #[test]
    fn recovers_a_synthetic_focal_series() {
        let (size, padding) = (24, 32);
        let p = params(size, padding, 0.3);

        let truth_f = band_limited_truth(padding);
        let truth = ifft_norm(truth_f.clone());
        let series = synthetic_series(&truth_f, &[-5.0, 0.0, 5.0], size, p.lambda, p.psize);
        let scale = 1.0 / series_mean(&series).sqrt();

        let mut rec = Reconstructor::new(&p, series, None).unwrap();
        for _ in 0..200 {
            rec.iterate();
        }

        let wave = rec.exit_wave();
        let mut rel_err = 0.0;
        for x in 0..size {
            for y in 0..size {
                let target = truth[[x, y]].norm() * scale;
                rel_err += (wave[[x, y]].norm() - target).abs() / target;
            }
        }
        let rel_err = rel_err / (size * size) as f64;
        assert!(rel_err < 0.01, "mean relative amplitude error {rel_err}");
    }

    #[test]
    fn uniform_planes_converge_to_a_uniform_wave() {
        let (size, padding) = (6, 8);
        let p = params(size, padding, 0.3);

        let series = vec![
            (-2.0, Array2::from_elem((size, size), 4.0)),
            (3.0, Array2::from_elem((size, size), 4.0)),
        ];
        let mut rec = Reconstructor::new(&p, series, None).unwrap();
        for _ in 0..5 {
            rec.iterate();
        }

        let wave = rec.exit_wave();
        for x in 0..size {
            for y in 0..size {
                assert!((wave[[x, y]].norm() - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn zero_mean_intensity_is_rejected() {
        let (size, padding) = (4, 4);
        let p = params(size, padding, 0.3);
        let series = vec![(0.0, Array2::from_elem((size, size), 0.0))];
        assert!(matches!(
            Reconstructor::new(&p, series, None),
            Err(PewrError::DegenerateIntensity)
        ));
    }

    #[test]
    fn guess_resumes_the_iteration_counter() {
        let (size, padding) = (4, 6);
        let p = params(size, padding, 1.0);
        let series = vec![(0.0, Array2::from_elem((size, size), 1.0))];
        let guess = Array2::from_elem((padding, padding), Complex::new(0.5, 0.5));

        let rec = Reconstructor::new(&p, series, Some((guess.clone(), 12))).unwrap();
        assert_eq!(rec.start_iter(), 12);

        // The seeded estimate is the forward transform of the guess.
        let expected = fft(guess);
        for (a, b) in rec.ewfft.iter().zip(&expected) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn interrupt_finishes_the_iteration_and_emits_once() {
        let (size, padding) = (4, 6);
        let p = params(size, padding, 0.3);
        let series = vec![(1.0, Array2::from_elem((size, size), 2.0))];
        let mut rec = Reconstructor::new(&p, series, None).unwrap();

        let mut schedule = OutputSchedule::new(0, 0.0, 1, 50, 0);
        let stop = AtomicBool::new(true);
        let mut emitted = Vec::new();
        rec.run(50, &mut schedule, &stop, |iter, _| {
            emitted.push(iter);
            Ok(())
        })
        .unwrap();

        assert_eq!(emitted, vec![1]);
    }

    #[test]
    fn run_emits_on_the_configured_cadence() {
        let (size, padding) = (4, 6);
        let p = params(size, padding, 0.3);
        let series = vec![(1.0, Array2::from_elem((size, size), 2.0))];
        let mut rec = Reconstructor::new(&p, series, None).unwrap();

        let mut schedule = OutputSchedule::new(4, 0.0, 1, 10, 0);
        let stop = AtomicBool::new(false);
        let mut emitted = Vec::new();
        rec.run(10, &mut schedule, &stop, |iter, wave| {
            assert_eq!(wave.dim(), (padding, padding));
            emitted.push(iter);
            Ok(())
        })
        .unwrap();

        assert_eq!(emitted, vec![4, 8, 10]);
    }
}
