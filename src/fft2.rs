use ndarray::Array2;
use num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;
use unchecked_index::get_unchecked_mut;

/// In-place 2D complex DFT over a square grid, planned once for a fixed side
/// length and direction.
///
/// Rows are transformed in place (they are contiguous), columns through an
/// owned staging buffer. No normalisation is applied in either direction: a
/// backward pass after a forward pass gains a factor of `len * len`, which
/// callers divide out. The staging and scratch buffers are allocated at
/// construction so repeated transforms never allocate.
pub struct Fft2 {
    len: usize,
    line: Arc<dyn Fft<f64>>,
    stage: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl Fft2 {
    pub fn new(planner: &mut FftPlanner<f64>, len: usize, direction: FftDirection) -> Self {
        let line = planner.plan_fft(len, direction);
        let stage = vec![Zero::zero(); len];
        let scratch = vec![Zero::zero(); line.get_inplace_scratch_len()];
        Fft2 {
            len,
            line,
            stage,
            scratch,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn direction(&self) -> FftDirection {
        self.line.fft_direction()
    }

    /// Transform `grid` in place. The grid side length must match the planned
    /// length; rows are the outer index.
    pub fn process(&mut self, grid: &mut Array2<Complex<f64>>) {
        debug_assert_eq!(grid.shape(), [self.len, self.len]);

        let data = grid.as_slice_mut().unwrap();

        for row in data.chunks_exact_mut(self.len) {
            self.line.process_with_scratch(row, &mut self.scratch);
        }

        for col in 0..self.len {
            unsafe {
                for row in 0..self.len {
                    *get_unchecked_mut(self.stage.as_mut_slice(), row) =
                        *data.get_unchecked(row * self.len + col);
                }
            }

            self.line
                .process_with_scratch(&mut self.stage, &mut self.scratch);

            unsafe {
                for row in 0..self.len {
                    *data.get_unchecked_mut(row * self.len + col) = *self.stage.get_unchecked(row);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Fft2;
    use ndarray::Array2;
    use num_complex::Complex;
    use rustfft::{FftDirection, FftPlanner};

    fn assert_eq_grids(a: &Array2<Complex<f64>>, b: &Array2<Complex<f64>>, tol: f64) {
        for (a, b) in a.iter().zip(b) {
            assert!((a - b).norm() < tol, "{}", (a - b).norm());
        }
    }

    #[test]
    fn impulse_transforms_to_ones() {
        let n = 8;
        let mut grid = Array2::zeros((n, n));
        grid[[0, 0]] = Complex::new(1., 0.);

        let mut planner = FftPlanner::new();
        Fft2::new(&mut planner, n, FftDirection::Forward).process(&mut grid);

        let expected = Array2::from_elem((n, n), Complex::new(1., 0.));
        assert_eq_grids(&grid, &expected, 1e-12);
    }

    #[test]
    fn constant_transforms_to_scaled_impulse() {
        let n = 8;
        let mut grid = Array2::from_elem((n, n), Complex::new(1., 0.));

        let mut planner = FftPlanner::new();
        Fft2::new(&mut planner, n, FftDirection::Forward).process(&mut grid);

        let mut expected = Array2::zeros((n, n));
        expected[[0, 0]] = Complex::new((n * n) as f64, 0.);
        assert_eq_grids(&grid, &expected, 1e-10);
    }

    #[test]
    fn forward_backward_round_trip() {
        let n = 16;
        let original = Array2::from_shape_fn((n, n), |(x, y)| {
            Complex::new((x as f64 * 0.3).sin(), (y as f64 * 0.7).cos())
        });
        let mut grid = original.clone();

        let mut planner = FftPlanner::new();
        let mut fwd = Fft2::new(&mut planner, n, FftDirection::Forward);
        let mut bwd = Fft2::new(&mut planner, n, FftDirection::Inverse);

        fwd.process(&mut grid);
        bwd.process(&mut grid);
        let norm = 1.0 / (n * n) as f64;
        grid.map_inplace(|e| *e *= norm);

        assert_eq_grids(&grid, &original, 1e-10);
    }
}
