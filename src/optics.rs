use ndarray::{Array2, Zip};
use num_complex::Complex;
use std::f64::consts::PI;

/// Squared spatial frequency at grid index `(x, y)` in inverse length units.
///
/// Indices wrap around the padded side so that DC sits at index 0 and the
/// upper half of each axis carries the negative frequencies, matching the
/// layout the FFT produces.
pub fn q2(x: usize, y: usize, padding: usize, psize: f64) -> f64 {
    let p = padding as isize;
    let half = p / 2;
    let qx = (((x as isize + half) % p) - half) as f64 / (padding as f64 * psize);
    let qy = (((y as isize + half) % p) - half) as f64 / (padding as f64 * psize);
    qx * qx + qy * qy
}

/// Boolean aperture marking the frequencies inside the reconstruction band.
pub fn tophat(padding: usize, psize: f64, qmax: f64) -> Array2<bool> {
    let qmax2 = qmax * qmax;
    let mut mask = Array2::from_elem((padding, padding), false);
    Zip::indexed(&mut mask).par_for_each(|(x, y), inside| {
        *inside = q2(x, y, padding, psize) <= qmax2;
    });
    mask
}

/// Fill `prop` with the Fresnel transfer function for defocus `fval`.
///
/// Every sample has unit modulus; only the phase varies with frequency, so
/// the transfer is precomputed once and reused every iteration.
pub fn fill_propagator(prop: &mut Array2<Complex<f64>>, lambda: f64, psize: f64, fval: f64) {
    let padding = prop.nrows();
    Zip::indexed(prop).for_each(|(x, y), h| {
        let chi = PI * lambda * fval * q2(x, y, padding, psize);
        *h = Complex::from_polar(1.0, -chi);
    });
}
