use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array3, Axis, Zip};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::error::Error;

use crate::error::{AnalysisError, Result};

pub type DynError = Box<dyn Error + Send + Sync>;

pub type Shape3 = [usize; 3];

/// Separable 3D FFT over `rustfft` plans, one plan per axis.
pub struct FftHelper {
    shape: Shape3,
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
}

impl FftHelper {
    pub fn new(shape: Shape3) -> Self {
        let mut planner = FftPlanner::new();
        let forward = [
            planner.plan_fft_forward(shape[0]),
            planner.plan_fft_forward(shape[1]),
            planner.plan_fft_forward(shape[2]),
        ];
        let inverse = [
            planner.plan_fft_inverse(shape[0]),
            planner.plan_fft_inverse(shape[1]),
            planner.plan_fft_inverse(shape[2]),
        ];
        Self {
            shape,
            forward,
            inverse,
        }
    }

    fn check_shape(&self, data: &Array3<Complex<f64>>) -> Result<()> {
        if data.dim() != (self.shape[0], self.shape[1], self.shape[2]) {
            return Err(AnalysisError::invalid(format!(
                "array shape {:?} does not match FFT configuration {:?}",
                data.shape(),
                self.shape
            )));
        }
        Ok(())
    }

    pub fn fftn(&self, data: &mut Array3<Complex<f64>>) -> Result<()> {
        self.check_shape(data)?;
        for (axis, plan) in self.forward.iter().enumerate() {
            process_lanes(data, axis, plan.as_ref());
        }
        Ok(())
    }

    /// Inverse transform, normalized so that `ifftn(fftn(a)) == a`.
    pub fn ifftn(&self, data: &mut Array3<Complex<f64>>) -> Result<()> {
        self.check_shape(data)?;
        for (axis, plan) in self.inverse.iter().enumerate() {
            process_lanes(data, axis, plan.as_ref());
        }
        let scale = 1.0 / (self.shape[0] * self.shape[1] * self.shape[2]) as f64;
        data.mapv_inplace(|v| v * scale);
        Ok(())
    }
}

fn process_lanes(data: &mut Array3<Complex<f64>>, axis: usize, plan: &dyn Fft<f64>) {
    Zip::from(data.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
        let mut buffer: Vec<Complex<f64>> = lane.iter().copied().collect();
        plan.process(&mut buffer);
        for (dst, src) in lane.iter_mut().zip(buffer) {
            *dst = src;
        }
    });
}

/// Convenience wrapper planning a one-shot forward transform.
pub fn fftn(data: &Array3<Complex<f64>>) -> Result<Array3<Complex<f64>>> {
    let (nz, ny, nx) = data.dim();
    let mut out = data.clone();
    FftHelper::new([nz, ny, nx]).fftn(&mut out)?;
    Ok(out)
}

pub fn ifftn(data: &Array3<Complex<f64>>) -> Result<Array3<Complex<f64>>> {
    let (nz, ny, nx) = data.dim();
    let mut out = data.clone();
    FftHelper::new([nz, ny, nx]).ifftn(&mut out)?;
    Ok(out)
}

/// Circular shift along every axis, numpy `roll` semantics.
pub fn roll<A: Clone>(array: &Array3<A>, shifts: [isize; 3]) -> Array3<A> {
    let (nz, ny, nx) = array.dim();
    let dims = [nz as isize, ny as isize, nx as isize];
    Array3::from_shape_fn((nz, ny, nx), |(z, y, x)| {
        let src = |i: usize, axis: usize| -> usize {
            if dims[axis] == 0 {
                return 0;
            }
            (i as isize - shifts[axis]).rem_euclid(dims[axis]) as usize
        };
        array[[src(z, 0), src(y, 1), src(x, 2)]].clone()
    })
}

pub fn fftshift<A: Clone>(array: &Array3<A>) -> Array3<A> {
    let (nz, ny, nx) = array.dim();
    roll(array, [(nz / 2) as isize, (ny / 2) as isize, (nx / 2) as isize])
}

pub fn ifftshift<A: Clone>(array: &Array3<A>) -> Array3<A> {
    let (nz, ny, nx) = array.dim();
    roll(
        array,
        [-((nz / 2) as isize), -((ny / 2) as isize), -((nx / 2) as isize)],
    )
}

/// Sample frequencies in cycles per unit, numpy `fftfreq` ordering.
pub fn fftfreq(n: usize, spacing: f64) -> Vec<f64> {
    let denom = n as f64 * spacing;
    (0..n)
        .map(|k| {
            let k = if k < (n + 1) / 2 {
                k as f64
            } else {
                k as f64 - n as f64
            };
            k / denom
        })
        .collect()
}

/// Wrap `value` into `[start, start + range)`.
#[inline]
pub fn wrap(value: f64, start: f64, range: f64) -> f64 {
    (value - start).rem_euclid(range) + start
}

#[inline]
pub fn wrap_to_pi(angle: f64) -> f64 {
    wrap(angle, -PI, 2.0 * PI)
}

pub fn safe_arg(z: &Complex<f64>) -> f64 {
    if z.re == 0.0 && z.im == 0.0 {
        0.0
    } else {
        z.arg()
    }
}

pub fn hanning_window(len: usize) -> Vec<f64> {
    if len < 2 {
        return vec![1.0; len];
    }
    let mut window = vec![0.0; len];
    for i in 0..len {
        window[i] = 0.5 * (1.0 - (2.0 * PI * i as f64 / (len as f64 - 1.0)).cos());
    }
    window
}

pub fn blackman_window(len: usize) -> Vec<f64> {
    if len < 2 {
        return vec![1.0; len];
    }
    let m = len as f64 - 1.0;
    (0..len)
        .map(|i| {
            let t = 2.0 * PI * i as f64 / m;
            0.42 - 0.5 * t.cos() + 0.08 * (2.0 * t).cos()
        })
        .collect()
}

/// Tapered cosine window; `alpha = 0` is rectangular, `alpha = 1` is Hann.
pub fn tukey_window(len: usize, alpha: f64) -> Vec<f64> {
    if len < 2 || alpha <= 0.0 {
        return vec![1.0; len];
    }
    if alpha >= 1.0 {
        return hanning_window(len);
    }
    let m = len as f64 - 1.0;
    let width = alpha * m / 2.0;
    (0..len)
        .map(|i| {
            let n = i as f64;
            if n < width {
                0.5 * (1.0 + (PI * (n / width - 1.0)).cos())
            } else if n <= m - width {
                1.0
            } else {
                0.5 * (1.0 + (PI * (n / width - 2.0 / alpha + 1.0)).cos())
            }
        })
        .collect()
}

/// Outer product of three 1D windows.
pub fn separable_window(wz: &[f64], wy: &[f64], wx: &[f64]) -> Array3<f64> {
    Array3::from_shape_fn((wz.len(), wy.len(), wx.len()), |(z, y, x)| {
        wz[z] * wy[y] * wx[x]
    })
}

#[cfg(test)]
mod tests {
    use super::{
        blackman_window, fftfreq, fftn, fftshift, ifftn, ifftshift, roll, tukey_window, wrap,
    };
    use ndarray::Array3;
    use rustfft::num_complex::Complex;
    use std::f64::consts::PI;

    #[test]
    fn fftn_of_delta_is_flat() {
        let mut data = Array3::from_elem((4, 6, 5), Complex::new(0.0, 0.0));
        data[[0, 0, 0]] = Complex::new(1.0, 0.0);
        let spectrum = fftn(&data).unwrap();
        for value in spectrum.iter() {
            assert!((value - Complex::new(1.0, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn ifftn_inverts_fftn() {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| {
            Complex::new((z * 7 + y) as f64, (x as f64).sin())
        });
        let back = ifftn(&fftn(&data).unwrap()).unwrap();
        for (a, b) in data.iter().zip(back.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn roll_matches_numpy_direction() {
        let data = Array3::from_shape_fn((1, 1, 5), |(_, _, x)| x as i32);
        let rolled = roll(&data, [0, 0, 2]);
        assert_eq!(rolled.iter().copied().collect::<Vec<_>>(), vec![3, 4, 0, 1, 2]);
        let back = roll(&rolled, [0, 0, -2]);
        assert_eq!(back, data);
    }

    #[test]
    fn fftshift_and_ifftshift_are_inverse_for_odd_sizes() {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| z * 100 + y * 10 + x);
        assert_eq!(ifftshift(&fftshift(&data)), data);
    }

    #[test]
    fn fftfreq_matches_numpy_layout() {
        let f = fftfreq(5, 1.0);
        let expected = [0.0, 0.2, 0.4, -0.4, -0.2];
        for (a, b) in f.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        let even = fftfreq(4, 1.0);
        assert!((even[2] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn wrap_lands_in_half_open_interval() {
        assert!((wrap(3.5 * PI, -PI, 2.0 * PI) + 0.5 * PI).abs() < 1e-12);
        assert!((wrap(PI, -PI, 2.0 * PI) + PI).abs() < 1e-12);
        assert!((wrap(-4.0, -2.0, 4.0) + 0.0).abs() < 1e-12);
    }

    #[test]
    fn windows_peak_in_the_middle() {
        let b = blackman_window(9);
        assert!(b[0].abs() < 1e-12);
        assert!((b[4] - 1.0).abs() < 1e-12);
        let t = tukey_window(11, 0.5);
        assert!(t[0].abs() < 1e-12);
        assert!((t[5] - 1.0).abs() < 1e-12);
        assert!((t[1] - t[9]).abs() < 1e-12);
    }
}
