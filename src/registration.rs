use std::f64::consts::PI;

use ndarray::{Array2, Array3, Axis, Zip};
use num_complex::Complex64;
use tracing::{debug, info, warn};

use crate::config::AveragingSpace;
use crate::error::{AnalysisError, Result};
use crate::utils::{fftfreq, fftn, ifftn, FftHelper, Shape3};
use crate::volume::{argmax, shape_of, support_mask, ComplexVolume};

/// Fraction of the reference maximum defining the support used for scoring.
pub const SUPPORT_THRESHOLD: f64 = 0.25;

/// Refinement window of the upsampled DFT, in original pixels.
const UPSAMPLED_REGION: f64 = 1.5;

fn check_same_shape(a: &ComplexVolume, b: &ComplexVolume) -> Result<Shape3> {
    if a.dim() != b.dim() {
        return Err(AnalysisError::invalid(format!(
            "cannot register arrays of shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(shape_of(a))
}

/// Applies `kernel` (rows: output samples, columns: input samples) along `axis`.
fn contract_axis(data: &ComplexVolume, axis: usize, kernel: &Array2<Complex64>) -> ComplexVolume {
    let mut out_shape = shape_of(data);
    out_shape[axis] = kernel.nrows();
    let mut out = ComplexVolume::zeros((out_shape[0], out_shape[1], out_shape[2]));
    Zip::from(out.lanes_mut(Axis(axis)))
        .and(data.lanes(Axis(axis)))
        .par_for_each(|mut dst, src| dst.assign(&kernel.dot(&src)));
    out
}

/// Matrix-multiply DFT evaluated on `region` samples per axis, upsampled by
/// `upsample_factor` and starting at `offsets` (in upsampled pixels).
fn upsampled_dft(
    data: &ComplexVolume,
    region: usize,
    upsample_factor: f64,
    offsets: [f64; 3],
) -> ComplexVolume {
    let shape = shape_of(data);
    let mut current = data.clone();
    for axis in (0..3).rev() {
        let freqs = fftfreq(shape[axis], upsample_factor);
        let kernel = Array2::from_shape_fn((region, shape[axis]), |(r, k)| {
            let arg = -2.0 * PI * (r as f64 - offsets[axis]) * freqs[k];
            Complex64::from_polar(1.0, arg)
        });
        current = contract_axis(&current, axis, &kernel);
    }
    current
}

/// Shift (z, y, x) to apply to `moving` to register it onto `reference`,
/// with a precision of `1 / upsample_factor` pixel.
pub fn get_shift(
    reference: &ComplexVolume,
    moving: &ComplexVolume,
    upsample_factor: usize,
) -> Result<[f64; 3]> {
    let shape = check_same_shape(reference, moving)?;
    if upsample_factor == 0 {
        return Err(AnalysisError::invalid("upsample factor must be at least 1"));
    }
    let fft = FftHelper::new(shape);
    let mut src_freq = reference.clone();
    fft.fftn(&mut src_freq)?;
    let mut target_freq = moving.clone();
    fft.fftn(&mut target_freq)?;

    let mut image_product = src_freq;
    image_product.zip_mut_with(&target_freq, |a, b| *a *= b.conj());

    let mut cross_correlation = image_product.clone();
    fft.ifftn(&mut cross_correlation)?;
    let peak = argmax(&cross_correlation.mapv(|v| v.norm()))
        .ok_or_else(|| AnalysisError::invalid("empty arrays"))?;

    let mut shifts: [f64; 3] = std::array::from_fn(|a| {
        let midpoint = shape[a] / 2;
        if peak[a] > midpoint {
            peak[a] as f64 - shape[a] as f64
        } else {
            peak[a] as f64
        }
    });
    if upsample_factor == 1 {
        return Ok(shifts);
    }

    let u = upsample_factor as f64;
    for s in shifts.iter_mut() {
        *s = (*s * u).round() / u;
    }
    let region = (u * UPSAMPLED_REGION).ceil() as usize;
    let dftshift = (region as f64 / 2.0).trunc();
    let offsets = shifts.map(|s| dftshift - s * u);

    let refined = upsampled_dft(&image_product.mapv(|v| v.conj()), region, u, offsets)
        .mapv(|v| v.norm());
    let fine = argmax(&refined).ok_or_else(|| AnalysisError::invalid("empty arrays"))?;
    for (axis, s) in shifts.iter_mut().enumerate() {
        *s += (fine[axis] as f64 - dftshift) / u;
        if shape[axis] == 1 {
            *s = 0.0;
        }
    }
    debug!("registration shift {:?}", shifts);
    Ok(shifts)
}

/// Shifts `data` by `shift` voxels (periodic) through the Fourier shift theorem.
pub fn fourier_shift(data: &ComplexVolume, shift: [f64; 3]) -> Result<ComplexVolume> {
    let shape = shape_of(data);
    let mut spectrum = fftn(data)?;
    let freqs: [Vec<f64>; 3] = std::array::from_fn(|a| fftfreq(shape[a], 1.0));
    Zip::indexed(&mut spectrum).par_for_each(|(z, y, x), v| {
        let arg = -2.0 * PI * (shift[0] * freqs[0][z] + shift[1] * freqs[1][y] + shift[2] * freqs[2][x]);
        *v *= Complex64::from_polar(1.0, arg);
    });
    ifftn(&spectrum)
}

/// Pearson correlation of `a` and `b` restricted to `mask`; 0 when undefined.
pub fn pearson_correlation(a: &Array3<f64>, b: &Array3<f64>, mask: &Array3<bool>) -> f64 {
    let mut n = 0.0;
    let (mut sa, mut sb) = (0.0, 0.0);
    Zip::from(a).and(b).and(mask).for_each(|&x, &y, &m| {
        if m {
            n += 1.0;
            sa += x;
            sb += y;
        }
    });
    if n < 2.0 {
        return 0.0;
    }
    let (ma, mb) = (sa / n, sb / n);
    let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
    Zip::from(a).and(b).and(mask).for_each(|&x, &y, &m| {
        if m {
            cov += (x - ma) * (y - mb);
            va += (x - ma).powi(2);
            vb += (y - mb).powi(2);
        }
    });
    if va <= 0.0 || vb <= 0.0 {
        return 0.0;
    }
    cov / (va.sqrt() * vb.sqrt())
}

/// A candidate registered onto the reference, not yet folded in.
#[derive(Debug, Clone)]
pub struct AlignedCandidate {
    pub volume: ComplexVolume,
    pub shift: [f64; 3],
    pub correlation: f64,
}

/// Registers candidate reconstructions onto a fixed reference and folds the
/// good ones into a running sum.
#[derive(Debug, Clone, Copy)]
pub struct ReconstructionAligner {
    pub space: AveragingSpace,
    pub upsample_factor: usize,
}

impl ReconstructionAligner {
    pub fn new(space: AveragingSpace, upsample_factor: usize) -> Self {
        Self {
            space,
            upsample_factor,
        }
    }

    /// Shift, global phase match and correlation score of `candidate`.
    pub fn align(
        &self,
        reference: &ComplexVolume,
        candidate: &ComplexVolume,
    ) -> Result<AlignedCandidate> {
        let shift = get_shift(reference, candidate, self.upsample_factor)?;
        let mut volume = fourier_shift(candidate, shift)?;

        let ref_modulus = reference.mapv(|v| v.norm());
        let support = support_mask(&ref_modulus, SUPPORT_THRESHOLD);

        // global phase matched to the reference over its support
        let mut overlap = Complex64::new(0.0, 0.0);
        Zip::from(reference)
            .and(&volume)
            .and(&support)
            .for_each(|r, c, &inside| {
                if inside {
                    overlap += r * c.conj();
                }
            });
        if overlap.norm() > 0.0 {
            let rotation = Complex64::from_polar(1.0, overlap.arg());
            volume.mapv_inplace(|v| v * rotation);
        }

        let correlation = match self.space {
            AveragingSpace::Direct => {
                pearson_correlation(&ref_modulus, &volume.mapv(|v| v.norm()), &support)
            }
            AveragingSpace::Reciprocal => {
                let ref_freq = fftn(reference)?;
                let cand_freq = fftn(&volume)?;
                let everywhere = Array3::from_elem(ref_freq.dim(), true);
                pearson_correlation(
                    &ref_freq.mapv(|v| v.norm()),
                    &cand_freq.mapv(|v| v.norm()),
                    &everywhere,
                )
            }
        };
        Ok(AlignedCandidate {
            volume,
            shift,
            correlation,
        })
    }

    /// Adds `aligned` to `running_sum` when its correlation reaches `threshold`.
    pub fn fold(
        &self,
        running_sum: ComplexVolume,
        aligned: &AlignedCandidate,
        threshold: f64,
    ) -> Result<(ComplexVolume, bool)> {
        if running_sum.dim() != aligned.volume.dim() {
            return Err(AnalysisError::invalid("candidate does not match the running average"));
        }
        if aligned.correlation < threshold {
            warn!(
                "candidate rejected: correlation {:.4} below threshold {:.4}",
                aligned.correlation, threshold
            );
            return Ok((running_sum, false));
        }
        info!(
            "candidate accepted: correlation {:.4}, shift {:?}",
            aligned.correlation, aligned.shift
        );
        Ok((running_sum + &aligned.volume, true))
    }

    /// Registers `candidate` onto `reference` and folds it into `running_sum`.
    pub fn merge(
        &self,
        reference: &ComplexVolume,
        running_sum: ComplexVolume,
        candidate: &ComplexVolume,
        threshold: f64,
    ) -> Result<(ComplexVolume, bool)> {
        check_same_shape(reference, candidate)?;
        let aligned = self.align(reference, candidate)?;
        self.fold(running_sum, &aligned, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::{fourier_shift, get_shift, pearson_correlation, ReconstructionAligner};
    use crate::config::AveragingSpace;
    use crate::utils::roll;
    use crate::volume::ComplexVolume;
    use ndarray::Array3;
    use num_complex::Complex64;

    fn blob(n: usize, center: [f64; 3], sigma: f64) -> ComplexVolume {
        Array3::from_shape_fn((n, n, n), |(z, y, x)| {
            let r2 = (z as f64 - center[0]).powi(2)
                + (y as f64 - center[1]).powi(2)
                + (x as f64 - center[2]).powi(2);
            Complex64::new((-r2 / (2.0 * sigma * sigma)).exp(), 0.0)
        })
    }

    #[test]
    fn integer_shift_is_recovered() {
        let reference = blob(16, [8.0, 7.0, 9.0], 2.0);
        let moving = roll(&reference, [2, -3, 1]);
        let shift = get_shift(&reference, &moving, 1).unwrap();
        assert_eq!(shift, [-2.0, 3.0, -1.0]);
    }

    #[test]
    fn subpixel_shift_is_recovered() {
        let reference = blob(24, [12.0, 12.0, 12.0], 2.5);
        let applied = [0.4, -1.3, 2.25];
        let moving = fourier_shift(&reference, applied).unwrap();
        let shift = get_shift(&reference, &moving, 20).unwrap();
        for axis in 0..3 {
            assert!(
                (shift[axis] + applied[axis]).abs() < 0.06,
                "axis {axis}: {} vs {}",
                shift[axis],
                -applied[axis]
            );
        }
    }

    #[test]
    fn fourier_shift_by_integer_matches_roll() {
        let data = blob(12, [5.0, 6.0, 4.0], 1.5);
        let shifted = fourier_shift(&data, [1.0, -2.0, 3.0]).unwrap();
        let rolled = roll(&data, [1, -2, 3]);
        for (a, b) in shifted.iter().zip(rolled.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn pearson_is_one_for_affine_copies() {
        let a = Array3::from_shape_fn((3, 3, 3), |(z, y, x)| (z * 9 + y * 3 + x) as f64);
        let b = a.mapv(|v| 2.0 * v + 1.0);
        let mask = Array3::from_elem((3, 3, 3), true);
        assert!((pearson_correlation(&a, &b, &mask) - 1.0).abs() < 1e-12);
        let flat = Array3::from_elem((3, 3, 3), 1.0);
        assert_eq!(pearson_correlation(&a, &flat, &mask), 0.0);
    }

    #[test]
    fn shifted_copy_is_accepted_in_both_spaces() {
        let reference = blob(16, [8.0, 8.0, 8.0], 2.0);
        let candidate = roll(&reference, [1, 2, -1]).mapv(|v| v * Complex64::from_polar(1.0, 0.7));
        for space in [AveragingSpace::Direct, AveragingSpace::Reciprocal] {
            let aligner = ReconstructionAligner::new(space, 10);
            let (sum, accepted) = aligner
                .merge(&reference, reference.clone(), &candidate, 0.95)
                .unwrap();
            assert!(accepted, "{space:?}");
            for (s, r) in sum.iter().zip(reference.iter()) {
                assert!((s - r * 2.0).norm() < 1e-6);
            }
        }
    }

    #[test]
    fn unreachable_threshold_keeps_the_reference() {
        let reference = blob(16, [8.0, 8.0, 8.0], 2.0);
        let candidate = blob(16, [8.0, 8.0, 8.0], 4.0)
            + &blob(16, [3.0, 12.0, 5.0], 1.0).mapv(|v| v * 2.0);
        let aligner = ReconstructionAligner::new(AveragingSpace::Direct, 4);
        let (sum, accepted) = aligner
            .merge(&reference, reference.clone(), &candidate, 0.999)
            .unwrap();
        assert!(!accepted);
        assert_eq!(sum, reference);
    }
}
