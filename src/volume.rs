use std::ops::{Add, Mul};

use ndarray::{Array3, Zip};
use num_complex::Complex64;
use tracing::debug;

use crate::config::CenteringMethod;
use crate::error::{AnalysisError, Result};
use crate::utils::{roll, safe_arg, Shape3};

pub type ComplexVolume = Array3<Complex64>;

/// Modulus / phase view of a complex volume.
#[derive(Debug, Clone)]
pub struct PhaseModel {
    pub modulus: Array3<f64>,
    pub phase: Array3<f64>,
}

impl PhaseModel {
    /// Splits `data` into modulus and phase, phase in (-pi, pi].
    pub fn from_complex(data: &ComplexVolume) -> Self {
        Self {
            modulus: data.mapv(|v| v.norm()),
            phase: data.map(safe_arg),
        }
    }

    pub fn to_complex(&self) -> Result<ComplexVolume> {
        compose(&self.modulus, &self.phase)
    }

    pub fn shape(&self) -> Shape3 {
        let (nz, ny, nx) = self.modulus.dim();
        [nz, ny, nx]
    }
}

pub fn compose(modulus: &Array3<f64>, phase: &Array3<f64>) -> Result<ComplexVolume> {
    if modulus.dim() != phase.dim() {
        return Err(AnalysisError::invalid(format!(
            "modulus shape {:?} and phase shape {:?} differ",
            modulus.shape(),
            phase.shape()
        )));
    }
    let mut out = ComplexVolume::zeros(modulus.dim());
    Zip::from(&mut out)
        .and(modulus)
        .and(phase)
        .for_each(|o, &m, &p| *o = Complex64::from_polar(m, p));
    Ok(out)
}

pub fn shape_of<A>(array: &Array3<A>) -> Shape3 {
    let (nz, ny, nx) = array.dim();
    [nz, ny, nx]
}

/// Centered crop and/or zero pad to `output_shape`, independently per axis.
pub fn crop_pad<A: Clone + Default>(array: &Array3<A>, output_shape: Shape3) -> Array3<A> {
    let input = shape_of(array);
    let start: [isize; 3] =
        std::array::from_fn(|a| (input[a] / 2) as isize - (output_shape[a] / 2) as isize);
    Array3::from_shape_fn(
        (output_shape[0], output_shape[1], output_shape[2]),
        |(z, y, x)| {
            let src = [
                z as isize + start[0],
                y as isize + start[1],
                x as isize + start[2],
            ];
            let inside = src
                .iter()
                .zip(input.iter())
                .all(|(&i, &n)| i >= 0 && (i as usize) < n);
            if inside {
                array[[src[0] as usize, src[1] as usize, src[2] as usize]].clone()
            } else {
                A::default()
            }
        },
    )
}

/// Shape of the phasing grid: configured detector size divided by the binning.
pub fn phasing_shape(size: Shape3, binning: [usize; 3]) -> Result<Shape3> {
    if binning.iter().any(|&b| b == 0) {
        return Err(AnalysisError::invalid(format!(
            "binning factors must be positive, got {binning:?}"
        )));
    }
    Ok([size[0] / binning[0], size[1] / binning[1], size[2] / binning[2]])
}

pub fn max_modulus(data: &ComplexVolume) -> f64 {
    data.iter().fold(0.0_f64, |acc, v| acc.max(v.norm()))
}

/// `true` where `modulus > fraction * max(modulus)`.
pub fn support_mask(modulus: &Array3<f64>, fraction: f64) -> Array3<bool> {
    let max = modulus.iter().cloned().fold(0.0_f64, f64::max);
    let level = fraction * max;
    modulus.mapv(|m| m > level)
}

/// Smallest shape, symmetric about the array center, that still holds every
/// voxel above `threshold * max`, grown by `margin` on each side.
pub fn find_data_range(
    data: &ComplexVolume,
    threshold: f64,
    margin: [usize; 3],
    keep_size: bool,
) -> Result<Shape3> {
    let shape = shape_of(data);
    if keep_size {
        return Ok(shape);
    }
    let support = support_mask(&data.mapv(|v| v.norm()), threshold);

    let mut first = [usize::MAX; 3];
    let mut last = [0usize; 3];
    let mut any = false;
    for ((z, y, x), &inside) in support.indexed_iter() {
        if !inside {
            continue;
        }
        any = true;
        for (axis, index) in [z, y, x].into_iter().enumerate() {
            first[axis] = first[axis].min(index);
            last[axis] = last[axis].max(index);
        }
    }
    if !any {
        return Err(AnalysisError::degenerate(format!(
            "no voxel above {threshold} of the maximum modulus"
        )));
    }

    let range = std::array::from_fn(|axis| {
        let n = shape[axis] as isize;
        let distance = (first[axis] as isize).min(n - last[axis] as isize);
        let margin = margin[axis] as isize;
        let wanted = 2 * (n / 2 - distance + margin);
        wanted.clamp(1, n + 2 * margin) as usize
    });
    debug!("data range {:?} for shape {:?}", range, shape);
    Ok(range)
}

/// Modulus-weighted center of mass in array order, `None` for zero weight.
pub fn center_of_mass(weights: &Array3<f64>) -> Option<[f64; 3]> {
    let mut total = 0.0;
    let mut acc = [0.0; 3];
    for ((z, y, x), &w) in weights.indexed_iter() {
        total += w;
        acc[0] += w * z as f64;
        acc[1] += w * y as f64;
        acc[2] += w * x as f64;
    }
    if total <= 0.0 || !total.is_finite() {
        return None;
    }
    Some([acc[0] / total, acc[1] / total, acc[2] / total])
}

pub fn argmax(values: &Array3<f64>) -> Option<[usize; 3]> {
    let mut best: Option<([usize; 3], f64)> = None;
    for ((z, y, x), &v) in values.indexed_iter() {
        if best.map_or(true, |(_, b)| v > b) {
            best = Some(([z, y, x], v));
        }
    }
    best.map(|(index, _)| index)
}

fn roll_to_center(data: &ComplexVolume, position: [f64; 3]) -> ComplexVolume {
    let shape = shape_of(data);
    let shifts = std::array::from_fn(|a| (shape[a] as f64 / 2.0).floor() as isize - position[a].round() as isize);
    roll(data, shifts)
}

/// Rolls the object so that its maximum and/or modulus center of mass sits at
/// the array center.
pub fn center_object(data: &ComplexVolume, method: CenteringMethod) -> Result<ComplexVolume> {
    let by_max = |volume: &ComplexVolume| -> Result<ComplexVolume> {
        let modulus = volume.mapv(|v| v.norm());
        let peak = argmax(&modulus).ok_or_else(|| AnalysisError::degenerate("empty volume"))?;
        Ok(roll_to_center(volume, peak.map(|i| i as f64)))
    };
    let by_com = |volume: &ComplexVolume| -> Result<ComplexVolume> {
        let modulus = volume.mapv(|v| v.norm());
        let com = center_of_mass(&modulus)
            .ok_or_else(|| AnalysisError::degenerate("center of mass of a null object"))?;
        Ok(roll_to_center(volume, com))
    };
    match method {
        CenteringMethod::Skip => Ok(data.clone()),
        CenteringMethod::Max => by_max(data),
        CenteringMethod::Com => by_com(data),
        CenteringMethod::MaxCom => by_com(&by_max(data)?),
    }
}

/// Twin image: complex conjugate of the point-reflected object.
pub fn flip_reconstruction(data: &ComplexVolume) -> ComplexVolume {
    let shape = shape_of(data);
    Array3::from_shape_fn(data.dim(), |(z, y, x)| {
        let mirror = |i: usize, n: usize| (n - i) % n;
        data[[mirror(z, shape[0]), mirror(y, shape[1]), mirror(x, shape[2])]].conj()
    })
}

/// Trilinear interpolation at fractional array position `(z, y, x)`;
/// positions outside the grid give the default value.
pub fn sample_trilinear<T>(volume: &Array3<T>, position: [f64; 3]) -> T
where
    T: Copy + Default + Add<Output = T> + Mul<f64, Output = T>,
{
    const EDGE: f64 = 1e-9;
    let shape = shape_of(volume);
    let mut lower = [0usize; 3];
    let mut upper = [0usize; 3];
    let mut frac = [0.0f64; 3];
    for axis in 0..3 {
        let n = shape[axis];
        let p = position[axis];
        if n == 0 || !p.is_finite() || p < -EDGE || p > (n - 1) as f64 + EDGE {
            return T::default();
        }
        let p = p.clamp(0.0, (n - 1) as f64);
        let i0 = (p.floor() as usize).min(n - 1);
        lower[axis] = i0;
        upper[axis] = (i0 + 1).min(n - 1);
        frac[axis] = p - i0 as f64;
    }
    let mut acc = T::default();
    for corner in 0..8 {
        let mut weight = 1.0;
        let mut index = [0usize; 3];
        for axis in 0..3 {
            if corner >> (2 - axis) & 1 == 1 {
                weight *= frac[axis];
                index[axis] = upper[axis];
            } else {
                weight *= 1.0 - frac[axis];
                index[axis] = lower[axis];
            }
        }
        if weight != 0.0 {
            acc = acc + volume[index] * weight;
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::{
        center_object, crop_pad, find_data_range, flip_reconstruction, phasing_shape,
        sample_trilinear, shape_of, support_mask, ComplexVolume, PhaseModel,
    };
    use crate::config::CenteringMethod;
    use crate::error::AnalysisError;
    use ndarray::Array3;
    use num_complex::Complex64;

    fn blob(shape: (usize, usize, usize), center: [f64; 3], radius: f64) -> ComplexVolume {
        Array3::from_shape_fn(shape, |(z, y, x)| {
            let r2 = (z as f64 - center[0]).powi(2)
                + (y as f64 - center[1]).powi(2)
                + (x as f64 - center[2]).powi(2);
            Complex64::from_polar((-r2 / (2.0 * radius * radius)).exp(), 0.3)
        })
    }

    #[test]
    fn phasing_shape_divides_by_binning() {
        assert_eq!(
            phasing_shape([252, 420, 392], [2, 2, 1]).unwrap(),
            [126, 210, 392]
        );
        assert!(matches!(
            phasing_shape([10, 10, 10], [1, 0, 1]),
            Err(AnalysisError::InvalidParameter(_))
        ));
    }

    #[test]
    fn crop_then_pad_restores_shape() {
        let data = blob((12, 9, 10), [6.0, 4.0, 5.0], 2.0);
        let cropped = crop_pad(&data, [7, 5, 6]);
        assert_eq!(shape_of(&cropped), [7, 5, 6]);
        let restored = crop_pad(&cropped, shape_of(&data));
        assert_eq!(shape_of(&restored), shape_of(&data));
        // the central voxel survives the round trip
        assert_eq!(restored[[6, 4, 5]], data[[6, 4, 5]]);
    }

    #[test]
    fn pad_places_data_in_the_center_with_zeros() {
        let data = Array3::from_elem((2, 2, 2), 1.0_f64);
        let padded = crop_pad(&data, [4, 4, 4]);
        assert_eq!(padded.sum(), 8.0);
        assert_eq!(padded[[0, 0, 0]], 0.0);
        assert_eq!(padded[[1, 1, 1]], 1.0);
        assert_eq!(padded[[2, 2, 2]], 1.0);
    }

    #[test]
    fn data_range_is_symmetric_around_the_object() {
        let mut data = ComplexVolume::zeros((20, 16, 12));
        for z in 8..12 {
            for y in 5..11 {
                for x in 3..9 {
                    data[[z, y, x]] = Complex64::new(1.0, 0.0);
                }
            }
        }
        let range = find_data_range(&data, 0.05, [0, 0, 0], false).unwrap();
        assert_eq!(range, [4, 6, 6]);
        let with_margin = find_data_range(&data, 0.05, [1, 2, 0], false).unwrap();
        assert_eq!(with_margin, [6, 10, 6]);
        let kept = find_data_range(&data, 0.05, [0, 0, 0], true).unwrap();
        assert_eq!(kept, [20, 16, 12]);
    }

    #[test]
    fn data_range_of_null_object_is_degenerate() {
        let data = ComplexVolume::zeros((4, 4, 4));
        assert!(matches!(
            find_data_range(&data, 0.05, [0, 0, 0], false),
            Err(AnalysisError::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn centering_moves_the_peak_to_the_middle() {
        let data = blob((16, 16, 16), [3.0, 12.0, 5.0], 1.5);
        for method in [CenteringMethod::Max, CenteringMethod::Com, CenteringMethod::MaxCom] {
            let centered = center_object(&data, method).unwrap();
            let modulus = centered.mapv(|v| v.norm());
            assert_eq!(super::argmax(&modulus).unwrap(), [8, 8, 8], "{method:?}");
        }
        let skipped = center_object(&data, CenteringMethod::Skip).unwrap();
        assert_eq!(skipped, data);
    }

    #[test]
    fn flip_twice_is_identity() {
        let data = Array3::from_shape_fn((5, 4, 3), |(z, y, x)| {
            Complex64::new(z as f64 + 0.5 * y as f64, x as f64 - 1.0)
        });
        let flipped = flip_reconstruction(&data);
        assert_eq!(flipped[[1, 1, 1]], data[[4, 3, 2]].conj());
        assert_eq!(flip_reconstruction(&flipped), data);
    }

    #[test]
    fn trilinear_sampling_interpolates_linear_fields() {
        let field = Array3::from_shape_fn((4, 5, 6), |(z, y, x)| {
            2.0 * z as f64 - y as f64 + 0.5 * x as f64
        });
        let v: f64 = sample_trilinear(&field, [1.25, 2.5, 3.75]);
        assert!((v - (2.5 - 2.5 + 1.875)).abs() < 1e-12);
        let outside: f64 = sample_trilinear(&field, [-0.5, 1.0, 1.0]);
        assert_eq!(outside, 0.0);
        let edge: f64 = sample_trilinear(&field, [3.0, 4.0, 5.0]);
        assert!((edge - (6.0 - 4.0 + 2.5)).abs() < 1e-12);
    }

    #[test]
    fn phase_model_roundtrip() {
        let data = blob((4, 4, 4), [2.0, 2.0, 2.0], 1.0);
        let model = PhaseModel::from_complex(&data);
        assert!(model.modulus.iter().all(|&m| m >= 0.0));
        let back = model.to_complex().unwrap();
        for (a, b) in data.iter().zip(back.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
        let mask = support_mask(&model.modulus, 0.5);
        assert!(mask[[2, 2, 2]]);
        assert!(!mask[[0, 0, 0]]);
    }
}
