use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;

use ndarray::{Array3, Axis, Zip};
use tracing::{debug, info, warn};

use crate::config::{ApodizationWindow, OffsetMethod, PostprocessingConfig};
use crate::error::{AnalysisError, Result};
use crate::plot::plot_central_slices;
use crate::utils::{
    blackman_window, fftshift, hanning_window, ifftshift, separable_window, tukey_window, wrap,
    wrap_to_pi, FftHelper, Shape3,
};
use crate::volume::{center_of_mass, compose, crop_pad, shape_of, support_mask, ComplexVolume, PhaseModel};

/// State produced by one pipeline step and consumed by a later one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prerequisite<T> {
    Unset,
    Ready(T),
}

impl<T: Copy> Prerequisite<T> {
    pub fn require(&self, producer: &str) -> Result<T> {
        match self {
            Prerequisite::Ready(value) => Ok(*value),
            Prerequisite::Unset => Err(AnalysisError::precondition(format!(
                "{producer} must run first"
            ))),
        }
    }

    pub fn get(&self) -> Option<T> {
        match self {
            Prerequisite::Ready(value) => Some(*value),
            Prerequisite::Unset => None,
        }
    }
}

/// Settings of the phase pipeline, copied out of the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseParameters {
    pub isosurface_strain: f64,
    pub threshold_unwrap_refraction: f64,
    pub threshold_gradient: f64,
    pub offset_method: OffsetMethod,
    pub phase_offset: f64,
    pub phase_offset_origin: Option<[usize; 3]>,
    pub half_width_avg_phase: usize,
    pub apodization_window: ApodizationWindow,
    pub apodization_mu: [f64; 3],
    pub apodization_sigma: [f64; 3],
    pub apodization_alpha: [f64; 3],
}

impl PhaseParameters {
    pub fn from_config(config: &PostprocessingConfig) -> Self {
        Self {
            isosurface_strain: config.isosurface_strain,
            threshold_unwrap_refraction: config.threshold_unwrap_refraction,
            threshold_gradient: config.threshold_gradient,
            offset_method: config.offset_method,
            phase_offset: config.phase_offset,
            phase_offset_origin: config.phase_offset_origin,
            half_width_avg_phase: config.half_width_avg_phase,
            apodization_window: config.apodization_window,
            apodization_mu: config.apodization_mu,
            apodization_sigma: config.apodization_sigma,
            apodization_alpha: config.apodization_alpha,
        }
    }
}

impl Default for PhaseParameters {
    fn default() -> Self {
        Self::from_config(&PostprocessingConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    reliability: f64,
    index: usize,
    parent: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.reliability
            .total_cmp(&other.reliability)
            .then_with(|| other.index.cmp(&self.index))
    }
}

fn neighbours(index: usize, shape: Shape3) -> impl Iterator<Item = usize> {
    let [_, ny, nx] = shape;
    let x = index % nx;
    let y = (index / nx) % ny;
    let z = index / (nx * ny);
    let plane = nx * ny;
    [
        (z > 0).then(|| index - plane),
        (z + 1 < shape[0]).then(|| index + plane),
        (y > 0).then(|| index - nx),
        (y + 1 < ny).then(|| index + nx),
        (x > 0).then(|| index - 1),
        (x + 1 < nx).then(|| index + 1),
    ]
    .into_iter()
    .flatten()
}

/// 1 / (1 + D), D the root-sum-square of the wrapped second differences.
fn reliability_map(phase: &[f64], shape: Shape3) -> Vec<f64> {
    let strides = [shape[1] * shape[2], shape[2], 1];
    let coords = |index: usize| [index / strides[0], (index / strides[1]) % shape[1], index % shape[2]];
    (0..phase.len())
        .map(|index| {
            let c = coords(index);
            let mut d2 = 0.0;
            for axis in 0..3 {
                if c[axis] == 0 || c[axis] + 1 >= shape[axis] {
                    continue;
                }
                let before = phase[index - strides[axis]];
                let after = phase[index + strides[axis]];
                let here = phase[index];
                let second = wrap_to_pi(before - here) - wrap_to_pi(here - after);
                d2 += second * second;
            }
            1.0 / (1.0 + d2.sqrt())
        })
        .collect()
}

/// Quality-guided unwrapping restricted to `support`; zero outside it.
pub fn unwrap_quality_guided(phase: &Array3<f64>, support: &Array3<bool>) -> Result<Array3<f64>> {
    if phase.dim() != support.dim() {
        return Err(AnalysisError::invalid(format!(
            "support of shape {:?} does not match the phase of shape {:?}",
            support.dim(),
            phase.dim()
        )));
    }
    let shape = shape_of(phase);
    let wrapped: Vec<f64> = phase.iter().cloned().collect();
    let inside: Vec<bool> = support.iter().cloned().collect();
    let reliability = reliability_map(&wrapped, shape);

    let mut seeds: Vec<usize> = (0..wrapped.len()).filter(|&i| inside[i]).collect();
    seeds.sort_by(|&a, &b| reliability[b].total_cmp(&reliability[a]).then(a.cmp(&b)));

    let mut unwrapped = vec![0.0; wrapped.len()];
    let mut done = vec![false; wrapped.len()];
    let mut heap = BinaryHeap::new();
    for seed in seeds {
        if done[seed] {
            continue;
        }
        done[seed] = true;
        unwrapped[seed] = wrapped[seed];
        let push = |heap: &mut BinaryHeap<Candidate>, done: &[bool], from: usize| {
            for next in neighbours(from, shape) {
                if inside[next] && !done[next] {
                    heap.push(Candidate {
                        reliability: reliability[next],
                        index: next,
                        parent: from,
                    });
                }
            }
        };
        push(&mut heap, &done, seed);
        while let Some(candidate) = heap.pop() {
            if done[candidate.index] {
                continue;
            }
            done[candidate.index] = true;
            let step = wrap_to_pi(wrapped[candidate.index] - wrapped[candidate.parent]);
            unwrapped[candidate.index] = unwrapped[candidate.parent] + step;
            push(&mut heap, &done, candidate.index);
        }
    }
    Ok(Array3::from_shape_vec(phase.raw_dim(), unwrapped)?)
}

/// numpy-style gradient along `axis`: central differences, one-sided at the edges.
pub fn gradient(values: &Array3<f64>, axis: usize) -> Array3<f64> {
    let mut out = Array3::<f64>::zeros(values.dim());
    Zip::from(out.lanes_mut(Axis(axis)))
        .and(values.lanes(Axis(axis)))
        .for_each(|mut dst, src| {
            let n = src.len();
            if n < 2 {
                return;
            }
            dst[0] = src[1] - src[0];
            dst[n - 1] = src[n - 1] - src[n - 2];
            for i in 1..n - 1 {
                dst[i] = (src[i + 1] - src[i - 1]) / 2.0;
            }
        });
    out
}

fn linear_ramp(shape: (usize, usize, usize), ramp: [f64; 3]) -> Array3<f64> {
    Array3::from_shape_fn(shape, |(z, y, x)| {
        z as f64 * ramp[0] + y as f64 * ramp[1] + x as f64 * ramp[2]
    })
}

fn normal_window(shape: Shape3, mu: [f64; 3], sigma: [f64; 3]) -> Array3<f64> {
    let axis = |n: usize, m: f64, s: f64| -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = if n > 1 { -1.0 + 2.0 * i as f64 / (n - 1) as f64 } else { 0.0 };
                (-(t - m).powi(2) / (2.0 * s * s)).exp()
            })
            .collect()
    };
    let window = separable_window(
        &axis(shape[0], mu[0], sigma[0]),
        &axis(shape[1], mu[1], sigma[1]),
        &axis(shape[2], mu[2], sigma[2]),
    );
    let max = window.iter().cloned().fold(0.0_f64, f64::max);
    if max > 0.0 {
        window.mapv(|w| w / max)
    } else {
        window
    }
}

/// Owns the modulus and phase of the object and applies the cleanup steps.
#[derive(Debug, Clone)]
pub struct PhaseManipulator {
    modulus: Array3<f64>,
    phase: Array3<f64>,
    original_shape: Shape3,
    params: PhaseParameters,
    save_directory: Option<PathBuf>,
    extent_phase: Prerequisite<f64>,
    phase_ramp: Prerequisite<[f64; 3]>,
}

impl PhaseManipulator {
    pub fn new(
        data: ComplexVolume,
        params: PhaseParameters,
        original_shape: Shape3,
        save_directory: Option<PathBuf>,
    ) -> Self {
        let PhaseModel { modulus, phase } = PhaseModel::from_complex(&data);
        Self {
            modulus,
            phase,
            original_shape,
            params,
            save_directory,
            extent_phase: Prerequisite::Unset,
            phase_ramp: Prerequisite::Unset,
        }
    }

    pub fn modulus(&self) -> &Array3<f64> {
        &self.modulus
    }

    pub fn phase(&self) -> &Array3<f64> {
        &self.phase
    }

    pub fn extent_phase(&self) -> Option<f64> {
        self.extent_phase.get()
    }

    pub fn phase_ramp(&self) -> Option<[f64; 3]> {
        self.phase_ramp.get()
    }

    pub fn original_shape(&self) -> Shape3 {
        self.original_shape
    }

    pub fn params(&self) -> &PhaseParameters {
        &self.params
    }

    pub fn into_parts(self) -> (Array3<f64>, Array3<f64>) {
        (self.modulus, self.phase)
    }

    fn strain_support(&self, step: &str) -> Result<Array3<bool>> {
        let support = support_mask(&self.modulus, self.params.isosurface_strain);
        if !support.iter().any(|&s| s) {
            return Err(AnalysisError::precondition(format!(
                "{step}: empty support at isosurface {}",
                self.params.isosurface_strain
            )));
        }
        Ok(support)
    }

    pub fn unwrap_phase(&mut self) -> Result<()> {
        let support = support_mask(&self.modulus, self.params.threshold_unwrap_refraction);
        self.phase = unwrap_quality_guided(&self.phase, &support)?;
        let max = self.phase.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = self.phase.iter().cloned().fold(f64::INFINITY, f64::min);
        let extent = (max - min).ceil();
        self.extent_phase = Prerequisite::Ready(extent);
        info!("extent of the unwrapped phase: {} rad", extent);
        Ok(())
    }

    pub fn remove_ramp(&mut self) -> Result<()> {
        let support = self.strain_support("remove_ramp")?;
        let mut ramp = [0.0; 3];
        for (axis, value) in ramp.iter_mut().enumerate() {
            let grad = gradient(&self.phase, axis);
            let mut sum = 0.0;
            let mut count = 0usize;
            Zip::from(&grad).and(&support).for_each(|&g, &inside| {
                if inside && g.abs() < self.params.threshold_gradient {
                    sum += g;
                    count += 1;
                }
            });
            if count == 0 {
                warn!(
                    "no gradient below {} along axis {}, ramp set to 0",
                    self.params.threshold_gradient, axis
                );
            } else {
                *value = sum / count as f64;
            }
        }
        self.phase = &self.phase - &linear_ramp(self.phase.dim(), ramp);
        self.phase_ramp = Prerequisite::Ready(ramp);
        info!("removed phase ramp {:?} rad/voxel", ramp);
        Ok(())
    }

    pub fn remove_offset(&mut self) -> Result<()> {
        let support = self.strain_support("remove_offset")?;
        let offset = match self.params.phase_offset_origin {
            Some(origin) => {
                let [nz, ny, nx] = shape_of(&self.phase);
                if origin[0] >= nz || origin[1] >= ny || origin[2] >= nx {
                    return Err(AnalysisError::invalid(format!(
                        "phase_offset_origin {origin:?} outside the array {:?}",
                        self.phase.shape()
                    )));
                }
                self.phase[origin]
            }
            None => match self.params.offset_method {
                OffsetMethod::Mean => {
                    let mut sum = 0.0;
                    let mut count = 0usize;
                    Zip::from(&self.phase).and(&support).for_each(|&p, &inside| {
                        if inside {
                            sum += p;
                            count += 1;
                        }
                    });
                    sum / count as f64
                }
                OffsetMethod::Com => {
                    let weights = support.mapv(|s| if s { 1.0 } else { 0.0 });
                    let com = center_of_mass(&weights)
                        .ok_or_else(|| AnalysisError::precondition("remove_offset: empty support"))?;
                    self.phase[[
                        com[0].round() as usize,
                        com[1].round() as usize,
                        com[2].round() as usize,
                    ]]
                }
            },
        };
        let shift = self.params.phase_offset - offset;
        Zip::from(&mut self.phase).and(&support).for_each(|p, &inside| {
            if inside {
                *p += shift;
            }
        });
        debug!("phase offset {} removed, {} added", offset, self.params.phase_offset);
        Ok(())
    }

    pub fn average_phase(&mut self) {
        let half = self.params.half_width_avg_phase;
        if half == 0 {
            return;
        }
        let support = support_mask(&self.modulus, self.params.isosurface_strain);
        let [nz, ny, nx] = shape_of(&self.phase);
        let phase = &self.phase;
        let mut averaged = phase.clone();
        Zip::indexed(&mut averaged).par_for_each(|(z, y, x), out| {
            if !support[[z, y, x]] {
                return;
            }
            let mut sum = 0.0;
            let mut count = 0usize;
            for k in z.saturating_sub(half)..(z + half + 1).min(nz) {
                for j in y.saturating_sub(half)..(y + half + 1).min(ny) {
                    for i in x.saturating_sub(half)..(x + half + 1).min(nx) {
                        if support[[k, j, i]] {
                            sum += phase[[k, j, i]];
                            count += 1;
                        }
                    }
                }
            }
            *out = sum / count as f64;
        });
        self.phase = averaged;
        debug!("phase averaged over a {}-voxel half width", half);
    }

    pub fn center_phase(&mut self) -> Result<()> {
        let extent = self.extent_phase.require("unwrap_phase")?;
        if extent <= 0.0 {
            return Ok(());
        }
        let start = -extent / 2.0;
        self.phase.mapv_inplace(|p| wrap(p, start, extent));
        Ok(())
    }

    /// Adds back `sign` times the ramp removed by `remove_ramp`.
    pub fn add_ramp(&mut self, sign: i32) -> Result<()> {
        if sign != 1 && sign != -1 {
            return Err(AnalysisError::invalid(format!(
                "ramp sign must be +1 or -1, got {sign}"
            )));
        }
        let ramp = self.phase_ramp.require("remove_ramp")?;
        let signed = ramp.map(|r| r * sign as f64);
        self.phase = &self.phase + &linear_ramp(self.phase.dim(), signed);
        Ok(())
    }

    pub fn invert_phase(&mut self) {
        self.phase.mapv_inplace(|p| -p);
    }

    fn window(&self) -> Array3<f64> {
        let shape = self.original_shape;
        let p = &self.params;
        match p.apodization_window {
            ApodizationWindow::Blackman => separable_window(
                &blackman_window(shape[0]),
                &blackman_window(shape[1]),
                &blackman_window(shape[2]),
            ),
            ApodizationWindow::Hanning => separable_window(
                &hanning_window(shape[0]),
                &hanning_window(shape[1]),
                &hanning_window(shape[2]),
            ),
            ApodizationWindow::Tukey => separable_window(
                &tukey_window(shape[0], p.apodization_alpha[0]),
                &tukey_window(shape[1], p.apodization_alpha[1]),
                &tukey_window(shape[2], p.apodization_alpha[2]),
            ),
            ApodizationWindow::Normal => normal_window(shape, p.apodization_mu, p.apodization_sigma),
        }
    }

    /// Windows the diffraction pattern of the object, keeping its total modulus.
    pub fn apodize(&mut self) -> Result<()> {
        let current_shape = shape_of(&self.phase);
        let data = compose(&self.modulus, &self.phase)?;
        let mut spectrum = crop_pad(&data, self.original_shape);
        let fft = FftHelper::new(self.original_shape);
        fft.fftn(&mut spectrum)?;
        let mut spectrum = fftshift(&spectrum);

        let before: f64 = spectrum.iter().map(|v| v.norm()).sum();
        let window = self.window();
        Zip::from(&mut spectrum).and(&window).for_each(|v, &w| *v *= w);
        let after: f64 = spectrum.iter().map(|v| v.norm()).sum();
        if after > 0.0 {
            let scale = before / after;
            spectrum.mapv_inplace(|v| v * scale);
        }

        let mut object = ifftshift(&spectrum);
        fft.ifftn(&mut object)?;
        let object: ComplexVolume = crop_pad(&object, current_shape);
        let PhaseModel { modulus, phase } = PhaseModel::from_complex(&object);
        self.modulus = modulus;
        self.phase = phase;
        info!("apodization with a {:?} window", self.params.apodization_window);
        Ok(())
    }

    /// Writes the central slices of the phase to `<save_directory>/<title>.png`
    /// when `save` is set and a directory is known.
    pub fn plot_phase(&self, title: &str, save: bool) -> Result<Option<PathBuf>> {
        match (&self.save_directory, save) {
            (Some(dir), true) => {
                let path = dir.join(format!("{title}.png"));
                plot_central_slices(&self.phase, title, &path)?;
                Ok(Some(path))
            }
            _ => Ok(None),
        }
    }

    pub fn to_complex(&self) -> Result<ComplexVolume> {
        compose(&self.modulus, &self.phase)
    }
}
