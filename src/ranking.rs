use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::SortMethod;
use crate::error::Result;
use crate::io::VolumeLoader;
use crate::utils::Shape3;
use crate::volume::crop_pad;

const ENTROPY_BINS: usize = 100;

/// Quality statistics of one reconstruction, computed on its normalized
/// modulus inside the support.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    pub mean_amplitude: f64,
    pub variance: f64,
    pub volume: usize,
    pub entropy: f64,
}

impl QualityMetrics {
    pub fn from_modulus<'a, I>(modulus: I, threshold: f64) -> Option<Self>
    where
        I: IntoIterator<Item = &'a f64> + Clone,
    {
        let max = modulus.clone().into_iter().cloned().fold(0.0_f64, f64::max);
        if !(max > 0.0) {
            return None;
        }
        let support: Vec<f64> = modulus
            .into_iter()
            .map(|m| m / max)
            .filter(|&m| m > threshold)
            .collect();
        if support.is_empty() {
            return None;
        }
        let n = support.len() as f64;
        let mean = support.iter().sum::<f64>() / n;
        let variance = support.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;

        let mut histogram = [0usize; ENTROPY_BINS];
        for &m in &support {
            let bin = ((m * ENTROPY_BINS as f64) as usize).min(ENTROPY_BINS - 1);
            histogram[bin] += 1;
        }
        let entropy = -histogram
            .iter()
            .filter(|&&count| count > 0)
            .map(|&count| {
                let p = count as f64 / n;
                p * p.ln()
            })
            .sum::<f64>();

        Some(Self {
            mean_amplitude: mean,
            variance,
            volume: support.len(),
            entropy,
        })
    }

    /// Sort key, lower is better.
    pub fn key(&self, method: SortMethod) -> f64 {
        match method {
            SortMethod::MeanAmplitude => -self.mean_amplitude,
            SortMethod::Variance => self.variance,
            SortMethod::VarianceOverMean => self.variance / self.mean_amplitude,
            SortMethod::Volume => -(self.volume as f64),
            SortMethod::Entropy => self.entropy,
        }
    }
}

/// Orders sort keys best first; equal keys keep the lower index first.
pub fn order_by_key(keys: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]).then(a.cmp(&b)));
    order
}

/// Ranks candidate reconstructions best first. A single candidate is not loaded.
pub fn rank_reconstructions(
    loader: &(dyn VolumeLoader + Sync),
    file_paths: &[PathBuf],
    amplitude_threshold: f64,
    target_shape: Shape3,
    method: SortMethod,
) -> Result<Vec<usize>> {
    if file_paths.len() <= 1 {
        return Ok((0..file_paths.len()).collect());
    }
    let keys = file_paths
        .par_iter()
        .map(|path| -> Result<f64> {
            let (volume, _) = loader.load_volume(path)?;
            let cropped = crop_pad(&volume, target_shape);
            let modulus = cropped.mapv(|v| v.norm());
            let key = QualityMetrics::from_modulus(modulus.iter(), amplitude_threshold)
                .map(|metrics| metrics.key(method))
                .filter(|k| !k.is_nan())
                .unwrap_or(f64::INFINITY);
            debug!("{}: sort key {:.6e}", path.display(), key);
            Ok(key)
        })
        .collect::<Result<Vec<f64>>>()?;
    let order = order_by_key(&keys);
    info!("reconstruction ranking ({:?}): {:?}", method, order);
    Ok(order)
}
