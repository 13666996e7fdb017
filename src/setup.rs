use std::f64::consts::PI;
use std::path::PathBuf;

use ndarray::{s, Array3};
use tracing::{debug, info};

use crate::config::{PeakMethod, PostprocessingConfig, RockingAngle, SetupConfig};
use crate::error::{AnalysisError, Result};
use crate::geometry::{
    invert, q_from_detector_angles, wavelength_angstrom, BraggGeometry, Matrix3, Vector3,
};
use crate::io::{extension_of, read_npz_real, read_real_volume};
use crate::utils::Shape3;
use crate::volume::{argmax, center_of_mass, shape_of};

/// Geometry of the measurement, read by the analysis workflow.
pub trait ExperimentSetup {
    /// Bragg vector (x, y, z) in the laboratory frame, 1/Angstrom.
    fn q_laboratory(&self) -> Result<Vector3>;

    fn detector_binning(&self) -> [usize; 3];

    /// (out-of-plane, in-plane) detector angles in degrees, when known.
    fn detector_angles(&self) -> (Option<f64>, Option<f64>);

    /// Recomputes the detector angles from the Bragg peak position
    /// (frame, row, column) in the diffraction stack, then refreshes q.
    fn correct_detector_angles(&mut self, peak: [f64; 3]) -> Result<()>;

    /// Matrix mapping an array-index displacement (z, y, x) of a direct-space
    /// reconstruction of `shape` to a laboratory position in array order, nm.
    fn transformation_matrix(&self, shape: Shape3) -> Result<Matrix3>;

    fn bragg(&self) -> Result<BraggGeometry> {
        Ok(BraggGeometry::new(self.q_laboratory()?))
    }

    /// Voxel sizes (nm) of the reconstruction in the detector frame.
    fn voxel_sizes_detector(&self, shape: Shape3) -> Result<[f64; 3]> {
        let t = self.transformation_matrix(shape)?;
        Ok(std::array::from_fn(|c| t.column(c).norm()))
    }
}

/// Setup described entirely by the configuration file.
#[derive(Debug, Clone)]
pub struct StaticSetup {
    params: SetupConfig,
    phasing_binning: [usize; 3],
    outofplane: Option<f64>,
    inplane: Option<f64>,
    q: Option<Vector3>,
}

impl StaticSetup {
    pub fn new(params: SetupConfig, phasing_binning: [usize; 3]) -> Self {
        Self {
            outofplane: params.outofplane_angle,
            inplane: params.inplane_angle,
            q: params.q_laboratory.map(Vector3::from),
            params,
            phasing_binning,
        }
    }

    pub fn from_config(config: &PostprocessingConfig) -> Self {
        Self::new(config.setup.clone(), config.phasing_binning)
    }

    fn angles(&self) -> Result<(f64, f64)> {
        match (self.outofplane, self.inplane) {
            (Some(delta), Some(gamma)) => Ok((delta, gamma)),
            _ => Err(AnalysisError::precondition(
                "detector angles are unknown, correct them from the Bragg peak first",
            )),
        }
    }

    fn k(&self) -> Result<f64> {
        Ok(2.0 * PI / wavelength_angstrom(self.params.energy)?)
    }

    /// Raw detector pixels per reconstruction voxel along each axis.
    fn effective_binning(&self) -> [f64; 3] {
        std::array::from_fn(|a| (self.params.detector_binning[a] * self.phasing_binning[a]) as f64)
    }

    /// Reciprocal-space step (laboratory frame) per array index, one column per axis.
    fn reciprocal_steps(&self) -> Result<Matrix3> {
        let (delta_deg, gamma_deg) = self.angles()?;
        let (delta, gamma) = (delta_deg.to_radians(), gamma_deg.to_radians());
        let k = self.k()?;
        let q = self.q_laboratory()?;
        let binning = self.effective_binning();
        let pixel_angle = self.params.pixel_size / self.params.distance;

        // detector rows run downwards, columns follow increasing gamma
        let row_dir = Vector3::new(gamma.cos() * delta.sin(), -delta.cos(), -gamma.sin() * delta.sin());
        let col_dir = Vector3::new(-gamma.sin(), 0.0, -gamma.cos());
        let axis = match self.params.rocking_angle {
            RockingAngle::Outofplane => Vector3::z(),
            RockingAngle::Inplane => Vector3::y(),
        };
        let rock = axis.cross(&q);
        let dtilt = self.params.tilt_angle.to_radians() * binning[0];
        Ok(Matrix3::from_columns(&[
            rock * dtilt,
            row_dir * (k * pixel_angle * binning[1]),
            col_dir * (k * pixel_angle * binning[2]),
        ]))
    }
}

impl ExperimentSetup for StaticSetup {
    fn q_laboratory(&self) -> Result<Vector3> {
        if let Some(q) = self.q {
            return Ok(q);
        }
        let (delta, gamma) = self.angles()?;
        q_from_detector_angles(self.params.energy, delta, gamma)
    }

    fn detector_binning(&self) -> [usize; 3] {
        self.params.detector_binning
    }

    fn detector_angles(&self) -> (Option<f64>, Option<f64>) {
        (self.outofplane, self.inplane)
    }

    fn correct_detector_angles(&mut self, peak: [f64; 3]) -> Result<()> {
        let direct_beam = self.params.direct_beam.ok_or_else(|| {
            AnalysisError::precondition("direct beam position is needed to correct detector angles")
        })?;
        let binning = self.params.detector_binning;
        let pixel_angle = self.params.pixel_size / self.params.distance;
        let row_offset = direct_beam[0] - peak[1] * binning[1] as f64;
        let col_offset = peak[2] * binning[2] as f64 - direct_beam[1];
        let delta = self.params.detector_delta + (row_offset * pixel_angle).atan().to_degrees();
        let gamma = self.params.detector_gamma + (col_offset * pixel_angle).atan().to_degrees();
        info!(
            "corrected detector angles: outofplane {:.4} deg, inplane {:.4} deg",
            delta, gamma
        );
        self.outofplane = Some(delta);
        self.inplane = Some(gamma);
        self.q = Some(q_from_detector_angles(self.params.energy, delta, gamma)?);
        Ok(())
    }

    fn transformation_matrix(&self, shape: Shape3) -> Result<Matrix3> {
        if self.q_laboratory()?.norm() < 1e-12 {
            return Err(AnalysisError::degenerate("null Bragg vector"));
        }
        let steps = self.reciprocal_steps()?;
        // direct-space basis A with A^T B = 2 pi diag(1/N)
        let dual = invert(&steps)?.transpose();
        // reverse rows: laboratory (x, y, z) to array order (z, y, x), Angstrom to nm
        let t = Matrix3::from_fn(|r, c| 2.0 * PI * dual[(2 - r, c)] / shape[c] as f64 / 10.0);
        debug!("transformation matrix {}", t);
        Ok(t)
    }
}

/// Diffraction intensity of one scan as handed to the peak search.
#[derive(Debug, Clone)]
pub struct DiffractionData {
    pub intensity: Array3<f64>,
    pub mask: Array3<bool>,
    pub monitor: Vec<f64>,
    pub frames_valid: Vec<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    /// frame indices excluded from the stack
    pub skip_frames: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Corrections {
    pub normalize_by_monitor: bool,
}

pub trait DiffractionLoader {
    fn load(
        &self,
        scan_id: u32,
        filter: &FrameFilter,
        corrections: &Corrections,
    ) -> Result<DiffractionData>;
}

/// Reads a preprocessed intensity stack from `.npy` or `.npz` (`data`, optional `mask`).
#[derive(Debug, Clone)]
pub struct NpyDiffractionLoader {
    pub path: PathBuf,
}

impl NpyDiffractionLoader {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DiffractionLoader for NpyDiffractionLoader {
    fn load(
        &self,
        scan_id: u32,
        filter: &FrameFilter,
        corrections: &Corrections,
    ) -> Result<DiffractionData> {
        let mut intensity = read_real_volume(&self.path, &["data", "intensity"])?;
        let stored_mask = if extension_of(&self.path) == "npz" {
            read_npz_real(&self.path, "mask")?
        } else {
            None
        };
        let mask = match stored_mask {
            Some(mask) if mask.dim() == intensity.dim() => mask.mapv(|m| m != 0.0),
            _ => Array3::from_elem(intensity.dim(), false),
        };
        let nz = intensity.dim().0;
        let monitor = vec![1.0; nz];
        let mut frames_valid = vec![true; nz];
        for &frame in &filter.skip_frames {
            if frame < nz {
                frames_valid[frame] = false;
                intensity.slice_mut(s![frame, .., ..]).fill(0.0);
            }
        }
        intensity.zip_mut_with(&mask, |v, &masked| {
            if masked {
                *v = 0.0;
            }
        });
        if corrections.normalize_by_monitor {
            let mean = monitor.iter().sum::<f64>() / nz.max(1) as f64;
            for (frame, &m) in monitor.iter().enumerate() {
                if m > 0.0 {
                    intensity
                        .slice_mut(s![frame, .., ..])
                        .mapv_inplace(|v| v * mean / m);
                }
            }
        }
        info!(
            "scan {}: loaded diffraction stack {:?} from {}",
            scan_id,
            intensity.shape(),
            self.path.display()
        );
        Ok(DiffractionData {
            intensity,
            mask,
            monitor,
            frames_valid,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeakSearch {
    /// (frame, row, column)
    pub position: [f64; 3],
    /// rocking angle at the peak frame, when the tilt values are known
    pub tilt_at_peak: Option<f64>,
}

pub trait PeakFinder {
    /// `roi` is `[z0, z1, y0, y1, x0, x1]`, half-open.
    fn find_peak(
        &self,
        intensity: &Array3<f64>,
        roi: Option<[usize; 6]>,
        method: PeakMethod,
        tilt_values: Option<&[f64]>,
    ) -> Result<PeakSearch>;
}

/// Maximum / center of mass peak search.
#[derive(Debug, Clone, Copy)]
pub struct MaxPeakFinder {
    /// half width of the window used by `max_com`
    pub com_half_width: usize,
}

impl Default for MaxPeakFinder {
    fn default() -> Self {
        Self { com_half_width: 5 }
    }
}

impl PeakFinder for MaxPeakFinder {
    fn find_peak(
        &self,
        intensity: &Array3<f64>,
        roi: Option<[usize; 6]>,
        method: PeakMethod,
        tilt_values: Option<&[f64]>,
    ) -> Result<PeakSearch> {
        let shape = shape_of(intensity);
        let roi = roi.unwrap_or([0, shape[0], 0, shape[1], 0, shape[2]]);
        for axis in 0..3 {
            let (lo, hi) = (roi[2 * axis], roi[2 * axis + 1]);
            if lo >= hi || hi > shape[axis] {
                return Err(AnalysisError::invalid(format!(
                    "region of interest {roi:?} does not fit the stack {shape:?}"
                )));
            }
        }
        let view = intensity.slice(s![roi[0]..roi[1], roi[2]..roi[3], roi[4]..roi[5]]);
        let local = view.mapv(|v| v.max(0.0));
        let offset = [roi[0] as f64, roi[2] as f64, roi[4] as f64];

        let local_position = match method {
            PeakMethod::Max => argmax(&local).map(|p| p.map(|i| i as f64)),
            PeakMethod::Com => center_of_mass(&local),
            PeakMethod::MaxCom => argmax(&local).and_then(|peak| {
                let local_shape = shape_of(&local);
                let lo: [usize; 3] =
                    std::array::from_fn(|a| peak[a].saturating_sub(self.com_half_width));
                let hi: [usize; 3] = std::array::from_fn(|a| {
                    (peak[a] + self.com_half_width + 1).min(local_shape[a])
                });
                let window = local
                    .slice(s![lo[0]..hi[0], lo[1]..hi[1], lo[2]..hi[2]])
                    .to_owned();
                center_of_mass(&window).map(|c| std::array::from_fn(|a| c[a] + lo[a] as f64))
            }),
        }
        .ok_or_else(|| AnalysisError::degenerate("no intensity in the region of interest"))?;

        let position: [f64; 3] = std::array::from_fn(|a| local_position[a] + offset[a]);
        let tilt_at_peak = tilt_values.and_then(|tilts| interpolate_tilt(tilts, position[0]));
        debug!("Bragg peak at {:?} ({:?})", position, method);
        Ok(PeakSearch {
            position,
            tilt_at_peak,
        })
    }
}

fn interpolate_tilt(tilts: &[f64], frame: f64) -> Option<f64> {
    if tilts.is_empty() || frame < 0.0 {
        return None;
    }
    let i0 = frame.floor() as usize;
    if i0 + 1 >= tilts.len() {
        return tilts.get(i0).copied();
    }
    let t = frame - i0 as f64;
    Some(tilts[i0] * (1.0 - t) + tilts[i0 + 1] * t)
}

#[cfg(test)]
mod tests {
    use super::{
        Corrections, DiffractionLoader, ExperimentSetup, FrameFilter, MaxPeakFinder,
        NpyDiffractionLoader, PeakFinder, StaticSetup,
    };
    use crate::config::{PeakMethod, SetupConfig};
    use crate::error::AnalysisError;
    use crate::geometry::Matrix3;
    use ndarray::Array3;
    use ndarray_npy::write_npy;
    use std::f64::consts::PI;

    fn detector_setup() -> StaticSetup {
        StaticSetup::new(
            SetupConfig {
                energy: 9000.0,
                outofplane_angle: Some(35.0),
                inplane_angle: Some(-2.0),
                distance: 1.2,
                pixel_size: 75e-6,
                direct_beam: Some([250.0, 300.0]),
                ..SetupConfig::default()
            },
            [1, 1, 1],
        )
    }

    #[test]
    fn explicit_q_overrides_angles() {
        let setup = StaticSetup::new(
            SetupConfig {
                q_laboratory: Some([-0.84449687, 2.64216636, -0.09732299]),
                ..SetupConfig::default()
            },
            [1, 1, 1],
        );
        let d = setup.bragg().unwrap().interplanar_distance().unwrap();
        assert!((d - 2.2637604819).abs() < 1e-4);
        assert_eq!(setup.detector_angles(), (None, None));
    }

    #[test]
    fn missing_angles_is_a_precondition_error() {
        let setup = StaticSetup::new(SetupConfig::default(), [1, 1, 1]);
        assert!(matches!(
            setup.q_laboratory(),
            Err(AnalysisError::Precondition(_))
        ));
    }

    #[test]
    fn transformation_matrix_is_dual_to_reciprocal_steps() {
        let setup = detector_setup();
        let shape = [40, 64, 50];
        let t = setup.transformation_matrix(shape).unwrap();
        let b = setup.reciprocal_steps().unwrap();
        // back to laboratory row order and Angstrom
        let a = Matrix3::from_fn(|r, c| t[(2 - r, c)] * 10.0);
        let product = a.transpose() * b;
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 2.0 * PI / shape[c] as f64 } else { 0.0 };
                assert!((product[(r, c)] - expected).abs() < 1e-9, "{r} {c}");
            }
        }
        let voxels = setup.voxel_sizes_detector(shape).unwrap();
        assert!(voxels.iter().all(|&v| v > 0.0 && v.is_finite()));
    }

    #[test]
    fn angle_correction_from_direct_beam() {
        let mut setup = StaticSetup::new(
            SetupConfig {
                distance: 1.0,
                pixel_size: 1e-3,
                direct_beam: Some([100.0, 100.0]),
                ..SetupConfig::default()
            },
            [1, 1, 1],
        );
        setup.correct_detector_angles([5.0, 0.0, 100.0]).unwrap();
        let (delta, gamma) = setup.detector_angles();
        assert!((delta.unwrap() - (0.1_f64).atan().to_degrees()).abs() < 1e-9);
        assert!(gamma.unwrap().abs() < 1e-12);
        assert!(setup.q_laboratory().unwrap().norm() > 0.0);
    }

    #[test]
    fn peak_methods_locate_a_symmetric_peak() {
        let intensity = Array3::from_shape_fn((20, 30, 30), |(z, y, x)| {
            let r2 = (z as f64 - 9.0).powi(2) + (y as f64 - 14.0).powi(2) + (x as f64 - 17.0).powi(2);
            (-r2 / 4.0).exp()
        });
        let finder = MaxPeakFinder::default();
        for method in [PeakMethod::Max, PeakMethod::Com, PeakMethod::MaxCom] {
            let found = finder.find_peak(&intensity, None, method, None).unwrap();
            assert!((found.position[0] - 9.0).abs() < 1e-6, "{method:?}");
            assert!((found.position[1] - 14.0).abs() < 1e-6);
            assert!((found.position[2] - 17.0).abs() < 1e-6);
        }
        let tilts: Vec<f64> = (0..20).map(|i| 10.0 + 0.5 * i as f64).collect();
        let found = finder
            .find_peak(&intensity, Some([5, 15, 0, 30, 10, 25]), PeakMethod::Max, Some(&tilts))
            .unwrap();
        assert_eq!(found.position, [9.0, 14.0, 17.0]);
        assert_eq!(found.tilt_at_peak, Some(14.5));
        assert!(finder
            .find_peak(&intensity, Some([5, 5, 0, 30, 0, 30]), PeakMethod::Max, None)
            .is_err());
    }

    #[test]
    fn npy_loader_skips_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.npy");
        write_npy(&path, &Array3::<f64>::ones((3, 4, 5))).unwrap();
        let loader = NpyDiffractionLoader::new(path);
        let data = loader
            .load(
                1,
                &FrameFilter {
                    skip_frames: vec![1],
                },
                &Corrections::default(),
            )
            .unwrap();
        assert_eq!(data.frames_valid, vec![true, false, true]);
        assert_eq!(data.intensity.sum(), 40.0);
        assert!(!data.mask.iter().any(|&m| m));
    }
}
