use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::geometry::RefAxis;
use crate::logging::LoggingConfig;

/// Frame the reconstructions are expressed in when they come out of phasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFrame {
    Detector,
    Laboratory,
    Crystal,
}

impl DataFrame {
    pub fn parse(label: &str) -> Result<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "detector" => Ok(DataFrame::Detector),
            "laboratory" => Ok(DataFrame::Laboratory),
            "crystal" => Ok(DataFrame::Crystal),
            other => Err(AnalysisError::invalid(format!(
                "unknown data frame '{other}', expected detector, laboratory or crystal"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortMethod {
    #[serde(rename = "mean_amplitude")]
    MeanAmplitude,
    #[serde(rename = "variance")]
    Variance,
    #[serde(rename = "variance/mean")]
    VarianceOverMean,
    #[serde(rename = "volume")]
    Volume,
    #[serde(rename = "entropy")]
    Entropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AveragingSpace {
    #[serde(rename = "direct", alias = "direct_space")]
    Direct,
    #[serde(rename = "reciprocal", alias = "reciprocal_space")]
    Reciprocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApodizationWindow {
    Blackman,
    Tukey,
    #[serde(alias = "hann")]
    Hanning,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetMethod {
    Mean,
    Com,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CenteringMethod {
    Com,
    Max,
    MaxCom,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakMethod {
    Max,
    Com,
    MaxCom,
}

/// Sample rotation used for the rocking curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RockingAngle {
    /// rotation about the outboard axis
    Outofplane,
    /// rotation about the vertical axis
    Inplane,
}

/// Voxel size in nm, either isotropic or per axis (z, y, x).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VoxelSize {
    Isotropic(f64),
    PerAxis([f64; 3]),
}

impl VoxelSize {
    pub fn to_array(self) -> [f64; 3] {
        match self {
            VoxelSize::Isotropic(v) => [v; 3],
            VoxelSize::PerAxis(v) => v,
        }
    }
}

/// Reconstructions of one scan, a single path or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileList {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl FileList {
    pub fn to_vec(&self) -> Vec<PathBuf> {
        match self {
            FileList::One(p) => vec![p.clone()],
            FileList::Many(v) => v.clone(),
        }
    }
}

/// Static description of the diffractometer for one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// X-ray energy in eV
    pub energy: f64,
    /// detector out-of-plane angle (delta) in degrees
    pub outofplane_angle: Option<f64>,
    /// detector in-plane angle (gamma) in degrees
    pub inplane_angle: Option<f64>,
    /// detector arm positions used when the angles are recomputed from the peak
    pub detector_delta: f64,
    pub detector_gamma: f64,
    /// explicit Bragg vector (x, y, z) in 1/Angstrom, skips the angle calculation
    pub q_laboratory: Option<[f64; 3]>,
    pub detector_binning: [usize; 3],
    /// pixel size in m
    pub pixel_size: f64,
    /// sample-detector distance in m
    pub distance: f64,
    /// direct beam position (row, column) in unbinned pixels
    pub direct_beam: Option<[f64; 2]>,
    /// rocking step in degrees
    pub tilt_angle: f64,
    pub rocking_angle: RockingAngle,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            energy: 9000.0,
            outofplane_angle: None,
            inplane_angle: None,
            detector_delta: 0.0,
            detector_gamma: 0.0,
            q_laboratory: None,
            detector_binning: [1, 1, 1],
            pixel_size: 55e-6,
            distance: 1.0,
            direct_beam: None,
            tilt_angle: 0.01,
            rocking_angle: RockingAngle::Outofplane,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessingConfig {
    pub scans: Vec<u32>,
    pub reconstruction_files: Vec<FileList>,
    pub save_dir: Option<PathBuf>,
    pub comment: String,

    pub data_frame: DataFrame,
    pub interpolation_method: String,
    pub original_size: Option<[usize; 3]>,
    pub phasing_binning: [usize; 3],
    pub fix_voxel: Option<VoxelSize>,
    pub ref_axis_q: RefAxis,

    pub isosurface_strain: f64,
    pub sort_method: SortMethod,
    pub correlation_threshold: f64,
    pub averaging_space: AveragingSpace,
    pub upsample_factor: usize,

    pub apodize: bool,
    pub apodization_window: ApodizationWindow,
    pub apodization_mu: [f64; 3],
    pub apodization_sigma: [f64; 3],
    pub apodization_alpha: [f64; 3],

    pub threshold_unwrap_refraction: f64,
    pub threshold_gradient: f64,
    pub offset_method: OffsetMethod,
    pub phase_offset: f64,
    pub phase_offset_origin: Option<[usize; 3]>,
    pub half_width_avg_phase: usize,

    pub keep_size: bool,
    pub centering_method: CenteringMethod,
    pub roll_modes: [isize; 3],
    pub flip_reconstruction: bool,
    pub invert_phase: bool,
    pub skip_unwrap: bool,

    pub bragg_peak: Option<[f64; 3]>,
    pub q_values_file: Option<PathBuf>,
    pub diffraction_file: Option<PathBuf>,
    pub peak_method: PeakMethod,

    pub data_range_threshold: f64,
    pub plot_margin: [usize; 3],

    pub save_rawdata: bool,
    pub save_support: bool,
    pub debug: bool,

    pub setup: SetupConfig,
    pub logging: LoggingConfig,
}

impl Default for PostprocessingConfig {
    fn default() -> Self {
        Self {
            scans: Vec::new(),
            reconstruction_files: Vec::new(),
            save_dir: None,
            comment: String::new(),
            data_frame: DataFrame::Detector,
            interpolation_method: "linearization".to_string(),
            original_size: None,
            phasing_binning: [1, 1, 1],
            fix_voxel: None,
            ref_axis_q: RefAxis::Y,
            isosurface_strain: 0.2,
            sort_method: SortMethod::VarianceOverMean,
            correlation_threshold: 0.9,
            averaging_space: AveragingSpace::Reciprocal,
            upsample_factor: 20,
            apodize: false,
            apodization_window: ApodizationWindow::Blackman,
            apodization_mu: [0.0; 3],
            apodization_sigma: [0.30; 3],
            apodization_alpha: [1.0; 3],
            threshold_unwrap_refraction: 0.05,
            threshold_gradient: 1.0,
            offset_method: OffsetMethod::Mean,
            phase_offset: 0.0,
            phase_offset_origin: None,
            half_width_avg_phase: 0,
            keep_size: false,
            centering_method: CenteringMethod::MaxCom,
            roll_modes: [0, 0, 0],
            flip_reconstruction: false,
            invert_phase: true,
            skip_unwrap: false,
            bragg_peak: None,
            q_values_file: None,
            diffraction_file: None,
            peak_method: PeakMethod::MaxCom,
            data_range_threshold: 0.05,
            plot_margin: [0, 0, 0],
            save_rawdata: false,
            save_support: false,
            debug: false,
            setup: SetupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(AnalysisError::invalid(format!(
            "{name} must lie in [0, 1], got {value}"
        )));
    }
    Ok(())
}

impl PostprocessingConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        check_unit_interval("isosurface_strain", self.isosurface_strain)?;
        check_unit_interval("correlation_threshold", self.correlation_threshold)?;
        check_unit_interval(
            "threshold_unwrap_refraction",
            self.threshold_unwrap_refraction,
        )?;
        check_unit_interval("data_range_threshold", self.data_range_threshold)?;
        if let Some(voxel) = self.fix_voxel {
            let voxel = voxel.to_array();
            if voxel.iter().any(|&v| !(v > 0.0)) {
                return Err(AnalysisError::invalid(format!(
                    "fix_voxel entries must be strictly positive, got {voxel:?}"
                )));
            }
        }
        if self.phasing_binning.iter().any(|&b| b == 0)
            || self.setup.detector_binning.iter().any(|&b| b == 0)
        {
            return Err(AnalysisError::invalid("binning factors must be positive"));
        }
        if self.upsample_factor == 0 {
            return Err(AnalysisError::invalid("upsample_factor must be at least 1"));
        }
        if self.apodization_window == ApodizationWindow::Normal
            && self.apodization_sigma.iter().any(|&s| !(s > 0.0))
        {
            return Err(AnalysisError::invalid(format!(
                "apodization_sigma must be strictly positive, got {:?}",
                self.apodization_sigma
            )));
        }
        if !(self.setup.energy > 0.0) || !(self.setup.distance > 0.0) || !(self.setup.pixel_size > 0.0)
        {
            return Err(AnalysisError::invalid(
                "energy, detector distance and pixel size must be positive",
            ));
        }
        Ok(())
    }

    /// Candidate reconstructions of the scan at `scan_index`.
    pub fn files_for_scan(&self, scan_index: usize) -> Option<Vec<PathBuf>> {
        self.reconstruction_files
            .get(scan_index)
            .map(FileList::to_vec)
            .filter(|files| !files.is_empty())
    }

    pub fn scan_id(&self, scan_index: usize) -> u32 {
        self.scans
            .get(scan_index)
            .copied()
            .unwrap_or(scan_index as u32)
    }
}
