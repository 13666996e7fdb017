use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{CenteringMethod, DataFrame, PostprocessingConfig};
use crate::error::{AnalysisError, Result};
use crate::frame::{AnalysisType, FrameTransform};
use crate::geometry::Matrix3;
use crate::io::{
    save_complex, save_modulus_phase, save_support, save_to_vti, NumpyLoader, PathResolver,
    StaticPaths, VolumeLoader,
};
use crate::phase::{PhaseManipulator, PhaseParameters};
use crate::ranking::rank_reconstructions;
use crate::registration::ReconstructionAligner;
use crate::setup::{
    Corrections, DiffractionLoader, ExperimentSetup, FrameFilter, MaxPeakFinder,
    NpyDiffractionLoader, PeakFinder, StaticSetup,
};
use crate::utils::{roll, Shape3};
use crate::volume::{
    center_object, compose, crop_pad, find_data_range, flip_reconstruction, phasing_shape,
    shape_of, ComplexVolume,
};

/// Label appended to output file names, one `_token` at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comment {
    text: String,
}

impl Comment {
    pub fn new(initial: &str) -> Self {
        let trimmed = initial.trim_start_matches('_');
        if trimmed.is_empty() {
            Self::default()
        } else {
            Self {
                text: format!("_{trimmed}"),
            }
        }
    }

    pub fn concatenate(&mut self, token: &str) {
        self.text.push('_');
        self.text.push_str(token);
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// External collaborators of the workflow.
pub struct Collaborators {
    pub setup: Box<dyn ExperimentSetup>,
    pub loader: Box<dyn VolumeLoader + Sync>,
    pub resolver: Box<dyn PathResolver>,
    pub diffraction_loader: Option<Box<dyn DiffractionLoader>>,
    pub peak_finder: Box<dyn PeakFinder>,
}

impl Collaborators {
    /// Non-interactive collaborators built from the configuration alone.
    pub fn from_config(config: &PostprocessingConfig) -> Self {
        Self {
            setup: Box::new(StaticSetup::from_config(config)),
            loader: Box::new(NumpyLoader),
            resolver: Box::new(StaticPaths::default()),
            diffraction_loader: config
                .diffraction_file
                .clone()
                .map(|path| Box::new(NpyDiffractionLoader::new(path)) as Box<dyn DiffractionLoader>),
            peak_finder: Box::new(MaxPeakFinder::default()),
        }
    }
}

/// What one `run` produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scan_id: u32,
    pub candidate_count: usize,
    pub accepted_count: usize,
    pub averaged_files: Vec<PathBuf>,
    pub voxel_sizes: [f64; 3],
    pub is_orthogonal: bool,
    pub transfer_matrix: Option<Matrix3>,
    pub files_written: Vec<PathBuf>,
    pub comment: String,
}

/// Post-processing of the reconstructions of one scan.
pub struct Analysis<'a> {
    config: &'a PostprocessingConfig,
    scan_id: u32,
    setup: Box<dyn ExperimentSetup>,
    loader: Box<dyn VolumeLoader + Sync>,
    diffraction_loader: Option<Box<dyn DiffractionLoader>>,
    peak_finder: Box<dyn PeakFinder>,
    frame: FrameTransform,
    file_paths: Vec<PathBuf>,
    data: Option<ComplexVolume>,
    extension: String,
    original_shape: Shape3,
    optimized_range: Shape3,
    sorted_indices: Vec<usize>,
    averaged_files: Vec<PathBuf>,
    accepted_count: usize,
    bragg_peak: Option<[f64; 3]>,
    comment: Comment,
    voxel_sizes: Option<[f64; 3]>,
    transfer_matrix: Option<Matrix3>,
    is_orthogonal: bool,
}

/// Resolves the files of scan `scan_index`, loads the first one and picks the
/// frame workflow. Unsupported frame / method combinations fail here.
pub fn create_analysis<'a>(
    config: &'a PostprocessingConfig,
    scan_index: usize,
    collaborators: Collaborators,
) -> Result<Analysis<'a>> {
    let frame = FrameTransform::from_config(config)?;
    let Collaborators {
        setup,
        loader,
        resolver,
        diffraction_loader,
        peak_finder,
    } = collaborators;

    let file_paths = resolver.resolve(config.files_for_scan(scan_index).as_deref())?;
    let (data, extension) = loader.load_volume(&file_paths[0])?;
    let shape = shape_of(&data);

    let size = config.original_size.unwrap_or(shape);
    info!("FFT size before accounting for phasing_binning: {:?}", size);
    let original_shape = phasing_shape(size, config.phasing_binning)?;
    info!("binning used during phasing: {:?}", config.phasing_binning);
    info!("original data shape during phasing: {:?}", original_shape);

    let mut comment = Comment::new(&config.comment);
    if extension == "h5" {
        comment.concatenate("mode");
    }
    let scan_id = config.scan_id(scan_index);
    info!(
        "scan {}: {} candidate reconstruction(s), {:?} workflow",
        scan_id,
        file_paths.len(),
        frame.analysis_type()
    );

    Ok(Analysis {
        config,
        scan_id,
        setup,
        loader,
        diffraction_loader,
        peak_finder,
        frame,
        sorted_indices: (0..file_paths.len()).collect(),
        file_paths,
        data: Some(data),
        extension,
        original_shape,
        optimized_range: shape,
        averaged_files: Vec::new(),
        accepted_count: 0,
        bragg_peak: config.bragg_peak,
        comment,
        voxel_sizes: None,
        transfer_matrix: None,
        is_orthogonal: false,
    })
}

impl<'a> Analysis<'a> {
    pub fn analysis_type(&self) -> AnalysisType {
        self.frame.analysis_type()
    }

    pub fn scan_id(&self) -> u32 {
        self.scan_id
    }

    pub fn file_paths(&self) -> &[PathBuf] {
        &self.file_paths
    }

    pub fn original_shape(&self) -> Shape3 {
        self.original_shape
    }

    pub fn optimized_range(&self) -> Shape3 {
        self.optimized_range
    }

    pub fn sorted_indices(&self) -> &[usize] {
        &self.sorted_indices
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted_count
    }

    pub fn averaged_files(&self) -> &[PathBuf] {
        &self.averaged_files
    }

    pub fn bragg_peak(&self) -> Option<[f64; 3]> {
        self.bragg_peak
    }

    pub fn comment(&self) -> &Comment {
        &self.comment
    }

    pub fn voxel_sizes(&self) -> Option<[f64; 3]> {
        self.voxel_sizes
    }

    pub fn is_orthogonal(&self) -> bool {
        self.is_orthogonal
    }

    pub fn transfer_matrix(&self) -> Option<Matrix3> {
        self.transfer_matrix
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Working volume, absent while a PhaseManipulator holds it.
    pub fn data(&self) -> Result<&ComplexVolume> {
        self.data
            .as_ref()
            .ok_or_else(|| AnalysisError::precondition("the working volume was handed to the phase manipulator"))
    }

    fn take_data(&mut self) -> Result<ComplexVolume> {
        self.data
            .take()
            .ok_or_else(|| AnalysisError::precondition("the working volume was handed to the phase manipulator"))
    }

    pub fn undefined_bragg_peak_but_retrievable(&self) -> bool {
        self.bragg_peak.is_none() && self.diffraction_loader.is_some()
    }

    pub fn retrieve_bragg_peak(&mut self) -> Result<[f64; 3]> {
        let loader = self.diffraction_loader.as_ref().ok_or_else(|| {
            AnalysisError::precondition("no diffraction data to search the Bragg peak in")
        })?;
        let diffraction = loader.load(self.scan_id, &FrameFilter::default(), &Corrections::default())?;
        let peak = self.peak_finder.find_peak(
            &diffraction.intensity,
            None,
            self.config.peak_method,
            None,
        )?;
        info!("Bragg peak found at {:?} ({:?})", peak.position, self.config.peak_method);
        self.bragg_peak = Some(peak.position);
        Ok(peak.position)
    }

    pub fn detector_angles_correction_needed(&self) -> bool {
        let (outofplane, inplane) = self.setup.detector_angles();
        // a zero angle is an unset angle, as in the beamline files
        let missing = |angle: Option<f64>| angle.map_or(true, |value| value == 0.0);
        self.config.data_frame == DataFrame::Detector && (missing(outofplane) || missing(inplane))
    }

    pub fn correct_detector_angles(&mut self) -> Result<()> {
        let peak = self.bragg_peak.ok_or_else(|| {
            AnalysisError::precondition("detector angles can only be corrected from a known Bragg peak")
        })?;
        self.setup.correct_detector_angles(peak)
    }

    pub fn find_data_range(&mut self, amplitude_threshold: f64, plot_margin: [usize; 3]) -> Result<Shape3> {
        let range = find_data_range(
            self.data()?,
            amplitude_threshold,
            plot_margin,
            self.config.keep_size,
        )?;
        self.optimized_range = range;
        info!("optimized range: {:?}", range);
        Ok(range)
    }

    pub fn find_best_reconstruction(&mut self) -> Result<()> {
        self.sorted_indices = rank_reconstructions(
            self.loader.as_ref(),
            &self.file_paths,
            self.config.isosurface_strain,
            self.optimized_range,
            self.config.sort_method,
        )?;
        Ok(())
    }

    fn prepare_candidate(&self, volume: ComplexVolume, extension: &str) -> ComplexVolume {
        let volume = if self.config.flip_reconstruction {
            flip_reconstruction(&volume)
        } else {
            volume
        };
        // decomposed modes come out of phasing rolled
        let volume = if extension == "h5" {
            roll(&volume, self.config.roll_modes)
        } else {
            volume
        };
        crop_pad(&volume, self.optimized_range)
    }

    /// Folds the ranked candidates into their mean, the best one being the
    /// fixed reference.
    pub fn average_reconstructions(&mut self) -> Result<()> {
        let aligner = ReconstructionAligner::new(self.config.averaging_space, self.config.upsample_factor);
        let threshold = self.config.correlation_threshold;

        let (&first, others) = self
            .sorted_indices
            .split_first()
            .ok_or_else(|| AnalysisError::precondition("no reconstruction to average"))?;
        let load = |index: usize| -> Result<ComplexVolume> {
            let (volume, extension) = self.loader.load_volume(&self.file_paths[index])?;
            Ok(self.prepare_candidate(volume, &extension))
        };

        let reference = load(first)?;
        let mut running_sum = reference.clone();
        let mut count = 1usize;
        let mut averaged = vec![self.file_paths[first].clone()];
        for &index in others {
            let candidate = load(index)?;
            let (sum, accepted) = aligner.merge(&reference, running_sum, &candidate, threshold)?;
            running_sum = sum;
            if accepted {
                count += 1;
                averaged.push(self.file_paths[index].clone());
            }
        }

        let rejected = self.sorted_indices.len() - count;
        if rejected > 0 {
            warn!("{} reconstruction(s) excluded from the average", rejected);
        }
        info!("averaged {} reconstruction(s)", count);
        if count > 1 {
            self.comment.concatenate(&format!("avg{count}"));
        }
        let scale = 1.0 / count as f64;
        self.data = Some(running_sum.mapv(|v| v * scale));
        self.accepted_count = count;
        self.averaged_files = averaged;
        Ok(())
    }

    /// Decomposed-mode (`.h5`) reconstructions are already centered by the phasing.
    pub fn centering_method(&self) -> CenteringMethod {
        if self.extension == "h5" {
            CenteringMethod::Skip
        } else {
            self.config.centering_method
        }
    }

    pub fn center_object(&mut self) -> Result<()> {
        let method = self.centering_method();
        debug!("centering the object: {:?}", method);
        let centered = center_object(self.data()?, method)?;
        self.data = Some(centered);
        Ok(())
    }

    pub fn crop_pad_data(&mut self, shape: Shape3) -> Result<()> {
        let resized = crop_pad(self.data()?, shape);
        self.data = Some(resized);
        Ok(())
    }

    pub fn interpolate_into_crystal_frame(&mut self) -> Result<()> {
        let outcome = self.frame.interpolate_into_crystal_frame(
            self.data()?,
            self.setup.as_ref(),
            self.original_shape,
        )?;
        info!("voxel sizes in the crystal frame: {:?} nm", outcome.voxel_sizes);
        self.data = Some(outcome.volume);
        self.voxel_sizes = Some(outcome.voxel_sizes);
        self.transfer_matrix = outcome.transfer_matrix;
        self.is_orthogonal = outcome.is_orthogonal;
        Ok(())
    }

    /// Hands the working volume over to a PhaseManipulator.
    pub fn get_phase_manipulator(&mut self, save_directory: Option<PathBuf>) -> Result<PhaseManipulator> {
        let data = self.take_data()?;
        Ok(PhaseManipulator::new(
            data,
            PhaseParameters::from_config(self.config),
            self.original_shape,
            save_directory,
        ))
    }

    pub fn update_data(&mut self, modulus: &ndarray::Array3<f64>, phase: &ndarray::Array3<f64>) -> Result<()> {
        self.data = Some(compose(modulus, phase)?);
        Ok(())
    }

    fn output_path(&self, save_dir: &Path, stem: &str, extension: &str) -> PathBuf {
        save_dir.join(format!(
            "S{}_{}{}.{}",
            self.scan_id,
            stem,
            self.comment.text(),
            extension
        ))
    }

    pub fn save_rawdata(&self, save_dir: &Path) -> Result<PathBuf> {
        let path = self.output_path(save_dir, "raw", "npz");
        save_complex(&path, self.data()?)?;
        Ok(path)
    }

    /// Writes amplitude and phase (npz and vti), plus the support when asked.
    pub fn save_results(&self, save_dir: &Path) -> Result<Vec<PathBuf>> {
        let data = self.data()?;
        let voxel_sizes = self.voxel_sizes.ok_or_else(|| {
            AnalysisError::precondition("interpolate into the crystal frame before saving")
        })?;
        let modulus = data.mapv(|v| v.norm());
        let phase = data.mapv(|v| crate::utils::safe_arg(&v));

        let mut written = Vec::new();
        let npz = self.output_path(save_dir, "amp-phase", "npz");
        save_modulus_phase(&npz, &modulus, &phase)?;
        written.push(npz);

        let vti = self.output_path(save_dir, "amp-phase", "vti");
        save_to_vti(&vti, &modulus, &phase, voxel_sizes)?;
        written.push(vti);

        if self.config.save_support {
            let support = self.output_path(save_dir, "support", "npz");
            save_support(&support, &modulus)?;
            written.push(support);
        }
        Ok(written)
    }

    /// Full post-processing of the scan, results written under `save_dir`.
    pub fn run(&mut self, save_dir: &Path) -> Result<RunSummary> {
        std::fs::create_dir_all(save_dir)?;
        let mut files_written = Vec::new();

        if self.undefined_bragg_peak_but_retrievable() {
            self.retrieve_bragg_peak()?;
        }
        if self.detector_angles_correction_needed() {
            self.correct_detector_angles()?;
        }

        self.find_data_range(self.config.data_range_threshold, self.config.plot_margin)?;
        self.find_best_reconstruction()?;
        self.average_reconstructions()?;
        self.center_object()?;
        self.crop_pad_data(self.original_shape)?;
        if self.config.save_rawdata {
            files_written.push(self.save_rawdata(save_dir)?);
        }

        self.interpolate_into_crystal_frame()?;

        let mut manipulator = self.get_phase_manipulator(Some(save_dir.to_path_buf()))?;
        if !self.config.skip_unwrap {
            manipulator.unwrap_phase()?;
            manipulator.center_phase()?;
        }
        manipulator.remove_ramp()?;
        if let Some(path) = manipulator.plot_phase("phase_after_ramp_removal", self.config.debug)? {
            files_written.push(path);
        }
        manipulator.remove_offset()?;
        if !self.config.skip_unwrap {
            manipulator.center_phase()?;
        }
        if self.config.invert_phase {
            manipulator.invert_phase();
        }
        manipulator.average_phase();
        if self.config.apodize {
            manipulator.apodize()?;
        }
        if let Some(path) = manipulator.plot_phase("phase_final", self.config.debug)? {
            files_written.push(path);
        }
        let (modulus, phase) = manipulator.into_parts();
        self.update_data(&modulus, &phase)?;

        files_written.extend(self.save_results(save_dir)?);
        info!("scan {}: wrote {} file(s) to {}", self.scan_id, files_written.len(), save_dir.display());

        Ok(RunSummary {
            scan_id: self.scan_id,
            candidate_count: self.file_paths.len(),
            accepted_count: self.accepted_count,
            averaged_files: self.averaged_files.clone(),
            voxel_sizes: self.voxel_sizes.unwrap_or_default(),
            is_orthogonal: self.is_orthogonal,
            transfer_matrix: self.transfer_matrix,
            files_written,
            comment: self.comment.text().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{create_analysis, Collaborators, Comment};
    use crate::config::{
        AveragingSpace, CenteringMethod, DataFrame, FileList, PostprocessingConfig, SortMethod,
    };
    use crate::error::{AnalysisError, Result};
    use crate::io::VolumeLoader;
    use crate::frame::AnalysisType;
    use crate::volume::{crop_pad, ComplexVolume};
    use ndarray::{Array1, Array3};
    use ndarray_npy::{write_npy, NpzWriter};
    use num_complex::Complex64;
    use std::fs::File;
    use std::path::{Path, PathBuf};

    fn blob(n: usize, center: [f64; 3], sigma: f64, phase_slope: f64) -> ComplexVolume {
        Array3::from_shape_fn((n, n, n), |(z, y, x)| {
            let r2 = (z as f64 - center[0]).powi(2)
                + (y as f64 - center[1]).powi(2)
                + (x as f64 - center[2]).powi(2);
            Complex64::from_polar((-r2 / (2.0 * sigma * sigma)).exp(), phase_slope * x as f64)
        })
    }

    fn write_volume(dir: &Path, name: &str, data: &ComplexVolume) -> PathBuf {
        let path = dir.join(name);
        write_npy(&path, data).unwrap();
        path
    }

    fn write_q_values(dir: &Path, n: usize) -> PathBuf {
        let path = dir.join("q.npz");
        let axis = Array1::linspace(-0.1, 0.1, n);
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("qx", &axis).unwrap();
        npz.add_array("qy", &axis).unwrap();
        npz.add_array("qz", &axis).unwrap();
        npz.finish().unwrap();
        path
    }

    fn config_for(files: Vec<PathBuf>, data_frame: DataFrame) -> PostprocessingConfig {
        let mut config = PostprocessingConfig {
            scans: vec![11],
            reconstruction_files: vec![FileList::Many(files)],
            data_frame,
            ..PostprocessingConfig::default()
        };
        config.setup.q_laboratory = Some([-0.844, 2.642, -0.097]);
        config
    }

    #[test]
    fn comment_accumulates_tokens() {
        let mut comment = Comment::new("test");
        comment.concatenate("mode");
        comment.concatenate("avg2");
        assert_eq!(comment.text(), "_test_mode_avg2");
        assert_eq!(Comment::new("").text(), "");
    }

    #[test]
    fn workflow_follows_the_data_frame() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_volume(dir.path(), "rec.npy", &blob(8, [4.0; 3], 1.5, 0.0));

        let config = config_for(vec![file.clone()], DataFrame::Detector);
        let analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        assert_eq!(analysis.analysis_type(), AnalysisType::Linearized);

        for frame in [DataFrame::Laboratory, DataFrame::Crystal] {
            let config = config_for(vec![file.clone()], frame);
            let analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
            assert_eq!(analysis.analysis_type(), AnalysisType::Orthogonal);
        }

        let mut config = config_for(vec![file], DataFrame::Detector);
        config.interpolation_method = "xrayutilities".to_string();
        assert!(matches!(
            create_analysis(&config, 0, Collaborators::from_config(&config)),
            Err(AnalysisError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn phasing_shape_accounts_for_binning() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_volume(dir.path(), "rec.npy", &blob(8, [4.0; 3], 1.5, 0.0));
        let mut config = config_for(vec![file], DataFrame::Crystal);
        config.original_size = Some([252, 420, 392]);
        config.phasing_binning = [2, 2, 1];
        let analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        assert_eq!(analysis.original_shape(), [126, 210, 392]);
        assert_eq!(analysis.scan_id(), 11);
    }

    #[test]
    fn single_candidate_is_its_own_average() {
        let dir = tempfile::tempdir().unwrap();
        let data = blob(12, [6.0, 5.0, 6.0], 2.0, 0.1);
        let file = write_volume(dir.path(), "rec.npy", &data);
        let config = config_for(vec![file], DataFrame::Crystal);
        let mut analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();

        let range = analysis.find_data_range(0.05, [0; 3]).unwrap();
        analysis.find_best_reconstruction().unwrap();
        assert_eq!(analysis.sorted_indices(), &[0]);
        analysis.average_reconstructions().unwrap();
        assert_eq!(analysis.accepted_count(), 1);
        assert_eq!(analysis.data().unwrap(), &crop_pad(&data, range));
        assert_eq!(analysis.comment().text(), "");
    }

    #[test]
    fn unreachable_threshold_keeps_only_the_reference() {
        let dir = tempfile::tempdir().unwrap();
        let first = blob(12, [6.0; 3], 2.0, 0.0);
        let second = blob(12, [6.0; 3], 3.0, 0.0);
        let files = vec![
            write_volume(dir.path(), "a.npy", &first),
            write_volume(dir.path(), "b.npy", &second),
        ];
        let mut config = config_for(files, DataFrame::Crystal);
        config.correlation_threshold = 1.0;
        config.keep_size = true;
        config.averaging_space = AveragingSpace::Direct;
        config.sort_method = SortMethod::Volume;
        let mut analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        analysis.find_data_range(0.05, [0; 3]).unwrap();
        analysis.find_best_reconstruction().unwrap();
        let best = analysis.sorted_indices()[0];
        analysis.average_reconstructions().unwrap();
        assert_eq!(analysis.accepted_count(), 1);

        let reference = if best == 0 { &first } else { &second };
        assert_eq!(analysis.data().unwrap(), reference);
        assert_eq!(analysis.averaged_files().len(), 1);
    }

    #[test]
    fn shifted_copies_are_averaged() {
        let dir = tempfile::tempdir().unwrap();
        let first = blob(16, [8.0; 3], 2.0, 0.0);
        let second = crate::utils::roll(&first, [1, -1, 2]);
        let files = vec![
            write_volume(dir.path(), "a.npy", &first),
            write_volume(dir.path(), "b.npy", &second),
        ];
        let mut config = config_for(files, DataFrame::Crystal);
        config.keep_size = true;
        let mut analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        analysis.find_data_range(0.05, [0; 3]).unwrap();
        analysis.find_best_reconstruction().unwrap();
        analysis.average_reconstructions().unwrap();
        assert_eq!(analysis.accepted_count(), 2);
        assert_eq!(analysis.comment().text(), "_avg2");
    }

    #[test]
    fn phase_manipulator_takes_the_volume() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_volume(dir.path(), "rec.npy", &blob(8, [4.0; 3], 1.5, 0.2));
        let config = config_for(vec![file], DataFrame::Crystal);
        let mut analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();

        let manipulator = analysis.get_phase_manipulator(None).unwrap();
        assert!(matches!(analysis.data(), Err(AnalysisError::Precondition(_))));
        assert!(matches!(
            analysis.get_phase_manipulator(None),
            Err(AnalysisError::Precondition(_))
        ));

        let (modulus, phase) = manipulator.into_parts();
        analysis.update_data(&modulus, &phase).unwrap();
        let restored = analysis.data().unwrap();
        assert!((restored[[4, 4, 4]].norm() - 1.0).abs() < 1e-12);
        assert!((restored[[4, 4, 4]].arg() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn bragg_peak_is_retrieved_from_the_diffraction_stack() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_volume(dir.path(), "rec.npy", &blob(8, [4.0; 3], 1.5, 0.0));
        let mut intensity = Array3::<f64>::zeros((10, 12, 14));
        intensity[[3, 7, 9]] = 100.0;
        let diffraction = dir.path().join("diffraction.npy");
        write_npy(&diffraction, &intensity).unwrap();

        let mut config = config_for(vec![file], DataFrame::Detector);
        config.diffraction_file = Some(diffraction);
        config.peak_method = crate::config::PeakMethod::Max;
        config.setup.outofplane_angle = None;
        config.setup.inplane_angle = None;
        config.setup.direct_beam = Some([6.0, 7.0]);
        let mut analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        assert!(analysis.undefined_bragg_peak_but_retrievable());
        assert!(analysis.detector_angles_correction_needed());
        assert_eq!(analysis.retrieve_bragg_peak().unwrap(), [3.0, 7.0, 9.0]);
        analysis.correct_detector_angles().unwrap();
        assert!(!analysis.detector_angles_correction_needed());
    }

    #[test]
    fn zero_detector_angle_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_volume(dir.path(), "rec.npy", &blob(8, [4.0; 3], 1.5, 0.0));
        let mut config = config_for(vec![file], DataFrame::Detector);
        config.setup.outofplane_angle = Some(35.0);
        config.setup.inplane_angle = Some(0.0);
        let analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        assert!(analysis.detector_angles_correction_needed());

        config.setup.inplane_angle = Some(-1.5);
        let analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        assert!(!analysis.detector_angles_correction_needed());
    }

    struct FixedLoader {
        volume: ComplexVolume,
        extension: &'static str,
    }

    impl VolumeLoader for FixedLoader {
        fn load_volume(&self, _path: &Path) -> Result<(ComplexVolume, String)> {
            Ok((self.volume.clone(), self.extension.to_string()))
        }
    }

    #[test]
    fn decomposed_modes_are_not_centered_again() {
        let off_center = blob(12, [3.0, 4.0, 8.0], 1.5, 0.0);
        let mut config = config_for(vec![PathBuf::from("modes.h5")], DataFrame::Crystal);
        config.centering_method = CenteringMethod::MaxCom;

        let mut collaborators = Collaborators::from_config(&config);
        collaborators.loader = Box::new(FixedLoader {
            volume: off_center.clone(),
            extension: "h5",
        });
        let mut analysis = create_analysis(&config, 0, collaborators).unwrap();
        assert_eq!(analysis.centering_method(), CenteringMethod::Skip);
        assert_eq!(analysis.comment().text(), "_mode");
        analysis.center_object().unwrap();
        assert_eq!(analysis.data().unwrap(), &off_center);

        let mut collaborators = Collaborators::from_config(&config);
        collaborators.loader = Box::new(FixedLoader {
            volume: off_center.clone(),
            extension: "npy",
        });
        let mut analysis = create_analysis(&config, 0, collaborators).unwrap();
        assert_eq!(analysis.centering_method(), CenteringMethod::MaxCom);
        analysis.center_object().unwrap();
        assert_ne!(analysis.data().unwrap(), &off_center);
    }

    #[test]
    fn run_writes_the_results() {
        let dir = tempfile::tempdir().unwrap();
        let first = blob(16, [8.0; 3], 2.5, 0.15);
        let second = crate::utils::roll(&first, [0, 1, -1]);
        let files = vec![
            write_volume(dir.path(), "a.npy", &first),
            write_volume(dir.path(), "b.npy", &second),
        ];
        let mut config = config_for(files, DataFrame::Crystal);
        config.q_values_file = Some(write_q_values(dir.path(), 16));
        config.save_support = true;
        config.save_rawdata = true;
        config.comment = "test".to_string();

        let save_dir = dir.path().join("result");
        let mut analysis = create_analysis(&config, 0, Collaborators::from_config(&config)).unwrap();
        let summary = analysis.run(&save_dir).unwrap();

        assert_eq!(summary.scan_id, 11);
        assert_eq!(summary.candidate_count, 2);
        assert!(summary.is_orthogonal);
        assert!(summary.voxel_sizes.iter().all(|&v| v > 0.0));
        assert_eq!(summary.files_written.len(), 4);
        for path in &summary.files_written {
            assert!(path.exists(), "{}", path.display());
        }
        assert!(save_dir
            .join(format!("S11_amp-phase{}.vti", summary.comment))
            .exists());
        assert_eq!(analysis.data().unwrap().dim(), (16, 16, 16));
    }
}
