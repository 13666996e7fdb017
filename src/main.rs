use std::path::PathBuf;

use bcdi_analysis::analysis::{create_analysis, Collaborators};
use bcdi_analysis::args::{apply_overrides, scan_indices, Args};
use bcdi_analysis::config::PostprocessingConfig;
use bcdi_analysis::logging::init_logging;
use bcdi_analysis::utils::DynError;
use clap::Parser;
use tracing::info;

fn main() -> Result<(), DynError> {
    let args = Args::parse();
    let config = PostprocessingConfig::from_yaml_file(&args.config)?;
    let config = apply_overrides(&args, config)?;
    init_logging(&config.logging)?;

    for scan_index in scan_indices(&args, &config)? {
        let mut analysis =
            create_analysis(&config, scan_index, Collaborators::from_config(&config))?;
        let scan_dir = format!("S{}", analysis.scan_id());
        let save_dir = match &config.save_dir {
            Some(dir) => dir.join(&scan_dir),
            None => analysis
                .file_paths()
                .first()
                .and_then(|p| p.parent())
                .map(|p| p.join(format!("{scan_dir}_postprocessing")))
                .unwrap_or_else(|| PathBuf::from(format!("{scan_dir}_postprocessing"))),
        };

        let summary = analysis.run(&save_dir)?;
        info!(
            "scan {}: {}/{} reconstruction(s) averaged, voxel sizes {:?} nm, {} file(s) in {}",
            summary.scan_id,
            summary.accepted_count,
            summary.candidate_count,
            summary.voxel_sizes,
            summary.files_written.len(),
            save_dir.display()
        );
    }
    Ok(())
}
