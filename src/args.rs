use crate::config::{DataFrame, PostprocessingConfig, VoxelSize};
use crate::utils::DynError;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Post-processing of BCDI reconstructions: averaging, crystal-frame interpolation and phase cleanup",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  bcdi-analysis --config postprocessing.yml\n  bcdi-analysis --config postprocessing.yml --scan-index 1 --data-frame laboratory --fix-voxel 5\n  bcdi-analysis --config postprocessing.yml --fix-voxel 4,5,6 --save-dir results --log-level debug\n"
)]
pub struct Args {
    /// YAML configuration file
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Process only the scan at this index of `scans` (default: every scan)
    #[arg(long)]
    pub scan_index: Option<usize>,

    /// Frame of the reconstructions, overrides `data_frame`
    #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(["detector", "laboratory", "crystal"]))]
    pub data_frame: Option<String>,

    /// Output voxel size in nm: one value, or three comma-separated values (z,y,x)
    #[arg(long)]
    pub fix_voxel: Option<String>,

    /// Output directory, overrides `save_dir`
    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also append log records to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

pub fn parse_fix_voxel(list: &str) -> Result<VoxelSize, DynError> {
    let values = list
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()?;
    let voxel = match values.as_slice() {
        [v] => VoxelSize::Isotropic(*v),
        [z, y, x] => VoxelSize::PerAxis([*z, *y, *x]),
        _ => {
            return Err(format!(
                "--fix-voxel expects 1 or 3 comma-separated values, received {}",
                values.len()
            )
            .into())
        }
    };
    if voxel.to_array().iter().any(|&v| !(v > 0.0)) {
        return Err("--fix-voxel values must be strictly positive".into());
    }
    Ok(voxel)
}

/// Command-line values take precedence over the configuration file.
pub fn apply_overrides(
    args: &Args,
    mut config: PostprocessingConfig,
) -> Result<PostprocessingConfig, DynError> {
    if let Some(frame) = &args.data_frame {
        config.data_frame = DataFrame::parse(frame)?;
    }
    if let Some(list) = &args.fix_voxel {
        config.fix_voxel = Some(parse_fix_voxel(list)?);
    }
    if let Some(dir) = &args.save_dir {
        config.save_dir = Some(dir.clone());
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(file) = &args.log_file {
        config.logging.file = Some(file.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Scan indices to process.
pub fn scan_indices(args: &Args, config: &PostprocessingConfig) -> Result<Vec<usize>, DynError> {
    let available = config.scans.len().max(config.reconstruction_files.len()).max(1);
    match args.scan_index {
        Some(index) if index >= available => Err(format!(
            "--scan-index {index} is out of range, the configuration lists {available} scan(s)"
        )
        .into()),
        Some(index) => Ok(vec![index]),
        None => Ok((0..available).collect()),
    }
}
