use std::path::{Path, PathBuf};

use ndarray::{Array3, Zip};
use tracing::info;

use crate::config::{DataFrame, PostprocessingConfig};
use crate::error::{AnalysisError, Result};
use crate::geometry::{invert, rotation_aligning, BraggGeometry, Matrix3, RefAxis, Vector3};
use crate::io::{load_q_values, QValues};
use crate::setup::ExperimentSetup;
use crate::utils::Shape3;
use crate::volume::{compose, sample_trilinear, shape_of, ComplexVolume, PhaseModel};

pub const LINEARIZATION: &str = "linearization";

/// Workflow chosen once from the acquisition frame and interpolation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisType {
    Linearized,
    Orthogonal,
}

pub fn define_analysis_type(data_frame: DataFrame, interpolation_method: &str) -> Result<AnalysisType> {
    match data_frame {
        DataFrame::Detector if interpolation_method == LINEARIZATION => Ok(AnalysisType::Linearized),
        DataFrame::Detector => Err(AnalysisError::UnsupportedConfiguration(format!(
            "interpolation method '{interpolation_method}' is not available for detector-frame data"
        ))),
        DataFrame::Laboratory | DataFrame::Crystal => Ok(AnalysisType::Orthogonal),
    }
}

/// Result of the crystal-frame interpolation, merged by the orchestrator.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub volume: ComplexVolume,
    /// nm, array order (z, y, x)
    pub voxel_sizes: [f64; 3],
    pub transfer_matrix: Option<Matrix3>,
    pub is_orthogonal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameTransform {
    /// Detector-frame data linearized around the Bragg peak. Only
    /// `reference_axis` is aligned with q, an in-plane rotation about it remains.
    LinearizedDetectorFrame {
        reference_axis: RefAxis,
        fix_voxel: Option<[f64; 3]>,
    },
    /// Data already on an orthogonal grid (laboratory or crystal frame).
    OrthogonalFrame {
        reference_axis: RefAxis,
        fix_voxel: Option<[f64; 3]>,
        data_frame: DataFrame,
        q_values_file: Option<PathBuf>,
    },
}

impl FrameTransform {
    pub fn from_config(config: &PostprocessingConfig) -> Result<Self> {
        let fix_voxel = config.fix_voxel.map(|v| v.to_array());
        Ok(
            match define_analysis_type(config.data_frame, &config.interpolation_method)? {
                AnalysisType::Linearized => FrameTransform::LinearizedDetectorFrame {
                    reference_axis: config.ref_axis_q,
                    fix_voxel,
                },
                AnalysisType::Orthogonal => FrameTransform::OrthogonalFrame {
                    reference_axis: config.ref_axis_q,
                    fix_voxel,
                    data_frame: config.data_frame,
                    q_values_file: config.q_values_file.clone(),
                },
            },
        )
    }

    pub fn analysis_type(&self) -> AnalysisType {
        match self {
            FrameTransform::LinearizedDetectorFrame { .. } => AnalysisType::Linearized,
            FrameTransform::OrthogonalFrame { .. } => AnalysisType::Orthogonal,
        }
    }

    pub fn interpolate_into_crystal_frame(
        &self,
        volume: &ComplexVolume,
        setup: &dyn ExperimentSetup,
        original_shape: Shape3,
    ) -> Result<FrameOutcome> {
        match self {
            FrameTransform::LinearizedDetectorFrame {
                reference_axis,
                fix_voxel,
            } => {
                let q = setup.q_laboratory()?;
                // reject a null q before asking the setup for its matrix
                BraggGeometry::new(q).normalized_laboratory()?;
                let transformation = setup.transformation_matrix(original_shape)?;
                linearized_transform(volume, q, &transformation, *fix_voxel, *reference_axis)
            }
            FrameTransform::OrthogonalFrame {
                reference_axis,
                fix_voxel,
                data_frame,
                q_values_file,
            } => {
                // only laboratory-frame data needs q, for the rotation
                let q = match data_frame {
                    DataFrame::Laboratory => Some(setup.q_laboratory()?),
                    _ => None,
                };
                orthogonal_transform(
                    volume,
                    q,
                    q_values_file.as_deref(),
                    *fix_voxel,
                    *data_frame,
                    *reference_axis,
                )
            }
        }
    }
}

/// Rotation taking the Bragg direction (laboratory `q`) onto `reference_axis`, array order.
fn crystal_rotation(q_laboratory: Vector3, reference_axis: RefAxis) -> Result<Matrix3> {
    let direction = BraggGeometry::new(q_laboratory).normalized_array_order()?;
    Ok(rotation_aligning(&direction, &reference_axis.array_vector())?.into_inner())
}

fn centers(shape: Shape3) -> [f64; 3] {
    shape.map(|n| (n / 2) as f64)
}

/// Interpolates detector-frame data onto an orthonormal grid whose
/// `reference_axis` follows q.
pub fn linearized_transform(
    volume: &ComplexVolume,
    q_laboratory: Vector3,
    transformation: &Matrix3,
    voxel_size_hint: Option<[f64; 3]>,
    reference_axis: RefAxis,
) -> Result<FrameOutcome> {
    let rotation = crystal_rotation(q_laboratory, reference_axis)?;
    let transfer = rotation * transformation;
    let inverse = invert(&transfer)?;

    let voxel = match voxel_size_hint {
        Some(v) => {
            if v.iter().any(|&s| !(s > 0.0)) {
                return Err(AnalysisError::invalid(format!(
                    "voxel sizes must be strictly positive, got {v:?}"
                )));
            }
            v
        }
        None => {
            let mean = transformation.column_iter().map(|c| c.norm()).sum::<f64>() / 3.0;
            [mean; 3]
        }
    };

    let input_shape = shape_of(volume);
    let input_center = centers(input_shape);
    let mut low = [f64::INFINITY; 3];
    let mut high = [f64::NEG_INFINITY; 3];
    for corner in 0..8 {
        let index = Vector3::from_fn(|a, _| {
            let edge = if corner >> (2 - a) & 1 == 1 {
                input_shape[a].saturating_sub(1) as f64
            } else {
                0.0
            };
            edge - input_center[a]
        });
        let position = transfer * index;
        for a in 0..3 {
            low[a] = low[a].min(position[a]);
            high[a] = high[a].max(position[a]);
        }
    }
    let output_shape: Shape3 =
        std::array::from_fn(|a| ((high[a] - low[a]) / voxel[a] - 1e-9).ceil().max(0.0) as usize + 1);
    let output_center = centers(output_shape);

    let mut output = ComplexVolume::zeros((output_shape[0], output_shape[1], output_shape[2]));
    Zip::indexed(&mut output).par_for_each(|(z, y, x), value| {
        let position = Vector3::from_fn(|a, _| ([z, y, x][a] as f64 - output_center[a]) * voxel[a]);
        let source = inverse * position;
        let source = std::array::from_fn(|a| source[a] + input_center[a]);
        *value = sample_trilinear(volume, source);
    });
    info!(
        "linearized frame: shape {:?} -> {:?}, voxel size {:?} nm; only the {:?} axis is aligned with q",
        input_shape, output_shape, voxel, reference_axis
    );
    Ok(FrameOutcome {
        volume: output,
        voxel_sizes: voxel,
        transfer_matrix: Some(transfer),
        is_orthogonal: true,
    })
}

/// Real-space voxel sizes (nm, array order) of data gridded on `q_values`.
pub fn voxel_sizes_from_q(q_values: &QValues) -> Result<[f64; 3]> {
    let extent = |q: &ndarray::Array1<f64>| -> f64 {
        let max = q.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = q.iter().cloned().fold(f64::INFINITY, f64::min);
        max - min
    };
    // qx runs along z, qz along y, qy along x
    let extents = [extent(&q_values.qx), extent(&q_values.qz), extent(&q_values.qy)];
    if extents.iter().any(|&e| !(e > 0.0) || !e.is_finite()) {
        return Err(AnalysisError::degenerate(format!(
            "q values span {extents:?}, cannot derive voxel sizes"
        )));
    }
    Ok(extents.map(|e| 2.0 * std::f64::consts::PI / e / 10.0))
}

/// Resamples `volume` from `old_voxel` to `new_voxel` keeping the array shape.
pub fn regrid(volume: &ComplexVolume, old_voxel: [f64; 3], new_voxel: [f64; 3]) -> Result<ComplexVolume> {
    if old_voxel.iter().chain(new_voxel.iter()).any(|&v| !(v > 0.0)) {
        return Err(AnalysisError::invalid(format!(
            "voxel sizes must be strictly positive, got {old_voxel:?} and {new_voxel:?}"
        )));
    }
    let center = centers(shape_of(volume));
    let mut output = ComplexVolume::zeros(volume.dim());
    Zip::indexed(&mut output).par_for_each(|(z, y, x), value| {
        let source = std::array::from_fn(|a| {
            center[a] + ([z, y, x][a] as f64 - center[a]) * new_voxel[a] / old_voxel[a]
        });
        *value = sample_trilinear(volume, source);
    });
    Ok(output)
}

/// Rotates modulus and phase separately by `rotation` (array order) about the
/// array center, keeping the shape.
pub fn rotate_modulus_phase(
    volume: &ComplexVolume,
    rotation: &Matrix3,
    voxel: [f64; 3],
) -> Result<ComplexVolume> {
    let model = PhaseModel::from_complex(volume);
    let back = rotation.transpose();
    let center = centers(model.shape());
    let mut modulus = Array3::<f64>::zeros(volume.dim());
    let mut phase = Array3::<f64>::zeros(volume.dim());
    Zip::indexed(&mut modulus)
        .and(&mut phase)
        .par_for_each(|(z, y, x), m, p| {
            let position = Vector3::from_fn(|a, _| ([z, y, x][a] as f64 - center[a]) * voxel[a]);
            let source = back * position;
            let source = std::array::from_fn(|a| source[a] / voxel[a] + center[a]);
            *m = sample_trilinear(&model.modulus, source);
            *p = sample_trilinear(&model.phase, source);
        });
    compose(&modulus, &phase)
}

/// Orthogonal-grid workflow: voxel sizes from the q values, optional regrid,
/// then rotation into the crystal frame for laboratory-frame data.
pub fn orthogonal_transform(
    volume: &ComplexVolume,
    q_laboratory: Option<Vector3>,
    q_values_file: Option<&Path>,
    fix_voxel: Option<[f64; 3]>,
    data_frame: DataFrame,
    reference_axis: RefAxis,
) -> Result<FrameOutcome> {
    let q_values = load_q_values(q_values_file)?;
    let mut voxel = voxel_sizes_from_q(&q_values)?;
    info!("voxel sizes from the q values: {:?} nm", voxel);

    let mut data = match fix_voxel {
        Some(target) => {
            let regridded = regrid(volume, voxel, target)?;
            info!("regridded to voxel sizes {:?} nm", target);
            voxel = target;
            regridded
        }
        None => volume.clone(),
    };

    let mut transfer_matrix = None;
    if data_frame == DataFrame::Laboratory {
        let q_laboratory = q_laboratory
            .ok_or_else(|| AnalysisError::precondition("laboratory-frame data needs the Bragg vector"))?;
        let rotation = crystal_rotation(q_laboratory, reference_axis)?;
        data = rotate_modulus_phase(&data, &rotation, voxel)?;
        transfer_matrix = Some(rotation);
        info!("rotated laboratory-frame data so that q follows {:?}", reference_axis);
    }
    Ok(FrameOutcome {
        volume: data,
        voxel_sizes: voxel,
        transfer_matrix,
        is_orthogonal: true,
    })
}
