use std::f64::consts::PI;

use nalgebra::{Rotation3, Unit};
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

pub type Vector3 = nalgebra::Vector3<f64>;
pub type Matrix3 = nalgebra::Matrix3<f64>;

const NORM_EPSILON: f64 = 1e-12;
// hc in keV * Angstrom
const HC_KEV_ANGSTROM: f64 = 12.398_419_843;

// --- Frame conventions ---
// Laboratory frame (x, y, z): x downstream along the incident beam, y vertical up,
// z outboard. Arrays are indexed (z, y, x), so a laboratory vector is reversed
// before it is compared with array axes.
// ------------------------

/// Crystal axis that the Bragg direction is aligned onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefAxis {
    X,
    Y,
    Z,
}

impl RefAxis {
    /// Unit vector of this axis in array order (z, y, x).
    pub fn array_vector(self) -> Vector3 {
        match self {
            RefAxis::X => Vector3::z(),
            RefAxis::Y => Vector3::y(),
            RefAxis::Z => Vector3::x(),
        }
    }

    pub fn parse(label: &str) -> Result<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(RefAxis::X),
            "y" => Ok(RefAxis::Y),
            "z" => Ok(RefAxis::Z),
            other => Err(AnalysisError::invalid(format!(
                "unknown reference axis '{other}', expected x, y or z"
            ))),
        }
    }
}

pub fn normalize(v: &Vector3) -> Result<Vector3> {
    match v.try_normalize(NORM_EPSILON) {
        Some(unit) if unit.iter().all(|c| c.is_finite()) => Ok(unit),
        _ => Err(AnalysisError::degenerate(format!(
            "cannot normalize vector {:?} with norm {:e}",
            v.as_slice(),
            v.norm()
        ))),
    }
}

pub fn laboratory_to_array_order(v: &Vector3) -> Vector3 {
    Vector3::new(v.z, v.y, v.x)
}

/// Inverse of a transformation matrix; a singular matrix is degenerate geometry.
pub fn invert(m: &Matrix3) -> Result<Matrix3> {
    let scale = m.amax();
    let det = m.determinant();
    if !det.is_finite() || det.abs() <= NORM_EPSILON * scale.powi(3).max(NORM_EPSILON) {
        return Err(AnalysisError::degenerate(format!(
            "transformation matrix is singular (det = {det:e})"
        )));
    }
    m.try_inverse().ok_or_else(|| {
        AnalysisError::degenerate(format!("transformation matrix is singular (det = {det:e})"))
    })
}

/// Rotation taking the direction of `from` onto the direction of `to`.
pub fn rotation_aligning(from: &Vector3, to: &Vector3) -> Result<Rotation3<f64>> {
    let a = normalize(from)?;
    let b = normalize(to)?;
    if let Some(rotation) = Rotation3::rotation_between(&a, &b) {
        return Ok(rotation);
    }
    // antiparallel: half turn about any axis perpendicular to `a`
    let helper = if a.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
    let axis = Unit::new_normalize(a.cross(&helper));
    Ok(Rotation3::from_axis_angle(&axis, PI))
}

/// Scattering vector of the measured Bragg reflection, laboratory frame, 1/Angstrom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BraggGeometry {
    pub q_laboratory: Vector3,
}

impl BraggGeometry {
    pub fn new(q_laboratory: Vector3) -> Self {
        Self { q_laboratory }
    }

    pub fn norm_q(&self) -> f64 {
        self.q_laboratory.norm()
    }

    pub fn interplanar_distance(&self) -> Result<f64> {
        let n = self.norm_q();
        if n < NORM_EPSILON {
            return Err(AnalysisError::degenerate("null Bragg vector"));
        }
        Ok(2.0 * PI / n)
    }

    pub fn normalized_laboratory(&self) -> Result<Vector3> {
        normalize(&self.q_laboratory)
    }

    /// Normalized Bragg direction in array order (z, y, x).
    pub fn normalized_array_order(&self) -> Result<Vector3> {
        Ok(laboratory_to_array_order(&self.normalized_laboratory()?))
    }
}

pub fn wavelength_angstrom(energy_ev: f64) -> Result<f64> {
    if !(energy_ev > 0.0) {
        return Err(AnalysisError::invalid(format!(
            "X-ray energy must be positive, got {energy_ev} eV"
        )));
    }
    Ok(HC_KEV_ANGSTROM / (energy_ev / 1000.0))
}

/// q = k_out - k_in for detector angles in degrees.
pub fn q_from_detector_angles(
    energy_ev: f64,
    outofplane_deg: f64,
    inplane_deg: f64,
) -> Result<Vector3> {
    let k = 2.0 * PI / wavelength_angstrom(energy_ev)?;
    let delta = outofplane_deg.to_radians();
    let gamma = inplane_deg.to_radians();
    let k_out = Vector3::new(
        k * gamma.cos() * delta.cos(),
        k * delta.sin(),
        -k * gamma.sin() * delta.cos(),
    );
    Ok(k_out - Vector3::new(k, 0.0, 0.0))
}
