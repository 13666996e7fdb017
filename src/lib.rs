//! Post-processing of phase-retrieved Bragg coherent diffraction imaging
//! reconstructions.
//!
//! Candidate reconstructions of one scan are ranked, registered onto the best
//! one and averaged, interpolated into the crystal frame, and their phase is
//! cleaned (unwrapping, ramp and offset removal, smoothing, apodization)
//! before being written as npz and VTK files.

pub mod analysis;
pub mod args;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod io;
pub mod logging;
pub mod phase;
pub mod plot;
pub mod ranking;
pub mod registration;
pub mod setup;
pub mod utils;
pub mod volume;

pub use analysis::{create_analysis, Analysis, Collaborators, Comment, RunSummary};
pub use config::PostprocessingConfig;
pub use error::{AnalysisError, Result};
pub use frame::{AnalysisType, FrameOutcome, FrameTransform};
pub use phase::{PhaseManipulator, PhaseParameters, Prerequisite};
pub use registration::ReconstructionAligner;
pub use volume::PhaseModel;
