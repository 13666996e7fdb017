use thiserror::Error;

/// Root error type for the post-processing workflow.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// An operation ran before the step that produces its input state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Null Bragg vector, singular transformation or empty support.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// The auxiliary reciprocal-space file could not be located.
    #[error("missing geometry file: {0}")]
    MissingGeometryFile(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Frame / interpolation method combination without a workflow.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("plot error: {0}")]
    Plot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    #[error(transparent)]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    #[error(transparent)]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

impl AnalysisError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn degenerate(msg: impl Into<String>) -> Self {
        Self::DegenerateGeometry(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}
