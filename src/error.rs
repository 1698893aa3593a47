//! Error types for point-diffusion-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration (channel widths, group counts, point counts).
    #[error("config: {0}")]
    Config(String),

    /// Tensor shape does not match what the operation expects.
    #[error("shape: {0}")]
    Shape(String),

    /// A timestep index outside `[0, timesteps)`.
    #[error("timestep {timestep} out of range for a {timesteps}-step schedule")]
    TimestepOutOfRange { timestep: usize, timesteps: usize },

    /// Sampling was stopped by the caller between two reverse steps.
    #[error("sampling interrupted after timestep {timestep}")]
    Interrupted { timestep: usize },

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
