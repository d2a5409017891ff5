use std::path::PathBuf;

use thiserror::Error;

/// Domain errors for the automation core, one enum per concern.
///
/// Per-cycle failures (`CaptureError`, `TemplateError`, `DispatchError`) are
/// logged by the worker and never end a run. `ValidationError` and
/// `ControlError` are returned to the operator before anything starts.

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to enumerate monitors")]
    EnumerationFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Failed to capture monitor {monitor}")]
    CaptureFailed {
        monitor: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("No monitors found")]
    NoMonitors,

    #[error("Monitor {0} is no longer available")]
    MonitorGone(u32),
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to decode template image: {path}")]
    DecodeFailed {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Template '{0}' has no decoded image")]
    NotDecoded(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to initialize input injection")]
    InitFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Failed to click at ({x}, {y})")]
    ClickFailed {
        x: i32,
        y: i32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("No image templates in the active profile")]
    EmptyProfile,

    #[error("Invalid confidence threshold: {0} (must be 0.50-1.00)")]
    ConfidenceOutOfRange(f32),

    #[error("Template index {index} out of range (profile has {len})")]
    TemplateIndexOutOfRange { index: usize, len: usize },

    #[error("Profile name must not be empty")]
    EmptyProfileName,

    #[error("Invalid scale range: {min}-{max} with {samples} samples")]
    InvalidScaleRange { min: f32, max: f32, samples: usize },
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Automation already running")]
    AlreadyRunning,

    #[error("Cannot {action} while {status}")]
    InvalidTransition {
        action: &'static str,
        status: &'static str,
    },

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error("Failed to start automation thread")]
    ThreadSpawnFailed(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to load profiles from {path}")]
    LoadFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to save profiles to {path}")]
    SaveFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Profile not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from {path}")]
    LoadFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to save configuration to {path}")]
    SaveFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine configuration directory")]
    NoConfigDir,
}

/// Type alias for application Results using anyhow for context chaining
pub type AppResult<T> = anyhow::Result<T>;
