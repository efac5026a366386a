//! Error kinds reported by lifecycle operations.

use thiserror::Error;

/// Failure of a lifecycle operation.
///
/// Validation kinds are raised before anything on disk changes. Anything that
/// goes wrong in the filesystem, the network or an external command is
/// wrapped in [`ModuleError::OperationFailed`] with a short context string.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Invalid module package: {0}")]
    InvalidPackage(String),

    #[error("Malformed module manifest: {0}")]
    MalformedManifest(String),

    #[error("Module '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("Module {0} not found")]
    NotFound(String),

    #[error("Missing dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    #[error("Cannot uninstall module {module} because the following modules depend on it: {}", .dependents.join(", "))]
    Blocked {
        module: String,
        dependents: Vec<String>,
    },

    #[error("No updates available for module {0}")]
    NoUpdateAvailable(String),

    #[error("{context}: {source:#}")]
    OperationFailed {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ModuleError {
    /// Wrap a lower-level failure with a description of what was being done.
    pub fn failed(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ModuleError::OperationFailed {
            context: context.into(),
            source: source.into(),
        }
    }

    /// True for the kinds that are detected before any destructive step.
    pub fn is_validation(&self) -> bool {
        !matches!(self, ModuleError::OperationFailed { .. })
    }
}

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, ModuleError>;
