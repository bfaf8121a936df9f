/// Errors surfaced by the supervision machinery itself.
///
/// A child exiting with a non-zero status is *not* an error: it is reported
/// through [`crate::WrapStatus`]. These variants only cover the cases where
/// supervision could not be established or the child could not be waited on.
use std::path::PathBuf;

#[derive(Debug)]
pub enum WrapError {
    /// Missing handler, invalid detector settings, or an unreadable settings file.
    Config { message: String },
    /// The path of the running executable could not be determined.
    ExecutableResolution { source: std::io::Error },
    /// The operating system refused to create the child process.
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// Waiting on the child failed for a reason other than its own exit.
    Supervise { source: std::io::Error },
    /// The tokio runtime for `wrap_blocking` could not be built.
    Runtime { source: std::io::Error },
}

impl WrapError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        WrapError::Config {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapError::Config { message } => write!(f, "invalid wrap configuration: {}", message),
            WrapError::ExecutableResolution { source } => {
                write!(f, "failed to resolve current executable: {}", source)
            }
            WrapError::Spawn { program, source } => {
                write!(
                    f,
                    "failed to spawn supervised child {}: {}",
                    program.display(),
                    source
                )
            }
            WrapError::Supervise { source } => {
                write!(f, "failed to wait on supervised child: {}", source)
            }
            WrapError::Runtime { source } => {
                write!(f, "failed to build supervision runtime: {}", source)
            }
        }
    }
}

impl std::error::Error for WrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WrapError::Config { .. } => None,
            WrapError::ExecutableResolution { source } => Some(source),
            WrapError::Spawn { source, .. } => Some(source),
            WrapError::Supervise { source } => Some(source),
            WrapError::Runtime { source } => Some(source),
        }
    }
}
