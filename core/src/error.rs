use std::path::PathBuf;

use thiserror::Error;

/// A3S build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// A cached instruction could not be backed by exactly one layer
    #[error("Cache integrity error: {0}")]
    CacheIntegrity(String),

    /// Filesystem failure while replaying a tar stream
    #[error("Extraction failed at {path}: {message}")]
    Extraction { path: PathBuf, message: String },

    /// Layer cache unreachable or unreadable on a plain lookup
    #[error("Cache lookup failed: {0}")]
    CacheLookup(String),

    /// No layer is cached under the requested key
    #[error("No cached layer for key {0}")]
    CacheNotFound(String),

    /// Layer cache write or maintenance failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Undeclared or unsatisfied build argument, or malformed override
    #[error("Build argument error: {0}")]
    BuildArg(String),

    /// Non-"not found" error while resolving a symlinked destination
    #[error("Failed to resolve destination {path}: {source}")]
    DestinationResolution {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A RUN command exited unsuccessfully
    #[error("Command '{command}' failed with exit code {code}")]
    Command { command: String, code: i32 },

    /// Snapshot capture or layer packaging failure
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure attributed to one build instruction
    #[error("{instruction}: {source}")]
    Instruction {
        instruction: String,
        #[source]
        source: Box<BuildError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BuildError {
    /// Attribute this error to the instruction with the given description.
    ///
    /// Already-attributed errors are returned unchanged.
    pub fn for_instruction(self, instruction: impl Into<String>) -> Self {
        match self {
            err @ BuildError::Instruction { .. } => err,
            other => BuildError::Instruction {
                instruction: instruction.into(),
                source: Box::new(other),
            },
        }
    }

    /// Whether this error is the not-found kind returned by layer caches.
    pub fn is_not_found(&self) -> bool {
        match self {
            BuildError::CacheNotFound(_) => true,
            BuildError::Instruction { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The innermost error, looking through instruction attribution.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Instruction { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Build an extraction error for `path`.
    pub fn extraction(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        BuildError::Extraction {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for A3S build operations
pub type Result<T> = std::result::Result<T, BuildError>;
