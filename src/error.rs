//! Error types for polyrepo

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for polyrepo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for polyrepo operations
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest is missing a required field or holds an invalid value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A matcher include/ignore pattern failed to compile
    #[error("Invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Explicitly configured credentials could not be honored
    #[error("Authentication error: {0}")]
    Auth(String),

    /// libgit2 failure
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// IO error with the path or action that caused it
    #[error("IO error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A supervised command could not be launched
    #[error("Failed to start command {name:?}: {source}")]
    CommandStart {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A supervised command failed and is marked exit-on-error
    #[error("Command {name:?} failed and is marked exit_on_error")]
    CommandFatal { name: String },

    /// Working directory for a command does not exist
    #[error("Working directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    /// Filesystem watcher failure
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Manifest (de)serialization failure
    #[error("Manifest error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Manifest download failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic operational failure with message
    #[error("{0}")]
    Operation(String),
}

impl Error {
    /// Build an IO error carrying the path it concerns
    pub fn io(context: impl std::fmt::Display, source: std::io::Error) -> Self {
        Error::Io {
            context: context.to_string(),
            source,
        }
    }

    /// Configuration-class errors abort the affected runner or the whole process;
    /// everything else is reported and siblings continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Pattern { .. }
                | Error::Auth(_)
                | Error::Yaml(_)
                | Error::CommandFatal { .. }
        )
    }
}
