//! Error types for the hab resolution engine.

use std::path::PathBuf;

/// Errors raised while loading sites, building forests and resolving URIs.
#[derive(Debug, thiserror::Error)]
pub enum HabError {
    /// The same URI or distro version was defined twice inside one glob path.
    #[error("Duplicate definition of \"{uri}\" from \"{}\"", filename.display())]
    DuplicateJson { uri: String, filename: PathBuf },

    /// A distro's version string could not be parsed. The distro is dropped
    /// with a warning, this error is only surfaced for direct lookups.
    #[error("Unable to determine the version for \"{}\": {reason}", filename.display())]
    InvalidVersion { filename: PathBuf, reason: String },

    /// The solver could not satisfy a requirement.
    #[error("{0}")]
    InvalidRequirement(String),

    /// The solver hit the redirect limit while re-evaluating requirements.
    #[error("Redirect limit of {0} reached")]
    MaxRedirects(usize),

    /// A config used a variable name reserved by the formatter.
    #[error("\"{0}\" is a reserved variable name")]
    ReservedVariableName(String),

    /// A config attempted to modify an environment variable owned by hab.
    #[error("\"{0}\" is a reserved environment variable")]
    ReservedEnvVar(String),

    /// A set or unset operation was applied to a variable that was already
    /// written by an earlier operation in the traversal.
    #[error("\"{op}\" after first-write on \"{name}\"")]
    SetAfterFirstWrite { op: &'static str, name: String },

    /// The requested URI could not be mapped to any config, even a default.
    #[error("Unable to resolve the URI \"{0}\"")]
    UriUnresolved(String),

    /// A freeze string could not be decoded.
    #[error("{0}")]
    FreezeDecode(String),

    /// The habcache no longer matches the on-disk state. Internal, readers
    /// catch this and fall back to a live scan.
    #[error("Cache for \"{}\" is stale: {reason}", site_file.display())]
    CacheStale { site_file: PathBuf, reason: String },

    /// A site file was missing or contained invalid json.
    #[error("Unable to load site file \"{}\": {reason}", filename.display())]
    SiteLoad { filename: PathBuf, reason: String },

    /// A config or distro json document failed to parse.
    #[error("{reason} Source(\"{}\")", filename.display())]
    InvalidJson { filename: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type used across the engine.
pub type Result<T> = std::result::Result<T, HabError>;

impl HabError {
    /// A stable per-kind exit code for the command line interface.
    pub fn exit_code(&self) -> i32 {
        match self {
            HabError::DuplicateJson { .. } => 3,
            HabError::InvalidVersion { .. } => 4,
            HabError::InvalidRequirement(_) => 5,
            HabError::MaxRedirects(_) => 5,
            HabError::ReservedVariableName(_) => 6,
            HabError::ReservedEnvVar(_) => 6,
            HabError::SetAfterFirstWrite { .. } => 6,
            HabError::UriUnresolved(_) => 7,
            HabError::FreezeDecode(_) => 8,
            HabError::CacheStale { .. } => 9,
            HabError::SiteLoad { .. } => 10,
            HabError::InvalidJson { .. } => 11,
            HabError::Io(_) => 12,
        }
    }
}
