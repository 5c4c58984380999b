//! Error taxonomy for parameter validation, directory resolution, per-image integration
//! and batch-fatal conditions.

use crate::params::ParamField;
use std::path::PathBuf;
use thiserror::Error;

/// A parameter value or artifact path is unusable. Always names the offending field.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field}: required key is missing")]
    MissingField { field: ParamField },

    #[error("{field}: unknown facility '{value}' (expected NSLS2, APS_single, APS_multi or SSRL)")]
    UnknownFacility { field: ParamField, value: String },

    #[error("{field}: '{value}' is not one of {expected}")]
    InvalidChoice {
        field: ParamField,
        value: String,
        expected: &'static str,
    },

    #[error("{field}: '{value}' is not a whole number")]
    NotAnInteger { field: ParamField, value: String },

    #[error("{field}: '{value}' is not a number")]
    NotANumber { field: ParamField, value: String },

    #[error("{field}: must be greater than zero")]
    NotPositive { field: ParamField },

    #[error("{field}: malformed range '{value}': {reason}")]
    MalformedRange {
        field: ParamField,
        value: String,
        reason: &'static str,
    },

    #[error("{field}: no path given")]
    EmptyPath { field: ParamField },

    #[error("{field}: path '{}' starts or ends with whitespace", path.display())]
    PathWhitespace { field: ParamField, path: PathBuf },

    #[error("{field}: file does not exist: {}", path.display())]
    FileNotFound { field: ParamField, path: PathBuf },

    #[error("{field}: {} has an unsupported extension (allowed: {allowed})", path.display())]
    BadExtension {
        field: ParamField,
        path: PathBuf,
        allowed: &'static str,
    },

    #[error("{field}: {} exists but is not a directory", path.display())]
    NotADirectory { field: ParamField, path: PathBuf },
}

/// Nothing to integrate for the chosen facility layout.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("root directory not found: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("no root directories given")]
    NoRoots,

    #[error("no source directories matched the {facility} layout under {roots}")]
    NoDirectories { facility: String, roots: String },

    #[error("no {extension} images found in {directories} matching directories")]
    NoImages {
        extension: &'static str,
        directories: usize,
    },

    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by an integration engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid image {}: {reason}", path.display())]
    InvalidImage { path: PathBuf, reason: String },

    #[error("engine failed: {0}")]
    Failed(String),

    /// The engine itself cannot run, so no image can be integrated.
    #[error("could not start {}: {source}", program.display())]
    Unavailable {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One image could not be integrated. Recovered by the orchestrator.
#[derive(Debug, Error)]
#[error("{}: {reason}", image.display())]
pub struct ItemError {
    pub image: PathBuf,
    pub reason: String,
}

/// Conditions that make all remaining work meaningless.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("calibration file is no longer readable: {}", path.display())]
    CalibrationLost { path: PathBuf },

    #[error("mask file is no longer readable: {}", path.display())]
    MaskLost { path: PathBuf },

    #[error("failed to load {what} from {}: {source}", path.display())]
    ArtifactLoad {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: EngineError,
    },

    #[error("integration engine is unavailable: {0}")]
    EngineUnavailable(#[source] EngineError),

    #[error("output location {} is not writable: {source}", path.display())]
    OutputUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write run record {}: {source}", path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of driving one work item that did not produce an outcome.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Item(#[from] ItemError),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Failure modes of a whole batch run.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid parameters: {0}")]
    Validation(#[from] ValidationError),

    #[error("directory resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// The batch started and was aborted; the run record reflects completed work.
    #[error("batch aborted after {} of {} images: {cause}", summary.processed(), summary.total)]
    Aborted {
        cause: FatalError,
        summary: Box<crate::model::BatchSummary>,
    },
}
