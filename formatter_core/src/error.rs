use polars::prelude::PolarsError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use zip::result::ZipError;

/// Failures that stop a scenario. Everything recoverable is reported as a
/// [`crate::models::Diagnostic`] instead.
#[derive(Debug, Error)]
pub enum FormatterError {
    #[error("no partition archives found in {0}")]
    NoPartitions(PathBuf),

    #[error("partition {path} could not be read: {source}")]
    Partition {
        path: PathBuf,
        #[source]
        source: ZipError,
    },

    #[error("unknown object category '{0}'")]
    UnknownCategory(String),

    #[error("unknown timescale '{0}'")]
    UnknownTimescale(String),

    #[error("no normalizer registered for {0}")]
    MissingNormalizer(String),

    #[error("invalid partition pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Zip(#[from] ZipError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FormatterError>;
