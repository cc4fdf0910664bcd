use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IdError {
    #[snafu(display("id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

/// Failure while replacing a file through a temp file and rename.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AtomicWriteError {
    #[snafu(display("failed to create directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace file from {from:?} to {to:?} on `{stage}`: {source}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("failed to read snapshot at {path:?} on `{stage}`: {source}"))]
    ReadSnapshot {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse snapshot at {path:?} on `{stage}`: {source}"))]
    ParseSnapshot {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("failed to serialize snapshot on `{stage}`: {source}"))]
    SerializeSnapshot {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to save snapshot on `{stage}`: {source}"))]
    SaveSnapshot {
        stage: &'static str,
        source: AtomicWriteError,
    },
}

pub type IdResult<T> = Result<T, IdError>;
pub type StoreResult<T> = Result<T, StoreError>;
