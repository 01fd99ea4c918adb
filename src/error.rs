use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OpenNeuroError {
    #[error(
        "could not read API token as no config file exists at {0}; run `openneuro login` to generate it"
    )]
    #[diagnostic(help("run `openneuro login` and paste the key from My Account → Obtain an API Key"))]
    MissingCredentials(PathBuf),

    #[error(
        "a config file was found at {0}, but it does not contain an \"apikey\" entry; run `openneuro login` to add one"
    )]
    MissingApiKey(PathBuf),

    #[error("failed to read config file at {path}: {message}")]
    ConfigRead { path: PathBuf, message: String },

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to write config file at {path}: {message}")]
    ConfigWrite { path: PathBuf, message: String },

    #[error("API key must not be empty")]
    EmptyApiKey,

    #[error("login aborted")]
    PromptAborted,

    #[error("terminal error: {0}")]
    Terminal(String),

    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid snapshot tag: {0}")]
    InvalidTag(String),

    #[error("invalid DatasetDOI: {0}")]
    InvalidDoi(String),

    #[error("dataset {0} does not exist")]
    DatasetNotFound(String),

    #[error("the requested snapshot with the tag {tag} does not exist for dataset {dataset}")]
    SnapshotNotFound { dataset: String, tag: String },

    #[error(
        "the existing dataset in the target directory ({local}) appears to be different from the one you requested to download ({requested})"
    )]
    #[diagnostic(help("download to a different target directory"))]
    DatasetMismatch { requested: String, local: String },

    #[error(
        "you requested to download revision {requested}, but revision {local} exists locally"
    )]
    #[diagnostic(help("download to a different target directory"))]
    RevisionExists { requested: String, local: String },

    #[error("{0} does not contain \"DatasetDOI\"; cannot verify which dataset it belongs to")]
    #[diagnostic(help("remove the file to resume the download anyway"))]
    MissingDatasetDoi(PathBuf),

    #[error("failed to parse {path}: {message}")]
    MarkerParse { path: PathBuf, message: String },

    #[error("invalid glob pattern {pattern}: {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("OpenNeuro API request failed: {0}")]
    ApiHttp(String),

    #[error("OpenNeuro API returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("OpenNeuro API error: {0}")]
    Graphql(String),

    #[error("file transfer failed: {0}")]
    TransferHttp(String),

    #[error("file server returned status {status} for {url}")]
    TransferStatus { status: u16, url: String },

    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
