use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use tracing::{debug, warn};

use crate::api::build_http_client;
use crate::error::OpenNeuroError;

/// What a finished fetch left on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Final length of the destination file.
    pub len: u64,
    /// Whether the bytes present before the fetch were kept.
    pub appended: bool,
    /// Bytes written during this fetch, across retries.
    pub written: u64,
}

/// Moves the bytes of one remote file onto local disk.
pub trait FileTransfer: Send + Sync {
    /// Writes `url` into `destination`, continuing after the first `offset`
    /// bytes already present there.
    fn fetch(&self, url: &str, destination: &Path, offset: u64)
    -> Result<FetchOutcome, OpenNeuroError>;
}

/// How to treat the response to a (possibly ranged) GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseAction {
    Append,
    Restart,
    Complete,
    Fail { retryable: bool },
}

fn response_action(status: StatusCode, offset: u64) -> ResponseAction {
    match status {
        StatusCode::PARTIAL_CONTENT if offset > 0 => ResponseAction::Append,
        StatusCode::OK | StatusCode::PARTIAL_CONTENT => ResponseAction::Restart,
        // Nothing left past `offset`.
        StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => ResponseAction::Complete,
        _ => ResponseAction::Fail {
            retryable: matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504),
        },
    }
}

#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
    max_attempts: usize,
    retry_delay: Duration,
}

impl HttpTransfer {
    pub fn new(token: Option<&str>) -> Result<Self, OpenNeuroError> {
        Ok(Self {
            client: build_http_client(token, Duration::from_secs(600))?,
            max_attempts: 4,
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// One GET. Sets `restarted` once the destination has been truncated.
    fn attempt(
        &self,
        url: &str,
        destination: &Path,
        offset: u64,
        restarted: &mut bool,
    ) -> Result<u64, AttemptError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let mut response = request.send().map_err(|err| {
            let retryable = err.is_timeout() || err.is_connect() || err.is_request();
            AttemptError::new(OpenNeuroError::TransferHttp(err.to_string()), retryable)
        })?;

        let status = response.status();
        let append = match response_action(status, offset) {
            ResponseAction::Append => true,
            ResponseAction::Restart => {
                if offset > 0 {
                    debug!(url, "server ignored range request, restarting file");
                }
                false
            }
            ResponseAction::Complete => return Ok(offset),
            ResponseAction::Fail { retryable } => {
                return Err(AttemptError::new(
                    OpenNeuroError::TransferStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    },
                    retryable,
                ));
            }
        };

        let mut file = open_destination(destination, append)
            .map_err(|err| AttemptError::fatal(OpenNeuroError::Filesystem(err.to_string())))?;
        if !append {
            *restarted = true;
        }
        io::copy(&mut response, &mut file).map_err(|err| {
            // A broken stream leaves a usable prefix behind.
            AttemptError::new(OpenNeuroError::TransferHttp(err.to_string()), true)
        })?;
        file.sync_all()
            .map_err(|err| AttemptError::fatal(OpenNeuroError::Filesystem(err.to_string())))?;
        file_len(destination).map_err(AttemptError::fatal)
    }
}

impl FileTransfer for HttpTransfer {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        offset: u64,
    ) -> Result<FetchOutcome, OpenNeuroError> {
        let mut current = offset;
        let mut restarted = false;
        let mut written = 0u64;
        let mut attempt = 1usize;
        loop {
            let mut truncated = false;
            let result = self.attempt(url, destination, current, &mut truncated);
            restarted |= truncated;
            let len = match &result {
                Ok(len) => *len,
                Err(_) => file_len(destination).unwrap_or(0),
            };
            written += if truncated {
                len
            } else {
                len.saturating_sub(current)
            };

            match result {
                Ok(len) => {
                    return Ok(FetchOutcome {
                        len,
                        appended: !restarted,
                        written,
                    });
                }
                Err(AttemptError { error, retryable }) => {
                    if !retryable || attempt >= self.max_attempts {
                        return Err(error);
                    }
                    current = len;
                    warn!(url, attempt, offset = current, error = %error, "retrying transfer");
                    thread::sleep(self.retry_delay * attempt as u32);
                    attempt += 1;
                }
            }
        }
    }
}

struct AttemptError {
    error: OpenNeuroError,
    retryable: bool,
}

impl AttemptError {
    fn new(error: OpenNeuroError, retryable: bool) -> Self {
        Self { error, retryable }
    }

    fn fatal(error: OpenNeuroError) -> Self {
        Self::new(error, false)
    }
}

fn open_destination(destination: &Path, append: bool) -> io::Result<File> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(destination)
}

fn file_len(path: &Path) -> Result<u64, OpenNeuroError> {
    std::fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| OpenNeuroError::Filesystem(err.to_string()))
}
