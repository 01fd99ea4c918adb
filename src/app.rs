use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info};

use crate::api::{DatasetSnapshots, RemoteFile, SnapshotApi};
use crate::domain::{DatasetDoi, DatasetId, SnapshotTag};
use crate::error::OpenNeuroError;
use crate::filter::FileFilter;
use crate::target::TargetDir;
use crate::transfer::FileTransfer;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub dataset: DatasetId,
    pub tag: Option<SnapshotTag>,
    pub target_dir: Utf8PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    pub dry_run: bool,
    pub verify_size: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verify_size: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Downloaded,
    Resumed,
    Skipped,
    Planned,
}

impl FileAction {
    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::Downloaded => "downloaded",
            FileAction::Resumed => "resumed",
            FileAction::Skipped => "skipped",
            FileAction::Planned => "planned",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub path: String,
    pub size: Option<u64>,
    pub action: FileAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub dataset: String,
    pub tag: String,
    pub target_dir: String,
    pub files: Vec<FileResult>,
    pub bytes_transferred: u64,
    pub finished_at: String,
}

impl DownloadResult {
    pub fn count(&self, action: FileAction) -> usize {
        self.files.iter().filter(|file| file.action == action).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub config_path: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// A selected remote file with its dataset-relative path.
#[derive(Debug, Clone)]
struct PlannedFile {
    path: String,
    size: Option<u64>,
    urls: Vec<String>,
}

#[derive(Clone)]
pub struct App<A: SnapshotApi, T: FileTransfer> {
    api: A,
    transfer: T,
}

impl<A: SnapshotApi, T: FileTransfer> App<A, T> {
    pub fn new(api: A, transfer: T) -> Self {
        Self { api, transfer }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn download(
        &self,
        request: DownloadRequest,
        options: DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, OpenNeuroError> {
        let filter = FileFilter::for_dataset(
            &request.dataset,
            request.include.clone(),
            request.exclude.clone(),
        )?;
        debug!(
            include = ?filter.include_patterns(),
            exclude = ?filter.exclude_patterns(),
            "file filter"
        );

        emit(sink, format!("phase=Resolve; dataset {}", request.dataset));
        let snapshots = self.api.snapshots(&request.dataset)?;
        if let Some(tag) = &request.tag {
            if !snapshots.contains(tag) {
                return Err(OpenNeuroError::SnapshotNotFound {
                    dataset: request.dataset.to_string(),
                    tag: tag.to_string(),
                });
            }
        }

        let target = TargetDir::new(request.target_dir.clone());
        let tag = resolve_tag(&target, &request, &snapshots)?;
        info!(dataset = %request.dataset, tag = %tag, target = %target.root(), "downloading snapshot");

        emit(sink, format!("phase=Prepare; listing files of {tag}"));
        let planned = self.plan(&request.dataset, &tag, &filter, sink)?;
        debug!(files = planned.len(), "selected files");

        if !options.dry_run {
            target.ensure_root()?;
        }

        let mut files = Vec::with_capacity(planned.len());
        let mut bytes_transferred = 0u64;
        for (index, file) in planned.iter().enumerate() {
            let (result, bytes) =
                self.fetch_file(&target, file, options, index + 1, planned.len(), sink)?;
            bytes_transferred += bytes;
            files.push(result);
        }

        emit(
            sink,
            format!(
                "phase=Store; {} files in {}",
                files.len(),
                target.root()
            ),
        );

        Ok(DownloadResult {
            dataset: request.dataset.to_string(),
            tag: tag.to_string(),
            target_dir: target.root().to_string(),
            files,
            bytes_transferred,
            finished_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Walks the snapshot's file tree, listing only directories that can hold
    /// selected files.
    fn plan(
        &self,
        dataset: &DatasetId,
        tag: &SnapshotTag,
        filter: &FileFilter,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<PlannedFile>, OpenNeuroError> {
        let mut planned = Vec::new();
        let mut pending: Vec<(String, Option<String>)> = vec![(String::new(), None)];
        while let Some((prefix, tree)) = pending.pop() {
            emit(sink, "api.request".to_string());
            let start = Instant::now();
            let entries = self.api.files(dataset, tag, tree.as_deref())?;
            emit_timed(sink, "api.response", start.elapsed());

            for entry in entries {
                let path = entry_path(&prefix, &entry);
                if entry.directory {
                    if filter.may_select_below(&path) {
                        let tree = entry.key.clone().unwrap_or_else(|| entry.id.clone());
                        pending.push((path, Some(tree)));
                    }
                } else if filter.selects(&path) {
                    planned.push(PlannedFile {
                        path,
                        size: entry.size,
                        urls: entry.urls,
                    });
                }
            }
        }
        planned.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(planned)
    }

    fn fetch_file(
        &self,
        target: &TargetDir,
        file: &PlannedFile,
        options: DownloadOptions,
        position: usize,
        total: usize,
        sink: &dyn ProgressSink,
    ) -> Result<(FileResult, u64), OpenNeuroError> {
        let result = |action| FileResult {
            path: file.path.clone(),
            size: file.size,
            action,
        };

        if target.is_complete(&file.path, file.size)? {
            emit(sink, format!("file.skip [{position}/{total}] {}", file.path));
            return Ok((result(FileAction::Skipped), 0));
        }
        if options.dry_run {
            return Ok((result(FileAction::Planned), 0));
        }

        let url = file.urls.first().ok_or_else(|| {
            OpenNeuroError::TransferHttp(format!("no download URL for {}", file.path))
        })?;

        let mut offset = target.partial_len(&file.path)?;
        if file.size.is_some_and(|size| offset > size) {
            target.discard_partial(&file.path)?;
            offset = 0;
        }
        emit(
            sink,
            format!("phase=Fetch; [{position}/{total}] {}", file.path),
        );
        let partial = target.partial_path(&file.path)?;
        let start = Instant::now();
        let outcome = self.transfer.fetch(url, partial.as_std_path(), offset)?;
        emit_timed(sink, "transfer.response", start.elapsed());
        let len = outcome.len;
        let action = if offset > 0 && outcome.appended {
            FileAction::Resumed
        } else {
            FileAction::Downloaded
        };

        if options.verify_size {
            if let Some(expected) = file.size {
                if len != expected {
                    if len > expected {
                        target.discard_partial(&file.path)?;
                    }
                    return Err(OpenNeuroError::SizeMismatch {
                        path: file.path.clone(),
                        expected,
                        actual: len,
                    });
                }
            }
        }
        target.finalize(&file.path)?;
        debug!(path = %file.path, bytes = len, action = action.as_str(), "file complete");

        Ok((result(action), outcome.written))
    }
}

/// Picks the snapshot to download, checking any existing download in
/// `target` for the same dataset and revision.
fn resolve_tag(
    target: &TargetDir,
    request: &DownloadRequest,
    snapshots: &DatasetSnapshots,
) -> Result<SnapshotTag, OpenNeuroError> {
    let Some(doi) = target.local_doi()? else {
        if let Some(tag) = &request.tag {
            return Ok(tag.clone());
        }
        return snapshots
            .latest
            .clone()
            .or_else(|| snapshots.tags.last().cloned())
            .ok_or_else(|| OpenNeuroError::SnapshotNotFound {
                dataset: request.dataset.to_string(),
                tag: "latest".to_string(),
            });
    };

    let local = doi
        .parse::<DatasetDoi>()
        .map_err(|_| OpenNeuroError::DatasetMismatch {
            requested: request.dataset.to_string(),
            local: doi.clone(),
        })?;
    if local.dataset != request.dataset {
        return Err(OpenNeuroError::DatasetMismatch {
            requested: request.dataset.to_string(),
            local: local.dataset.to_string(),
        });
    }
    match &request.tag {
        Some(tag) if *tag != local.tag => Err(OpenNeuroError::RevisionExists {
            requested: tag.to_string(),
            local: local.tag.to_string(),
        }),
        _ => {
            debug!(doi = %local, "resuming existing download");
            Ok(local.tag)
        }
    }
}

fn entry_path(prefix: &str, entry: &RemoteFile) -> String {
    let name = entry.filename.trim_matches('/');
    if prefix.is_empty() || name.starts_with(&format!("{prefix}/")) {
        return name.to_string();
    }
    format!("{prefix}/{name}")
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

fn emit_timed(sink: &dyn ProgressSink, event: &str, elapsed: Duration) {
    sink.event(ProgressEvent {
        message: format!("{event} latency_ms={}", elapsed.as_millis()),
        elapsed: Some(elapsed),
    });
}
