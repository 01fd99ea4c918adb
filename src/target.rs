use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::domain::strip_doi_prefix;
use crate::error::OpenNeuroError;
use crate::filter::MARKER_FILE;

const PARTIAL_SUFFIX: &str = "part";

/// Local directory a dataset snapshot is downloaded into.
#[derive(Debug, Clone)]
pub struct TargetDir {
    root: Utf8PathBuf,
}

impl TargetDir {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), OpenNeuroError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| OpenNeuroError::Filesystem(err.to_string()))
    }

    pub fn marker_path(&self) -> Utf8PathBuf {
        self.root.join(MARKER_FILE)
    }

    /// Parsed `dataset_description.json`, or `None` when the file is absent.
    pub fn marker(&self) -> Result<Option<Value>, OpenNeuroError> {
        let path = self.marker_path();
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| OpenNeuroError::Filesystem(err.to_string()))?;
        let value = serde_json::from_str(&content).map_err(|err| OpenNeuroError::MarkerParse {
            path: path.clone().into_std_path_buf(),
            message: err.to_string(),
        })?;
        Ok(Some(value))
    }

    /// The marker's `DatasetDOI` with any `doi:` prefix removed. `None` when
    /// there is no marker.
    pub fn local_doi(&self) -> Result<Option<String>, OpenNeuroError> {
        let Some(marker) = self.marker()? else {
            return Ok(None);
        };
        let doi = marker
            .get("DatasetDOI")
            .and_then(Value::as_str)
            .ok_or_else(|| OpenNeuroError::MissingDatasetDoi(self.marker_path().into_std_path_buf()))?;
        Ok(Some(strip_doi_prefix(doi).to_string()))
    }

    /// Local path of a dataset-relative POSIX path. Rejects paths that
    /// would escape the target directory.
    pub fn file_path(&self, relative: &str) -> Result<Utf8PathBuf, OpenNeuroError> {
        let mut path = self.root.clone();
        for part in relative.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(OpenNeuroError::Filesystem(format!(
                        "refusing path outside target directory: {relative}"
                    )));
                }
                part => path.push(part),
            }
        }
        Ok(path)
    }

    pub fn partial_path(&self, relative: &str) -> Result<Utf8PathBuf, OpenNeuroError> {
        let path = self.file_path(relative)?;
        let name = path.file_name().unwrap_or(relative);
        Ok(path.with_file_name(format!("{name}.{PARTIAL_SUFFIX}")))
    }

    /// Whether the file exists with exactly `expected_size` bytes. Without a
    /// known size, existence is enough.
    pub fn is_complete(
        &self,
        relative: &str,
        expected_size: Option<u64>,
    ) -> Result<bool, OpenNeuroError> {
        let path = self.file_path(relative)?;
        let Ok(meta) = fs::metadata(path.as_std_path()) else {
            return Ok(false);
        };
        Ok(meta.is_file() && expected_size.is_none_or(|size| meta.len() == size))
    }

    pub fn partial_len(&self, relative: &str) -> Result<u64, OpenNeuroError> {
        let path = self.partial_path(relative)?;
        Ok(fs::metadata(path.as_std_path())
            .map(|meta| meta.len())
            .unwrap_or(0))
    }

    pub fn discard_partial(&self, relative: &str) -> Result<(), OpenNeuroError> {
        let path = self.partial_path(relative)?;
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| OpenNeuroError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Moves the finished `.part` file into place.
    pub fn finalize(&self, relative: &str) -> Result<Utf8PathBuf, OpenNeuroError> {
        let partial = self.partial_path(relative)?;
        let dest = self.file_path(relative)?;
        if dest.as_std_path().exists() {
            fs::remove_file(dest.as_std_path())
                .map_err(|err| OpenNeuroError::Filesystem(err.to_string()))?;
        }
        fs::rename(partial.as_std_path(), dest.as_std_path())
            .map_err(|err| OpenNeuroError::Filesystem(err.to_string()))?;
        Ok(dest)
    }
}
