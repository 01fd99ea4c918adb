use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OpenNeuroError;

static DOI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^10\.\d{4,9}/openneuro\.(ds\d{6})\.v(\S+)$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = OpenNeuroError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let digits = normalized.strip_prefix("ds").unwrap_or_default();
        let is_valid = digits.len() == 6 && digits.chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(OpenNeuroError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Immutable version identifier of a dataset, e.g. `1.0.0` or `00001`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotTag(String);

impl SnapshotTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotTag {
    type Err = OpenNeuroError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && !trimmed
                .chars()
                .any(|ch| ch.is_whitespace() || ch == '/' || ch == '\\');
        if !is_valid {
            return Err(OpenNeuroError::InvalidTag(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Identity of a downloaded snapshot as recorded in `dataset_description.json`.
///
/// OpenNeuro mints DOIs of the form `10.18112/openneuro.<dataset>.v<tag>`;
/// some datasets carry the same value with a leading `doi:` scheme marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDoi {
    pub dataset: DatasetId,
    pub tag: SnapshotTag,
}

impl DatasetDoi {
    pub fn to_doi_string(&self) -> String {
        format!("10.18112/openneuro.{}.v{}", self.dataset, self.tag)
    }
}

impl fmt::Display for DatasetDoi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_doi_string())
    }
}

impl FromStr for DatasetDoi {
    type Err = OpenNeuroError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let stripped = strip_doi_prefix(value);
        let captures = DOI_RE
            .captures(stripped)
            .ok_or_else(|| OpenNeuroError::InvalidDoi(value.to_string()))?;
        Ok(Self {
            dataset: captures[1].parse()?,
            tag: captures[2].parse()?,
        })
    }
}

pub fn strip_doi_prefix(value: &str) -> &str {
    let trimmed = value.trim();
    match trimmed.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("doi:") => trimmed[4..].trim_start(),
        _ => trimmed,
    }
}
