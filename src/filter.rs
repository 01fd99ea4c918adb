//! Include/exclude selection of dataset files.
//!
//! Paths are POSIX-style and relative to the dataset root. A pattern selects a
//! file when it matches the file path itself or any of its parent
//! directories, so `sub-0001/anat` selects everything below that directory
//! while `sub-0001/meg/*.jpg` only selects the matching files. `*` never
//! crosses a `/`; use `**` for that.

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

use crate::domain::DatasetId;
use crate::error::OpenNeuroError;

/// Always downloaded so that a later run can verify what the directory holds.
pub const MARKER_FILE: &str = "dataset_description.json";

const DEFAULT_EXCLUDES: &[(&str, &[&str])] = &[(
    "ds000248",
    &["derivatives/freesurfer/subjects/sub-01/mri/aparc+aseg.mgz"],
)];

/// Files known to be broken on the server for a given dataset.
pub fn default_excludes(dataset: &DatasetId) -> &'static [&'static str] {
    DEFAULT_EXCLUDES
        .iter()
        .find(|(id, _)| *id == dataset.as_str())
        .map(|(_, patterns)| *patterns)
        .unwrap_or(&[])
}

#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    include_set: Option<GlobSet>,
    exclude_set: Option<GlobSet>,
}

impl FileFilter {
    /// Matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patterns(include: Vec<String>, exclude: Vec<String>) -> Result<Self, OpenNeuroError> {
        let include = normalize_patterns(include);
        let exclude = normalize_patterns(exclude);
        let include_set = compile(&include)?;
        let exclude_set = compile(&exclude)?;
        Ok(Self {
            include,
            exclude,
            include_set,
            exclude_set,
        })
    }

    /// User patterns plus the dataset's default excludes. A default exclude is
    /// dropped when the user includes exactly that path.
    pub fn for_dataset(
        dataset: &DatasetId,
        include: Vec<String>,
        exclude: Vec<String>,
    ) -> Result<Self, OpenNeuroError> {
        let include = normalize_patterns(include);
        let mut exclude = normalize_patterns(exclude);
        for pattern in default_excludes(dataset) {
            if include.iter().any(|value| value == pattern) {
                continue;
            }
            if !exclude.iter().any(|value| value == pattern) {
                exclude.push(pattern.to_string());
            }
        }
        Self::with_patterns(include, exclude)
    }

    pub fn include_patterns(&self) -> &[String] {
        &self.include
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude
    }

    /// Whether the file at `path` should be downloaded.
    pub fn selects(&self, path: &str) -> bool {
        if path == MARKER_FILE {
            return true;
        }
        let included = match &self.include_set {
            Some(set) => matches_self_or_parent(set, path),
            None => true,
        };
        let excluded = match &self.exclude_set {
            Some(set) => matches_self_or_parent(set, path),
            None => false,
        };
        included && !excluded
    }

    /// Whether any file below directory `dir` could be selected, so listing
    /// it remotely is worthwhile.
    pub fn may_select_below(&self, dir: &str) -> bool {
        if let Some(set) = &self.exclude_set {
            if matches_self_or_parent(set, dir) {
                return false;
            }
        }
        let Some(set) = &self.include_set else {
            return true;
        };
        if matches_self_or_parent(set, dir) {
            return true;
        }
        self.include
            .iter()
            .any(|pattern| pattern_may_descend(pattern, dir))
    }
}

fn normalize_patterns(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|pattern| normalize_pattern(&pattern))
        .filter(|pattern| !pattern.is_empty())
        .collect()
}

fn normalize_pattern(pattern: &str) -> String {
    let mut value = pattern.trim().replace('\\', "/");
    while let Some(rest) = value.strip_prefix("./") {
        value = rest.to_string();
    }
    value.trim_matches('/').to_string()
}

fn compile(patterns: &[String]) -> Result<Option<GlobSet>, OpenNeuroError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(build_glob(pattern)?);
    }
    let set = builder.build().map_err(|err| OpenNeuroError::InvalidGlob {
        pattern: patterns.join(", "),
        reason: err.to_string(),
    })?;
    Ok(Some(set))
}

fn build_glob(pattern: &str) -> Result<Glob, OpenNeuroError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| OpenNeuroError::InvalidGlob {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })
}

fn matches_self_or_parent(set: &GlobSet, path: &str) -> bool {
    if set.is_match(path) {
        return true;
    }
    path.match_indices('/')
        .any(|(index, _)| set.is_match(&path[..index]))
}

/// Component-wise check that `dir` is a possible prefix of paths matched by
/// `pattern`.
fn pattern_may_descend(pattern: &str, dir: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let dir_parts: Vec<&str> = dir.split('/').collect();
    for (index, dir_part) in dir_parts.iter().enumerate() {
        let Some(pattern_part) = pattern_parts.get(index) else {
            return false;
        };
        if pattern_part.contains("**") {
            return true;
        }
        if !has_glob_meta(pattern_part) {
            if pattern_part != dir_part {
                return false;
            }
            continue;
        }
        match Glob::new(pattern_part) {
            Ok(glob) if glob.compile_matcher().is_match(dir_part) => {}
            Ok(_) => return false,
            Err(_) => return true,
        }
    }
    pattern_parts.len() > dir_parts.len()
}

fn has_glob_meta(value: &str) -> bool {
    value
        .chars()
        .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn empty_filter_selects_everything() {
        let filter = FileFilter::new();
        assert!(filter.selects("CHANGES"));
        assert!(filter.selects("sub-01/anat/sub-01_T1w.nii.gz"));
        assert!(filter.may_select_below("derivatives"));
    }

    #[test]
    fn directory_include_selects_children() {
        let filter = FileFilter::with_patterns(strings(&["sub-0001/anat/"]), vec![]).unwrap();
        assert!(filter.selects("sub-0001/anat/sub-0001_T1w.nii.gz"));
        assert!(!filter.selects("sub-0001/meg/sub-0001_meg.json"));
        assert!(!filter.selects("CHANGES"));
    }

    #[test]
    fn marker_is_always_selected() {
        let filter = FileFilter::with_patterns(strings(&["CHANGES"]), vec![]).unwrap();
        assert!(filter.selects(MARKER_FILE));
        assert!(filter.selects("CHANGES"));
        assert!(!filter.selects("README"));
    }

    #[test]
    fn star_does_not_cross_directories() {
        let filter = FileFilter::with_patterns(strings(&["sub-0001/meg/*.jpg"]), vec![]).unwrap();
        assert!(filter.selects("sub-0001/meg/photo.jpg"));
        assert!(!filter.selects("sub-0001/meg/run-1/photo.jpg"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter =
            FileFilter::with_patterns(strings(&["sub-01"]), strings(&["sub-01/**/*.fif"])).unwrap();
        assert!(filter.selects("sub-01/anat/t1.nii.gz"));
        assert!(!filter.selects("sub-01/meg/raw.fif"));
    }

    #[test]
    fn pruning_follows_include_prefixes() {
        let filter = FileFilter::with_patterns(strings(&["sub-*/meg/*.jpg"]), vec![]).unwrap();
        assert!(filter.may_select_below("sub-0001"));
        assert!(filter.may_select_below("sub-0001/meg"));
        assert!(!filter.may_select_below("sub-0001/anat"));
        assert!(!filter.may_select_below("derivatives"));
    }

    #[test]
    fn excluded_directory_is_not_listed() {
        let filter = FileFilter::with_patterns(vec![], strings(&["derivatives"])).unwrap();
        assert!(!filter.may_select_below("derivatives"));
        assert!(!filter.may_select_below("derivatives/freesurfer"));
        assert!(filter.may_select_below("sub-01"));
    }

    #[test]
    fn default_excludes_can_be_overridden() {
        let dataset: DatasetId = "ds000248".parse().unwrap();
        let broken = default_excludes(&dataset)[0];

        let filter = FileFilter::for_dataset(&dataset, vec![], vec![]).unwrap();
        assert_eq!(filter.exclude_patterns(), [broken.to_string()]);
        assert!(!filter.selects(broken));
        assert!(filter.selects("participants.tsv"));

        let filter = FileFilter::for_dataset(&dataset, vec![broken.to_string()], vec![]).unwrap();
        assert_eq!(filter.include_patterns(), [broken.to_string()]);
        assert!(filter.exclude_patterns().is_empty());
        assert!(filter.selects(broken));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = FileFilter::with_patterns(strings(&["sub-[01"]), vec![]).unwrap_err();
        assert_matches!(err, OpenNeuroError::InvalidGlob { .. });
    }
}
