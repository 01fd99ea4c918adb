use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use openneuro::api::{DatasetSnapshots, RemoteFile, SnapshotApi};
use openneuro::app::{App, DownloadOptions, DownloadRequest, FileAction};
use openneuro::domain::{DatasetId, SnapshotTag};
use openneuro::error::OpenNeuroError;
use openneuro::output::JsonOutput;
use openneuro::transfer::{FetchOutcome, FileTransfer};

const FILE_HOST: &str = "https://files.mock.test";

fn body(dataset: &str, tag: &str, path: &str) -> Vec<u8> {
    if path == "dataset_description.json" {
        return format!(
            r#"{{"Name": "mock", "BIDSVersion": "1.8.0", "DatasetDOI": "doi:10.18112/openneuro.{dataset}.v{tag}"}}"#
        )
        .into_bytes();
    }
    format!("{path} of {dataset} at {tag}\n").into_bytes()
}

struct MockApi {
    tags: Vec<&'static str>,
    size_skew: u64,
    listed: Mutex<Vec<Option<String>>>,
}

impl MockApi {
    fn new() -> Self {
        Self {
            tags: vec!["00001", "1.0.0", "1.1.0"],
            size_skew: 0,
            listed: Mutex::new(Vec::new()),
        }
    }

    fn listed(&self) -> Vec<Option<String>> {
        self.listed.lock().unwrap().clone()
    }

    fn entry(&self, dataset: &str, tag: &str, dir: &str, name: &str) -> RemoteFile {
        let path = if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        };
        let size = body(dataset, tag, &path).len() as u64 + self.size_skew;
        RemoteFile {
            id: format!("id-{path}"),
            key: None,
            filename: name.to_string(),
            size: Some(size),
            directory: false,
            urls: vec![format!("{FILE_HOST}/{dataset}/{tag}/{path}")],
        }
    }

    fn directory(name: &str, key: &str) -> RemoteFile {
        RemoteFile {
            id: format!("id-{name}"),
            key: Some(key.to_string()),
            filename: name.to_string(),
            size: None,
            directory: true,
            urls: Vec::new(),
        }
    }
}

impl SnapshotApi for MockApi {
    fn snapshots(&self, dataset: &DatasetId) -> Result<DatasetSnapshots, OpenNeuroError> {
        if dataset.as_str() == "ds999999" {
            return Err(OpenNeuroError::DatasetNotFound(dataset.to_string()));
        }
        let tags = self
            .tags
            .iter()
            .map(|tag| tag.parse::<SnapshotTag>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DatasetSnapshots {
            latest: tags.last().cloned(),
            tags,
        })
    }

    fn files(
        &self,
        dataset: &DatasetId,
        tag: &SnapshotTag,
        tree: Option<&str>,
    ) -> Result<Vec<RemoteFile>, OpenNeuroError> {
        self.listed.lock().unwrap().push(tree.map(str::to_string));
        let (ds, tag) = (dataset.as_str(), tag.as_str());
        let entries = match tree {
            None => vec![
                self.entry(ds, tag, "", "CHANGES"),
                self.entry(ds, tag, "", "dataset_description.json"),
                self.entry(ds, tag, "", "participants.tsv"),
                Self::directory("sub-0001", "tree-sub-0001"),
                Self::directory("derivatives", "tree-derivatives"),
            ],
            Some("tree-sub-0001") => vec![Self::directory("meg", "tree-sub-0001-meg")],
            Some("tree-sub-0001-meg") => vec![
                self.entry(ds, tag, "sub-0001/meg", "coordsystem.json"),
                self.entry(ds, tag, "sub-0001/meg", "photo.jpg"),
            ],
            Some("tree-derivatives") => vec![self.entry(ds, tag, "derivatives", "notes.txt")],
            Some(other) => return Err(OpenNeuroError::Graphql(format!("unknown tree {other}"))),
        };
        Ok(entries)
    }
}

/// Serves `body` for each URL; with `ignore_range` it answers like a server
/// that does not support range requests.
#[derive(Default)]
struct MockTransfer {
    ignore_range: bool,
    calls: Mutex<Vec<(String, u64)>>,
}

impl MockTransfer {
    fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl FileTransfer for MockTransfer {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        offset: u64,
    ) -> Result<FetchOutcome, OpenNeuroError> {
        self.calls.lock().unwrap().push((url.to_string(), offset));
        let rest = url
            .strip_prefix(&format!("{FILE_HOST}/"))
            .ok_or_else(|| OpenNeuroError::TransferStatus {
                status: 404,
                url: url.to_string(),
            })?;
        let mut parts = rest.splitn(3, '/');
        let (dataset, tag, path) = (
            parts.next().unwrap(),
            parts.next().unwrap(),
            parts.next().unwrap(),
        );
        let content = body(dataset, tag, path);
        let start = if self.ignore_range { 0 } else { offset as usize };

        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(start > 0)
            .truncate(start == 0)
            .open(destination)
            .unwrap();
        file.write_all(&content[start..]).unwrap();
        Ok(FetchOutcome {
            len: content.len() as u64,
            appended: start > 0,
            written: (content.len() - start) as u64,
        })
    }
}

fn target_dir(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join("ds000001")).unwrap()
}

fn request(target_dir: &Utf8PathBuf, tag: Option<&str>) -> DownloadRequest {
    DownloadRequest {
        dataset: "ds000001".parse().unwrap(),
        tag: tag.map(|value| value.parse().unwrap()),
        target_dir: target_dir.clone(),
        include: Vec::new(),
        exclude: Vec::new(),
    }
}

fn app() -> App<MockApi, MockTransfer> {
    App::new(MockApi::new(), MockTransfer::default())
}

fn read(target_dir: &Utf8PathBuf, path: &str) -> String {
    fs::read_to_string(target_dir.join(path).as_std_path()).unwrap()
}

#[test]
fn downloads_latest_snapshot_by_default() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let app = app();

    let result = app
        .download(request(&target, None), DownloadOptions::default(), &JsonOutput)
        .unwrap();

    assert_eq!(result.tag, "1.1.0");
    assert_eq!(result.count(FileAction::Downloaded), 6);
    assert_eq!(
        read(&target, "sub-0001/meg/coordsystem.json"),
        "sub-0001/meg/coordsystem.json of ds000001 at 1.1.0\n"
    );
    assert!(read(&target, "dataset_description.json").contains("openneuro.ds000001.v1.1.0"));
    assert!(!target.join("CHANGES.part").as_std_path().exists());
    let expected: u64 = result.files.iter().filter_map(|file| file.size).sum();
    assert_eq!(result.bytes_transferred, expected);
}

#[test]
fn unknown_tag_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);

    let err = app()
        .download(
            request(&target, Some("abcdefg")),
            DownloadOptions::default(),
            &JsonOutput,
        )
        .unwrap_err();

    assert!(err.to_string().contains("does not exist"));
    assert_matches!(err, OpenNeuroError::SnapshotNotFound { tag, .. } if tag == "abcdefg");
    assert!(!target.as_std_path().exists());
}

#[test]
fn unknown_dataset_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let mut req = request(&target, None);
    req.dataset = "ds999999".parse().unwrap();

    let err = app()
        .download(req, DownloadOptions::default(), &JsonOutput)
        .unwrap_err();
    assert_matches!(err, OpenNeuroError::DatasetNotFound(_));
}

#[test]
fn second_run_skips_complete_files() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let app = app();

    app.download(request(&target, Some("1.0.0")), DownloadOptions::default(), &JsonOutput)
        .unwrap();
    let first_calls = app.transfer().calls();

    let result = app
        .download(request(&target, Some("1.0.0")), DownloadOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(result.count(FileAction::Skipped), 6);
    assert_eq!(result.bytes_transferred, 0);
    assert_eq!(app.transfer().calls(), first_calls);
}

#[test]
fn existing_download_keeps_its_revision() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let app = app();

    let mut first = request(&target, Some("1.0.0"));
    first.include = vec!["CHANGES".to_string()];
    app.download(first, DownloadOptions::default(), &JsonOutput)
        .unwrap();

    let result = app
        .download(request(&target, None), DownloadOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(result.tag, "1.0.0");

    let err = app
        .download(request(&target, Some("00001")), DownloadOptions::default(), &JsonOutput)
        .unwrap_err();
    assert!(err.to_string().contains("revision 1.0.0 exists"));
    assert_matches!(
        err,
        OpenNeuroError::RevisionExists { requested, local }
            if requested == "00001" && local == "1.0.0"
    );
}

#[test]
fn different_dataset_in_target_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    fs::create_dir_all(target.as_std_path()).unwrap();
    fs::write(
        target.join("dataset_description.json").as_std_path(),
        r#"{"Name": "other", "DatasetDOI": "10.18112/openneuro.ds000117.v1.0.0"}"#,
    )
    .unwrap();

    let err = app()
        .download(request(&target, None), DownloadOptions::default(), &JsonOutput)
        .unwrap_err();
    assert!(err.to_string().contains("appears to be different"));
    assert_matches!(
        err,
        OpenNeuroError::DatasetMismatch { requested, local }
            if requested == "ds000001" && local == "ds000117"
    );
}

#[test]
fn marker_without_doi_blocks_resume_until_removed() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let app = app();

    app.download(request(&target, Some("1.0.0")), DownloadOptions::default(), &JsonOutput)
        .unwrap();
    let marker = target.join("dataset_description.json");
    fs::write(marker.as_std_path(), r#"{"Name": "mock"}"#).unwrap();

    let err = app
        .download(request(&target, Some("1.0.0")), DownloadOptions::default(), &JsonOutput)
        .unwrap_err();
    assert!(err.to_string().contains(r#"does not contain "DatasetDOI""#));
    assert_matches!(err, OpenNeuroError::MissingDatasetDoi(_));

    fs::remove_file(marker.as_std_path()).unwrap();
    let result = app
        .download(request(&target, Some("1.0.0")), DownloadOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(result.count(FileAction::Downloaded), 1);
    assert_eq!(result.count(FileAction::Skipped), 5);
}

#[test]
fn partial_file_is_resumed() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let partial = target.join("sub-0001/meg/coordsystem.json.part");
    fs::create_dir_all(partial.parent().unwrap().as_std_path()).unwrap();
    fs::write(partial.as_std_path(), b"sub-").unwrap();
    let app = app();

    let result = app
        .download(request(&target, Some("1.1.0")), DownloadOptions::default(), &JsonOutput)
        .unwrap();

    let coords = result
        .files
        .iter()
        .find(|file| file.path == "sub-0001/meg/coordsystem.json")
        .unwrap();
    assert_eq!(coords.action, FileAction::Resumed);
    assert!(
        app.transfer()
            .calls()
            .iter()
            .any(|(url, offset)| url.ends_with("/1.1.0/sub-0001/meg/coordsystem.json")
                && *offset == 4)
    );
    assert_eq!(
        read(&target, "sub-0001/meg/coordsystem.json"),
        "sub-0001/meg/coordsystem.json of ds000001 at 1.1.0\n"
    );
    assert!(!partial.as_std_path().exists());
}

#[test]
fn ignored_range_counts_as_full_download() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    fs::create_dir_all(target.as_std_path()).unwrap();
    fs::write(target.join("CHANGES.part").as_std_path(), b"CHAN").unwrap();
    let transfer = MockTransfer {
        ignore_range: true,
        ..MockTransfer::default()
    };
    let app = App::new(MockApi::new(), transfer);
    let mut req = request(&target, None);
    req.include = vec!["CHANGES".to_string()];

    let result = app
        .download(req, DownloadOptions::default(), &JsonOutput)
        .unwrap();

    let changes = result
        .files
        .iter()
        .find(|file| file.path == "CHANGES")
        .unwrap();
    assert_eq!(changes.action, FileAction::Downloaded);
    let full = body("ds000001", "1.1.0", "CHANGES").len() as u64;
    let marker = body("ds000001", "1.1.0", "dataset_description.json").len() as u64;
    assert_eq!(result.bytes_transferred, full + marker);
    assert_eq!(read(&target, "CHANGES"), "CHANGES of ds000001 at 1.1.0\n");
}

#[test]
fn include_prunes_tree_listing() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let app = app();
    let mut req = request(&target, None);
    req.include = vec!["sub-0001/meg/*.jpg".to_string()];

    let result = app
        .download(req, DownloadOptions::default(), &JsonOutput)
        .unwrap();

    let paths: Vec<_> = result.files.iter().map(|file| file.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["dataset_description.json", "sub-0001/meg/photo.jpg"]
    );
    let listed = app.api().listed();
    assert!(!listed.contains(&Some("tree-derivatives".to_string())));
    assert!(listed.contains(&Some("tree-sub-0001-meg".to_string())));
}

#[test]
fn root_file_include_lists_only_root() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let app = app();
    let mut req = request(&target, None);
    req.include = vec!["CHANGES".to_string()];

    let result = app
        .download(req, DownloadOptions::default(), &JsonOutput)
        .unwrap();

    assert_eq!(result.files.len(), 2);
    assert_eq!(app.api().listed(), vec![None]);
}

#[test]
fn exclude_skips_matching_files() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let mut req = request(&target, None);
    req.exclude = vec!["*.tsv".to_string(), "derivatives".to_string()];

    let result = app()
        .download(req, DownloadOptions::default(), &JsonOutput)
        .unwrap();
    assert_eq!(result.files.len(), 4);
    assert!(!target.join("participants.tsv").as_std_path().exists());
    assert!(!target.join("derivatives").as_std_path().exists());
}

#[test]
fn dry_run_writes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let app = app();

    let options = DownloadOptions {
        dry_run: true,
        ..DownloadOptions::default()
    };
    let result = app
        .download(request(&target, None), options, &JsonOutput)
        .unwrap();

    assert_eq!(result.count(FileAction::Planned), 6);
    assert!(app.transfer().calls().is_empty());
    assert!(!target.as_std_path().exists());
}

#[test]
fn size_mismatch_is_reported_unless_disabled() {
    let temp = tempfile::tempdir().unwrap();
    let target = target_dir(&temp);
    let api = MockApi {
        size_skew: 10,
        ..MockApi::new()
    };
    let app = App::new(api, MockTransfer::default());

    let err = app
        .download(request(&target, None), DownloadOptions::default(), &JsonOutput)
        .unwrap_err();
    assert_matches!(
        err,
        OpenNeuroError::SizeMismatch { path, expected, actual }
            if path == "CHANGES" && expected == actual + 10
    );

    let options = DownloadOptions {
        verify_size: false,
        ..DownloadOptions::default()
    };
    let result = app
        .download(request(&target, None), options, &JsonOutput)
        .unwrap();
    assert_eq!(result.files.len(), 6);
}
