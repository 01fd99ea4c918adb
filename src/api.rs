use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::DEFAULT_BASE_URL;
use crate::domain::{DatasetId, SnapshotTag};
use crate::error::OpenNeuroError;

const DATASET_QUERY: &str = r#"
query dataset($datasetId: ID!) {
  dataset(id: $datasetId) {
    id
    latestSnapshot { tag }
    snapshots { tag }
  }
}
"#;

const FILES_QUERY: &str = r#"
query snapshotFiles($datasetId: ID!, $tag: String!, $tree: String) {
  snapshot(datasetId: $datasetId, tag: $tag) {
    files(tree: $tree) {
      id
      key
      filename
      size
      directory
      urls
    }
  }
}
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSnapshots {
    pub tags: Vec<SnapshotTag>,
    pub latest: Option<SnapshotTag>,
}

impl DatasetSnapshots {
    pub fn contains(&self, tag: &SnapshotTag) -> bool {
        self.tags.iter().any(|candidate| candidate == tag)
    }
}

/// One entry of a snapshot's file tree. Directories carry the tree `key`
/// used to list their children.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFile {
    pub id: String,
    #[serde(default)]
    pub key: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub urls: Vec<String>,
}

pub trait SnapshotApi: Send + Sync {
    fn snapshots(&self, dataset: &DatasetId) -> Result<DatasetSnapshots, OpenNeuroError>;
    fn files(
        &self,
        dataset: &DatasetId,
        tag: &SnapshotTag,
        tree: Option<&str>,
    ) -> Result<Vec<RemoteFile>, OpenNeuroError>;
}

#[derive(Clone)]
pub struct OpenNeuroHttpClient {
    client: Client,
    graphql_url: String,
}

impl OpenNeuroHttpClient {
    pub fn new(base_url: Option<&str>, token: Option<&str>) -> Result<Self, OpenNeuroError> {
        let client = build_http_client(token, Duration::from_secs(30))?;
        Ok(Self {
            client,
            graphql_url: graphql_url(base_url.unwrap_or(DEFAULT_BASE_URL)),
        })
    }

    pub fn graphql_url(&self) -> &str {
        &self.graphql_url
    }

    fn query<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, OpenNeuroError> {
        let body = json!({ "query": query, "variables": variables });
        debug!(url = %self.graphql_url, "graphql request");
        let response = self.send_with_retries(|| self.client.post(&self.graphql_url).json(&body))?;
        let response = Self::handle_status(response)?;
        let payload: GraphqlResponse<T> = response
            .json()
            .map_err(|err| OpenNeuroError::ApiHttp(err.to_string()))?;
        payload.into_result()
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, OpenNeuroError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "OpenNeuro request failed".to_string());
        Err(OpenNeuroError::ApiStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, OpenNeuroError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        warn!(status, attempt, "retrying graphql request");
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        warn!(error = %err, attempt, "retrying graphql request");
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(OpenNeuroError::ApiHttp(err.to_string()));
                }
            }
        }
    }
}

impl SnapshotApi for OpenNeuroHttpClient {
    fn snapshots(&self, dataset: &DatasetId) -> Result<DatasetSnapshots, OpenNeuroError> {
        let data: DatasetData = self
            .query(DATASET_QUERY, json!({ "datasetId": dataset.as_str() }))
            .map_err(|err| dataset_lookup_error(dataset, err))?;
        let dataset_node = data
            .dataset
            .ok_or_else(|| OpenNeuroError::DatasetNotFound(dataset.to_string()))?;
        dataset_node.into_snapshots()
    }

    fn files(
        &self,
        dataset: &DatasetId,
        tag: &SnapshotTag,
        tree: Option<&str>,
    ) -> Result<Vec<RemoteFile>, OpenNeuroError> {
        let data: SnapshotData = self.query(
            FILES_QUERY,
            json!({
                "datasetId": dataset.as_str(),
                "tag": tag.as_str(),
                "tree": tree,
            }),
        )?;
        let snapshot = data
            .snapshot
            .ok_or_else(|| OpenNeuroError::SnapshotNotFound {
                dataset: dataset.to_string(),
                tag: tag.to_string(),
            })?;
        Ok(snapshot.files)
    }
}

pub(crate) fn build_http_client(
    token: Option<&str>,
    timeout: Duration,
) -> Result<Client, OpenNeuroError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("openneuro-rs/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| OpenNeuroError::ApiHttp(err.to_string()))?,
    );
    if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
        let mut cookie = HeaderValue::from_str(&format!("accessToken={token}"))
            .map_err(|err| OpenNeuroError::ApiHttp(err.to_string()))?;
        cookie.set_sensitive(true);
        headers.insert(COOKIE, cookie);
    }
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| OpenNeuroError::ApiHttp(err.to_string()))
}

pub fn graphql_url(base_url: &str) -> String {
    format!("{}/crn/graphql", base_url.trim_end_matches('/'))
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

impl<T> GraphqlResponse<T> {
    fn into_result(self) -> Result<T, OpenNeuroError> {
        if !self.errors.is_empty() {
            let message = self
                .errors
                .into_iter()
                .map(|err| err.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(OpenNeuroError::Graphql(message));
        }
        self.data
            .ok_or_else(|| OpenNeuroError::Graphql("response carried no data".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct DatasetData {
    dataset: Option<DatasetNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetNode {
    #[serde(default)]
    latest_snapshot: Option<TagNode>,
    #[serde(default)]
    snapshots: Vec<TagNode>,
}

#[derive(Debug, Deserialize)]
struct TagNode {
    tag: String,
}

impl DatasetNode {
    fn into_snapshots(self) -> Result<DatasetSnapshots, OpenNeuroError> {
        let tags = self
            .snapshots
            .into_iter()
            .map(|node| node.tag.parse())
            .collect::<Result<Vec<SnapshotTag>, OpenNeuroError>>()?;
        let latest = self
            .latest_snapshot
            .map(|node| node.tag.parse())
            .transpose()?;
        Ok(DatasetSnapshots { tags, latest })
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotData {
    snapshot: Option<SnapshotNode>,
}

#[derive(Debug, Deserialize)]
struct SnapshotNode {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

/// An unknown dataset can come back as a GraphQL error instead of a null node.
fn dataset_lookup_error(dataset: &DatasetId, err: OpenNeuroError) -> OpenNeuroError {
    match err {
        OpenNeuroError::Graphql(message) if message.to_lowercase().contains("not found") => {
            debug!(dataset = %dataset, message = %message, "dataset lookup failed");
            OpenNeuroError::DatasetNotFound(dataset.to_string())
        }
        other => other,
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
