use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::OpenNeuroError;
use crate::prompt::CredentialProvider;

pub const DEFAULT_BASE_URL: &str = "https://openneuro.org/";
pub const CONFIG_FILE_NAME: &str = ".openneuro";
pub const LOGIN_HINT: &str =
    "🙏 Please login to your OpenNeuro account and go to: My Account → Obtain an API Key";
pub const API_KEY_PROMPT: &str = "OpenNeuro API key (input hidden): ";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credentials {
    #[serde(default = "default_base_url")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    #[serde(default, rename = "errorReporting")]
    pub error_reporting: bool,
}

impl Credentials {
    pub fn new(apikey: String) -> Self {
        Self {
            url: default_base_url(),
            apikey: Some(apikey),
            error_reporting: false,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// The credential file written by `openneuro login`.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.openneuro`.
    pub fn new() -> Result<Self, OpenNeuroError> {
        let home = BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or_else(|| {
                OpenNeuroError::Filesystem("unable to resolve home directory".to_string())
            })?;
        Ok(Self::with_path(home.join(CONFIG_FILE_NAME)))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Asks `provider` for an API key and writes a fresh credential file,
    /// replacing any previous one. The file ends up owner-read-only.
    pub fn init(&self, provider: &dyn CredentialProvider) -> Result<Credentials, OpenNeuroError> {
        let apikey = provider.api_key(API_KEY_PROMPT)?;
        let credentials = Credentials::new(apikey);
        self.write(&credentials)?;
        info!(path = %self.path.display(), "wrote OpenNeuro credentials");
        Ok(credentials)
    }

    pub fn load(&self) -> Result<Credentials, OpenNeuroError> {
        let content =
            fs::read_to_string(&self.path).map_err(|err| OpenNeuroError::ConfigRead {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        serde_json::from_str(&content).map_err(|err| OpenNeuroError::ConfigParse(err.to_string()))
    }

    pub fn token(&self) -> Result<String, OpenNeuroError> {
        if !self.exists() {
            return Err(OpenNeuroError::MissingCredentials(self.path.clone()));
        }
        self.load()?
            .apikey
            .ok_or_else(|| OpenNeuroError::MissingApiKey(self.path.clone()))
    }

    /// Like [`token`](Self::token), but treats a missing file as anonymous access.
    pub fn token_if_configured(&self) -> Result<Option<String>, OpenNeuroError> {
        if !self.exists() {
            debug!(path = %self.path.display(), "no credential file, downloading anonymously");
            return Ok(None);
        }
        self.token().map(Some)
    }

    fn write(&self, credentials: &Credentials) -> Result<(), OpenNeuroError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|err| self.write_error(err))?;

        let content = serde_json::to_vec(credentials).map_err(|err| self.write_error(err))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".openneuro")
            .tempfile_in(&parent)
            .map_err(|err| self.write_error(err))?;
        temp.write_all(&content).map_err(|err| self.write_error(err))?;
        temp.flush().map_err(|err| self.write_error(err))?;

        allow_replace(&self.path).map_err(|err| self.write_error(err))?;
        temp.persist(&self.path).map_err(|err| self.write_error(err))?;

        restrict_to_owner_read(&self.path).map_err(|err| self.write_error(err))
    }

    fn write_error(&self, err: impl fmt::Display) -> OpenNeuroError {
        OpenNeuroError::ConfigWrite {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

/// A rename replaces a read-only file on unix; the old file stays in place
/// until then.
#[cfg(unix)]
fn allow_replace(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Replacing a read-only file fails elsewhere, so a previous login's file is
/// made writable first.
#[cfg(not(unix))]
fn allow_replace(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut permissions = fs::metadata(path)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)
}

#[cfg(unix)]
fn restrict_to_owner_read(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn restrict_to_owner_read(path: &Path) -> std::io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}
