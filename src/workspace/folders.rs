//! Workspace folders and resource resolution

use crate::server::error::ConfigError;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// Stable identifier of a workspace root: its folder URI without a trailing slash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkspaceKey(String);

impl WorkspaceKey {
    pub fn from_uri(uri: &Url) -> Self {
        Self(uri.as_str().trim_end_matches('/').to_string())
    }

    /// Parse a key from user-provided text (settings files, CLI)
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(uri).map_err(|e| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_uri(&url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One open workspace root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceFolder {
    /// Always ends with `/`
    pub uri: Url,
    pub name: String,
}

impl WorkspaceFolder {
    pub fn from_uri(mut uri: Url) -> Self {
        if !uri.path().ends_with('/') {
            let path = format!("{}/", uri.path());
            uri.set_path(&path);
        }
        let name = match uri.to_file_path() {
            Ok(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            Err(()) => uri
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
                .map(str::to_string),
        }
        .unwrap_or_else(|| uri.as_str().to_string());
        Self { uri, name }
    }

    /// Folder for a local directory; relative paths are rejected
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let uri = Url::from_directory_path(path).map_err(|()| ConfigError::InvalidPath {
            path: path.display().to_string(),
            reason: "workspace roots must be absolute directory paths".to_string(),
        })?;
        let mut folder = Self::from_uri(uri);
        if let Some(name) = path.file_name() {
            folder.name = name.to_string_lossy().into_owned();
        }
        Ok(folder)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn key(&self) -> WorkspaceKey {
        WorkspaceKey::from_uri(&self.uri)
    }

    /// Local directory of this folder, for `file:` URIs
    pub fn path(&self) -> Option<PathBuf> {
        self.uri.to_file_path().ok()
    }

    pub fn lsp_uri(&self) -> Result<lsp_types::Uri, ConfigError> {
        self.uri
            .as_str()
            .parse::<lsp_types::Uri>()
            .map_err(|e| ConfigError::InvalidUri {
                uri: self.uri.to_string(),
                reason: e.to_string(),
            })
    }

    /// Whether `resource` is this folder or lies beneath it
    pub fn contains(&self, resource: &Url) -> bool {
        if resource.scheme() != self.uri.scheme()
            || resource.host_str() != self.uri.host_str()
            || resource.port() != self.uri.port()
        {
            return false;
        }

        let root = self.uri.path();
        let path = resource.path();
        path.starts_with(root) || path == root.trim_end_matches('/')
    }
}

/// The set of open workspace roots
#[derive(Debug, Clone, Default)]
pub struct WorkspaceFolders {
    folders: Vec<WorkspaceFolder>,
}

impl WorkspaceFolders {
    pub fn new(folders: impl IntoIterator<Item = WorkspaceFolder>) -> Self {
        let mut set = Self::default();
        for folder in folders {
            set.add(folder);
        }
        set
    }

    /// Returns false if a folder with the same key is already present
    pub fn add(&mut self, folder: WorkspaceFolder) -> bool {
        let key = folder.key();
        if self.get(&key).is_some() {
            return false;
        }
        self.folders.push(folder);
        true
    }

    pub fn remove(&mut self, key: &WorkspaceKey) -> Option<WorkspaceFolder> {
        let index = self.folders.iter().position(|f| &f.key() == key)?;
        Some(self.folders.remove(index))
    }

    pub fn get(&self, key: &WorkspaceKey) -> Option<&WorkspaceFolder> {
        self.folders.iter().find(|f| &f.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkspaceFolder> {
        self.folders.iter()
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Find the folder owning `resource`
    ///
    /// The innermost containing folder wins. When nothing contains the
    /// resource and `fallback_to_sole_root` is set, the only open folder is
    /// used if there is exactly one.
    pub fn resolve(&self, resource: &Url, fallback_to_sole_root: bool) -> Option<&WorkspaceFolder> {
        let owner = self
            .folders
            .iter()
            .filter(|f| f.contains(resource))
            .max_by_key(|f| f.uri.path().len());

        match owner {
            Some(folder) => Some(folder),
            None if fallback_to_sole_root && self.folders.len() == 1 => self.folders.first(),
            None => None,
        }
    }
}
