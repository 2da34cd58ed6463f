// geoinv/src/workspace/monitoring.rs

use super::{Workspace, WorkspaceError};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stage a copy of `workspace` in `directory` and publish it under a
/// timestamped name once complete. Watchers only ever see whole files.
pub fn monitored_directory_copy(
    directory: &Path,
    workspace: &Path,
) -> Result<PathBuf, WorkspaceError> {
    let file_name = workspace
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "workspace".to_string());
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let staged = directory.join(format!(".{}.staged", file_name));
    let published = directory.join(format!("{}_{}", stamp, file_name));
    fs::copy(workspace, &staged).map_err(|source| WorkspaceError::Io {
        path: staged.clone(),
        source,
    })?;
    fs::rename(&staged, &published).map_err(|source| WorkspaceError::Io {
        path: published.clone(),
        source,
    })?;
    info!("Results published to {}", published.display());
    Ok(published)
}

/// Destination of run outputs: the workspace file, optionally mirrored into
/// a host application's monitoring directory by [`ResultSink::publish`].
#[derive(Clone, Debug)]
pub struct ResultSink {
    workspace: PathBuf,
    monitoring_directory: Option<PathBuf>,
}

impl ResultSink {
    pub fn new(workspace: &Path, monitoring_directory: Option<&Path>) -> Self {
        let monitoring_directory = match monitoring_directory {
            Some(directory) if directory.is_dir() => Some(directory.to_path_buf()),
            Some(directory) => {
                warn!(
                    "Monitoring directory {} does not exist; writing results in place",
                    directory.display()
                );
                None
            }
            None => None,
        };
        Self {
            workspace: workspace.to_path_buf(),
            monitoring_directory,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Apply `f` to the workspace file in place.
    pub fn write<T, F>(&self, f: F) -> Result<T, WorkspaceError>
    where
        F: FnOnce(&mut Workspace) -> Result<T, WorkspaceError>,
    {
        Workspace::edit(&self.workspace, f)
    }

    /// Copy the workspace into the monitoring directory, if any. Called
    /// once per completed step of a run, not per write.
    pub fn publish(&self) -> Result<Option<PathBuf>, WorkspaceError> {
        match &self.monitoring_directory {
            Some(directory) => monitored_directory_copy(directory, &self.workspace).map(Some),
            None => Ok(None),
        }
    }
}
