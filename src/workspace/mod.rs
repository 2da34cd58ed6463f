// geoinv/src/workspace/mod.rs

//! Persisted object store holding surveys, meshes and result channels.
//!
//! A workspace is read as a snapshot; writes happen inside [`Workspace::edit`],
//! which reloads the file, applies the change and replaces the file atomically.

mod entity;
mod monitoring;

pub use entity::{DataLengthError, Entity, EntityError, Geometry, Values};
pub use monitoring::{monitored_directory_copy, ResultSink};

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension of workspace files.
pub const WORKSPACE_EXTENSION: &str = ".ws.json";

/// File name of a workspace without its extension.
pub fn workspace_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "workspace".to_string());
    match name.strip_suffix(WORKSPACE_EXTENSION) {
        Some(stem) => stem.to_string(),
        None => path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or(name),
    }
}

/// Run artifact beside the workspace: `<dir>/<stem><suffix>`.
pub fn artifact_path(workspace: &Path, suffix: &str) -> PathBuf {
    let directory = workspace
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    directory.join(format!("{}{}", workspace_stem(workspace), suffix))
}

#[derive(Default, Serialize, Deserialize)]
struct WorkspaceDocument {
    entities: Vec<Entity>,
}

#[derive(Clone, Debug)]
pub struct Workspace {
    path: PathBuf,
    entities: Vec<Entity>,
}

impl Workspace {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            entities: Vec::new(),
        }
    }

    pub fn open(path: &Path) -> Result<Self, WorkspaceError> {
        let contents = fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: WorkspaceDocument =
            serde_json::from_str(&contents).map_err(|source| WorkspaceError::Format {
                path: path.to_path_buf(),
                source,
            })?;
        for entity in &document.entities {
            entity.validate().map_err(|source| WorkspaceError::InvalidEntity {
                path: path.to_path_buf(),
                source,
            })?;
        }
        debug!(
            "Opened workspace {} with {} entities",
            path.display(),
            document.entities.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            entities: document.entities,
        })
    }

    /// Scoped read-write window over the file at `path`.
    pub fn edit<T, F>(path: &Path, f: F) -> Result<T, WorkspaceError>
    where
        F: FnOnce(&mut Workspace) -> Result<T, WorkspaceError>,
    {
        let mut workspace = Self::open(path)?;
        let result = f(&mut workspace)?;
        workspace.save()?;
        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn find_entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    pub fn get_entity(&self, name: &str) -> Result<&Entity, WorkspaceError> {
        self.find_entity(name)
            .ok_or_else(|| WorkspaceError::EntityNotFound(name.to_string()))
    }

    pub fn get_entity_mut(&mut self, name: &str) -> Result<&mut Entity, WorkspaceError> {
        self.entities
            .iter_mut()
            .find(|entity| entity.name == name)
            .ok_or_else(|| WorkspaceError::EntityNotFound(name.to_string()))
    }

    /// Entity `name` inside `group`; names are only unique within a group.
    pub fn find_in_group(&self, name: &str, group: &str) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|entity| entity.name == name && entity.group.as_deref() == Some(group))
    }

    pub fn get_in_group(&self, name: &str, group: &str) -> Result<&Entity, WorkspaceError> {
        self.find_in_group(name, group)
            .ok_or_else(|| WorkspaceError::EntityNotFound(format!("{}/{}", group, name)))
    }

    pub fn get_in_group_mut(
        &mut self,
        name: &str,
        group: &str,
    ) -> Result<&mut Entity, WorkspaceError> {
        self.entities
            .iter_mut()
            .find(|entity| entity.name == name && entity.group.as_deref() == Some(group))
            .ok_or_else(|| WorkspaceError::EntityNotFound(format!("{}/{}", group, name)))
    }

    pub fn entities_in_group(&self, group: &str) -> impl Iterator<Item = &Entity> {
        let group = group.to_string();
        self.entities
            .iter()
            .filter(move |entity| entity.group.as_deref() == Some(group.as_str()))
    }

    /// Insert an entity, replacing any entity with the same name and group.
    pub fn add_entity(&mut self, entity: Entity) -> &mut Entity {
        let position = self
            .entities
            .iter()
            .position(|e| e.name == entity.name && e.group == entity.group);
        let index = match position {
            Some(index) => {
                self.entities[index] = entity;
                index
            }
            None => {
                self.entities.push(entity);
                self.entities.len() - 1
            }
        };
        &mut self.entities[index]
    }

    pub fn save(&self) -> Result<(), WorkspaceError> {
        self.save_as(&self.path)
    }

    /// Write through a sibling temp file so readers never see a partial file.
    pub fn save_as(&self, path: &Path) -> Result<(), WorkspaceError> {
        let document = WorkspaceDocument {
            entities: self.entities.clone(),
        };
        let contents =
            serde_json::to_string(&document).map_err(|source| WorkspaceError::Format {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string());
        let staged = path.with_file_name(format!(".{}.partial", file_name));
        fs::write(&staged, contents).map_err(|source| WorkspaceError::Io {
            path: staged.clone(),
            source,
        })?;
        fs::rename(&staged, path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Workspace I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Workspace file {path} is malformed: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Workspace file {path} holds an invalid entity: {source}")]
    InvalidEntity {
        path: PathBuf,
        source: EntityError,
    },
    #[error("Entity '{0}' not found in workspace")]
    EntityNotFound(String),
    #[error("Channel '{channel}' not found on entity '{entity}'")]
    ChannelNotFound { entity: String, channel: String },
    #[error(transparent)]
    DataLengthError(#[from] DataLengthError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(name: &str) -> Entity {
        Entity::new(
            name,
            Geometry::Points {
                vertices: vec![[0.0, 0.0, 0.0]],
            },
        )
    }

    #[test]
    fn test_edit_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.ws.json");
        let mut workspace = Workspace::new(&path);
        workspace.add_entity(points("obs"));
        workspace.save().unwrap();

        Workspace::edit(&path, |ws| {
            ws.get_entity_mut("obs")?.add_data("gz", vec![2.0])?;
            Ok(())
        })
        .unwrap();

        let reopened = Workspace::open(&path).unwrap();
        assert_eq!(reopened.get_entity("obs").unwrap().get_data("gz"), Some(&[2.0][..]));
        assert!(!dir.path().join(".survey.ws.json.partial").exists());
    }

    #[test]
    fn test_failed_edit_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.ws.json");
        let mut workspace = Workspace::new(&path);
        workspace.add_entity(points("obs"));
        workspace.save().unwrap();

        let result = Workspace::edit(&path, |ws| {
            ws.add_entity(points("extra"));
            ws.get_entity("missing").map(|_| ())
        });
        assert!(matches!(result, Err(WorkspaceError::EntityNotFound(_))));
        assert!(Workspace::open(&path).unwrap().find_entity("extra").is_none());
    }

    #[test]
    fn test_open_rejects_short_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.ws.json");
        let contents = r#"{"entities": [{
            "name": "obs",
            "geometry": {"type": "Points", "vertices": [[0,0,0],[1,0,0],[2,0,0]]},
            "data": {"gz": [1.0]}
        }]}"#;
        fs::write(&path, contents).unwrap();
        let result = Workspace::open(&path);
        assert!(matches!(
            result,
            Err(WorkspaceError::InvalidEntity {
                source: EntityError::DataLengthError(_),
                ..
            })
        ));
    }

    #[test]
    fn test_open_rejects_dangling_source_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dc.ws.json");
        let contents = r#"{"entities": [{
            "name": "dc",
            "geometry": {
                "type": "PotentialElectrodes",
                "vertices": [[0,0,0],[1,0,0]],
                "cells": [[0,1],[1,5]],
                "ab_cell_id": [1,1],
                "current_electrodes": "currents"
            }
        }]}"#;
        fs::write(&path, contents).unwrap();
        assert!(matches!(
            Workspace::open(&path),
            Err(WorkspaceError::InvalidEntity {
                source: EntityError::InvalidGeometry { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_lookup_by_group_separates_same_names() {
        let mut workspace = Workspace::new(Path::new("unused.ws.json"));
        workspace.add_entity(points("dc"));
        workspace.add_entity(points("dc").with_group("Inversion"));
        assert!(workspace.find_in_group("dc", "Inversion").is_some());
        assert!(workspace.find_in_group("dc", "Models").is_none());
        assert!(workspace.get_in_group_mut("dc", "Inversion").is_ok());
        assert!(workspace.get_entity("dc").unwrap().group.is_none());
    }

    #[test]
    fn test_artifacts_are_named_after_the_workspace() {
        assert_eq!(workspace_stem(Path::new("/runs/grav.ws.json")), "grav");
        assert_eq!(workspace_stem(Path::new("/runs/grav.json")), "grav");
        assert_eq!(
            artifact_path(Path::new("/runs/grav.ws.json"), ".inversion.log"),
            PathBuf::from("/runs/grav.inversion.log")
        );
    }

    #[test]
    fn test_add_entity_replaces_same_name_and_group() {
        let mut workspace = Workspace::new(Path::new("unused.ws.json"));
        workspace.add_entity(points("Data").with_group("Inversion"));
        workspace.add_entity(points("Data").with_group("Inversion"));
        workspace.add_entity(points("Data"));
        assert_eq!(workspace.entities().len(), 2);
        assert_eq!(workspace.entities_in_group("Inversion").count(), 1);
    }
}
