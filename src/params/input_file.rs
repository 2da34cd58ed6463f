// geoinv/src/params/input_file.rs

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A ui.json parameter file.
///
/// Entries are either plain values or UI forms carrying a `value` next to
/// presentation metadata. The raw document is kept so that it can be written
/// back with only the values changed.
#[derive(Clone, Debug)]
pub struct InputFile {
    path: PathBuf,
    ui: Map<String, Value>,
}

impl InputFile {
    pub fn read(path: &Path) -> Result<Self, InputFileError> {
        let contents = fs::read_to_string(path).map_err(|source| InputFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: Value =
            serde_json::from_str(&contents).map_err(|source| InputFileError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        match document {
            Value::Object(ui) => Ok(Self {
                path: path.to_path_buf(),
                ui,
            }),
            _ => Err(InputFileError::NotAnObject(path.to_path_buf())),
        }
    }

    pub fn from_map(path: &Path, ui: Map<String, Value>) -> Self {
        Self {
            path: path.to_path_buf(),
            ui,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the file, used to resolve relative references.
    pub fn directory(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn resolve(&self, reference: &Path) -> PathBuf {
        if reference.is_absolute() {
            reference.to_path_buf()
        } else {
            self.directory().join(reference)
        }
    }

    pub fn ui(&self) -> &Map<String, Value> {
        &self.ui
    }

    /// Flattened key -> value mapping with UI forms resolved.
    pub fn data(&self) -> Map<String, Value> {
        self.ui
            .iter()
            .map(|(key, entry)| (key.clone(), Self::form_value(entry)))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.ui.get(key).map(Self::form_value)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    /// Set a value, preserving the surrounding UI form when there is one.
    pub fn set_value(&mut self, key: &str, value: Value) {
        match self.ui.get_mut(key) {
            Some(Value::Object(form)) if form.contains_key("value") => {
                if form.contains_key("enabled") {
                    form.insert("enabled".to_string(), Value::Bool(!value.is_null()));
                }
                if form.contains_key("isValue") {
                    form.insert("isValue".to_string(), Value::Bool(true));
                }
                form.insert("value".to_string(), value);
            }
            _ => {
                self.ui.insert(key.to_string(), value);
            }
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), InputFileError> {
        let contents = serde_json::to_string_pretty(&Value::Object(self.ui.clone())).map_err(
            |source| InputFileError::Json {
                path: path.to_path_buf(),
                source,
            },
        )?;
        fs::write(path, contents).map_err(|source| InputFileError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn form_value(entry: &Value) -> Value {
        let form = match entry {
            Value::Object(form) if form.contains_key("value") => form,
            _ => return entry.clone(),
        };
        if matches!(form.get("enabled"), Some(Value::Bool(false))) {
            return Value::Null;
        }
        if matches!(form.get("isValue"), Some(Value::Bool(false))) {
            return form.get("property").cloned().unwrap_or(Value::Null);
        }
        form.get("value").cloned().unwrap_or(Value::Null)
    }
}

#[derive(Error, Debug)]
pub enum InputFileError {
    #[error("Could not read or write input file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed input file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Input file {0} must contain a JSON object")]
    NotAnObject(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> InputFile {
        let ui = json!({
            "title": "Gravity inversion",
            "inversion_type": "gravity",
            "tile_spatial": {"label": "Tiles", "value": 4, "min": 1},
            "gz_uncertainty": {"label": "Uncertainty", "value": 0.5, "isValue": false, "property": "gz_std"},
            "starting_model": {"label": "Start", "value": 1e-4, "isValue": true, "property": "density"},
            "reference_model": {"label": "Ref", "value": 0.0, "optional": true, "enabled": false},
        });
        match ui {
            Value::Object(map) => InputFile::from_map(Path::new("/tmp/params.ui.json"), map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_forms_flatten_to_values() {
        let data = sample().data();
        assert_eq!(data["inversion_type"], json!("gravity"));
        assert_eq!(data["tile_spatial"], json!(4));
        assert_eq!(data["gz_uncertainty"], json!("gz_std"));
        assert_eq!(data["starting_model"], json!(1e-4));
        assert_eq!(data["reference_model"], Value::Null);
    }

    #[test]
    fn test_set_value_keeps_form_metadata() {
        let mut file = sample();
        file.set_value("tile_spatial", json!(8));
        file.set_value("reference_model", json!(0.25));
        file.set_value("line_id", json!(3));
        assert_eq!(file.ui()["tile_spatial"]["label"], json!("Tiles"));
        assert_eq!(file.get("tile_spatial"), Some(json!(8)));
        assert_eq!(file.get("reference_model"), Some(json!(0.25)));
        assert_eq!(file.get("line_id"), Some(json!(3)));
    }

    #[test]
    fn test_write_then_read_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.ui.json");
        let mut file = sample();
        file.set_value("tile_spatial", json!(2));
        file.write(&path).unwrap();
        let reread = InputFile::read(&path).unwrap();
        assert_eq!(reread.get("tile_spatial"), Some(json!(2)));
        assert_eq!(reread.directory(), dir.path());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ui.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            InputFile::read(&path),
            Err(InputFileError::Json { .. })
        ));
    }
}
