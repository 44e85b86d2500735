//! State recorder: load, save (atomic), path derivation.

use super::error::StateError;
use super::types::{ResourceState, StateStore};
use std::path::{Path, PathBuf};

/// Persistence for the logical-id → provider-id mapping.
pub trait StateRecorder {
    fn load(&self) -> Result<StateStore, StateError>;
    fn save(&self, store: &StateStore) -> Result<(), StateError>;
}

impl StateStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            schema: "1.0".to_string(),
            generator: format!("stratus {}", env!("CARGO_PKG_VERSION")),
            updated_at: None,
            resources: indexmap::IndexMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Insert or replace the record for `state.id`.
    pub fn put(&mut self, state: ResourceState) {
        self.resources.insert(state.id.clone(), state);
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the default state path for a plan file (`infra.yaml` → `infra.state.yaml`).
pub fn default_state_path(plan_path: &Path) -> PathBuf {
    plan_path.with_extension("state.yaml")
}

/// YAML state file on local disk.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateRecorder for StateFile {
    /// A missing file is an empty store.
    fn load(&self) -> Result<StateStore, StateError> {
        if !self.path.exists() {
            return Ok(StateStore::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_yaml_ng::from_str(&content).map_err(|e| StateError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn save(&self, store: &StateStore) -> Result<(), StateError> {
        let yaml =
            serde_yaml_ng::to_string(store).map_err(|e| StateError::Serialize(e.to_string()))?;
        write_atomic(&self.path, &yaml)
    }
}

/// Write a file atomically (write to temp, then rename).
pub fn write_atomic(path: &Path, content: &str) -> Result<(), StateError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StateError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    std::fs::write(&tmp_path, content).map_err(|source| StateError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StateError::Write {
        path: path.to_path_buf(),
        source,
    })
}
