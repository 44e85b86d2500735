//! File-backed sandbox account.
//!
//! Wraps [`MemoryProvider`] and persists its inventory to YAML after every
//! mutating call, so consecutive CLI runs see the same remote world.

use super::memory::{Inventory, MemoryProvider};
use super::{ProviderError, ReadyStatus, ResolvedDependency, ResourceProvider, UpdateError};
use crate::core::error::StateError;
use crate::core::state;
use crate::core::types::{Attributes, ProviderId, ResourceKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Readiness polls a NAT gateway takes in the sandbox.
const NAT_POLLS: u32 = 3;
/// Readiness polls an instance takes in the sandbox.
const INSTANCE_POLLS: u32 = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct SandboxProvider {
    path: PathBuf,
    inner: MemoryProvider,
}

impl SandboxProvider {
    /// Open the sandbox at `path`; a missing file is an empty account.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let inventory = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
                path: path.clone(),
                source,
            })?;
            serde_yaml_ng::from_str(&content).map_err(|e| StateError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?
        } else {
            Inventory::default()
        };

        let inner = MemoryProvider::from_inventory(inventory)
            .ready_after(ResourceKind::NatGateway, NAT_POLLS)
            .ready_after(ResourceKind::Instance, INSTANCE_POLLS)
            .poll_interval(POLL_INTERVAL);
        tracing::debug!(path = %path.display(), resources = inner.inventory().resources.len(), "sandbox opened");
        Ok(Self { path, inner })
    }

    /// Sandbox path next to a plan file (`infra.yaml` → `infra.sandbox.yaml`).
    pub fn default_path(plan_path: &Path) -> PathBuf {
        plan_path.with_extension("sandbox.yaml")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inventory(&self) -> &Inventory {
        self.inner.inventory()
    }

    pub fn persist(&self) -> Result<(), StateError> {
        let yaml = serde_yaml_ng::to_string(self.inner.inventory())
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        state::write_atomic(&self.path, &yaml)
    }

    fn flush(&self) -> Result<(), ProviderError> {
        self.persist()
            .map_err(|e| ProviderError::new("SandboxWriteFailed", e.to_string()))
    }
}

impl ResourceProvider for SandboxProvider {
    fn create(
        &mut self,
        kind: ResourceKind,
        attributes: &Attributes,
        dependencies: &[ResolvedDependency],
    ) -> Result<ProviderId, ProviderError> {
        let result = self.inner.create(kind, attributes, dependencies);
        self.flush()?;
        result
    }

    fn describe(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> Result<Option<Attributes>, ProviderError> {
        self.inner.describe(kind, provider_id)
    }

    fn update(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> Result<(), UpdateError> {
        let result = self.inner.update(kind, provider_id, attributes);
        self.flush()?;
        result
    }

    fn await_ready(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
        timeout: Duration,
    ) -> Result<ReadyStatus, ProviderError> {
        let result = self.inner.await_ready(kind, provider_id, timeout);
        self.flush()?;
        result
    }
}
