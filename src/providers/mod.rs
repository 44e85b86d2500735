//! Resource provider abstraction: the seam between the reconciler and a cloud API.
//!
//! A provider exposes create/describe/update per resource kind plus a bounded
//! readiness wait for asynchronously provisioned kinds. Two implementations
//! ship with the crate: [`memory::MemoryProvider`] for tests and embedding,
//! and [`sandbox::SandboxProvider`], a file-backed simulation the CLI drives.

pub mod memory;
pub mod sandbox;

use crate::core::types::{Attributes, ProviderId, ResourceKind};
use std::time::Duration;
use thiserror::Error;

/// Error codes that mean "the resource you asked for is already there".
pub const ALREADY_EXISTS_CODES: &[&str] = &[
    "BucketAlreadyOwnedByYou",
    "InvalidGroup.Duplicate",
    "TrailAlreadyExistsException",
    "FlowLogAlreadyExists",
    "AlreadyExists",
];

/// A rejection from the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    /// Id of the pre-existing resource, when the provider reports one.
    pub existing_id: Option<ProviderId>,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            existing_id: None,
        }
    }

    /// An already-exists rejection carrying the existing resource's id.
    pub fn already_exists(
        code: impl Into<String>,
        message: impl Into<String>,
        existing_id: impl Into<ProviderId>,
    ) -> Self {
        Self {
            existing_id: Some(existing_id.into()),
            ..Self::new(code, message)
        }
    }

    pub fn is_already_exists(&self) -> bool {
        ALREADY_EXISTS_CODES.contains(&self.code.as_str())
    }
}

/// Why an in-place update could not be performed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("{0} does not support in-place update")]
    Unsupported(ResourceKind),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyStatus {
    Ready,
    TimedOut,
    Failed { reason: String },
}

/// A Ready dependency handed to `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub id: String,
    pub kind: ResourceKind,
    pub provider_id: ProviderId,
}

/// Cloud API adapter.
///
/// Calls are blocking; the reconciler issues them strictly one at a time.
pub trait ResourceProvider {
    /// Create a resource. Dependencies are all Ready and carry their provider ids.
    fn create(
        &mut self,
        kind: ResourceKind,
        attributes: &Attributes,
        dependencies: &[ResolvedDependency],
    ) -> Result<ProviderId, ProviderError>;

    /// Current remote attributes, or `None` if the resource no longer exists.
    fn describe(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> Result<Option<Attributes>, ProviderError>;

    /// Apply mutable attribute changes in place.
    fn update(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> Result<(), UpdateError>;

    /// Block until the resource is usable or `timeout` elapses.
    fn await_ready(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
        timeout: Duration,
    ) -> Result<ReadyStatus, ProviderError>;
}
