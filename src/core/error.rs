//! Error taxonomy for plan loading, per-node reconciliation, and state persistence.

use super::types::{ProviderId, ResourceKind};
use crate::providers::ProviderError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal before any provider call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("resource '{resource}' depends on unknown '{dependency}'")]
    UnknownDependency {
        resource: String,
        dependency: String,
    },

    #[error("duplicate resource id '{0}'")]
    Duplicate(String),

    #[error("{} validation error(s): {}", .0.len(), .0.join("; "))]
    Invalid(Vec<String>),

    #[error("{0}")]
    Parse(String),
}

/// Confined to one node; its dependents are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("immutable change on {kind} requires replacement: {}", .fields.join(", "))]
    ImmutableChange {
        kind: ResourceKind,
        fields: Vec<String>,
    },

    #[error("{kind} {provider_id} not ready after {}s", .timeout.as_secs_f64())]
    ProvisioningTimeout {
        kind: ResourceKind,
        provider_id: ProviderId,
        timeout: Duration,
    },

    #[error("{kind} {provider_id} failed to provision: {reason}")]
    ProvisioningFailed {
        kind: ResourceKind,
        provider_id: ProviderId,
        reason: String,
    },

    #[error("{kind} does not support in-place update")]
    UnsupportedUpdate { kind: ResourceKind },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid state file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("serialize error: {0}")]
    Serialize(String),
}
