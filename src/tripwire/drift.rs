//! Drift detection: compare recorded snapshots to what the provider reports.

use crate::core::schema;
use crate::core::types::{ResourceKind, ResourceStatus, StateStore};
use crate::providers::{ProviderError, ResourceProvider};
use crate::tripwire::hasher;

/// A single drift finding.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub provider_id: String,
    pub expected_hash: String,
    pub actual_hash: String,
    /// Attribute keys that differ; empty when the resource is missing
    pub fields: Vec<String>,
    pub detail: String,
}

/// Describe every Ready resource and report those that no longer match.
pub fn detect_drift(
    store: &StateStore,
    provider: &mut dyn ResourceProvider,
) -> Result<Vec<DriftFinding>, ProviderError> {
    let mut findings = Vec::new();

    for (id, rs) in &store.resources {
        if rs.status != ResourceStatus::Ready {
            continue;
        }
        let Some(ref pid) = rs.provider_id else {
            continue;
        };

        match provider.describe(rs.kind, pid)? {
            None => findings.push(DriftFinding {
                resource_id: id.clone(),
                kind: rs.kind,
                provider_id: pid.clone(),
                expected_hash: rs.hash.clone(),
                actual_hash: "MISSING".to_string(),
                fields: Vec::new(),
                detail: format!("{} {} no longer exists", rs.kind, pid),
            }),
            Some(remote) => {
                let fields = schema::changed_fields(&rs.attributes, &remote);
                if fields.is_empty() {
                    continue;
                }
                findings.push(DriftFinding {
                    resource_id: id.clone(),
                    kind: rs.kind,
                    provider_id: pid.clone(),
                    expected_hash: rs.hash.clone(),
                    actual_hash: hasher::hash_attributes(rs.kind, &remote),
                    detail: format!("{} changed: {}", pid, fields.join(", ")),
                    fields,
                });
            }
        }
    }

    Ok(findings)
}
