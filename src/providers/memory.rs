//! In-memory provider that simulates the remote API.
//!
//! Models the behaviors the reconciler has to cope with: provider-assigned
//! ids, natural-key conflicts, asynchronous readiness and injected failures.
//! Every call is logged so tests can assert exactly what was issued.

use super::{ProviderError, ReadyStatus, ResolvedDependency, ResourceProvider, UpdateError};
use crate::core::schema;
use crate::core::types::{Attributes, ProviderId, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Every resource the simulated account holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub next_serial: u64,
    #[serde(default)]
    pub resources: BTreeMap<ProviderId, RemoteResource>,
}

/// One remote resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub kind: ResourceKind,
    pub attributes: Attributes,
    /// Provider ids of the resources this one was created against
    #[serde(default)]
    pub dependencies: Vec<ProviderId>,
    /// Readiness polls left before the resource becomes available
    #[serde(default)]
    pub pending_polls: u32,
}

/// A call issued against the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create { kind: ResourceKind },
    Describe { kind: ResourceKind, provider_id: ProviderId },
    Update { kind: ResourceKind, provider_id: ProviderId },
    AwaitReady { kind: ResourceKind, provider_id: ProviderId },
}

/// Polls that never complete.
pub const NEVER_READY: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct MemoryProvider {
    inventory: Inventory,
    calls: Vec<ProviderCall>,
    ready_after: HashMap<ResourceKind, u32>,
    poll_interval: Duration,
    create_failures: HashMap<String, ProviderError>,
    update_failures: HashMap<String, ProviderError>,
    describe_failures: HashMap<String, ProviderError>,
    ready_failures: HashMap<String, String>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_inventory(inventory: Inventory) -> Self {
        Self {
            inventory,
            ..Self::default()
        }
    }

    /// Newly created resources of `kind` need `polls` readiness polls.
    pub fn ready_after(mut self, kind: ResourceKind, polls: u32) -> Self {
        self.ready_after.insert(kind, polls);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reject creation of any resource whose `name` attribute is `name`.
    pub fn fail_create(&mut self, name: &str, error: ProviderError) {
        self.create_failures.insert(name.to_string(), error);
    }

    /// Reject updates of the resource whose `name` attribute is `name`.
    pub fn fail_update(&mut self, name: &str, error: ProviderError) {
        self.update_failures.insert(name.to_string(), error);
    }

    /// Fail every describe of the resource whose `name` attribute is `name`.
    pub fn fail_describe(&mut self, name: &str, error: ProviderError) {
        self.describe_failures.insert(name.to_string(), error);
    }

    /// Report the named resource as failed when readiness is awaited.
    pub fn fail_ready(&mut self, name: &str, reason: &str) {
        self.ready_failures
            .insert(name.to_string(), reason.to_string());
    }

    pub fn clear_failures(&mut self) {
        self.create_failures.clear();
        self.update_failures.clear();
        self.describe_failures.clear();
        self.ready_failures.clear();
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn calls(&self) -> &[ProviderCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Create { .. }))
    }

    pub fn updates(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::Update { .. }))
    }

    pub fn get(&self, provider_id: &str) -> Option<&RemoteResource> {
        self.inventory.resources.get(provider_id)
    }

    /// Delete a resource out of band.
    pub fn remove(&mut self, provider_id: &str) -> Option<RemoteResource> {
        self.inventory.resources.remove(provider_id)
    }

    /// Change a remote attribute out of band.
    pub fn tamper(&mut self, provider_id: &str, key: &str, value: serde_json::Value) -> bool {
        match self.inventory.resources.get_mut(provider_id) {
            Some(r) => {
                r.attributes.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    fn find(&self, pred: impl Fn(&RemoteResource) -> bool) -> Option<ProviderId> {
        self.inventory
            .resources
            .iter()
            .find(|(_, r)| pred(r))
            .map(|(id, _)| id.clone())
    }

    fn next_id(&mut self, kind: ResourceKind) -> ProviderId {
        self.inventory.next_serial += 1;
        format!(
            "{}-{:017x}",
            kind.schema().id_prefix,
            self.inventory.next_serial
        )
    }

    /// Conflict with an existing resource sharing the same natural key.
    fn conflict(
        &mut self,
        kind: ResourceKind,
        attributes: &Attributes,
        dependencies: &[ProviderId],
    ) -> Option<Result<ProviderId, ProviderError>> {
        if kind == ResourceKind::FlowLog {
            let traffic = attributes.get("traffic_type");
            let existing = self.find(|r| {
                r.kind == kind
                    && r.attributes.get("traffic_type") == traffic
                    && r.dependencies.first() == dependencies.first()
            })?;
            return Some(Err(ProviderError::already_exists(
                "FlowLogAlreadyExists",
                "a flow log with this configuration already exists for the resource",
                existing,
            )));
        }

        let key = kind.schema().natural_key?;
        let value = attributes.get(key)?;
        let existing = self.find(|r| r.kind == kind && r.attributes.get(key) == Some(value))?;

        let result = match kind {
            // put-metric-alarm overwrites
            ResourceKind::Alarm => {
                if let Some(r) = self.inventory.resources.get_mut(&existing) {
                    r.attributes = attributes.clone();
                }
                Ok(existing)
            }
            ResourceKind::Bucket => Err(ProviderError::already_exists(
                "BucketAlreadyOwnedByYou",
                "your previous request to create the named bucket succeeded and you already own it",
                existing,
            )),
            ResourceKind::SecurityGroup => Err(ProviderError::already_exists(
                "InvalidGroup.Duplicate",
                format!("the security group '{}' already exists", value_str(value)),
                existing,
            )),
            ResourceKind::Trail => Err(ProviderError::already_exists(
                "TrailAlreadyExistsException",
                format!("trail {} already exists", value_str(value)),
                existing,
            )),
            _ => Err(ProviderError::already_exists(
                "AlreadyExists",
                format!("{} already exists", kind),
                existing,
            )),
        };
        Some(result)
    }
}

fn value_str(v: &serde_json::Value) -> String {
    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())
}

fn name_of(attributes: &Attributes) -> Option<&str> {
    attributes.get("name").and_then(|v| v.as_str())
}

fn not_found(kind: ResourceKind, provider_id: &str) -> ProviderError {
    ProviderError::new(
        "NotFound",
        format!("{} {} does not exist", kind, provider_id),
    )
}

impl ResourceProvider for MemoryProvider {
    fn create(
        &mut self,
        kind: ResourceKind,
        attributes: &Attributes,
        dependencies: &[ResolvedDependency],
    ) -> Result<ProviderId, ProviderError> {
        self.calls.push(ProviderCall::Create { kind });

        if let Some(err) = name_of(attributes).and_then(|n| self.create_failures.get(n)) {
            return Err(err.clone());
        }

        for dep in dependencies {
            if !self.inventory.resources.contains_key(&dep.provider_id) {
                return Err(ProviderError::new(
                    "InvalidDependency.NotFound",
                    format!("{} {} does not exist", dep.kind, dep.provider_id),
                ));
            }
        }

        let dep_ids: Vec<ProviderId> = dependencies.iter().map(|d| d.provider_id.clone()).collect();
        if let Some(result) = self.conflict(kind, attributes, &dep_ids) {
            return result;
        }

        let provider_id = match kind {
            ResourceKind::Bucket | ResourceKind::Trail | ResourceKind::Alarm => {
                match schema::natural_id(kind, attributes) {
                    Some(id) => id,
                    None => self.next_id(kind),
                }
            }
            _ => self.next_id(kind),
        };

        let pending_polls = if kind.schema().awaits_ready {
            self.ready_after.get(&kind).copied().unwrap_or(0)
        } else {
            0
        };

        self.inventory.resources.insert(
            provider_id.clone(),
            RemoteResource {
                kind,
                attributes: attributes.clone(),
                dependencies: dep_ids,
                pending_polls,
            },
        );
        Ok(provider_id)
    }

    fn describe(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> Result<Option<Attributes>, ProviderError> {
        self.calls.push(ProviderCall::Describe {
            kind,
            provider_id: provider_id.to_string(),
        });
        let Some(resource) = self
            .inventory
            .resources
            .get(provider_id)
            .filter(|r| r.kind == kind)
        else {
            return Ok(None);
        };
        if let Some(err) = name_of(&resource.attributes).and_then(|n| self.describe_failures.get(n)) {
            return Err(err.clone());
        }
        Ok(Some(resource.attributes.clone()))
    }

    fn update(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> Result<(), UpdateError> {
        self.calls.push(ProviderCall::Update {
            kind,
            provider_id: provider_id.to_string(),
        });

        if kind == ResourceKind::FlowLog {
            return Err(UpdateError::Unsupported(kind));
        }
        if let Some(err) = name_of(attributes).and_then(|n| self.update_failures.get(n)) {
            return Err(err.clone().into());
        }

        let resource = self
            .inventory
            .resources
            .get_mut(provider_id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| not_found(kind, provider_id))?;

        let changed = schema::changed_fields(attributes, &resource.attributes);
        if !schema::immutable_changes(kind, &changed).is_empty() {
            return Err(UpdateError::Unsupported(kind));
        }
        resource.attributes = attributes.clone();
        Ok(())
    }

    fn await_ready(
        &mut self,
        kind: ResourceKind,
        provider_id: &str,
        timeout: Duration,
    ) -> Result<ReadyStatus, ProviderError> {
        self.calls.push(ProviderCall::AwaitReady {
            kind,
            provider_id: provider_id.to_string(),
        });
        // No deadline when the timeout is too large to represent.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let resource = self
                .inventory
                .resources
                .get_mut(provider_id)
                .filter(|r| r.kind == kind)
                .ok_or_else(|| not_found(kind, provider_id))?;

            if let Some(reason) = name_of(&resource.attributes).and_then(|n| self.ready_failures.get(n)) {
                return Ok(ReadyStatus::Failed {
                    reason: reason.clone(),
                });
            }
            if resource.pending_polls == 0 {
                return Ok(ReadyStatus::Ready);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(ReadyStatus::TimedOut);
            }
            if resource.pending_polls != NEVER_READY {
                resource.pending_polls -= 1;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
