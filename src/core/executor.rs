//! Reconciler: the orchestration loop for apply.
//!
//! Visits nodes strictly in topological order, one at a time:
//! decide → provider calls → state → events → checkpoint.
//!
//! A node is only attempted when every dependency ended this run Ready.
//! Anything else is skipped with the unmet dependencies listed, so a failure
//! never propagates past its own subtree.

use super::error::NodeError;
use super::planner;
use super::schema;
use super::state::StateRecorder;
use super::types::*;
use crate::providers::{
    ProviderError, ReadyStatus, ResolvedDependency, ResourceProvider, UpdateError,
};
use crate::tripwire::{eventlog, hasher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options for a reconciliation run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Upper bound for each readiness wait
    pub await_timeout: Duration,
    pub failure: FailurePolicy,
    /// Describe Ready resources before deciding
    pub refresh: bool,
    /// Checked between nodes; set it to stop the run early
    pub cancel: Option<Arc<AtomicBool>>,
    /// JSONL provenance log, if any
    pub event_log: Option<PathBuf>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self::from_policy(&Policy::default())
    }
}

impl ApplyOptions {
    /// Options from a plan's policy. The event log path is left to the caller.
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            await_timeout: Duration::from_secs(policy.await_timeout_secs),
            failure: policy.failure,
            refresh: policy.refresh,
            cancel: None,
            event_log: None,
        }
    }
}

pub struct Reconciler<'a> {
    provider: &'a mut dyn ResourceProvider,
    recorder: Option<&'a dyn StateRecorder>,
    options: ApplyOptions,
}

/// Reconcile with default options and no checkpointing.
pub fn apply(plan: &Plan, store: &mut StateStore, provider: &mut dyn ResourceProvider) -> RunReport {
    Reconciler::new(provider).apply(plan, store)
}

impl<'a> Reconciler<'a> {
    pub fn new(provider: &'a mut dyn ResourceProvider) -> Self {
        Self {
            provider,
            recorder: None,
            options: ApplyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Save the store after every node that changed it, and at the end of the run.
    pub fn with_recorder(mut self, recorder: &'a dyn StateRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Run one reconciliation pass over `plan`, mutating `store` in place.
    pub fn apply(&mut self, plan: &Plan, store: &mut StateStore) -> RunReport {
        let start = Instant::now();
        let run_id = eventlog::generate_run_id();
        let _run = tracing::info_span!("apply", run_id = %run_id).entered();
        info!(nodes = plan.len(), "reconciliation started");

        self.log(ProvenanceEvent::RunStarted {
            run_id: run_id.clone(),
            nodes: plan.len() as u32,
            stratus_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let mut nodes = Vec::with_capacity(plan.len());
        let mut ready: HashMap<&str, (ResourceKind, ProviderId)> = HashMap::new();
        let mut halted = false;

        for spec in plan.ordered() {
            let _node = tracing::info_span!("node", id = %spec.id, kind = %spec.kind).entered();
            let node_start = Instant::now();

            let outcome = if halted || self.cancelled() {
                debug!("not attempted: run stopped");
                NodeOutcome::Cancelled
            } else {
                let unmet: Vec<String> = spec
                    .depends_on
                    .iter()
                    .filter(|d| !ready.contains_key(d.as_str()))
                    .cloned()
                    .collect();
                if unmet.is_empty() {
                    let deps: Vec<ResolvedDependency> = spec
                        .depends_on
                        .iter()
                        .filter_map(|d| {
                            ready.get(d.as_str()).map(|(kind, pid)| ResolvedDependency {
                                id: d.clone(),
                                kind: *kind,
                                provider_id: pid.clone(),
                            })
                        })
                        .collect();
                    self.reconcile_node(spec, &deps, store)
                } else {
                    warn!(unmet = %unmet.join(", "), "skipped: unmet dependency");
                    self.log(ProvenanceEvent::NodeSkipped {
                        resource: spec.id.clone(),
                        unmet: unmet.clone(),
                    });
                    NodeOutcome::Skipped { unmet }
                }
            };

            let provider_id = store.get(&spec.id).and_then(|s| s.provider_id.clone());
            let duration = node_start.elapsed();

            match &outcome {
                NodeOutcome::Unchanged => {}
                o if o.is_ready() => {
                    let state = store.get(&spec.id);
                    self.log(ProvenanceEvent::NodeReady {
                        resource: spec.id.clone(),
                        provider_id: provider_id.clone().unwrap_or_default(),
                        outcome: outcome_label(o).to_string(),
                        duration_seconds: duration.as_secs_f64(),
                        hash: state.map(|s| s.hash.clone()).unwrap_or_default(),
                    });
                    self.checkpoint(store);
                }
                NodeOutcome::Failed(e) => {
                    self.log(ProvenanceEvent::NodeFailed {
                        resource: spec.id.clone(),
                        error: e.to_string(),
                    });
                    self.checkpoint(store);
                    if self.options.failure == FailurePolicy::StopOnFirst {
                        warn!("stopping after first failure");
                        halted = true;
                    }
                }
                _ => {}
            }

            if outcome.is_ready() {
                if let Some(ref pid) = provider_id {
                    ready.insert(spec.id.as_str(), (spec.kind, pid.clone()));
                }
            }

            nodes.push(NodeReport {
                resource_id: spec.id.clone(),
                kind: spec.kind,
                provider_id,
                outcome,
                duration,
            });
        }

        let report = RunReport {
            run_id: run_id.clone(),
            nodes,
            total_duration: start.elapsed(),
        };

        self.log(ProvenanceEvent::RunCompleted {
            run_id,
            ready: report.ready(),
            unchanged: report.unchanged(),
            failed: report.failed(),
            skipped: report.skipped(),
            total_seconds: report.total_duration.as_secs_f64(),
        });
        self.checkpoint(store);

        info!(
            ready = report.ready(),
            changed = report.changed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "reconciliation finished"
        );
        report
    }

    fn reconcile_node(
        &mut self,
        spec: &ResourceSpec,
        deps: &[ResolvedDependency],
        store: &mut StateStore,
    ) -> NodeOutcome {
        let mut current = store.get(&spec.id).cloned();

        if self.options.refresh {
            if let Some(rs) = current.as_mut() {
                if let Err(e) = self.refresh(rs) {
                    rs.error = Some(e.to_string());
                    rs.updated_at = Some(eventlog::now_iso8601());
                    store.put(rs.clone());
                    return self.failed(e);
                }
                store.put(rs.clone());
            }
        }

        let action = planner::determine_action(spec, current.as_ref());
        if action != Action::NoOp {
            self.log(ProvenanceEvent::NodeStarted {
                resource: spec.id.clone(),
                kind: spec.kind,
                action: action.to_string(),
            });
        }

        let pid = current.as_ref().and_then(|rs| rs.provider_id.clone());
        match (action, current, pid) {
            (Action::NoOp, ..) => {
                debug!("unchanged");
                NodeOutcome::Unchanged
            }
            (Action::Resume, Some(rs), Some(pid)) => self.resume(spec, rs, &pid, store),
            (Action::Update { fields }, Some(rs), Some(pid)) => {
                self.update(spec, &rs, &pid, &fields, store)
            }
            (Action::Blocked { fields }, ..) => self.failed(NodeError::ImmutableChange {
                kind: spec.kind,
                fields,
            }),
            _ => self.create(spec, deps, store),
        }
    }

    /// Replace a Ready snapshot with what the provider reports.
    fn refresh(&mut self, rs: &mut ResourceState) -> Result<(), NodeError> {
        if rs.status != ResourceStatus::Ready {
            return Ok(());
        }
        let Some(pid) = rs.provider_id.clone() else {
            return Ok(());
        };
        match self.provider.describe(rs.kind, &pid)? {
            None => {
                info!(provider_id = %pid, "vanished remotely; will recreate");
                rs.status = ResourceStatus::Absent;
                rs.provider_id = None;
            }
            Some(remote) if remote != rs.attributes => {
                info!(provider_id = %pid, "remote attributes drifted");
                rs.hash = hasher::hash_attributes(rs.kind, &remote);
                rs.attributes = remote;
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn create(
        &mut self,
        spec: &ResourceSpec,
        deps: &[ResolvedDependency],
        store: &mut StateStore,
    ) -> NodeOutcome {
        let mut rs = snapshot(spec, None, ResourceStatus::Creating);
        store.put(rs.clone());

        info!("creating");
        let pid = match self.provider.create(spec.kind, &spec.attributes, deps) {
            Ok(pid) => pid,
            Err(e) if e.is_already_exists() => {
                let existing = e
                    .existing_id
                    .clone()
                    .or_else(|| schema::natural_id(spec.kind, &spec.attributes));
                return match existing {
                    Some(pid) => {
                        info!(provider_id = %pid, code = %e.code, "already exists; adopting");
                        self.adopt(spec, rs, pid, store)
                    }
                    None => self.record_failure(rs, e.into(), store),
                };
            }
            Err(e) => return self.record_failure(rs, e.into(), store),
        };

        info!(provider_id = %pid, "created");
        rs.provider_id = Some(pid.clone());
        store.put(rs.clone());
        self.checkpoint(store);

        match self.await_ready(spec.kind, &pid) {
            Ok(()) => {
                store.put(snapshot(spec, Some(pid), ResourceStatus::Ready));
                NodeOutcome::Created
            }
            Err(e) => self.record_failure(rs, e, store),
        }
    }

    /// Take over an existing resource, recording what the provider reports
    /// rather than what was asked for, then converge it like any Ready node.
    fn adopt(
        &mut self,
        spec: &ResourceSpec,
        rs: ResourceState,
        pid: ProviderId,
        store: &mut StateStore,
    ) -> NodeOutcome {
        let remote = match self.provider.describe(spec.kind, &pid) {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                let err = ProviderError::new(
                    "NotFound",
                    format!("{} {} reported as existing but cannot be described", spec.kind, pid),
                );
                return self.record_failure(rs, err.into(), store);
            }
            Err(e) => return self.record_failure(rs, e.into(), store),
        };

        let adopted = ResourceState {
            provider_id: Some(pid.clone()),
            hash: hasher::hash_attributes(spec.kind, &remote),
            attributes: remote,
            status: ResourceStatus::Ready,
            updated_at: Some(eventlog::now_iso8601()),
            error: None,
            ..rs
        };
        store.put(adopted.clone());

        match planner::determine_action(spec, Some(&adopted)) {
            Action::Update { fields } => match self.update(spec, &adopted, &pid, &fields, store) {
                NodeOutcome::Updated => NodeOutcome::Adopted,
                other => other,
            },
            Action::Blocked { fields } => {
                let err = NodeError::ImmutableChange {
                    kind: spec.kind,
                    fields,
                };
                let mut rs = adopted;
                rs.error = Some(err.to_string());
                store.put(rs);
                self.failed(err)
            }
            _ => NodeOutcome::Adopted,
        }
    }

    /// Wait again on a resource whose readiness was never confirmed.
    fn resume(
        &mut self,
        spec: &ResourceSpec,
        mut rs: ResourceState,
        pid: &str,
        store: &mut StateStore,
    ) -> NodeOutcome {
        info!(provider_id = %pid, "resuming");
        if let Err(e) = self.await_ready(spec.kind, pid) {
            return self.record_failure(rs, e, store);
        }

        rs.status = ResourceStatus::Ready;
        rs.error = None;
        rs.updated_at = Some(eventlog::now_iso8601());
        store.put(rs.clone());

        match planner::determine_action(spec, Some(&rs)) {
            Action::Update { fields } => self.update(spec, &rs, pid, &fields, store),
            Action::Blocked { fields } => self.failed(NodeError::ImmutableChange {
                kind: spec.kind,
                fields,
            }),
            _ => NodeOutcome::Resumed,
        }
    }

    fn update(
        &mut self,
        spec: &ResourceSpec,
        current: &ResourceState,
        pid: &str,
        fields: &[String],
        store: &mut StateStore,
    ) -> NodeOutcome {
        info!(provider_id = %pid, fields = %fields.join(", "), "updating");
        let err = match self.provider.update(spec.kind, pid, &spec.attributes) {
            Ok(()) => {
                store.put(snapshot(spec, Some(pid.to_string()), ResourceStatus::Ready));
                return NodeOutcome::Updated;
            }
            Err(UpdateError::Unsupported(kind)) => NodeError::UnsupportedUpdate { kind },
            Err(UpdateError::Provider(e)) => NodeError::Provider(e),
        };

        // The remote resource is untouched and still usable.
        let mut rs = current.clone();
        rs.error = Some(err.to_string());
        store.put(rs);
        self.failed(err)
    }

    fn await_ready(&mut self, kind: ResourceKind, pid: &str) -> Result<(), NodeError> {
        if !kind.schema().awaits_ready {
            return Ok(());
        }
        let timeout = self.options.await_timeout;
        info!(provider_id = %pid, timeout_secs = timeout.as_secs_f64(), "waiting for readiness");
        match self.provider.await_ready(kind, pid, timeout)? {
            ReadyStatus::Ready => Ok(()),
            ReadyStatus::TimedOut => Err(NodeError::ProvisioningTimeout {
                kind,
                provider_id: pid.to_string(),
                timeout,
            }),
            ReadyStatus::Failed { reason } => Err(NodeError::ProvisioningFailed {
                kind,
                provider_id: pid.to_string(),
                reason,
            }),
        }
    }

    /// Mark the record Failed, keeping whatever provider id it already has.
    fn record_failure(
        &self,
        mut rs: ResourceState,
        err: NodeError,
        store: &mut StateStore,
    ) -> NodeOutcome {
        rs.status = ResourceStatus::Failed;
        rs.error = Some(err.to_string());
        rs.updated_at = Some(eventlog::now_iso8601());
        store.put(rs);
        self.failed(err)
    }

    fn failed(&self, err: NodeError) -> NodeOutcome {
        warn!(error = %err, "failed");
        NodeOutcome::Failed(err)
    }

    fn cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::SeqCst))
    }

    fn checkpoint(&self, store: &mut StateStore) {
        let Some(recorder) = self.recorder else {
            return;
        };
        store.updated_at = Some(eventlog::now_iso8601());
        if let Err(e) = recorder.save(store) {
            warn!(error = %e, "state checkpoint failed");
        }
    }

    fn log(&self, event: ProvenanceEvent) {
        if let Some(ref path) = self.options.event_log {
            if let Err(e) = eventlog::append_event(path, event) {
                warn!(error = %e, "event log write failed");
            }
        }
    }
}

/// Record of `spec` as desired, with the given provider id and status.
fn snapshot(spec: &ResourceSpec, provider_id: Option<ProviderId>, status: ResourceStatus) -> ResourceState {
    ResourceState {
        id: spec.id.clone(),
        kind: spec.kind,
        provider_id,
        attributes: spec.attributes.clone(),
        hash: hasher::hash_attributes(spec.kind, &spec.attributes),
        status,
        updated_at: Some(eventlog::now_iso8601()),
        error: None,
    }
}

fn outcome_label(outcome: &NodeOutcome) -> &'static str {
    match outcome {
        NodeOutcome::Created => "created",
        NodeOutcome::Adopted => "adopted",
        NodeOutcome::Resumed => "resumed",
        NodeOutcome::Updated => "updated",
        NodeOutcome::Unchanged => "unchanged",
        NodeOutcome::Failed(_) => "failed",
        NodeOutcome::Skipped { .. } => "skipped",
        NodeOutcome::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser;
    use crate::core::state::StateFile;
    use crate::providers::memory::{MemoryProvider, ProviderCall, NEVER_READY};
    use crate::tripwire::eventlog::read_events;

    const NETWORK: &str = r#"
version: "1.0"
name: polystudent
resources:
  - id: vpc
    kind: vpc
    attributes: { cidr_block: 10.0.0.0/16, enable_dns_support: true, name: polystudent-vpc }
  - id: public-a
    kind: subnet
    attributes: { cidr_block: 10.0.0.0/24, availability_zone: us-east-1a, map_public_ip_on_launch: true }
    depends_on: [vpc]
  - id: igw
    kind: internet_gateway
    depends_on: [vpc]
  - id: public-rt
    kind: route_table
    attributes: { destination_cidr_block: 0.0.0.0/0 }
    depends_on: [vpc, igw, public-a]
"#;

    /// Public and private tiers plus an unrelated bucket.
    const TIERED: &str = r#"
version: "1.0"
name: tiered
resources:
  - id: vpc
    kind: vpc
    attributes: { cidr_block: 10.0.0.0/16 }
  - id: public-a
    kind: subnet
    attributes: { cidr_block: 10.0.0.0/24, availability_zone: us-east-1a }
    depends_on: [vpc]
  - id: public-b
    kind: subnet
    attributes: { cidr_block: 10.0.16.0/24, availability_zone: us-east-1b }
    depends_on: [vpc]
  - id: nat-a
    kind: nat_gateway
    attributes: { name: nat-a }
    depends_on: [public-a]
  - id: private-rt
    kind: route_table
    attributes: { destination_cidr_block: 0.0.0.0/0 }
    depends_on: [vpc, nat-a]
  - id: app
    kind: instance
    attributes: { image_id: ami-0ecb62995f68bb549, instance_type: t3.micro }
    depends_on: [public-a, private-rt]
  - id: logs
    kind: bucket
    attributes: { bucket_name: polystudents3, versioning: Enabled }
"#;

    fn load(yaml: &str) -> Plan {
        parser::load_plan(&parser::parse_plan(yaml).unwrap()).unwrap()
    }

    fn pid(store: &StateStore, id: &str) -> String {
        store.get(id).unwrap().provider_id.clone().unwrap()
    }

    #[test]
    fn test_network_all_ready() {
        let plan = load(NETWORK);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();

        let report = apply(&plan, &mut store, &mut provider);

        assert!(report.is_success(), "{:?}", report.nodes);
        let order: Vec<&str> = report.nodes.iter().map(|n| n.resource_id.as_str()).collect();
        assert_eq!(order, vec!["vpc", "public-a", "igw", "public-rt"]);
        assert!(report.nodes.iter().all(|n| n.outcome == NodeOutcome::Created));
        for id in order {
            let rs = store.get(id).unwrap();
            assert_eq!(rs.status, ResourceStatus::Ready);
            assert!(rs.provider_id.is_some());
        }

        let vpc = pid(&store, "vpc");
        let igw = pid(&store, "igw");
        let subnet = pid(&store, "public-a");
        assert_eq!(provider.get(&subnet).unwrap().dependencies, vec![vpc.clone()]);
        assert_eq!(
            provider.get(&pid(&store, "public-rt")).unwrap().dependencies,
            vec![vpc, igw, subnet]
        );
    }

    #[test]
    fn test_second_run_makes_no_calls() {
        let plan = load(NETWORK);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        apply(&plan, &mut store, &mut provider);
        let before = store.clone();
        provider.clear_calls();

        let report = apply(&plan, &mut store, &mut provider);

        assert!(provider.calls().is_empty());
        assert_eq!(report.unchanged(), 4);
        assert_eq!(report.changed(), 0);
        for (id, rs) in &before.resources {
            assert_eq!(store.get(id), Some(rs));
        }
    }

    #[test]
    fn test_failure_skips_dependents_only() {
        let plan = load(TIERED);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        provider.fail_create(
            "nat-a",
            ProviderError::new("InsufficientAddressCapacity", "no Elastic IPs left"),
        );

        let report = apply(&plan, &mut store, &mut provider);

        let outcome = |id: &str| report.get(id).unwrap().outcome.clone();
        assert!(matches!(
            outcome("nat-a"),
            NodeOutcome::Failed(NodeError::Provider(ref e)) if e.code == "InsufficientAddressCapacity"
        ));
        assert_eq!(
            outcome("private-rt"),
            NodeOutcome::Skipped {
                unmet: vec!["nat-a".into()]
            }
        );
        assert_eq!(
            outcome("app"),
            NodeOutcome::Skipped {
                unmet: vec!["private-rt".into()]
            }
        );
        assert_eq!(outcome("public-b"), NodeOutcome::Created);
        assert_eq!(outcome("logs"), NodeOutcome::Created);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 2);
        assert!(!report.is_success());

        let nat = store.get("nat-a").unwrap();
        assert_eq!(nat.status, ResourceStatus::Failed);
        assert!(nat.provider_id.is_none());
        assert!(store.get("private-rt").is_none());
        assert!(!provider
            .calls()
            .contains(&ProviderCall::Create { kind: ResourceKind::RouteTable }));
    }

    #[test]
    fn test_failed_create_retried_next_run() {
        let plan = load(TIERED);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        provider.fail_create("nat-a", ProviderError::new("Throttling", "rate exceeded"));
        apply(&plan, &mut store, &mut provider);

        provider.clear_failures();
        let report = apply(&plan, &mut store, &mut provider);

        assert!(report.is_success());
        assert_eq!(report.get("nat-a").unwrap().outcome, NodeOutcome::Created);
        assert_eq!(report.get("app").unwrap().outcome, NodeOutcome::Created);
        assert_eq!(report.get("logs").unwrap().outcome, NodeOutcome::Unchanged);
    }

    #[test]
    fn test_already_exists_is_adopted() {
        let plan = load(
            r#"
version: "1.0"
name: logs
resources:
  - id: logs
    kind: bucket
    attributes: { bucket_name: polystudents3 }
  - id: vpc
    kind: vpc
    attributes: { cidr_block: 10.0.0.0/16 }
  - id: web-sg
    kind: security_group
    attributes: { group_name: web, description: web tier }
    depends_on: [vpc]
"#,
        );
        let mut provider = MemoryProvider::new();
        let existing_sg = provider
            .create(
                ResourceKind::SecurityGroup,
                &plan.get("web-sg").unwrap().attributes,
                &[],
            )
            .unwrap();
        provider
            .create(ResourceKind::Bucket, &plan.get("logs").unwrap().attributes, &[])
            .unwrap();
        let mut store = StateStore::new();

        let report = apply(&plan, &mut store, &mut provider);

        assert!(report.is_success());
        assert_eq!(report.get("logs").unwrap().outcome, NodeOutcome::Adopted);
        assert_eq!(report.get("web-sg").unwrap().outcome, NodeOutcome::Adopted);
        assert_eq!(pid(&store, "logs"), "polystudents3");
        assert_eq!(pid(&store, "web-sg"), existing_sg);
        assert_eq!(store.get("logs").unwrap().status, ResourceStatus::Ready);
    }

    #[test]
    fn test_adopted_bucket_is_hardened() {
        let plan = load(
            r#"
version: "1.0"
name: logs
resources:
  - id: logs
    kind: bucket
    attributes: { bucket_name: polystudents3, versioning: Enabled, block_public_access: true }
"#,
        );
        let mut provider = MemoryProvider::new();
        provider
            .create(
                ResourceKind::Bucket,
                &serde_json::from_value(serde_json::json!({"bucket_name": "polystudents3"})).unwrap(),
                &[],
            )
            .unwrap();
        let mut store = StateStore::new();

        let report = apply(&plan, &mut store, &mut provider);

        assert_eq!(report.get("logs").unwrap().outcome, NodeOutcome::Adopted);
        assert_eq!(provider.updates(), 1);
        let remote = &provider.get("polystudents3").unwrap().attributes;
        assert_eq!(remote["versioning"], serde_json::json!("Enabled"));
        assert_eq!(remote["block_public_access"], serde_json::json!(true));
        let rs = store.get("logs").unwrap();
        assert_eq!(&rs.attributes, remote);
        assert_eq!(rs.status, ResourceStatus::Ready);

        provider.clear_calls();
        let report = apply(&plan, &mut store, &mut provider);
        assert_eq!(report.get("logs").unwrap().outcome, NodeOutcome::Unchanged);
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_adopted_immutable_mismatch_fails() {
        let plan = load(
            r#"
version: "1.0"
name: sg
resources:
  - id: vpc
    kind: vpc
    attributes: { cidr_block: 10.0.0.0/16 }
  - id: web-sg
    kind: security_group
    attributes: { group_name: web, description: web tier }
    depends_on: [vpc]
"#,
        );
        let mut provider = MemoryProvider::new();
        let existing = provider
            .create(
                ResourceKind::SecurityGroup,
                &serde_json::from_value(
                    serde_json::json!({"group_name": "web", "description": "legacy"}),
                )
                .unwrap(),
                &[],
            )
            .unwrap();
        let mut store = StateStore::new();

        let report = apply(&plan, &mut store, &mut provider);

        assert_eq!(
            report.get("web-sg").unwrap().outcome,
            NodeOutcome::Failed(NodeError::ImmutableChange {
                kind: ResourceKind::SecurityGroup,
                fields: vec!["description".into()],
            })
        );
        assert_eq!(provider.updates(), 0);
        let rs = store.get("web-sg").unwrap();
        assert_eq!(rs.provider_id.as_deref(), Some(existing.as_str()));
        assert_eq!(rs.attributes["description"], serde_json::json!("legacy"));
        assert!(rs.error.is_some());
    }

    #[test]
    fn test_bucket_owned_elsewhere_fails() {
        let plan = load(
            r#"
version: "1.0"
name: logs
resources:
  - id: logs
    kind: bucket
    attributes: { bucket_name: taken, name: logs }
"#,
        );
        let mut provider = MemoryProvider::new();
        provider.fail_create(
            "logs",
            ProviderError::new("BucketAlreadyExists", "the requested bucket name is not available"),
        );
        let mut store = StateStore::new();

        let report = apply(&plan, &mut store, &mut provider);

        assert_eq!(report.failed(), 1);
        assert_eq!(store.get("logs").unwrap().status, ResourceStatus::Failed);
    }

    #[test]
    fn test_cidr_change_is_immutable() {
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        apply(&load(NETWORK), &mut store, &mut provider);
        let before = store.get("public-a").unwrap().clone();
        provider.clear_calls();

        let changed = load(&NETWORK.replace("10.0.0.0/24", "10.0.1.0/24"));
        let report = apply(&changed, &mut store, &mut provider);

        assert_eq!(
            report.get("public-a").unwrap().outcome,
            NodeOutcome::Failed(NodeError::ImmutableChange {
                kind: ResourceKind::Subnet,
                fields: vec!["cidr_block".into()],
            })
        );
        for id in ["vpc", "igw"] {
            assert_eq!(report.get(id).unwrap().outcome, NodeOutcome::Unchanged);
        }
        assert_eq!(
            report.get("public-rt").unwrap().outcome,
            NodeOutcome::Skipped {
                unmet: vec!["public-a".into()]
            }
        );
        assert_eq!(store.get("public-a"), Some(&before));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_timeout_then_resume() {
        let plan = load(TIERED);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new()
            .ready_after(ResourceKind::NatGateway, 3)
            .poll_interval(Duration::from_millis(1));

        let mut reconciler = Reconciler::new(&mut provider).with_options(ApplyOptions {
            await_timeout: Duration::ZERO,
            ..ApplyOptions::default()
        });
        let report = reconciler.apply(&plan, &mut store);

        assert!(matches!(
            report.get("nat-a").unwrap().outcome,
            NodeOutcome::Failed(NodeError::ProvisioningTimeout { .. })
        ));
        let nat = store.get("nat-a").unwrap().clone();
        assert_eq!(nat.status, ResourceStatus::Failed);
        let nat_pid = nat.provider_id.unwrap();
        assert_eq!(report.get("app").unwrap().outcome.status(), "SKIPPED");
        let creates = provider.creates();

        let report = apply(&plan, &mut store, &mut provider);

        assert!(report.is_success(), "{:?}", report.nodes);
        assert_eq!(report.get("nat-a").unwrap().outcome, NodeOutcome::Resumed);
        assert_eq!(pid(&store, "nat-a"), nat_pid);
        assert_eq!(store.get("nat-a").unwrap().error, None);
        // Only the previously skipped route table and instance are new.
        assert_eq!(provider.creates(), creates + 2);
    }

    #[test]
    fn test_unbounded_await_timeout() {
        let plan = load(TIERED);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new()
            .ready_after(ResourceKind::NatGateway, 2)
            .poll_interval(Duration::from_millis(1));

        let report = Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                await_timeout: Duration::from_secs(u64::MAX),
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        assert!(report.is_success(), "{:?}", report.nodes);
        assert_eq!(report.get("nat-a").unwrap().outcome, NodeOutcome::Created);
    }

    #[test]
    fn test_never_ready_times_out() {
        let plan = load(TIERED);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new()
            .ready_after(ResourceKind::NatGateway, NEVER_READY)
            .poll_interval(Duration::from_millis(1));

        let report = Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                await_timeout: Duration::from_millis(10),
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.get("logs").unwrap().outcome, NodeOutcome::Created);
    }

    #[test]
    fn test_provisioning_failed() {
        let plan = load(TIERED);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        provider.fail_ready("nat-a", "Server.InternalError");

        let report = apply(&plan, &mut store, &mut provider);

        assert!(matches!(
            report.get("nat-a").unwrap().outcome,
            NodeOutcome::Failed(NodeError::ProvisioningFailed { ref reason, .. }) if reason == "Server.InternalError"
        ));
        assert!(store.get("nat-a").unwrap().provider_id.is_some());
    }

    #[test]
    fn test_stop_on_first_cancels_rest() {
        let plan = load(
            r#"
version: "1.0"
name: halt
resources:
  - id: logs
    kind: bucket
    attributes: { bucket_name: polystudents3, name: logs }
  - id: vpc
    kind: vpc
    attributes: { cidr_block: 10.0.0.0/16 }
"#,
        );
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        provider.fail_create("logs", ProviderError::new("AccessDenied", "denied"));

        let report = Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                failure: FailurePolicy::StopOnFirst,
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        assert_eq!(report.get("vpc").unwrap().outcome, NodeOutcome::Cancelled);
        assert_eq!(provider.creates(), 1);
    }

    #[test]
    fn test_continue_independent_by_default() {
        let plan = load(
            r#"
version: "1.0"
name: halt
resources:
  - id: logs
    kind: bucket
    attributes: { bucket_name: polystudents3, name: logs }
  - id: vpc
    kind: vpc
    attributes: { cidr_block: 10.0.0.0/16 }
"#,
        );
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        provider.fail_create("logs", ProviderError::new("AccessDenied", "denied"));

        let report = apply(&plan, &mut store, &mut provider);

        assert_eq!(report.get("vpc").unwrap().outcome, NodeOutcome::Created);
    }

    #[test]
    fn test_cancellation_between_nodes() {
        let plan = load(NETWORK);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        let cancel = Arc::new(AtomicBool::new(true));

        let report = Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                cancel: Some(cancel),
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        assert!(report
            .nodes
            .iter()
            .all(|n| n.outcome == NodeOutcome::Cancelled));
        assert!(provider.calls().is_empty());
        assert!(store.resources.is_empty());
    }

    #[test]
    fn test_refresh_recreates_vanished() {
        let plan = load(NETWORK);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        apply(&plan, &mut store, &mut provider);
        let old = pid(&store, "public-a");
        provider.remove(&old);
        provider.clear_calls();

        let report = Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                refresh: true,
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        assert_eq!(report.get("public-a").unwrap().outcome, NodeOutcome::Created);
        assert_ne!(pid(&store, "public-a"), old);
        assert_eq!(report.unchanged(), 3);
        let describes = provider
            .calls()
            .iter()
            .filter(|c| matches!(c, ProviderCall::Describe { .. }))
            .count();
        assert_eq!(describes, 4);
    }

    #[test]
    fn test_refresh_repairs_drift() {
        let plan = load(NETWORK);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        apply(&plan, &mut store, &mut provider);
        let vpc = pid(&store, "vpc");
        provider.tamper(&vpc, "enable_dns_support", serde_json::json!(false));

        let report = Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                refresh: true,
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        assert_eq!(report.get("vpc").unwrap().outcome, NodeOutcome::Updated);
        assert_eq!(
            provider.get(&vpc).unwrap().attributes["enable_dns_support"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn test_refresh_failure_recorded() {
        let plan = load(NETWORK);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        apply(&plan, &mut store, &mut provider);
        provider.fail_describe(
            "polystudent-vpc",
            ProviderError::new("Throttling", "rate exceeded"),
        );

        let report = Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                refresh: true,
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        assert!(matches!(
            report.get("vpc").unwrap().outcome,
            NodeOutcome::Failed(NodeError::Provider(ref e)) if e.code == "Throttling"
        ));
        assert_eq!(report.skipped(), 3);
        let vpc = store.get("vpc").unwrap();
        assert_eq!(vpc.status, ResourceStatus::Ready);
        assert!(vpc.error.as_deref().unwrap().contains("Throttling"));
    }

    #[test]
    fn test_update_mutable_attribute() {
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        apply(&load(NETWORK), &mut store, &mut provider);

        let changed = load(&NETWORK.replace(
            "enable_dns_support: true",
            "enable_dns_support: true, enable_dns_hostnames: true",
        ));
        let report = apply(&changed, &mut store, &mut provider);

        assert_eq!(report.get("vpc").unwrap().outcome, NodeOutcome::Updated);
        assert_eq!(report.unchanged(), 3);
        assert_eq!(provider.updates(), 1);
        let vpc = store.get("vpc").unwrap();
        assert_eq!(vpc.attributes["enable_dns_hostnames"], serde_json::json!(true));
        assert_eq!(vpc.hash, hasher::hash_attributes(ResourceKind::Vpc, &vpc.attributes));
    }

    #[test]
    fn test_unsupported_update() {
        let flow_logs = r#"
version: "1.0"
name: flows
resources:
  - id: vpc
    kind: vpc
    attributes: { cidr_block: 10.0.0.0/16 }
  - id: trail-bucket
    kind: bucket
    attributes: { bucket_name: polystudents3 }
  - id: rejects
    kind: flow_log
    attributes: { traffic_type: REJECT, log_destination_prefix: tp4-vpc-flow-logs/, name: rejects }
    depends_on: [vpc, trail-bucket]
"#;
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        apply(&load(flow_logs), &mut store, &mut provider);

        let renamed = load(&flow_logs.replace("name: rejects", "name: rejected-traffic"));
        let report = apply(&renamed, &mut store, &mut provider);

        assert_eq!(
            report.get("rejects").unwrap().outcome,
            NodeOutcome::Failed(NodeError::UnsupportedUpdate {
                kind: ResourceKind::FlowLog
            })
        );
        let rs = store.get("rejects").unwrap();
        assert_eq!(rs.status, ResourceStatus::Ready);
        assert!(rs.error.as_deref().unwrap().contains("in-place update"));
    }

    #[test]
    fn test_event_log_written() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.events.jsonl");
        let plan = load(NETWORK);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();

        Reconciler::new(&mut provider)
            .with_options(ApplyOptions {
                event_log: Some(log.clone()),
                ..ApplyOptions::default()
            })
            .apply(&plan, &mut store);

        let events: Vec<ProvenanceEvent> = read_events(&log)
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert!(matches!(events.first(), Some(ProvenanceEvent::RunStarted { nodes: 4, .. })));
        assert!(matches!(
            events.last(),
            Some(ProvenanceEvent::RunCompleted { ready: 4, failed: 0, .. })
        ));
        let ready = events
            .iter()
            .filter(|e| matches!(e, ProvenanceEvent::NodeReady { outcome, .. } if outcome == "created"))
            .count();
        assert_eq!(ready, 4);
    }

    #[test]
    fn test_checkpoints_to_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = StateFile::new(dir.path().join("s.state.yaml"));
        let plan = load(TIERED);
        let mut store = StateStore::new();
        let mut provider = MemoryProvider::new();
        provider.fail_create("nat-a", ProviderError::new("Throttling", "rate exceeded"));

        Reconciler::new(&mut provider)
            .with_recorder(&recorder)
            .apply(&plan, &mut store);

        let saved = recorder.load().unwrap();
        assert!(saved.updated_at.is_some());
        assert_eq!(saved.resources.len(), store.resources.len());
        assert_eq!(saved.get("nat-a").unwrap().status, ResourceStatus::Failed);
        assert_eq!(saved.get("logs").unwrap().status, ResourceStatus::Ready);
    }
}
