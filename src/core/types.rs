//! Plan, state, report and provenance types.
//!
//! Everything that crosses a file boundary (plan YAML, state YAML, event JSONL)
//! derives Serialize/Deserialize.

use super::error::NodeError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Kind-specific desired attributes. Ordered so hashing and comparison are canonical.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Identifier assigned by the provider (e.g. `vpc-0a1b2c...`, a bucket name).
pub type ProviderId = String;

// ============================================================================
// Plan file
// ============================================================================

/// Root of a plan file: the desired infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable infrastructure name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Template parameters (`{{params.key}}`)
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Resource declarations, in declaration order
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

/// A single declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    /// Logical id, unique within a plan
    pub id: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Desired attributes
    #[serde(default)]
    pub attributes: Attributes,

    /// Logical ids that must be Ready before this resource is reconciled
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Resource kind enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    RouteTable,
    InternetGateway,
    NatGateway,
    SecurityGroup,
    Bucket,
    Trail,
    Alarm,
    Instance,
    FlowLog,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        Self::Vpc,
        Self::Subnet,
        Self::RouteTable,
        Self::InternetGateway,
        Self::NatGateway,
        Self::SecurityGroup,
        Self::Bucket,
        Self::Trail,
        Self::Alarm,
        Self::Instance,
        Self::FlowLog,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Vpc => "vpc",
            Self::Subnet => "subnet",
            Self::RouteTable => "route_table",
            Self::InternetGateway => "internet_gateway",
            Self::NatGateway => "nat_gateway",
            Self::SecurityGroup => "security_group",
            Self::Bucket => "bucket",
            Self::Trail => "trail",
            Self::Alarm => "alarm",
            Self::Instance => "instance",
            Self::FlowLog => "flow_log",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Upper bound for a single readiness wait
    #[serde(default = "default_await_timeout")]
    pub await_timeout_secs: u64,

    /// Append provenance events next to the state file
    #[serde(default = "default_true")]
    pub event_log: bool,

    /// Describe Ready resources before deciding (costs one call per node)
    #[serde(default)]
    pub refresh: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            await_timeout_secs: default_await_timeout(),
            event_log: true,
            refresh: false,
        }
    }
}

fn default_await_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the failed node's dependents, keep reconciling independent branches.
    #[default]
    ContinueIndependent,
    /// Cancel every node after the first failure.
    StopOnFirst,
}

// ============================================================================
// Built plan
// ============================================================================

/// A validated, acyclic set of specs with its execution order.
///
/// Only [`crate::core::resolver::build`] constructs one.
#[derive(Debug, Clone)]
pub struct Plan {
    pub(crate) specs: Vec<ResourceSpec>,
    pub(crate) order: Vec<usize>,
    pub(crate) index: HashMap<String, usize>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Look up a spec by logical id.
    pub fn get(&self, id: &str) -> Option<&ResourceSpec> {
        self.index.get(id).map(|&i| &self.specs[i])
    }

    /// Specs in declaration order.
    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    /// Specs in execution (topological) order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceSpec> + '_ {
        self.order.iter().map(move |&i| &self.specs[i])
    }

    /// Logical ids in execution order.
    pub fn execution_order(&self) -> Vec<&str> {
        self.ordered().map(|s| s.id.as_str()).collect()
    }
}

// ============================================================================
// State
// ============================================================================

/// Persisted state for every reconciled resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStore {
    /// Schema version
    pub schema: String,

    /// Generator version
    pub generator: String,

    /// When the store was last written by a run
    #[serde(default)]
    pub updated_at: Option<String>,

    /// Per-resource state, keyed by logical id
    #[serde(default)]
    pub resources: IndexMap<String, ResourceState>,
}

/// State for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Logical id
    pub id: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Provider-assigned id, once created
    #[serde(default)]
    pub provider_id: Option<ProviderId>,

    /// Attribute snapshot as last applied
    #[serde(default)]
    pub attributes: Attributes,

    /// BLAKE3 hash of the snapshot
    #[serde(default)]
    pub hash: String,

    /// Lifecycle status
    pub status: ResourceStatus,

    /// When the record last changed
    #[serde(default)]
    pub updated_at: Option<String>,

    /// Last error recorded against this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resource lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Absent,
    Creating,
    Ready,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "ABSENT"),
            Self::Creating => write!(f, "CREATING"),
            Self::Ready => write!(f, "READY"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

// ============================================================================
// Plan preview
// ============================================================================

/// Action the reconciler will take on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    /// Provider id known but readiness never confirmed; wait again.
    Resume,
    Update { fields: Vec<String> },
    /// Immutable fields changed; replacement is never done implicitly.
    Blocked { fields: Vec<String> },
    NoOp,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Resume => write!(f, "RESUME"),
            Self::Update { .. } => write!(f, "UPDATE"),
            Self::Blocked { .. } => write!(f, "BLOCKED"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub action: Action,
    pub description: String,
}

/// Preview of what an apply would do.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// Changes in execution order
    pub changes: Vec<PlannedChange>,

    pub to_create: u32,
    pub to_update: u32,
    pub blocked: u32,
    pub unchanged: u32,
}

// ============================================================================
// Run report
// ============================================================================

/// What happened to one node during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Created,
    /// Provider reported the resource already exists; adopted as Ready.
    Adopted,
    /// A previously unconfirmed resource became ready.
    Resumed,
    Updated,
    Unchanged,
    Failed(NodeError),
    /// Never attempted because a dependency was not Ready.
    Skipped { unmet: Vec<String> },
    /// Never attempted because the run was cancelled or halted.
    Cancelled,
}

impl NodeOutcome {
    /// True if the node ended the run Ready.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Adopted | Self::Resumed | Self::Updated | Self::Unchanged
        )
    }

    /// Short status word for report lines.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Failed(_) => "FAILED",
            Self::Skipped { .. } => "SKIPPED",
            Self::Cancelled => "CANCELLED",
            _ => "READY",
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "READY (created)"),
            Self::Adopted => write!(f, "READY (already existed)"),
            Self::Resumed => write!(f, "READY (resumed)"),
            Self::Updated => write!(f, "READY (updated)"),
            Self::Unchanged => write!(f, "READY (unchanged)"),
            Self::Failed(e) => write!(f, "FAILED: {}", e),
            Self::Skipped { unmet } => {
                write!(f, "SKIPPED (unmet dependency: {})", unmet.join(", "))
            }
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Per-node line of a run report.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub provider_id: Option<ProviderId>,
    pub outcome: NodeOutcome,
    pub duration: Duration,
}

impl fmt::Display for NodeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.resource_id, self.kind, self.outcome)?;
        if let Some(ref pid) = self.provider_id {
            write!(f, " ({})", pid)?;
        }
        Ok(())
    }
}

/// Result of one reconciliation run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    /// One entry per plan node, in execution order
    pub nodes: Vec<NodeReport>,
    pub total_duration: Duration,
}

impl RunReport {
    pub fn get(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.resource_id == id)
    }

    pub fn ready(&self) -> u32 {
        self.count(|o| o.is_ready())
    }

    pub fn changed(&self) -> u32 {
        self.count(|o| o.is_ready() && *o != NodeOutcome::Unchanged)
    }

    pub fn unchanged(&self) -> u32 {
        self.count(|o| *o == NodeOutcome::Unchanged)
    }

    pub fn failed(&self) -> u32 {
        self.count(|o| matches!(o, NodeOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> u32 {
        self.count(|o| matches!(o, NodeOutcome::Skipped { .. } | NodeOutcome::Cancelled))
    }

    /// Every node ended the run Ready.
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.outcome.is_ready())
    }

    fn count(&self, pred: impl Fn(&NodeOutcome) -> bool) -> u32 {
        self.nodes.iter().filter(|n| pred(&n.outcome)).count() as u32
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        run_id: String,
        nodes: u32,
        stratus_version: String,
    },
    NodeStarted {
        resource: String,
        kind: ResourceKind,
        action: String,
    },
    NodeReady {
        resource: String,
        provider_id: String,
        outcome: String,
        duration_seconds: f64,
        hash: String,
    },
    NodeFailed {
        resource: String,
        error: String,
    },
    NodeSkipped {
        resource: String,
        unmet: Vec<String>,
    },
    RunCompleted {
        run_id: String,
        ready: u32,
        unchanged: u32,
        failed: u32,
        skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_file_parse() {
        let yaml = r#"
version: "1.0"
name: polystudent
params:
  env: polystudent-vpc
resources:
  - id: vpc
    kind: vpc
    attributes:
      cidr_block: 10.0.0.0/16
      enable_dns_support: true
  - id: subnet-a
    kind: subnet
    attributes:
      cidr_block: 10.0.0.0/24
      availability_zone: us-east-1a
    depends_on: [vpc]
policy:
  failure: stop_on_first
  await_timeout_secs: 30
"#;
        let plan: PlanFile = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(plan.name, "polystudent");
        assert_eq!(plan.resources.len(), 2);
        assert_eq!(plan.resources[0].kind, ResourceKind::Vpc);
        assert_eq!(plan.resources[1].depends_on, vec!["vpc"]);
        assert_eq!(
            plan.resources[0].attributes["enable_dns_support"],
            serde_json::Value::Bool(true)
        );
        assert_eq!(plan.policy.failure, FailurePolicy::StopOnFirst);
        assert_eq!(plan.policy.await_timeout_secs, 30);
    }

    #[test]
    fn test_spec_rejects_unknown_fields() {
        let yaml = r#"
id: vpc
kind: vpc
attribute: {}
"#;
        let result: Result<ResourceSpec, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_defaults() {
        let p = Policy::default();
        assert_eq!(p.failure, FailurePolicy::ContinueIndependent);
        assert_eq!(p.await_timeout_secs, 600);
        assert!(p.event_log);
        assert!(!p.refresh);
    }

    #[test]
    fn test_kind_display_matches_serde() {
        for kind in ResourceKind::ALL {
            let yaml = serde_yaml_ng::to_string(&kind).unwrap();
            assert_eq!(yaml.trim(), kind.to_string());
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ResourceStatus::Ready.to_string(), "READY");
        assert_eq!(ResourceStatus::Creating.to_string(), "CREATING");
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::Create.to_string(), "CREATE");
        assert_eq!(Action::NoOp.to_string(), "NO-OP");
        assert_eq!(
            Action::Blocked {
                fields: vec!["cidr_block".into()]
            }
            .to_string(),
            "BLOCKED"
        );
    }

    #[test]
    fn test_outcome_display_skipped() {
        let o = NodeOutcome::Skipped {
            unmet: vec!["nat-a".into()],
        };
        assert_eq!(o.to_string(), "SKIPPED (unmet dependency: nat-a)");
        assert_eq!(o.status(), "SKIPPED");
        assert!(!o.is_ready());
    }

    #[test]
    fn test_report_counts() {
        let node = |id: &str, outcome| NodeReport {
            resource_id: id.to_string(),
            kind: ResourceKind::Vpc,
            provider_id: None,
            outcome,
            duration: Duration::ZERO,
        };
        let report = RunReport {
            run_id: "r-1".into(),
            nodes: vec![
                node("a", NodeOutcome::Created),
                node("b", NodeOutcome::Unchanged),
                node("c", NodeOutcome::Skipped { unmet: vec![] }),
                node("d", NodeOutcome::Cancelled),
            ],
            total_duration: Duration::ZERO,
        };
        assert_eq!(report.ready(), 2);
        assert_eq!(report.changed(), 1);
        assert_eq!(report.unchanged(), 1);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.failed(), 0);
        assert!(!report.is_success());
        assert!(report.get("c").is_some());
    }

    #[test]
    fn test_provenance_event_serde() {
        let event = ProvenanceEvent::NodeSkipped {
            resource: "rt".to_string(),
            unmet: vec!["igw".to_string()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"node_skipped\""));
        assert!(json.contains("\"unmet\":[\"igw\"]"));
    }

    #[test]
    fn test_yaml_value_to_string() {
        assert_eq!(
            yaml_value_to_string(&serde_yaml_ng::Value::String("hello".into())),
            "hello"
        );
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Bool(true)), "true");
        assert_eq!(yaml_value_to_string(&serde_yaml_ng::Value::Null), "");
    }
}
