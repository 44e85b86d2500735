//! Plan generation: diff desired specs against recorded state.

use super::schema;
use super::types::*;

/// Decide what the reconciler should do with one resource.
pub fn determine_action(spec: &ResourceSpec, state: Option<&ResourceState>) -> Action {
    let Some(state) = state else {
        return Action::Create;
    };
    if state.provider_id.is_none() {
        return Action::Create;
    }
    if state.kind != spec.kind {
        return Action::Blocked {
            fields: vec!["kind".to_string()],
        };
    }

    match state.status {
        ResourceStatus::Absent => Action::Create,
        ResourceStatus::Creating | ResourceStatus::Failed => Action::Resume,
        ResourceStatus::Ready => {
            let changed = schema::changed_fields(&spec.attributes, &state.attributes);
            if changed.is_empty() {
                return Action::NoOp;
            }
            let immutable = schema::immutable_changes(spec.kind, &changed);
            if immutable.is_empty() {
                Action::Update { fields: changed }
            } else {
                Action::Blocked { fields: immutable }
            }
        }
    }
}

/// Preview an apply: classify every node in execution order.
pub fn plan(plan: &Plan, store: &StateStore) -> ExecutionPlan {
    let mut preview = ExecutionPlan::default();

    for spec in plan.ordered() {
        let action = determine_action(spec, store.get(&spec.id));
        match action {
            Action::Create | Action::Resume => preview.to_create += 1,
            Action::Update { .. } => preview.to_update += 1,
            Action::Blocked { .. } => preview.blocked += 1,
            Action::NoOp => preview.unchanged += 1,
        }
        preview.changes.push(PlannedChange {
            resource_id: spec.id.clone(),
            kind: spec.kind,
            description: describe_action(spec, &action),
            action,
        });
    }

    preview
}

/// Human-readable description of a planned action.
pub fn describe_action(spec: &ResourceSpec, action: &Action) -> String {
    let attr = |key: &str| {
        spec.attributes
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string()
    };
    match action {
        Action::Create => match spec.kind {
            ResourceKind::Vpc | ResourceKind::Subnet => {
                format!("{}: create {} {}", spec.id, spec.kind, attr("cidr_block"))
            }
            ResourceKind::Bucket => format!("{}: create bucket {}", spec.id, attr("bucket_name")),
            ResourceKind::Trail => format!("{}: create trail {}", spec.id, attr("trail_name")),
            ResourceKind::Alarm => format!("{}: put alarm {}", spec.id, attr("alarm_name")),
            ResourceKind::SecurityGroup => {
                format!("{}: create security group {}", spec.id, attr("group_name"))
            }
            ResourceKind::Instance => format!(
                "{}: launch {} from {}",
                spec.id,
                attr("instance_type"),
                attr("image_id")
            ),
            _ => format!("{}: create {}", spec.id, spec.kind),
        },
        Action::Resume => format!("{}: wait for {} to become ready", spec.id, spec.kind),
        Action::Update { fields } => format!("{}: update {}", spec.id, fields.join(", ")),
        Action::Blocked { fields } => format!(
            "{}: requires replacement ({} immutable), not applied",
            spec.id,
            fields.join(", ")
        ),
        Action::NoOp => format!("{}: no changes", spec.id),
    }
}
