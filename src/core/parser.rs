//! Plan file parsing and validation.
//!
//! Parses a YAML plan file and validates structural constraints:
//! - Version must be "1.0"
//! - Resource ids must be non-empty
//! - Attributes must match the kind's schema
//! - Each kind must depend on the kinds it is attached to (subnet → vpc, ...)
//!
//! Unknown dependencies, duplicates and cycles are reported by the resolver.

use super::error::PlanError;
use super::resolver;
use super::schema;
use super::types::*;
use std::collections::HashMap;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a plan file from disk.
pub fn parse_plan_file(path: &Path) -> Result<PlanFile, PlanError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PlanError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
    parse_plan(&content)
}

/// Parse a plan from a string.
pub fn parse_plan(yaml: &str) -> Result<PlanFile, PlanError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| PlanError::Parse(format!("YAML parse error: {}", e)))
}

/// Validate a parsed plan. Returns a list of errors (empty = valid).
pub fn validate_plan(plan: &PlanFile) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if plan.version != "1.0" {
        push(format!("version must be \"1.0\", got \"{}\"", plan.version));
    }
    if plan.name.is_empty() {
        push("name must not be empty".to_string());
    }

    let kinds: HashMap<&str, ResourceKind> = plan
        .resources
        .iter()
        .map(|r| (r.id.as_str(), r.kind))
        .collect();

    for resource in &plan.resources {
        if resource.id.trim().is_empty() {
            push(format!("a {} resource has an empty id", resource.kind));
            continue;
        }

        for message in schema::validate_attributes(&resource.id, resource.kind, &resource.attributes) {
            push(message);
        }

        for required in resource.kind.schema().requires {
            let satisfied = resource
                .depends_on
                .iter()
                .any(|d| kinds.get(d.as_str()) == Some(required));
            if !satisfied {
                push(format!(
                    "resource '{}' ({}) must depend on a {}",
                    resource.id, resource.kind, required
                ));
            }
        }
    }

    errors
}

/// Apply `key=value` overrides to the plan's params.
pub fn apply_param_overrides(plan: &mut PlanFile, overrides: &[(String, String)]) {
    for (key, value) in overrides {
        plan.params
            .insert(key.clone(), serde_yaml_ng::Value::String(value.clone()));
    }
}

/// Parse a `key=value` CLI argument.
pub fn parse_param(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", arg)),
    }
}

/// Resolve templates, build the DAG, then validate schemas.
///
/// Graph errors (duplicate, unknown dependency, cycle) come back typed;
/// schema errors are collected into [`PlanError::Invalid`].
pub fn load_plan(plan_file: &PlanFile) -> Result<Plan, PlanError> {
    let resolved: Vec<ResourceSpec> = plan_file
        .resources
        .iter()
        .map(|spec| resolver::resolve_spec_templates(spec, &plan_file.params))
        .collect::<Result<_, _>>()
        .map_err(|e| PlanError::Invalid(vec![e]))?;

    let plan = resolver::build(resolved.clone())?;

    let errors = validate_plan(&PlanFile {
        resources: resolved,
        ..plan_file.clone()
    });
    if !errors.is_empty() {
        return Err(PlanError::Invalid(
            errors.into_iter().map(|e| e.message).collect(),
        ));
    }

    Ok(plan)
}
