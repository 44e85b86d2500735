//! Template resolution and dependency DAG construction.
//!
//! Resolves `{{params.key}}` templates inside attribute strings.
//! Builds a DAG from `depends_on` edges and computes a topological order
//! using Kahn's algorithm, tie-breaking on declaration order.

use super::error::PlanError;
use super::types::*;
use std::collections::{BTreeSet, HashMap};

/// Resolve all template variables in a string.
pub fn resolve_template(
    template: &str,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = match key.strip_prefix("params.") {
            Some(param_key) => params
                .get(param_key)
                .map(yaml_value_to_string)
                .ok_or_else(|| format!("unknown param: {}", param_key))?,
            None => return Err(format!("unknown template variable: {}", key)),
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

fn resolve_value(
    value: &serde_json::Value,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> Result<serde_json::Value, String> {
    use serde_json::Value;
    Ok(match value {
        Value::String(s) => Value::String(resolve_template(s, params)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, params))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), resolve_value(v, params)?)))
                .collect::<Result<_, String>>()?,
        ),
        other => other.clone(),
    })
}

/// Resolve templates in every attribute of a spec.
pub fn resolve_spec_templates(
    spec: &ResourceSpec,
    params: &HashMap<String, serde_yaml_ng::Value>,
) -> Result<ResourceSpec, String> {
    let mut resolved = spec.clone();
    for (key, value) in resolved.attributes.iter_mut() {
        *value = resolve_value(value, params)
            .map_err(|e| format!("resource '{}' attribute '{}': {}", spec.id, key, e))?;
    }
    Ok(resolved)
}

/// Build a plan: check ids and dependencies, then order topologically.
///
/// Among nodes whose dependencies are all placed, the earliest-declared goes
/// first, so identical input yields identical order.
pub fn build(specs: Vec<ResourceSpec>) -> Result<Plan, PlanError> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        if index.insert(spec.id.clone(), i).is_some() {
            return Err(PlanError::Duplicate(spec.id.clone()));
        }
    }

    let mut in_degree = vec![0usize; specs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (i, spec) in specs.iter().enumerate() {
        for dep in &spec.depends_on {
            let &d = index
                .get(dep)
                .ok_or_else(|| PlanError::UnknownDependency {
                    resource: spec.id.clone(),
                    dependency: dep.clone(),
                })?;
            dependents[d].push(i);
            in_degree[i] += 1;
        }
    }

    // Kahn's algorithm; the ready set is ordered by declaration index
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(specs.len());
    while let Some(current) = ready.pop_first() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != specs.len() {
        return Err(PlanError::Cycle {
            cycle: find_cycle(&specs, &index, &in_degree),
        });
    }

    Ok(Plan {
        specs,
        order,
        index,
    })
}

/// Extract one concrete cycle from the nodes Kahn's algorithm could not place.
///
/// Every unplaced node has at least one unplaced dependency, so following
/// those edges from any unplaced node must revisit a node.
fn find_cycle(
    specs: &[ResourceSpec],
    index: &HashMap<String, usize>,
    in_degree: &[usize],
) -> Vec<String> {
    let unplaced = |i: usize| in_degree[i] > 0;
    let Some(mut current) = (0..specs.len()).find(|&i| unplaced(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut seen_at: HashMap<usize, usize> = HashMap::new();
    loop {
        if let Some(&at) = seen_at.get(&current) {
            let mut cycle: Vec<String> = path[at..].iter().map(|&i| specs[i].id.clone()).collect();
            cycle.push(specs[current].id.clone());
            return cycle;
        }
        seen_at.insert(current, path.len());
        path.push(current);

        let next = specs[current]
            .depends_on
            .iter()
            .filter_map(|d| index.get(d).copied())
            .find(|&d| unplaced(d));
        match next {
            Some(d) => current = d,
            None => return path.iter().map(|&i| specs[i].id.clone()).collect(),
        }
    }
}
