//! Per-kind attribute schemas: allowed keys, immutability, readiness.

use super::types::{Attributes, ResourceKind};
use std::net::Ipv4Addr;

/// Keys every kind accepts.
pub const COMMON_KEYS: &[&str] = &["name", "tags"];

/// Static description of one resource kind.
#[derive(Debug)]
pub struct KindSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    /// Changing any of these requires replacement.
    pub immutable: &'static [&'static str],
    /// Kinds this one must depend on (at least one dependency of each).
    pub requires: &'static [ResourceKind],
    /// Attribute whose value doubles as the provider id (buckets, trails, alarms).
    pub natural_key: Option<&'static str>,
    /// Provisioned asynchronously; create is followed by a readiness wait.
    pub awaits_ready: bool,
    /// Prefix for generated provider ids.
    pub id_prefix: &'static str,
}

const VPC: KindSchema = KindSchema {
    required: &["cidr_block"],
    optional: &["enable_dns_support", "enable_dns_hostnames"],
    immutable: &["cidr_block"],
    requires: &[],
    natural_key: None,
    awaits_ready: true,
    id_prefix: "vpc",
};

const SUBNET: KindSchema = KindSchema {
    required: &["cidr_block", "availability_zone"],
    optional: &["map_public_ip_on_launch"],
    immutable: &["cidr_block", "availability_zone"],
    requires: &[ResourceKind::Vpc],
    natural_key: None,
    awaits_ready: false,
    id_prefix: "subnet",
};

const ROUTE_TABLE: KindSchema = KindSchema {
    required: &[],
    optional: &["destination_cidr_block"],
    immutable: &[],
    requires: &[ResourceKind::Vpc],
    natural_key: None,
    awaits_ready: false,
    id_prefix: "rtb",
};

const INTERNET_GATEWAY: KindSchema = KindSchema {
    required: &[],
    optional: &[],
    immutable: &[],
    requires: &[ResourceKind::Vpc],
    natural_key: None,
    awaits_ready: false,
    id_prefix: "igw",
};

const NAT_GATEWAY: KindSchema = KindSchema {
    required: &[],
    optional: &["connectivity_type"],
    immutable: &["connectivity_type"],
    requires: &[ResourceKind::Subnet],
    natural_key: None,
    awaits_ready: true,
    id_prefix: "nat",
};

const SECURITY_GROUP: KindSchema = KindSchema {
    required: &["group_name", "description"],
    optional: &["ingress"],
    immutable: &["group_name", "description"],
    requires: &[ResourceKind::Vpc],
    natural_key: Some("group_name"),
    awaits_ready: false,
    id_prefix: "sg",
};

const BUCKET: KindSchema = KindSchema {
    required: &["bucket_name"],
    optional: &[
        "versioning",
        "sse_algorithm",
        "kms_key_id",
        "block_public_access",
    ],
    immutable: &["bucket_name"],
    requires: &[],
    natural_key: Some("bucket_name"),
    awaits_ready: false,
    id_prefix: "bucket",
};

const TRAIL: KindSchema = KindSchema {
    required: &["trail_name"],
    optional: &["s3_key_prefix", "multi_region", "log_file_validation"],
    immutable: &["trail_name"],
    requires: &[ResourceKind::Bucket],
    natural_key: Some("trail_name"),
    awaits_ready: false,
    id_prefix: "trail",
};

const ALARM: KindSchema = KindSchema {
    required: &[
        "alarm_name",
        "metric_name",
        "namespace",
        "threshold",
        "comparison_operator",
    ],
    optional: &[
        "statistic",
        "period",
        "evaluation_periods",
        "treat_missing_data",
        "actions_enabled",
    ],
    immutable: &["alarm_name"],
    requires: &[],
    natural_key: Some("alarm_name"),
    awaits_ready: false,
    id_prefix: "alarm",
};

const INSTANCE: KindSchema = KindSchema {
    required: &["image_id", "instance_type"],
    optional: &["instance_profile"],
    immutable: &["image_id", "instance_type"],
    requires: &[ResourceKind::Subnet],
    natural_key: None,
    awaits_ready: true,
    id_prefix: "i",
};

const FLOW_LOG: KindSchema = KindSchema {
    required: &["traffic_type"],
    optional: &["log_destination_prefix"],
    immutable: &["traffic_type", "log_destination_prefix"],
    requires: &[ResourceKind::Vpc, ResourceKind::Bucket],
    natural_key: None,
    awaits_ready: false,
    id_prefix: "fl",
};

impl ResourceKind {
    pub fn schema(self) -> &'static KindSchema {
        match self {
            Self::Vpc => &VPC,
            Self::Subnet => &SUBNET,
            Self::RouteTable => &ROUTE_TABLE,
            Self::InternetGateway => &INTERNET_GATEWAY,
            Self::NatGateway => &NAT_GATEWAY,
            Self::SecurityGroup => &SECURITY_GROUP,
            Self::Bucket => &BUCKET,
            Self::Trail => &TRAIL,
            Self::Alarm => &ALARM,
            Self::Instance => &INSTANCE,
            Self::FlowLog => &FLOW_LOG,
        }
    }
}

/// Keys whose values differ between desired and snapshot (added, removed, or changed).
pub fn changed_fields(desired: &Attributes, snapshot: &Attributes) -> Vec<String> {
    let mut fields: Vec<String> = desired
        .iter()
        .filter(|(k, v)| snapshot.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    fields.extend(
        snapshot
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned(),
    );
    fields.sort();
    fields
}

/// The subset of `changed` that the kind cannot update in place.
pub fn immutable_changes(kind: ResourceKind, changed: &[String]) -> Vec<String> {
    let immutable = kind.schema().immutable;
    changed
        .iter()
        .filter(|f| immutable.contains(&f.as_str()))
        .cloned()
        .collect()
}

/// Provider id implied by the kind's natural key, if it has one.
pub fn natural_id(kind: ResourceKind, attributes: &Attributes) -> Option<String> {
    let key = kind.schema().natural_key?;
    attributes.get(key)?.as_str().map(str::to_string)
}

/// Validate one resource's attributes against its kind. Returns error messages.
pub fn validate_attributes(id: &str, kind: ResourceKind, attributes: &Attributes) -> Vec<String> {
    let schema = kind.schema();
    let mut errors = Vec::new();

    for key in schema.required {
        if !attributes.contains_key(*key) {
            errors.push(format!("resource '{}' ({}) requires '{}'", id, kind, key));
        }
    }

    for key in attributes.keys() {
        let k = key.as_str();
        if !schema.required.contains(&k) && !schema.optional.contains(&k) && !COMMON_KEYS.contains(&k) {
            errors.push(format!(
                "resource '{}' ({}) has unknown attribute '{}'",
                id, kind, key
            ));
        }
    }

    for (key, value) in attributes {
        if key.ends_with("cidr_block") {
            match value.as_str() {
                Some(s) if is_valid_cidr(s) => {}
                _ => errors.push(format!(
                    "resource '{}' ({}) has invalid CIDR in '{}': {}",
                    id, kind, key, value
                )),
            }
        }
    }

    if kind == ResourceKind::Alarm {
        if let Some(v) = attributes.get("threshold") {
            if !v.is_number() {
                errors.push(format!("resource '{}' (alarm) threshold must be a number", id));
            }
        }
    }

    if let Some(rules) = attributes.get("ingress") {
        errors.extend(validate_ingress(id, rules));
    }

    errors
}

fn validate_ingress(id: &str, rules: &serde_json::Value) -> Vec<String> {
    let Some(rules) = rules.as_array() else {
        return vec![format!("resource '{}' ingress must be a list", id)];
    };
    let mut errors = Vec::new();
    for (i, rule) in rules.iter().enumerate() {
        let port = |key: &str| rule.get(key).and_then(|v| v.as_u64());
        match (port("from_port"), port("to_port")) {
            (Some(from), Some(to)) if from <= to && to <= 65535 => {}
            _ => errors.push(format!(
                "resource '{}' ingress[{}] needs from_port <= to_port <= 65535",
                id, i
            )),
        }
        if let Some(cidr) = rule.get("cidr") {
            if !cidr.as_str().is_some_and(is_valid_cidr) {
                errors.push(format!("resource '{}' ingress[{}] has invalid cidr", id, i));
            }
        }
    }
    errors
}

/// IPv4 CIDR notation, e.g. `10.0.0.0/16`.
pub fn is_valid_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}
