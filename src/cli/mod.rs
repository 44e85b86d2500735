//! CLI subcommands: init, validate, plan, apply, status, drift.

use crate::core::error::PlanError;
use crate::core::executor::{ApplyOptions, Reconciler};
use crate::core::state::{self, StateFile, StateRecorder};
use crate::core::{parser, planner, types};
use crate::providers::sandbox::SandboxProvider;
use crate::tripwire::{drift, eventlog};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stratus project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a plan file without touching the provider
    Validate {
        /// Path to the plan file
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// Override a plan param
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parser::parse_param)]
        params: Vec<(String, String)>,
    },

    /// Show what apply would do (desired vs recorded state)
    Plan {
        /// Path to the plan file
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// State file (default: <plan>.state.yaml)
        #[arg(long)]
        state: Option<PathBuf>,

        /// Override a plan param
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parser::parse_param)]
        params: Vec<(String, String)>,
    },

    /// Converge infrastructure to the desired state
    Apply {
        /// Path to the plan file
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// State file (default: <plan>.state.yaml)
        #[arg(long)]
        state: Option<PathBuf>,

        /// Sandbox inventory (default: <plan>.sandbox.yaml)
        #[arg(long)]
        sandbox: Option<PathBuf>,

        /// Readiness wait limit in seconds (overrides policy)
        #[arg(long)]
        timeout: Option<u64>,

        /// Describe Ready resources before deciding
        #[arg(long)]
        refresh: bool,

        /// Override a plan param
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parser::parse_param)]
        params: Vec<(String, String)>,
    },

    /// Show recorded state
    Status {
        /// Path to the plan file (locates the default state file)
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// State file (default: <plan>.state.yaml)
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Detect out-of-band changes to provisioned resources
    Drift {
        /// Path to the plan file (locates the default state file)
        #[arg(short, long, default_value = "stratus.yaml")]
        file: PathBuf,

        /// State file (default: <plan>.state.yaml)
        #[arg(long)]
        state: Option<PathBuf>,

        /// Sandbox inventory (default: <plan>.sandbox.yaml)
        #[arg(long)]
        sandbox: Option<PathBuf>,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file, params } => cmd_validate(&file, &params),
        Commands::Plan {
            file,
            state,
            params,
        } => cmd_plan(&file, state.as_deref(), &params),
        Commands::Apply {
            file,
            state,
            sandbox,
            timeout,
            refresh,
            params,
        } => cmd_apply(
            &file,
            state.as_deref(),
            sandbox.as_deref(),
            timeout,
            refresh,
            &params,
        ),
        Commands::Status { file, state } => cmd_status(&file, state.as_deref()),
        Commands::Drift {
            file,
            state,
            sandbox,
            tripwire,
        } => cmd_drift(&file, state.as_deref(), sandbox.as_deref(), tripwire),
    }
}

const TEMPLATE: &str = r#"version: "1.0"
name: polystudent
description: "Two-AZ VPC with public and private subnets, audit logging and alarms"

params:
  env: polystudent-vpc
  kms_key_id: alias/aws/s3

policy:
  failure: continue_independent
  await_timeout_secs: 600
  event_log: true

resources:
  - id: vpc
    kind: vpc
    attributes:
      cidr_block: 10.0.0.0/16
      enable_dns_support: true
      enable_dns_hostnames: true
      name: "{{params.env}}"

  - id: public-a
    kind: subnet
    attributes:
      cidr_block: 10.0.0.0/24
      availability_zone: us-east-1a
      map_public_ip_on_launch: true
      name: "{{params.env}} Public Subnet (AZ1)"
    depends_on: [vpc]

  - id: public-b
    kind: subnet
    attributes:
      cidr_block: 10.0.16.0/24
      availability_zone: us-east-1b
      map_public_ip_on_launch: true
      name: "{{params.env}} Public Subnet (AZ2)"
    depends_on: [vpc]

  - id: private-a
    kind: subnet
    attributes:
      cidr_block: 10.0.128.0/24
      availability_zone: us-east-1a
      name: "{{params.env}} Private Subnet (AZ1)"
    depends_on: [vpc]

  - id: private-b
    kind: subnet
    attributes:
      cidr_block: 10.0.144.0/24
      availability_zone: us-east-1b
      name: "{{params.env}} Private Subnet (AZ2)"
    depends_on: [vpc]

  - id: igw
    kind: internet_gateway
    attributes:
      name: "{{params.env}} IGW"
    depends_on: [vpc]

  - id: public-rt
    kind: route_table
    attributes:
      destination_cidr_block: 0.0.0.0/0
      name: "{{params.env}} Public Routes"
    depends_on: [vpc, igw]

  - id: nat-a
    kind: nat_gateway
    attributes:
      name: "{{params.env}} NAT (AZ1)"
    depends_on: [public-a]

  - id: nat-b
    kind: nat_gateway
    attributes:
      name: "{{params.env}} NAT (AZ2)"
    depends_on: [public-b]

  - id: private-rt-a
    kind: route_table
    attributes:
      destination_cidr_block: 0.0.0.0/0
      name: "{{params.env}} Private Routes (AZ1)"
    depends_on: [vpc, nat-a, private-a]

  - id: private-rt-b
    kind: route_table
    attributes:
      destination_cidr_block: 0.0.0.0/0
      name: "{{params.env}} Private Routes (AZ2)"
    depends_on: [vpc, nat-b, private-b]

  - id: web-sg
    kind: security_group
    attributes:
      group_name: polystudent-sg
      description: "Allow SSH, HTTP, HTTPS, MSSQL, RDP, DNS, PostgreSQL, MySQL, OSSEC, Elasticsearch"
      ingress:
        - { protocol: tcp, from_port: 22, to_port: 22, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 80, to_port: 80, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 443, to_port: 443, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 1433, to_port: 1433, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 3389, to_port: 3389, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 53, to_port: 53, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 5432, to_port: 5432, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 3306, to_port: 3306, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 1514, to_port: 1514, cidr: 0.0.0.0/0 }
        - { protocol: tcp, from_port: 9200, to_port: 9200, cidr: 0.0.0.0/0 }
    depends_on: [vpc]

  - id: logs
    kind: bucket
    attributes:
      bucket_name: polystudents3
      versioning: Enabled
      sse_algorithm: aws:kms
      kms_key_id: "{{params.kms_key_id}}"
      block_public_access: true

  - id: trail
    kind: trail
    attributes:
      trail_name: polystudent-trail
      s3_key_prefix: cloudtrail/
      multi_region: true
      log_file_validation: true
    depends_on: [logs]

  - id: rejected-traffic
    kind: flow_log
    attributes:
      traffic_type: REJECT
      log_destination_prefix: tp4-vpc-flow-logs/
    depends_on: [vpc, logs]

  - id: web
    kind: instance
    attributes:
      image_id: ami-0ecb62995f68bb549
      instance_type: t3.micro
      instance_profile: LabInstanceProfile
      name: "{{params.env}} web"
    depends_on: [public-a, web-sg]

  - id: ingress-packets
    kind: alarm
    attributes:
      alarm_name: IngressNumberofPackets
      metric_name: NetworkPacketsIn
      namespace: AWS/EC2
      statistic: Average
      period: 60
      evaluation_periods: 1
      threshold: 1000
      comparison_operator: GreaterThanThreshold
      treat_missing_data: notBreaching
      actions_enabled: false
    depends_on: [web]
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let plan_path = path.join("stratus.yaml");
    if plan_path.exists() {
        return Err(format!("{} already exists", plan_path.display()));
    }

    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&plan_path, TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", plan_path.display(), e))?;

    println!("Initialized stratus project at {}", path.display());
    println!("  Created: {}", plan_path.display());
    Ok(())
}

/// Print validation errors and collapse a plan error into a CLI message.
fn plan_error(e: PlanError) -> String {
    match e {
        PlanError::Invalid(errors) => {
            for msg in &errors {
                eprintln!("  ERROR: {}", msg);
            }
            format!("{} validation error(s)", errors.len())
        }
        other => other.to_string(),
    }
}

/// Parse, apply param overrides, resolve, build and validate.
fn load(file: &Path, params: &[(String, String)]) -> Result<(types::PlanFile, types::Plan), String> {
    let mut plan_file = parser::parse_plan_file(file).map_err(plan_error)?;
    parser::apply_param_overrides(&mut plan_file, params);
    let plan = parser::load_plan(&plan_file).map_err(plan_error)?;
    Ok((plan_file, plan))
}

fn state_path(file: &Path, state: Option<&Path>) -> PathBuf {
    state.map_or_else(|| state::default_state_path(file), Path::to_path_buf)
}

fn sandbox_path(file: &Path, sandbox: Option<&Path>) -> PathBuf {
    sandbox.map_or_else(|| SandboxProvider::default_path(file), Path::to_path_buf)
}

fn cmd_validate(file: &Path, params: &[(String, String)]) -> Result<(), String> {
    let (plan_file, plan) = load(file, params)?;
    println!(
        "OK: {} ({} resources, order: {})",
        plan_file.name,
        plan.len(),
        plan.execution_order().join(" → ")
    );
    Ok(())
}

fn cmd_plan(file: &Path, state: Option<&Path>, params: &[(String, String)]) -> Result<(), String> {
    let (plan_file, plan) = load(file, params)?;
    let store = StateFile::new(state_path(file, state))
        .load()
        .map_err(|e| e.to_string())?;
    let preview = planner::plan(&plan, &store);
    print_plan(&plan_file.name, &preview);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(name: &str, plan: &types::ExecutionPlan) {
    println!("Planning: {} ({} resources)", name, plan.changes.len());
    println!();

    for change in &plan.changes {
        let symbol = match change.action {
            types::Action::Create => "+",
            types::Action::Resume => ">",
            types::Action::Update { .. } => "~",
            types::Action::Blocked { .. } => "!",
            types::Action::NoOp => " ",
        };
        println!("  {} {}", symbol, change.description);
    }

    println!();
    println!(
        "Plan: {} to create, {} to update, {} blocked, {} unchanged.",
        plan.to_create, plan.to_update, plan.blocked, plan.unchanged
    );
}

fn cmd_apply(
    file: &Path,
    state: Option<&Path>,
    sandbox: Option<&Path>,
    timeout: Option<u64>,
    refresh: bool,
    params: &[(String, String)],
) -> Result<(), String> {
    let (plan_file, plan) = load(file, params)?;

    let state_path = state_path(file, state);
    let recorder = StateFile::new(&state_path);
    let mut store = recorder.load().map_err(|e| e.to_string())?;
    let mut provider =
        SandboxProvider::open(sandbox_path(file, sandbox)).map_err(|e| e.to_string())?;

    let mut options = ApplyOptions::from_policy(&plan_file.policy);
    if let Some(secs) = timeout {
        options.await_timeout = Duration::from_secs(secs);
    }
    options.refresh |= refresh;
    if plan_file.policy.event_log {
        options.event_log = Some(eventlog::event_log_path(&state_path));
    }

    println!("Applying: {} ({} resources)", plan_file.name, plan.len());
    let report = Reconciler::new(&mut provider)
        .with_options(options)
        .with_recorder(&recorder)
        .apply(&plan, &mut store);

    for node in &report.nodes {
        println!("  {}", node);
    }
    println!();

    if !report.is_success() {
        println!(
            "Apply completed with errors: {} ready, {} FAILED, {} skipped ({:.1}s)",
            report.ready(),
            report.failed(),
            report.skipped(),
            report.total_duration.as_secs_f64()
        );
        return Err(format!(
            "{} resource(s) failed, {} skipped",
            report.failed(),
            report.skipped()
        ));
    }

    println!(
        "Apply complete: {} changed, {} unchanged ({:.1}s).",
        report.changed(),
        report.unchanged(),
        report.total_duration.as_secs_f64()
    );
    Ok(())
}

fn cmd_status(file: &Path, state: Option<&Path>) -> Result<(), String> {
    let path = state_path(file, state);
    if !path.exists() {
        println!("No state recorded at {}", path.display());
        return Ok(());
    }
    let store = StateFile::new(&path).load().map_err(|e| e.to_string())?;

    println!("State: {}", path.display());
    println!("  Generator: {}", store.generator);
    if let Some(ref ts) = store.updated_at {
        println!("  Updated: {}", ts);
    }
    println!("  Resources: {}", store.resources.len());

    for (id, rs) in &store.resources {
        println!(
            "    {}: {} [{}] {}",
            id,
            rs.status,
            rs.kind,
            rs.provider_id.as_deref().unwrap_or("-")
        );
        if let Some(ref err) = rs.error {
            println!("      error: {}", err);
        }
    }
    Ok(())
}

fn cmd_drift(
    file: &Path,
    state: Option<&Path>,
    sandbox: Option<&Path>,
    tripwire_mode: bool,
) -> Result<(), String> {
    let path = state_path(file, state);
    let store = StateFile::new(&path).load().map_err(|e| e.to_string())?;
    let mut provider =
        SandboxProvider::open(sandbox_path(file, sandbox)).map_err(|e| e.to_string())?;

    println!("Checking {} ({} resources)...", path.display(), store.resources.len());
    let findings = drift::detect_drift(&store, &mut provider).map_err(|e| e.to_string())?;

    if findings.is_empty() {
        println!("No drift detected.");
        return Ok(());
    }

    for f in &findings {
        println!("  DRIFTED: {} [{}] ({})", f.resource_id, f.kind, f.detail);
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
    }
    println!();
    println!("Drift detected: {} resource(s)", findings.len());
    if tripwire_mode {
        return Err(format!("{} drift finding(s)", findings.len()));
    }
    Ok(())
}
