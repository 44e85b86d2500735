//! Stratus: declarative, idempotent cloud infrastructure reconciler.
//!
//! Desired infrastructure is a plan of resource specs with explicit
//! dependencies. Each run builds the dependency graph, walks it in
//! topological order and issues create/update calls only where recorded
//! state says they are needed. Re-running an unchanged plan is a no-op.

pub mod cli;
pub mod core;
pub mod providers;
pub mod tripwire;
