//! Core reconciliation logic: types, parsing, graph building, planning, execution.

pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod schema;
pub mod state;
pub mod types;
