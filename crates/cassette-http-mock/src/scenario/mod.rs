//! Declarative scenario routing.
//!
//! When a scenario YAML is loaded, requests are matched by exact path, then
//! declaration order, with an optional method filter and an optional
//! JSON-body predicate per scenario. Scenario mode supersedes header-based
//! lookup entirely.

mod config;
mod predicate;

pub use config::{Scenario, ScenarioError, ScenarioSet};
pub use predicate::{BodyPredicate, CompiledPredicate, PredicateError};
