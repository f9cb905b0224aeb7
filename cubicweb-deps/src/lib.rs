//! Cube dependency engine.
//!
//! Everything in this crate is pure and I/O-free: version parsing and
//! comparison, the [`ConfigurationProblem`] solver that checks installed cube
//! versions against declared constraints, and cube load ordering.

pub mod order;
pub mod problem;
pub mod version;

pub use order::{expand_cubes, order_cubes};
pub use problem::{Action, ConfigurationProblem, DependencyError, Requirement, Solution};
pub use version::{Operator, Version, VersionConstraint};

/// Name of the pseudo-cube standing for the framework itself.
pub const ROOT_CUBE: &str = "cubicweb";

/// Error type for the dependency engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DepsError {
    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    #[error("Invalid version constraint: {0:?}")]
    InvalidConstraint(String),

    #[error("Cyclic cube dependencies: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Unknown cube: {0}")]
    UnknownCube(String),
}

pub type Result<T> = std::result::Result<T, DepsError>;
