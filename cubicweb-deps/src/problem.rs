// Configuration problem: checks installed cube versions against the
// constraints every cube declares on the cubes it depends on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::version::{Operator, Version, VersionConstraint};

/// What must happen to a cube for the configuration to become consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    /// The cube is required but not installed at all.
    Add,
    /// The cube is installed below the required version.
    Update,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
        }
    }
}

/// One unsatisfied dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyError {
    pub action: Action,
    pub cube: String,
    /// Effective required version, if any constraint applied.
    pub version: Option<Version>,
    /// Cube whose constraint produced the effective requirement.
    pub source: Option<String>,
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cube {}", self.action.as_str(), self.cube)?;
        if let Some(version) = self.version {
            write!(f, " (>= {version})")?;
        }
        if let Some(source) = &self.source {
            write!(f, " required by {source}")?;
        }
        Ok(())
    }
}

/// A reverse dependency: `cube` requires the depended-on cube with `op version`.
/// Both fields are `None` for an unconstrained requirement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Requirement {
    pub op: Option<Operator>,
    pub version: Option<Version>,
    pub cube: String,
}

/// Result of [`ConfigurationProblem::solve`].
#[derive(Debug, Clone, Default)]
pub struct Solution {
    /// `cube -> {dependency: raw constraint}`.
    pub dependencies: BTreeMap<String, BTreeMap<String, Option<String>>>,
    /// `dependency -> {requirements}` (transpose of `dependencies`).
    pub reverse_dependencies: BTreeMap<String, BTreeSet<Requirement>>,
    /// Malformed constraints that were dropped.
    pub warnings: Vec<String>,
    pub errors: Vec<DependencyError>,
    /// Constraint combinations the folding policy does not resolve.
    pub unresolved: Vec<String>,
}

impl Solution {
    pub fn is_consistent(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The set of installed cubes and their declared dependencies.
///
/// The root package is always present with its own version and has no
/// dependency lookup of its own.
#[derive(Debug, Clone)]
pub struct ConfigurationProblem {
    root: String,
    cubes: BTreeMap<String, Version>,
    declared: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

impl ConfigurationProblem {
    pub fn new(root: impl Into<String>, root_version: Version) -> Self {
        let root = root.into();
        let mut cubes = BTreeMap::new();
        cubes.insert(root.clone(), root_version);
        Self {
            root,
            cubes,
            declared: BTreeMap::new(),
        }
    }

    /// Register an installed cube with its declared dependencies
    /// (`name -> "<op> <version>"` or `None` when unconstrained).
    pub fn add_cube<I, K>(&mut self, name: impl Into<String>, version: Version, depends: I)
    where
        I: IntoIterator<Item = (K, Option<String>)>,
        K: Into<String>,
    {
        let name = name.into();
        let deps = depends.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.cubes.insert(name.clone(), version);
        self.declared.insert(name, deps);
    }

    pub fn installed(&self) -> &BTreeMap<String, Version> {
        &self.cubes
    }

    pub fn solve(&self) -> Solution {
        let mut solution = Solution::default();

        for cube in self.cubes.keys() {
            if *cube == self.root {
                continue;
            }
            let deps = self.declared.get(cube).cloned().unwrap_or_default();
            solution.dependencies.insert(cube.clone(), deps);
        }

        for (cube, deps) in &solution.dependencies {
            for (name, constraint) in deps {
                let requirements = solution
                    .reverse_dependencies
                    .entry(name.clone())
                    .or_default();
                match constraint {
                    Some(raw) => match raw.parse::<VersionConstraint>() {
                        Ok(c) => {
                            requirements.insert(Requirement {
                                op: Some(c.op),
                                version: Some(c.version),
                                cube: cube.clone(),
                            });
                        }
                        Err(_) => solution.warnings.push(format!(
                            "cube {cube} depends on {name} but constraint badly formatted: {raw}"
                        )),
                    },
                    None => {
                        requirements.insert(Requirement {
                            op: None,
                            version: None,
                            cube: cube.clone(),
                        });
                    }
                }
            }
        }

        for (cube, requirements) in &solution.reverse_dependencies {
            let (oper, version, source) =
                fold_requirements(cube, requirements, &mut solution.unresolved);
            debug!(cube = %cube, ?oper, ?version, "folded requirements");

            let Some(installed) = self.cubes.get(cube) else {
                solution.errors.push(DependencyError {
                    action: Action::Add,
                    cube: cube.clone(),
                    version,
                    source,
                });
                continue;
            };
            if requirements.is_empty() {
                continue;
            }
            match (oper, version) {
                (Some(Operator::Ge | Operator::Eq), Some(required)) => {
                    if *installed < required {
                        solution.errors.push(DependencyError {
                            action: Action::Update,
                            cube: cube.clone(),
                            version: Some(required),
                            source,
                        });
                    }
                }
                (None, _) => {}
                (Some(op), _) => solution
                    .unresolved
                    .push(format!("unknown operator {op} for {cube}")),
            }
        }

        solution
    }
}

/// Fold a requirement set into a single effective `(operator, version, source)`.
///
/// The first requirement seeds the accumulator. Later `>=` requirements raise
/// the floor only when strictly greater, unconstrained requirements are
/// skipped, and any other combination is recorded as unresolved without
/// changing the accumulator.
fn fold_requirements(
    cube: &str,
    requirements: &BTreeSet<Requirement>,
    unresolved: &mut Vec<String>,
) -> (Option<Operator>, Option<Version>, Option<String>) {
    let mut oper: Option<Operator> = None;
    let mut version: Option<Version> = None;
    let mut source: Option<String> = None;

    for req in requirements {
        if oper.is_none() {
            oper = req.op;
            version = req.version;
            source = Some(req.cube.clone());
        } else if req.op == Some(Operator::Ge) && oper == Some(Operator::Ge) {
            if req.version > version {
                version = req.version;
                source = Some(req.cube.clone());
            }
        } else if req.op.is_some() {
            unresolved.push(format!(
                "unable to handle {cube} in {}, set to `{} {}` but currently up to `{} {}`",
                source.as_deref().unwrap_or("?"),
                oper.map_or("", Operator::as_str),
                version.map(|v| v.to_string()).unwrap_or_default(),
                req.op.map_or("", Operator::as_str),
                req.version.map(|v| v.to_string()).unwrap_or_default(),
            ));
        }
    }

    (oper, version, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn dep(name: &str, constraint: &str) -> (String, Option<String>) {
        (name.to_string(), Some(constraint.to_string()))
    }

    #[test]
    fn missing_cube_is_reported_as_add() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [dep("B", ">= 2.0.0")]);
        let solution = problem.solve();

        assert_eq!(
            solution.errors,
            vec![DependencyError {
                action: Action::Add,
                cube: "B".into(),
                version: Some(v("2.0.0")),
                source: Some("A".into()),
            }]
        );
        assert!(solution.errors.iter().all(|e| e.action != Action::Update));
    }

    #[test]
    fn installed_below_floor_is_reported_as_update() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [dep("B", ">= 2.0.0")]);
        problem.add_cube("B", v("1.5.0"), Vec::<(String, Option<String>)>::new());
        let solution = problem.solve();

        assert_eq!(solution.errors.len(), 1);
        let err = &solution.errors[0];
        assert_eq!(err.action, Action::Update);
        assert_eq!(err.cube, "B");
        assert_eq!(err.version, Some(v("2.0.0")));
        assert_eq!(err.source.as_deref(), Some("A"));
    }

    #[test]
    fn tightest_floor_wins() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [dep("C", ">= 1.0.0")]);
        problem.add_cube("B", v("1.0.0"), [dep("C", ">= 1.4.0")]);
        problem.add_cube("C", v("1.2.0"), Vec::<(String, Option<String>)>::new());
        let solution = problem.solve();

        assert_eq!(solution.errors.len(), 1);
        assert_eq!(solution.errors[0].version, Some(v("1.4.0")));
        assert_eq!(solution.errors[0].source.as_deref(), Some("B"));
    }

    #[test]
    fn satisfied_configuration_has_no_errors() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [dep("cubicweb", ">= 3.20.0"), dep("B", ">= 1.0")]);
        problem.add_cube("B", v("1.0.0"), [("cubicweb".to_string(), None)]);
        let solution = problem.solve();
        assert!(solution.is_consistent(), "{:?}", solution.errors);
        assert!(solution.unresolved.is_empty());
    }

    #[test]
    fn malformed_constraint_is_a_warning_and_dropped() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [dep("B", "at least 2")]);
        problem.add_cube("B", v("1.0.0"), Vec::<(String, Option<String>)>::new());
        let solution = problem.solve();

        assert_eq!(solution.warnings.len(), 1);
        assert!(solution.warnings[0].contains("badly formatted"));
        assert!(solution.is_consistent());
        assert!(solution.reverse_dependencies["B"].is_empty());
    }

    #[test]
    fn conflicting_operators_are_reported_not_resolved() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [dep("C", "== 1.0.0")]);
        problem.add_cube("B", v("1.0.0"), [dep("C", ">= 2.0.0")]);
        problem.add_cube("C", v("1.0.0"), Vec::<(String, Option<String>)>::new());
        let solution = problem.solve();

        // `==` sorts before `>=` and seeds the accumulator; the floor from B
        // is left unresolved.
        assert_eq!(solution.unresolved.len(), 1);
        assert!(solution.unresolved[0].contains("unable to handle C"));
        assert!(solution.is_consistent());
    }

    #[test]
    fn unconstrained_requirement_on_installed_cube_is_fine() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [("B".to_string(), None)]);
        problem.add_cube("B", v("0.1.0"), Vec::<(String, Option<String>)>::new());
        assert!(problem.solve().is_consistent());
    }

    #[test]
    fn unconstrained_requirement_on_missing_cube_still_adds() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [("B".to_string(), None)]);
        let solution = problem.solve();
        assert_eq!(solution.errors.len(), 1);
        assert_eq!(solution.errors[0].action, Action::Add);
        assert_eq!(solution.errors[0].version, None);
    }

    #[test]
    fn reverse_dependencies_transpose_the_graph() {
        let mut problem = ConfigurationProblem::new("cubicweb", v("3.26.0"));
        problem.add_cube("A", v("1.0.0"), [dep("B", ">= 1.0.0")]);
        problem.add_cube("B", v("1.0.0"), Vec::<(String, Option<String>)>::new());
        let solution = problem.solve();
        let reqs: Vec<_> = solution.reverse_dependencies["B"].iter().collect();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].cube, "A");
        assert_eq!(reqs[0].op, Some(Operator::Ge));
    }
}
