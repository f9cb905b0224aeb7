// Cube load ordering: transitive expansion, then dependency-first order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::{DepsError, Result};

/// Expand `roots` with every cube reachable through `dependencies`.
///
/// Cubes missing from `dependencies` are kept but not expanded further; the
/// configuration problem reports them.
pub fn expand_cubes<S: AsRef<str>>(
    roots: &[S],
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<String> = roots.iter().map(|r| r.as_ref().to_string()).collect();
    while let Some(cube) = stack.pop() {
        if !seen.insert(cube.clone()) {
            continue;
        }
        if let Some(deps) = dependencies.get(&cube) {
            stack.extend(deps.iter().filter(|d| !seen.contains(*d)).cloned());
        }
    }
    seen
}

/// Order cubes so that every cube comes after the cubes it depends on.
///
/// Dependencies on cubes outside `cubes` are ignored. Ties are broken by name
/// so the order is stable across runs.
pub fn order_cubes(
    cubes: &BTreeSet<String>,
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for cube in cubes {
        index.insert(cube.as_str(), graph.add_node(cube.as_str()));
    }
    for cube in cubes {
        let Some(deps) = dependencies.get(cube) else {
            continue;
        };
        for dep in deps {
            if let Some(&from) = index.get(dep.as_str()) {
                graph.add_edge(from, index[cube.as_str()], ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|n| graph[n].to_string()).collect()),
        Err(_) => {
            let mut cycle: Vec<String> = kosaraju_scc(&graph)
                .into_iter()
                .find(|scc| {
                    scc.len() > 1 || graph.contains_edge(scc[0], scc[0])
                })
                .unwrap_or_default()
                .into_iter()
                .map(|n| graph[n].to_string())
                .collect();
            cycle.sort();
            Err(DepsError::Cycle(cycle))
        }
    }
}
