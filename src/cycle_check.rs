//! DFS cycle detection over name-keyed dependency edges.

use std::collections::{HashMap, HashSet};

/// Returns `true` if the dependency edges contain a cycle.
///
/// `edges` maps a task name to the names it depends on. Names that appear
/// only on the right-hand side are treated as leaves.
pub fn has_cycle(edges: &HashMap<String, Vec<String>>) -> bool {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    fn dfs(
        name: &str,
        edges: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> bool {
        if rec_stack.contains(name) {
            return true;
        }
        if visited.contains(name) {
            return false;
        }

        visited.insert(name.to_string());
        rec_stack.insert(name.to_string());

        if let Some(deps) = edges.get(name) {
            for dep in deps {
                if dfs(dep, edges, visited, rec_stack) {
                    return true;
                }
            }
        }

        rec_stack.remove(name);
        false
    }

    for name in edges.keys() {
        if !visited.contains(name) && dfs(name, edges, &mut visited, &mut rec_stack) {
            return true;
        }
    }

    false
}

/// Returns `true` if adding the edge `from -> to` would close a cycle in the
/// existing graph, i.e. `from` is already reachable from `to`.
pub(crate) fn creates_cycle(edges: &HashMap<String, Vec<String>>, from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = vec![to];
    while let Some(name) = stack.pop() {
        if name == from {
            return true;
        }
        if !seen.insert(name) {
            continue;
        }
        if let Some(deps) = edges.get(name) {
            stack.extend(deps.iter().map(String::as_str));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    v.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                )
            })
            .collect()
    }

    #[test]
    fn acyclic_diamond() {
        let edges = graph(&[
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        assert!(!has_cycle(&edges));
    }

    #[test]
    fn detects_two_node_cycle() {
        let edges = graph(&[("a", &["b"]), ("b", &["a"])]);
        assert!(has_cycle(&edges));
    }

    #[test]
    fn detects_self_loop() {
        let edges = graph(&[("a", &["a"])]);
        assert!(has_cycle(&edges));
    }

    #[test]
    fn creates_cycle_rejects_back_edge() {
        // b depends on a, c depends on b. "a depends on c" closes the loop,
        // the reverse direction does not.
        let edges = graph(&[("b", &["a"]), ("c", &["b"])]);
        assert!(creates_cycle(&edges, "a", "c"));
        assert!(!creates_cycle(&edges, "c", "a"));
    }

    #[test]
    fn creates_cycle_allows_forward_edge() {
        let edges = graph(&[("b", &["a"])]);
        assert!(!creates_cycle(&edges, "c", "a"));
        assert!(creates_cycle(&edges, "a", "b"));
        assert!(creates_cycle(&edges, "a", "a"));
    }
}
