use crate::domain::model::{ServiceSpec, Wave};
use crate::utils::error::{OrchestratorError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// 將依賴圖分層成 wave：wave k 的服務只依賴 wave < k 的服務
pub struct DependencyScheduler;

impl DependencyScheduler {
    pub fn schedule(specs: &[ServiceSpec]) -> Result<Vec<Wave>> {
        let graph: BTreeMap<&str, &BTreeSet<String>> = specs
            .iter()
            .map(|s| (s.name.as_str(), &s.depends_on))
            .collect();

        for (name, deps) in &graph {
            if let Some(missing) = deps.iter().find(|d| !graph.contains_key(d.as_str())) {
                return Err(OrchestratorError::config(
                    format!("services.{}.depends_on", name),
                    format!("Dependency '{}' is not part of this run", missing),
                ));
            }
        }

        if let Some(cycle) = Self::find_cycle(&graph) {
            return Err(OrchestratorError::CyclicDependencyError { cycle });
        }

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut remaining: BTreeSet<&str> = graph.keys().copied().collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            // BTreeSet 迭代即字典序，wave 內順序可重現
            let wave: Wave = remaining
                .iter()
                .filter(|name| graph[*name].iter().all(|d| placed.contains(d.as_str())))
                .map(|name| name.to_string())
                .collect();

            if wave.is_empty() {
                // 無環時不可能發生
                return Err(OrchestratorError::CyclicDependencyError {
                    cycle: remaining.iter().map(|s| s.to_string()).collect(),
                });
            }

            for name in &wave {
                remaining.remove(name.as_str());
            }
            placed.extend(
                wave.iter()
                    .filter_map(|n| graph.get_key_value(n.as_str()).map(|(k, _)| *k)),
            );
            waves.push(wave);
        }

        tracing::debug!("🧭 Scheduled {} services into {} waves", specs.len(), waves.len());
        Ok(waves)
    }

    /// DFS + recursion stack；回傳第一個找到的環，首尾為同一服務
    fn find_cycle(graph: &BTreeMap<&str, &BTreeSet<String>>) -> Option<Vec<String>> {
        let mut finished: BTreeSet<&str> = BTreeSet::new();
        let mut path: Vec<&str> = Vec::new();

        for name in graph.keys() {
            if let Some(cycle) = Self::visit(*name, graph, &mut finished, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        node: &'a str,
        graph: &BTreeMap<&'a str, &'a BTreeSet<String>>,
        finished: &mut BTreeSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if finished.contains(node) {
            return None;
        }

        path.push(node);
        for dep in graph.get(node).copied().into_iter().flat_map(|deps| deps.iter()) {
            if let Some(cycle) = Self::visit(dep.as_str(), graph, finished, path) {
                return Some(cycle);
            }
        }
        path.pop();
        finished.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::RestartPolicy;

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image_or_command: format!("{}:latest", name),
            ports: Vec::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            health_probe: None,
            profile_tags: BTreeSet::new(),
            restart_policy: RestartPolicy::No,
            environment: BTreeMap::new(),
            best_effort: false,
        }
    }

    #[test]
    fn test_diamond_produces_three_waves() {
        let specs = vec![
            spec("D", &["B", "C"]),
            spec("C", &["A"]),
            spec("B", &["A"]),
            spec("A", &[]),
        ];
        let waves = DependencyScheduler::schedule(&specs).unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["A".to_string()],
                vec!["B".to_string(), "C".to_string()],
                vec!["D".to_string()],
            ]
        );
    }

    #[test]
    fn test_waves_partition_input_exactly_once() {
        let specs = vec![
            spec("supabase-db", &[]),
            spec("supabase-kong", &["supabase-db"]),
            spec("n8n", &["supabase-db"]),
            spec("ollama", &[]),
            spec("open-webui", &["ollama", "n8n"]),
            spec("langfuse", &["supabase-db"]),
            spec("caddy", &["open-webui", "supabase-kong", "langfuse"]),
        ];
        let waves = DependencyScheduler::schedule(&specs).unwrap();

        let flattened: Vec<&String> = waves.iter().flatten().collect();
        let unique: BTreeSet<&String> = flattened.iter().copied().collect();
        assert_eq!(flattened.len(), specs.len());
        assert_eq!(unique.len(), specs.len());
        assert_eq!(waves.last().unwrap(), &vec!["caddy".to_string()]);

        // 每個服務的依賴都在更早的 wave
        let wave_of: BTreeMap<&str, usize> = waves
            .iter()
            .enumerate()
            .flat_map(|(i, w)| w.iter().map(move |n| (n.as_str(), i)))
            .collect();
        for s in &specs {
            for d in &s.depends_on {
                assert!(wave_of[d.as_str()] < wave_of[s.name.as_str()]);
            }
        }
    }

    #[test]
    fn test_schedule_is_deterministic() {
        let specs = vec![spec("zeta", &[]), spec("alpha", &[]), spec("mid", &["zeta"])];
        let first = DependencyScheduler::schedule(&specs).unwrap();
        let mut reversed = specs.clone();
        reversed.reverse();
        let second = DependencyScheduler::schedule(&reversed).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_cycle_is_named() {
        let specs = vec![spec("a", &["c"]), spec("b", &["a"]), spec("c", &["b"]), spec("d", &[])];
        match DependencyScheduler::schedule(&specs) {
            Err(OrchestratorError::CyclicDependencyError { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|n| n == name));
                }
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let specs = vec![spec("neo4j", &["neo4j"])];
        let err = DependencyScheduler::schedule(&specs).unwrap_err();
        assert_eq!(err.to_string(), "Cyclic dependency detected: neo4j -> neo4j");
    }
}
