use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::DagError;
use crate::stage::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dag {
    pub nodes: Vec<DagNode>,
    pub edges: Vec<(String, String)>, // (from, to)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    pub stage: Stage,
}

impl Dag {
    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Chequea ids únicos, aristas con extremos conocidos y ausencia de ciclos.
    pub fn validate(&self) -> Result<(), DagError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(DagError::DuplicateNode(node.id.clone()));
            }
        }

        for (from, to) in &self.edges {
            if !seen.contains(from.as_str()) || !seen.contains(to.as_str()) {
                return Err(DagError::UnknownNode {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Orden topológico (Kahn). Entre nodos listos a la vez se respeta el
    /// orden de declaración, así el resultado es determinista.
    pub fn topological_order(&self) -> Result<Vec<String>, DagError> {
        let position: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut indegree: BTreeMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for (_, to) in &self.edges {
            if let Some(d) = indegree.get_mut(to.as_str()) {
                *d += 1;
            }
        }

        let mut ready: BTreeSet<(usize, &str)> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| (position[id], *id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(first) = ready.iter().next().copied() {
            ready.remove(&first);
            let (_, id) = first;
            order.push(id.to_string());

            for (from, to) in &self.edges {
                if from == id {
                    if let Some(d) = indegree.get_mut(to.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert((position[to.as_str()], to.as_str()));
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = indegree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(id, _)| id.to_string())
                .unwrap_or_default();
            return Err(DagError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Dependencias directas de `id`.
    pub fn upstream_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == id)
            .map(|(from, _)| from.as_str())
            .collect()
    }

    /// Todos los nodos que dependen (transitivamente) de `id`.
    pub fn downstream_closure(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for (from, to) in &self.edges {
                if from == current && visited.insert(to.as_str()) {
                    out.push(to.clone());
                    queue.push_back(to.as_str());
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn node(id: &str) -> DagNode {
        DagNode {
            id: id.to_string(),
            stage: Stage::Convert {
                src: PathBuf::from(format!("/tmp/{id}.csv")),
            },
        }
    }

    fn edge(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn topological_order_respeta_dependencias_y_declaracion() {
        let dag = Dag {
            nodes: vec![node("a"), node("c"), node("b"), node("d")],
            edges: vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        };

        let order = dag.topological_order().unwrap();
        assert_eq!(order, vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn validate_detecta_duplicados() {
        let dag = Dag {
            nodes: vec![node("a"), node("a")],
            edges: vec![],
        };
        assert_eq!(dag.validate(), Err(DagError::DuplicateNode("a".into())));
    }

    #[test]
    fn validate_detecta_aristas_a_nodos_inexistentes() {
        let dag = Dag {
            nodes: vec![node("a")],
            edges: vec![edge("a", "zzz")],
        };
        assert!(matches!(dag.validate(), Err(DagError::UnknownNode { .. })));
    }

    #[test]
    fn validate_detecta_ciclos() {
        let dag = Dag {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![edge("a", "b"), edge("b", "c"), edge("c", "b")],
        };
        assert!(matches!(dag.validate(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn downstream_closure_es_transitiva() {
        let dag = Dag {
            nodes: vec![node("a"), node("b"), node("c"), node("x")],
            edges: vec![edge("a", "b"), edge("b", "c")],
        };

        assert_eq!(dag.downstream_closure("a"), vec!["b", "c"]);
        assert!(dag.downstream_closure("x").is_empty());
        assert_eq!(dag.upstream_of("c"), vec!["b"]);
    }
}
