//! # Stratification
//!
//! Dependency graph construction, SCC detection (Tarjan's), and negation
//! stratification over declarations. A clause `h(..) : .., b(..), !c(..).`
//! contributes a positive edge `h -> b` and a negative edge `h -> c`;
//! aggregation is non-monotone, so `over` edges are negative too. A program
//! stratifies iff no cycle contains a negative edge; when one does, the SCC
//! is returned as the representative cycle for diagnostics.

use crate::ast::{BodyItem, DeclId, ModuleIndex, ParseArena};
use std::collections::{HashMap, HashSet};

/// Type of dependency between relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyType {
    /// Head depends on the relation through a positive atom; may share a
    /// stratum.
    Positive,
    /// Head negates (or aggregates over) the relation; it must be fully
    /// computed in a strictly lower stratum.
    Negative,
}

/// Dependency graph keyed by canonical declaration ids.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub edges: HashMap<DeclId, Vec<(DeclId, DependencyType)>>,
    pub relations: HashSet<DeclId>,
}

impl DependencyGraph {
    pub fn add_edge(&mut self, from: DeclId, to: DeclId, ty: DependencyType) {
        self.relations.insert(from);
        self.relations.insert(to);
        self.edges.entry(from).or_default().push((to, ty));
    }
}

/// Build the dependency graph for the import closure of `root`. Functor uses
/// are not relations and contribute no edges.
pub fn build_dependency_graph(arena: &ParseArena, root: ModuleIndex) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    for clause in arena.clauses_in_dependency_order(root) {
        let head = arena.redeclarations(clause.head)[0];
        graph.relations.insert(head);
        for item in &clause.body {
            match item {
                BodyItem::Predicate(pred) => {
                    let decl = arena.canonical(pred.decl);
                    if decl.is_functor() {
                        continue;
                    }
                    let ty = if pred.negated {
                        DependencyType::Negative
                    } else {
                        DependencyType::Positive
                    };
                    graph.add_edge(head, decl.id, ty);
                }
                BodyItem::Aggregate(agg) => {
                    let inner = arena.canonical(agg.predicate.decl);
                    if !inner.is_functor() {
                        graph.add_edge(head, inner.id, DependencyType::Negative);
                    }
                }
                _ => {}
            }
        }
    }
    graph
}

/// Strongly connected components in reverse topological order (callees
/// first), via Tarjan's algorithm.
pub fn find_sccs(graph: &DependencyGraph) -> Vec<Vec<DeclId>> {
    struct Tarjan<'g> {
        graph: &'g DependencyGraph,
        index: HashMap<DeclId, usize>,
        lowlink: HashMap<DeclId, usize>,
        on_stack: HashSet<DeclId>,
        stack: Vec<DeclId>,
        next_index: usize,
        sccs: Vec<Vec<DeclId>>,
    }

    impl Tarjan<'_> {
        fn strong_connect(&mut self, v: DeclId) {
            self.index.insert(v, self.next_index);
            self.lowlink.insert(v, self.next_index);
            self.next_index += 1;
            self.stack.push(v);
            self.on_stack.insert(v);

            if let Some(edges) = self.graph.edges.get(&v) {
                for &(w, _) in edges {
                    if !self.index.contains_key(&w) {
                        self.strong_connect(w);
                        let low = self.lowlink[&w].min(self.lowlink[&v]);
                        self.lowlink.insert(v, low);
                    } else if self.on_stack.contains(&w) {
                        let low = self.index[&w].min(self.lowlink[&v]);
                        self.lowlink.insert(v, low);
                    }
                }
            }

            if self.lowlink[&v] == self.index[&v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort();
                self.sccs.push(component);
            }
        }
    }

    let mut tarjan = Tarjan {
        graph,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next_index: 0,
        sccs: Vec::new(),
    };

    let mut roots: Vec<DeclId> = graph.relations.iter().copied().collect();
    roots.sort();
    for v in roots {
        if !tarjan.index.contains_key(&v) {
            tarjan.strong_connect(v);
        }
    }
    tarjan.sccs
}

/// Result of a successful stratification.
#[derive(Debug, Clone)]
pub struct StratificationResult {
    /// Relations grouped by stratum, lowest first.
    pub strata: Vec<Vec<DeclId>>,
    /// Stratum number per relation.
    pub stratum_of: HashMap<DeclId, usize>,
}

impl StratificationResult {
    pub fn stratum(&self, decl: DeclId) -> usize {
        self.stratum_of.get(&decl).copied().unwrap_or(0)
    }
}

/// Stratify with negation. Returns the members of an offending SCC when a
/// negative edge closes a cycle.
pub fn stratify_with_negation(
    graph: &DependencyGraph,
) -> Result<StratificationResult, Vec<DeclId>> {
    let sccs = find_sccs(graph);
    let mut scc_of: HashMap<DeclId, usize> = HashMap::new();
    for (i, scc) in sccs.iter().enumerate() {
        for &d in scc {
            scc_of.insert(d, i);
        }
    }

    // A negative edge inside one SCC is negation through recursion.
    for (from, edges) in &graph.edges {
        for &(to, ty) in edges {
            if ty == DependencyType::Negative && scc_of.get(from) == scc_of.get(&to) {
                return Err(sccs[scc_of[from]].clone());
            }
        }
    }

    // Iterate stratum numbers to fixpoint. With no negative cycles this
    // terminates within |relations| passes.
    let mut stratum_of: HashMap<DeclId, usize> = graph
        .relations
        .iter()
        .map(|&d| (d, 0usize))
        .collect();
    loop {
        let mut changed = false;
        for (&from, edges) in &graph.edges {
            for &(to, ty) in edges {
                let need = stratum_of[&to] + usize::from(ty == DependencyType::Negative);
                if stratum_of[&from] < need {
                    stratum_of.insert(from, need);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    let max_stratum = stratum_of.values().copied().max().unwrap_or(0);
    let mut strata = vec![Vec::new(); max_stratum + 1];
    let mut ordered: Vec<DeclId> = graph.relations.iter().copied().collect();
    ordered.sort();
    for d in ordered {
        strata[stratum_of[&d]].push(d);
    }
    Ok(StratificationResult { strata, stratum_of })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(n: u32) -> DeclId {
        DeclId(n)
    }

    #[test]
    fn sccs_group_cycles() {
        let mut g = DependencyGraph::default();
        g.add_edge(d(0), d(1), DependencyType::Positive);
        g.add_edge(d(1), d(0), DependencyType::Positive);
        g.add_edge(d(2), d(0), DependencyType::Positive);
        let sccs = find_sccs(&g);
        assert!(sccs.contains(&vec![d(0), d(1)]));
        assert!(sccs.contains(&vec![d(2)]));
        // Callees come out first.
        let pos_cycle = sccs.iter().position(|s| s.len() == 2).expect("cycle scc");
        let pos_user = sccs.iter().position(|s| s == &vec![d(2)]).expect("user scc");
        assert!(pos_cycle < pos_user);
    }

    #[test]
    fn positive_recursion_stratifies() {
        let mut g = DependencyGraph::default();
        g.add_edge(d(0), d(0), DependencyType::Positive);
        g.add_edge(d(0), d(1), DependencyType::Positive);
        let result = stratify_with_negation(&g).expect("stratifies");
        assert_eq!(result.stratum(d(1)), 0);
        assert_eq!(result.stratum(d(0)), 0);
    }

    #[test]
    fn negation_raises_stratum() {
        let mut g = DependencyGraph::default();
        // unreach -> !reach, reach -> edge
        g.add_edge(d(2), d(1), DependencyType::Negative);
        g.add_edge(d(1), d(0), DependencyType::Positive);
        let result = stratify_with_negation(&g).expect("stratifies");
        assert_eq!(result.stratum(d(0)), 0);
        assert_eq!(result.stratum(d(1)), 0);
        assert_eq!(result.stratum(d(2)), 1);
        assert_eq!(result.strata.len(), 2);
    }

    #[test]
    fn negative_cycle_is_rejected() {
        let mut g = DependencyGraph::default();
        g.add_edge(d(0), d(1), DependencyType::Negative);
        g.add_edge(d(1), d(0), DependencyType::Positive);
        let err = stratify_with_negation(&g).expect_err("must fail");
        assert_eq!(err, vec![d(0), d(1)]);
    }
}
