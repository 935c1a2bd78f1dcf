//! Incremental cycle detection over the dependency edges of the current run.
//!
//! The graph is append-only within a run and reset at every run boundary, so
//! stale edges from prior runs can never combine with fresh ones to close a
//! cycle. A topological order over the nodes is maintained incrementally
//! (Pearce-Kelly): inserting an edge that respects the order is O(1);
//! inserting one that violates it triggers a search restricted to the
//! affected region, which either finds a cycle or repairs the order.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::cell::CellId;

/// Result of attempting to insert an edge.
pub(crate) enum AddEdge {
    Added,
    /// The edge was already present; nothing changed.
    Exists,
    /// Inserting the edge would close a cycle. The payload is the offending
    /// path `to -> ... -> from` (callee first, caller last).
    Cycle(Vec<CellId>),
}

#[derive(Default)]
pub(crate) struct Dag {
    ord: FxHashMap<CellId, u64>,
    children: FxHashMap<CellId, SmallVec<[CellId; 4]>>,
    parents: FxHashMap<CellId, SmallVec<[CellId; 4]>>,
    next_ord: u64,
}

impl Dag {
    pub(crate) fn clear(&mut self) {
        self.ord.clear();
        self.children.clear();
        self.parents.clear();
        self.next_ord = 0;
    }

    /// Inserts `id` if absent; returns true if it was new.
    pub(crate) fn ensure_node(&mut self, id: CellId) -> bool {
        if self.ord.contains_key(&id) {
            return false;
        }
        self.ord.insert(id, self.next_ord);
        self.next_ord += 1;
        true
    }

    pub(crate) fn add_edge(&mut self, from: CellId, to: CellId) -> AddEdge {
        self.ensure_node(from);
        self.ensure_node(to);

        if from == to {
            return AddEdge::Cycle(vec![to]);
        }
        if self
            .children
            .get(&from)
            .map_or(false, |cs| cs.contains(&to))
        {
            return AddEdge::Exists;
        }

        let ub = self.ord[&from];
        let lb = self.ord[&to];
        if lb > ub {
            // The edge already respects the topological order.
            self.link(from, to);
            return AddEdge::Added;
        }

        // Forward search from `to`, restricted to the affected region.
        let mut parent: FxHashMap<CellId, CellId> = FxHashMap::default();
        let mut delta_f: FxHashSet<CellId> = FxHashSet::default();
        let mut stack = vec![to];
        delta_f.insert(to);
        while let Some(n) = stack.pop() {
            if let Some(cs) = self.children.get(&n) {
                for &c in cs {
                    if self.ord[&c] > ub || delta_f.contains(&c) {
                        continue;
                    }
                    parent.insert(c, n);
                    if c == from {
                        return AddEdge::Cycle(self.cycle_path(&parent, from, to));
                    }
                    delta_f.insert(c);
                    stack.push(c);
                }
            }
        }

        // No cycle: repair the order by redistributing the indices of the
        // affected nodes (backward region first, forward region second).
        let mut delta_b: FxHashSet<CellId> = FxHashSet::default();
        let mut stack = vec![from];
        delta_b.insert(from);
        while let Some(n) = stack.pop() {
            if let Some(ps) = self.parents.get(&n) {
                for &p in ps {
                    if self.ord[&p] < lb || delta_b.contains(&p) {
                        continue;
                    }
                    delta_b.insert(p);
                    stack.push(p);
                }
            }
        }

        let mut back: Vec<CellId> = delta_b.into_iter().collect();
        back.sort_by_key(|id| self.ord[id]);
        let mut fwd: Vec<CellId> = delta_f.into_iter().collect();
        fwd.sort_by_key(|id| self.ord[id]);

        let mut pool: Vec<u64> = back
            .iter()
            .chain(fwd.iter())
            .map(|id| self.ord[id])
            .collect();
        pool.sort_unstable();
        for (id, slot) in back.into_iter().chain(fwd.into_iter()).zip(pool) {
            self.ord.insert(id, slot);
        }

        self.link(from, to);
        AddEdge::Added
    }

    fn link(&mut self, from: CellId, to: CellId) {
        self.children.entry(from).or_default().push(to);
        self.parents.entry(to).or_default().push(from);
    }

    fn cycle_path(
        &self,
        parent: &FxHashMap<CellId, CellId>,
        from: CellId,
        to: CellId,
    ) -> Vec<CellId> {
        let mut path = vec![from];
        let mut cursor = from;
        while cursor != to {
            cursor = parent[&cursor];
            path.push(cursor);
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> CellId {
        CellId(n)
    }

    #[test]
    fn ordered_inserts() {
        let mut dag = Dag::default();
        assert!(matches!(dag.add_edge(id(1), id(2)), AddEdge::Added));
        assert!(matches!(dag.add_edge(id(2), id(3)), AddEdge::Added));
        assert!(matches!(dag.add_edge(id(1), id(3)), AddEdge::Added));
        assert!(matches!(dag.add_edge(id(1), id(2)), AddEdge::Exists));
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let mut dag = Dag::default();
        match dag.add_edge(id(7), id(7)) {
            AddEdge::Cycle(path) => assert_eq!(path, vec![id(7)]),
            _ => panic!("expected cycle"),
        }
    }

    #[test]
    fn violating_insert_reorders() {
        let mut dag = Dag::default();
        assert!(matches!(dag.add_edge(id(1), id(2)), AddEdge::Added));
        // 3 was created after 2, so 3 -> 1 violates the current order but
        // closes no cycle.
        dag.ensure_node(id(3));
        assert!(matches!(dag.add_edge(id(3), id(1)), AddEdge::Added));
        // After the repair a genuine back-edge is still caught.
        match dag.add_edge(id(2), id(3)) {
            AddEdge::Cycle(path) => assert_eq!(path, vec![id(3), id(1), id(2)]),
            _ => panic!("expected cycle"),
        }
    }

    #[test]
    fn triangle_cycle_path() {
        let mut dag = Dag::default();
        assert!(matches!(dag.add_edge(id(10), id(11)), AddEdge::Added));
        assert!(matches!(dag.add_edge(id(11), id(12)), AddEdge::Added));
        match dag.add_edge(id(12), id(10)) {
            AddEdge::Cycle(path) => assert_eq!(path, vec![id(10), id(11), id(12)]),
            _ => panic!("expected cycle"),
        }
    }

    #[test]
    fn clear_forgets_everything() {
        let mut dag = Dag::default();
        assert!(matches!(dag.add_edge(id(1), id(2)), AddEdge::Added));
        assert!(matches!(dag.add_edge(id(2), id(1)), AddEdge::Cycle(_)));
        dag.clear();
        assert!(matches!(dag.add_edge(id(2), id(1)), AddEdge::Added));
    }
}
