//! Graph utilities: distance-vector FIBs, adjacency groups, pruning, and
//! the spanning-tree construction the aggregator planner drives.
//!
//! A general-purpose layer, not specific to any one caller — these are the
//! building blocks `aggregator::planner` composes. Weights are
//! non-negative `f64` delays; graphs here are undirected (an edge is
//! traversable in either direction), matching how trunk delay and
//! inferior-network connectivity models are expressed.

use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::identity::Terminal;

/// One weighted, undirected edge between two terminals.
#[derive(Clone, Debug)]
pub struct GraphEdge {
    pub a: Terminal,
    pub b: Terminal,
    pub weight: f64,
    /// Whether this edge came from a trunk (as opposed to an inferior
    /// network's self-reported connectivity model). The planner uses this
    /// to know which edges carry bandwidth to admission-check.
    pub is_trunk: bool,
}

impl GraphEdge {
    pub fn other(&self, t: &Terminal) -> Option<&Terminal> {
        if &self.a == t {
            Some(&self.b)
        } else if &self.b == t {
            Some(&self.a)
        } else {
            None
        }
    }

    pub fn touches(&self, t: &Terminal) -> bool {
        &self.a == t || &self.b == t
    }
}

/// A FIB entry: the next hop and cumulative distance from a vertex toward
/// a destination.
#[derive(Clone, Debug)]
pub struct Way {
    pub next_hop: Terminal,
    pub distance: f64,
}

/// A single destination's distance-vector table, computed by Dijkstra over
/// `GraphEdge`s since all weights are non-negative delays.
///
/// Ties in distance are broken by terminal id, giving the planner a
/// deterministic, stable choice every time the same graph is routed — the
/// "FIB preference breaks ties by (distance, destination-id)" rule.
pub struct Fib {
    destination: Terminal,
    ways: HashMap<Terminal, Way>,
}

/// A Dijkstra min-heap entry: negative-ordered distance, then terminal id,
/// then the terminal itself. `Ord` is implemented in reverse so a
/// `BinaryHeap` (a max-heap) pops the smallest distance first, with ties
/// broken by lower terminal id — the one deterministic-tie-break rule
/// `Fib::compute` and `multi_source_distances` both need.
#[derive(PartialEq)]
struct HeapItem(f64, u64, Terminal);
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.partial_cmp(&self.0).unwrap_or(std::cmp::Ordering::Equal).then_with(|| other.1.cmp(&self.1))
    }
}

/// Dijkstra seeded from every terminal in `sources` simultaneously, each at
/// distance 0. Returns, for every reachable vertex, its distance to the
/// nearest source and the neighbor one hop closer to it — following that
/// chain from any vertex walks back to whichever source is nearest.
fn dijkstra(
    sources: &[Terminal],
    vertices: &[Terminal],
    edges: &[GraphEdge],
) -> (HashMap<Terminal, f64>, HashMap<Terminal, Terminal>) {
    let mut adjacency: HashMap<Terminal, Vec<(&Terminal, f64)>> = HashMap::new();
    for v in vertices {
        adjacency.entry(v.clone()).or_default();
    }
    for e in edges {
        adjacency.entry(e.a.clone()).or_default().push((&e.b, e.weight));
        adjacency.entry(e.b.clone()).or_default().push((&e.a, e.weight));
    }

    let mut dist: HashMap<Terminal, f64> = HashMap::new();
    let mut prev: HashMap<Terminal, Terminal> = HashMap::new();
    let mut heap = BinaryHeap::new();

    let mut seeds: Vec<&Terminal> = sources.iter().collect();
    seeds.sort_by_key(|t| t.id());
    for s in seeds {
        dist.insert(s.clone(), 0.0);
        heap.push(HeapItem(0.0, s.id(), s.clone()));
    }

    while let Some(HeapItem(d, _, u)) = heap.pop() {
        if d > *dist.get(&u).unwrap_or(&f64::INFINITY) {
            continue;
        }
        if let Some(neighbors) = adjacency.get(&u) {
            for &(v, w) in neighbors {
                let nd = d + w;
                let better = match dist.get(v) {
                    None => true,
                    Some(&cur) => nd < cur || (nd == cur && v.id() < u.id()),
                };
                if better {
                    dist.insert(v.clone(), nd);
                    prev.insert(v.clone(), u.clone());
                    heap.push(HeapItem(nd, v.id(), v.clone()));
                }
            }
        }
    }

    (dist, prev)
}

impl Fib {
    /// Computes the FIB for a single destination over `edges`.
    pub fn compute(destination: Terminal, vertices: &[Terminal], edges: &[GraphEdge]) -> Fib {
        let (dist, next_hop) = dijkstra(std::slice::from_ref(&destination), vertices, edges);

        let mut ways = HashMap::new();
        for v in vertices {
            if v == &destination {
                continue;
            }
            if let (Some(&d), Some(h)) = (dist.get(v), next_hop.get(v)) {
                ways.insert(v.clone(), Way { next_hop: h.clone(), distance: d });
            }
        }

        Fib { destination, ways }
    }

    pub fn destination(&self) -> &Terminal {
        &self.destination
    }

    /// The way from `from` toward this FIB's destination, or `None` if
    /// unreachable.
    pub fn way(&self, from: &Terminal) -> Option<&Way> {
        self.ways.get(from)
    }

    /// The full path (including both endpoints) from `from` to this FIB's
    /// destination, or `None` if unreachable.
    pub fn path(&self, from: &Terminal) -> Option<Vec<Terminal>> {
        if from == &self.destination {
            return Some(vec![from.clone()]);
        }
        let mut path = vec![from.clone()];
        let mut cur = from.clone();
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > self.ways.len() + 2 {
                return None; // cycle guard; shouldn't happen over a valid FIB.
            }
            let way = self.ways.get(&cur)?;
            path.push(way.next_hop.clone());
            if way.next_hop == self.destination {
                return Some(path);
            }
            cur = way.next_hop.clone();
        }
    }
}

/// Partitions `vertices` by the equivalence closure of edge incidence
/// (union-find over `edges`).
pub fn adjacency_groups(vertices: &[Terminal], edges: &[(Terminal, Terminal)]) -> Vec<HashSet<Terminal>> {
    let mut parent: HashMap<Terminal, Terminal> = vertices.iter().map(|v| (v.clone(), v.clone())).collect();

    fn find(parent: &mut HashMap<Terminal, Terminal>, t: &Terminal) -> Terminal {
        let p = parent.get(t).cloned().unwrap_or_else(|| t.clone());
        if &p == t {
            t.clone()
        } else {
            let root = find(parent, &p);
            parent.insert(t.clone(), root.clone());
            root
        }
    }

    for (a, b) in edges {
        parent.entry(a.clone()).or_insert_with(|| a.clone());
        parent.entry(b.clone()).or_insert_with(|| b.clone());
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        if ra != rb {
            parent.insert(ra, rb);
        }
    }

    let mut groups: HashMap<Terminal, HashSet<Terminal>> = HashMap::new();
    for v in parent.keys().cloned().collect::<Vec<_>>() {
        let root = find(&mut parent, &v);
        groups.entry(root).or_default().insert(v);
    }
    groups.into_values().collect()
}

/// Removes spur vertices (degree-1, not in `keep`) iteratively from `edges`.
pub fn prune(edges: Vec<GraphEdge>, keep: &HashSet<Terminal>) -> Vec<GraphEdge> {
    let mut edges = edges;
    loop {
        let mut degree: HashMap<Terminal, usize> = HashMap::new();
        for e in &edges {
            *degree.entry(e.a.clone()).or_insert(0) += 1;
            *degree.entry(e.b.clone()).or_insert(0) += 1;
        }
        let spurs: HashSet<Terminal> = degree
            .into_iter()
            .filter(|(t, d)| *d <= 1 && !keep.contains(t))
            .map(|(t, _)| t)
            .collect();
        if spurs.is_empty() {
            return edges;
        }
        edges.retain(|e| !spurs.contains(&e.a) && !spurs.contains(&e.b));
    }
}

/// A single round of Dijkstra seeded from every vertex in `tree`
/// simultaneously (distance 0 each), used by `spanning_tree` to find, each
/// round, the nearest unreached destination and the path back into the
/// tree it should be attached by.
///
/// Returns, for every vertex, its distance to the nearest tree vertex and
/// the neighbor on the shortest path toward that tree vertex (so following
/// `prev` from any vertex walks back into `tree`). Ties are broken by
/// terminal id, matching `Fib::compute`.
fn multi_source_distances(
    tree: &HashSet<Terminal>,
    vertices: &[Terminal],
    edges: &[GraphEdge],
) -> (HashMap<Terminal, f64>, HashMap<Terminal, Terminal>) {
    let sources: Vec<Terminal> = tree.iter().cloned().collect();
    dijkstra(&sources, vertices, edges)
}

/// Computes a spanning tree over `edges` reaching every terminal in
/// `destinations`, or `None` if no such tree exists.
///
/// Grows the tree incrementally: seed it with the lowest-id destination,
/// then repeatedly find the nearest not-yet-reached destination to the
/// current tree (a multi-source shortest-path search rooted at every tree
/// vertex at once), attach it by the shortest path back into the tree, and
/// mark it reached. This is the nearest-unreached-destination growth rule
/// directly, rather than a single-source shortest-path-tree approximation
/// of it: with 3+ destinations and multiple candidate trunks of differing
/// delay, always pathing from one fixed root can pick a different edge set
/// than always attaching the globally-nearest remaining destination. No
/// edge is ever added twice (each round attaches new vertices only) and no
/// edge is excluded for being "intra-network", satisfying the elimination
/// rule's two clauses the same way a shortest-path tree does.
pub fn spanning_tree(vertices: &[Terminal], edges: &[GraphEdge], destinations: &[Terminal]) -> Option<Vec<GraphEdge>> {
    if destinations.is_empty() {
        return Some(Vec::new());
    }

    let edge_lookup: HashMap<(u64, u64), GraphEdge> = edges
        .iter()
        .map(|e| {
            let (lo, hi) = if e.a.id() <= e.b.id() { (e.a.id(), e.b.id()) } else { (e.b.id(), e.a.id()) };
            ((lo, hi), e.clone())
        })
        .collect();

    let root = destinations.iter().min_by_key(|t| t.id()).unwrap().clone();
    let mut tree_vertices: HashSet<Terminal> = HashSet::new();
    tree_vertices.insert(root);

    let mut remaining: Vec<Terminal> = destinations.iter().filter(|d| !tree_vertices.contains(d)).cloned().collect();
    remaining.sort_by_key(|t| t.id());

    let mut tree_keys: HashSet<(u64, u64)> = HashSet::new();
    let mut tree: Vec<GraphEdge> = Vec::new();

    loop {
        if remaining.is_empty() {
            break;
        }
        let (dist, prev) = multi_source_distances(&tree_vertices, vertices, edges);
        let pos = remaining
            .iter()
            .enumerate()
            .filter_map(|(i, d)| dist.get(d).map(|&dd| (i, dd, d.id())))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.2.cmp(&b.2)))
            .map(|(i, _, _)| i);
        let pos = match pos {
            Some(p) => p,
            None => break,
        };
        let dest = remaining.remove(pos);
        if tree_vertices.contains(&dest) {
            continue;
        }
        let mut path = vec![dest.clone()];
        let mut cur = dest.clone();
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > vertices.len() + 2 {
                return None;
            }
            if tree_vertices.contains(&cur) {
                break;
            }
            let next = prev.get(&cur)?;
            path.push(next.clone());
            cur = next.clone();
        }
        for pair in path.windows(2) {
            let (u, v) = (&pair[0], &pair[1]);
            let (lo, hi) = if u.id() <= v.id() { (u.id(), v.id()) } else { (v.id(), u.id()) };
            if tree_keys.insert((lo, hi)) {
                if let Some(e) = edge_lookup.get(&(lo, hi)) {
                    tree.push(e.clone());
                }
            }
            tree_vertices.insert(u.clone());
            tree_vertices.insert(v.clone());
        }
        tree_vertices.insert(dest);
    }

    if remaining.is_empty() { Some(tree) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Terminal;

    #[test]
    fn fib_finds_direct_neighbor() {
        let a = Terminal::new_atomic("a");
        let b = Terminal::new_atomic("b");
        let edges = vec![GraphEdge { a: a.clone(), b: b.clone(), weight: 3.0, is_trunk: true }];
        let fib = Fib::compute(b.clone(), &[a.clone(), b.clone()], &edges);
        let way = fib.way(&a).unwrap();
        assert_eq!(way.next_hop, b);
        assert_eq!(way.distance, 3.0);
    }

    #[test]
    fn fib_prefers_shorter_path() {
        let a = Terminal::new_atomic("a");
        let b = Terminal::new_atomic("b");
        let c = Terminal::new_atomic("c");
        let edges = vec![
            GraphEdge { a: a.clone(), b: c.clone(), weight: 10.0, is_trunk: true },
            GraphEdge { a: a.clone(), b: b.clone(), weight: 1.0, is_trunk: true },
            GraphEdge { a: b.clone(), b: c.clone(), weight: 1.0, is_trunk: true },
        ];
        let fib = Fib::compute(c.clone(), &[a.clone(), b.clone(), c.clone()], &edges);
        assert_eq!(fib.way(&a).unwrap().distance, 2.0);
    }

    #[test]
    fn adjacency_groups_partitions_connected_components() {
        let a = Terminal::new_atomic("a");
        let b = Terminal::new_atomic("b");
        let c = Terminal::new_atomic("c");
        let groups = adjacency_groups(&[a.clone(), b.clone(), c.clone()], &[(a.clone(), b.clone())]);
        assert_eq!(groups.len(), 2);
        let with_a = groups.iter().find(|g| g.contains(&a)).unwrap();
        assert!(with_a.contains(&b));
        assert!(!with_a.contains(&c));
    }

    #[test]
    fn spanning_tree_reaches_all_destinations() {
        let a = Terminal::new_atomic("a");
        let b = Terminal::new_atomic("b");
        let c = Terminal::new_atomic("c");
        let edges = vec![
            GraphEdge { a: a.clone(), b: b.clone(), weight: 1.0, is_trunk: true },
            GraphEdge { a: b.clone(), b: c.clone(), weight: 1.0, is_trunk: true },
        ];
        let tree = spanning_tree(&[a.clone(), b.clone(), c.clone()], &edges, &[a.clone(), c.clone()]).unwrap();
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn spanning_tree_prefers_cheap_redundant_path_over_direct_trunk() {
        // Three destinations, two candidate trunks between d3 and the rest:
        // a cheap detour through y (weight 2 total) and an expensive direct
        // trunk through x (weight 50). The tree must grow by attaching each
        // unreached destination via whichever path is nearest to what has
        // already been reached, not by routing everything through a single
        // fixed root — so d3 should be picked up via y, not via x.
        let d1 = Terminal::new_atomic("d1");
        let d2 = Terminal::new_atomic("d2");
        let d3 = Terminal::new_atomic("d3");
        let x = Terminal::new_atomic("x");
        let y = Terminal::new_atomic("y");
        let edges = vec![
            GraphEdge { a: d1.clone(), b: x.clone(), weight: 1.0, is_trunk: true },
            GraphEdge { a: x.clone(), b: d2.clone(), weight: 1.0, is_trunk: true },
            GraphEdge { a: x.clone(), b: d3.clone(), weight: 50.0, is_trunk: true },
            GraphEdge { a: d3.clone(), b: y.clone(), weight: 1.0, is_trunk: true },
            GraphEdge { a: y.clone(), b: d2.clone(), weight: 1.0, is_trunk: true },
        ];
        let vertices = [d1.clone(), d2.clone(), d3.clone(), x.clone(), y.clone()];
        let tree = spanning_tree(&vertices, &edges, &[d1.clone(), d2.clone(), d3.clone()]).unwrap();

        let total_weight: f64 = tree.iter().map(|e| e.weight).sum();
        assert_eq!(tree.len(), 4);
        assert_eq!(total_weight, 4.0, "should route d3 via the cheap y detour, not the 50-weight direct trunk");

        let uses_expensive_trunk = tree.iter().any(|e| e.touches(&x) && e.touches(&d3));
        assert!(!uses_expensive_trunk, "the expensive x-d3 trunk should be eliminated in favor of the cheaper path");

        // Every destination reachable from every other through the tree alone.
        for dest in [&d1, &d2, &d3] {
            let reach_fib = Fib::compute(dest.clone(), &vertices, &tree);
            for other in [&d1, &d2, &d3] {
                if other != dest {
                    assert!(reach_fib.way(other).is_some(), "{:?} must reach {:?} via the tree", other, dest);
                }
            }
        }
    }

    #[test]
    fn spanning_tree_fails_when_disconnected() {
        let a = Terminal::new_atomic("a");
        let c = Terminal::new_atomic("c");
        let tree = spanning_tree(&[a.clone(), c.clone()], &[], &[a, c]);
        assert!(tree.is_none());
    }

    #[test]
    fn prune_removes_spurs_iteratively() {
        let a = Terminal::new_atomic("a");
        let b = Terminal::new_atomic("b");
        let c = Terminal::new_atomic("c");
        let keep: HashSet<Terminal> = [a.clone(), c.clone()].into_iter().collect();
        let edges = vec![
            GraphEdge { a: a.clone(), b: b.clone(), weight: 1.0, is_trunk: true },
            GraphEdge { a: b.clone(), b: c.clone(), weight: 1.0, is_trunk: true },
        ];
        // b is degree-2 here so nothing is pruned yet.
        let pruned = prune(edges, &keep);
        assert_eq!(pruned.len(), 2);
    }
}
