//! The asymmetric-bandwidth spanning-tree planner: turns a sanitized
//! request `Segment` expressed in aggregator-exposed terminals into tunnel
//! allocations on trunks plus per-inferior-network sub-`Segment`s.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::graph::{self, GraphEdge};
use crate::identity::{Circuit, Terminal, TrafficFlow};
use crate::network::Network;
use crate::segment::Segment;
use std::sync::Arc;

use super::Inner;

/// One tunnel this plan allocates: the trunk it lives on and the circuit
/// at each end.
pub(super) struct PlannedTunnel {
    pub trunk_id: u64,
    pub start_circuit: Circuit,
    pub end_circuit: Circuit,
}

/// The result of a successful plan: tunnels to hold, plus the segment each
/// inferior network touched by the plan should be asked to carry.
pub(super) struct Plan {
    pub tunnels: Vec<PlannedTunnel>,
    pub sub_segments: Vec<(Arc<dyn Network>, Segment)>,
}

/// Builds the routing graph: vertices are every terminal of every
/// registered inferior network; edges are (a) each inferior network's
/// self-reported connectivity model (`Network::get_model`) and (b) every
/// trunk that is commissioned, has a free label, is not in `excluded`, and
/// whose `max(upstream_avail, downstream_avail) >= min_threshold`. Also
/// returns a lookup from a trunk edge's sorted terminal ids back to the
/// trunk id, since the admission check later needs to revisit the trunk
/// record a tree edge came from.
pub(super) fn build_graph(
    inner: &mut Inner,
    min_threshold: f64,
    excluded: &HashSet<u64>,
) -> (Vec<Terminal>, Vec<GraphEdge>, HashMap<(u64, u64), u64>) {
    let mut vertices: Vec<Terminal> = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    let mut edges: Vec<GraphEdge> = Vec::new();
    let mut trunk_edge_ids: HashMap<(u64, u64), u64> = HashMap::new();

    let networks: Vec<Arc<dyn Network>> = inner.inferior_networks.clone();
    for network in &networks {
        let terminals = network.get_terminals();
        for t in &terminals {
            if seen.insert(t.id()) {
                vertices.push(t.clone());
            }
        }
        for (edge, metrics) in network.get_model(min_threshold) {
            if metrics.weight > 0.0 {
                edges.push(GraphEdge { a: edge.a().clone(), b: edge.b().clone(), weight: metrics.weight, is_trunk: false });
            }
        }
    }

    for (&trunk_id, record) in &inner.trunks {
        if excluded.contains(&trunk_id) {
            continue;
        }
        if !record.trunk.is_commissioned() || record.trunk.free_label_count() == 0 {
            continue;
        }
        if record.trunk.max_available() < min_threshold {
            continue;
        }
        for t in [&record.start, &record.end] {
            if seen.insert(t.id()) {
                vertices.push(t.clone());
            }
        }
        edges.push(GraphEdge { a: record.start.clone(), b: record.end.clone(), weight: record.trunk.delay(), is_trunk: true });
        let (lo, hi) = sorted_pair(record.start.id(), record.end.id());
        trunk_edge_ids.insert((lo, hi), trunk_id);
    }

    (vertices, edges, trunk_edge_ids)
}

fn sorted_pair(a: u64, b: u64) -> (u64, u64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Vertices of `tree` reachable from `from` without crossing `excluded`
/// (the edge being bisected).
fn reachable_from(tree: &[GraphEdge], from: &Terminal, excluded_idx: usize) -> HashSet<u64> {
    let mut adjacency: HashMap<u64, Vec<&Terminal>> = HashMap::new();
    for (i, e) in tree.iter().enumerate() {
        if i == excluded_idx {
            continue;
        }
        adjacency.entry(e.a.id()).or_default().push(&e.b);
        adjacency.entry(e.b.id()).or_default().push(&e.a);
    }
    let mut visited: HashSet<u64> = HashSet::new();
    let mut stack = vec![from.clone()];
    visited.insert(from.id());
    while let Some(cur) = stack.pop() {
        if let Some(neighbors) = adjacency.get(&cur.id()) {
            for n in neighbors {
                if visited.insert(n.id()) {
                    stack.push((*n).clone());
                }
            }
        }
    }
    visited
}

struct Requirement {
    trunk_id: u64,
    required_up: f64,
    required_down: f64,
    shortfall: f64,
}

/// Computes, for every trunk edge in `tree`, the bandwidth it would need
/// to carry given the bisection of `per_terminal` that removing it would
/// produce.
fn admission_check(
    inner: &Inner,
    tree: &[GraphEdge],
    trunk_edge_ids: &HashMap<(u64, u64), u64>,
    per_terminal: &HashMap<Terminal, (f64, f64)>,
) -> Vec<Requirement> {
    let mut out = Vec::new();
    // Whatever's left of the tree's own vertex set, after splitting off one
    // side below — doesn't depend on which edge is being bisected, so it's
    // computed once rather than per trunk edge.
    let tree_vertices: HashSet<u64> = tree.iter().flat_map(|e| [e.a.id(), e.b.id()]).collect();
    for (idx, edge) in tree.iter().enumerate() {
        if !edge.is_trunk {
            continue;
        }
        let (lo, hi) = sorted_pair(edge.a.id(), edge.b.id());
        let trunk_id = match trunk_edge_ids.get(&(lo, hi)) {
            Some(&id) => id,
            None => continue,
        };
        let record = &inner.trunks[&trunk_id];

        let side_start = reachable_from(tree, &record.start, idx);
        let side_end: HashSet<u64> = tree_vertices.difference(&side_start).copied().collect();

        let sum_on = |side: &HashSet<u64>, pick_ingress: bool| -> f64 {
            per_terminal
                .iter()
                .filter(|(t, _)| side.contains(&t.id()))
                .map(|(_, (ingress, egress))| if pick_ingress { *ingress } else { *egress })
                .sum()
        };

        let produced_up = sum_on(&side_start, true);
        let consumed_up = sum_on(&side_end, false);
        let required_up = produced_up.min(consumed_up);

        let produced_down = sum_on(&side_end, true);
        let consumed_down = sum_on(&side_start, false);
        let required_down = produced_down.min(consumed_down);

        let shortfall = (required_up - record.trunk.upstream_available()).max(0.0)
            + (required_down - record.trunk.downstream_available()).max(0.0);

        out.push(Requirement { trunk_id, required_up, required_down, shortfall });
    }
    out
}

/// Runs the admission-retry loop and, on success, allocates tunnels and
/// assembles per-inferior-network sub-segments.
pub(super) fn plan(inner: &mut Inner, request: &Segment) -> Result<Plan> {
    if request.is_empty() {
        return Ok(Plan { tunnels: Vec::new(), sub_segments: Vec::new() });
    }

    // Step 1: map external circuits to inner circuits; accumulate
    // per-inner-terminal (ingress, egress) totals; find min_prod.
    let mut per_terminal_circuits: HashMap<Terminal, Vec<(Circuit, TrafficFlow)>> = HashMap::new();
    let mut per_terminal_totals: HashMap<Terminal, (f64, f64)> = HashMap::new();
    let mut min_prod = f64::INFINITY;
    for (ext_circuit, flow) in request.iter() {
        let wrapped = ext_circuit.terminal().wrapped().ok_or_else(|| {
            Error::invalid_service(format!("circuit {} does not reference an aggregator-exposed terminal", ext_circuit))
        })?;
        let wrapped = wrapped.clone();
        let inner_circuit = Circuit::new(wrapped.clone(), ext_circuit.label());
        min_prod = min_prod.min(flow.ingress());
        per_terminal_circuits.entry(wrapped.clone()).or_default().push((inner_circuit, *flow));
        let totals = per_terminal_totals.entry(wrapped).or_insert((0.0, 0.0));
        totals.0 += flow.ingress();
        totals.1 += flow.egress();
    }
    if !min_prod.is_finite() {
        min_prod = 0.0;
    }
    let destinations: Vec<Terminal> = per_terminal_circuits.keys().cloned().collect();

    let mut excluded: HashSet<u64> = HashSet::new();
    let (tree, _trunk_edge_ids, requirements) = loop {
        let (vertices, edges, trunk_edge_ids) = build_graph(inner, min_prod, &excluded);
        let tree = graph::spanning_tree(&vertices, &edges, &destinations)
            .ok_or_else(|| Error::invalid_service("no spanning tree reaches every requested terminal"))?;

        let requirements = admission_check(inner, &tree, &trunk_edge_ids, &per_terminal_totals);
        let worst = requirements.iter().enumerate().filter(|(_, r)| r.shortfall > 0.0).max_by(|(_, a), (_, b)| {
            a.shortfall.partial_cmp(&b.shortfall).unwrap_or(std::cmp::Ordering::Equal)
        });

        match worst {
            Some((_, req)) => {
                log::debug!("aggregator planner: evicting trunk {} for shortfall {}", req.trunk_id, req.shortfall);
                excluded.insert(req.trunk_id);
                continue;
            }
            None => break (tree, trunk_edge_ids, requirements),
        }
    };

    // Commit: allocate a tunnel on every trunk edge in the tree.
    let mut tunnels = Vec::new();
    for req in &requirements {
        let record = inner.trunks.get_mut(&req.trunk_id).expect("trunk referenced by plan must still exist");
        match record.trunk.allocate_tunnel(req.required_up, req.required_down) {
            Ok(Some(start_label)) => {
                let end_label = record
                    .trunk
                    .peer_label(start_label, false)
                    .expect("just-allocated label must have a bijection peer");
                tunnels.push(PlannedTunnel {
                    trunk_id: req.trunk_id,
                    start_circuit: Circuit::new(record.start.clone(), start_label),
                    end_circuit: Circuit::new(record.end.clone(), end_label),
                });
            }
            _ => {
                // Should not happen: inner is held under one lock for the
                // whole admission check and this allocation. Roll back any
                // tunnels already allocated in this plan.
                for t in &tunnels {
                    if let Some(r) = inner.trunks.get_mut(&t.trunk_id) {
                        let _ = r.trunk.release_tunnel(t.start_circuit.label(), false);
                    }
                }
                return Err(Error::invalid_service("trunk allocation failed after admission passed"));
            }
        }
    }

    // Assemble per-inferior-network sub-segments.
    let mut by_owner: HashMap<usize, Segment> = HashMap::new();
    for (terminal, circuits) in &per_terminal_circuits {
        let owner = inner
            .owner_index(terminal)
            .expect("every destination terminal was validated to have an owner in step 1");
        let seg = by_owner.entry(owner).or_insert_with(Segment::new);
        for (circuit, flow) in circuits {
            seg.insert(circuit.clone(), *flow);
        }
    }
    for tunnel in &tunnels {
        let start_owner = inner.owner_index(&tunnel.start_circuit.terminal().clone()).expect("trunk endpoints are always owned");
        let end_owner = inner.owner_index(&tunnel.end_circuit.terminal().clone()).expect("trunk endpoints are always owned");

        let (up, down) = (
            requirements.iter().find(|r| r.trunk_id == tunnel.trunk_id).map(|r| r.required_up).unwrap(),
            requirements.iter().find(|r| r.trunk_id == tunnel.trunk_id).map(|r| r.required_down).unwrap(),
        );
        // The start side's flow, from the inferior network's own
        // perspective: traffic arriving downstream is its ingress,
        // traffic leaving upstream is its egress. The end side is simply
        // the inverse.
        let start_flow = TrafficFlow::new(down, up).expect("bandwidth values are already non-negative");
        let end_flow = start_flow.invert();

        by_owner.entry(start_owner).or_insert_with(Segment::new).insert(tunnel.start_circuit.clone(), start_flow);
        by_owner.entry(end_owner).or_insert_with(Segment::new).insert(tunnel.end_circuit.clone(), end_flow);
    }

    let sub_segments = by_owner
        .into_iter()
        .map(|(idx, seg)| (inner.inferior_networks[idx].clone(), seg))
        .collect();

    Ok(Plan { tunnels, sub_segments })
}
