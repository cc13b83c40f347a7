//! `Segment`: a service's request, mapping circuits to bidirectional
//! bandwidth demands, plus the `sanitize` transform every engine applies
//! before storing a definition.

use std::collections::BTreeMap;
use std::iter::FromIterator;

use crate::identity::{Circuit, TrafficFlow};

/// A logical map `Circuit -> TrafficFlow`.
///
/// Backed by a `BTreeMap` (ordered by `Circuit`'s `terminal_id, label`
/// ordering) rather than a hash map, so that iteration — and therefore
/// every deterministic tie-break downstream in the planner — is stable
/// across runs without an extra sort.
#[derive(Clone, Debug, Default)]
pub struct Segment(BTreeMap<Circuit, TrafficFlow>);

impl Segment {
    pub fn new() -> Segment {
        Segment(BTreeMap::new())
    }

    pub fn insert(&mut self, circuit: Circuit, flow: TrafficFlow) {
        self.0.insert(circuit, flow);
    }

    pub fn get(&self, circuit: &Circuit) -> Option<&TrafficFlow> {
        self.0.get(circuit)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Circuit, &TrafficFlow)> {
        self.0.iter()
    }

    pub fn circuits(&self) -> impl Iterator<Item = &Circuit> {
        self.0.keys()
    }

    /// Sum of every circuit's ingress — "the total traffic entering the
    /// service".
    pub fn total_ingress(&self) -> f64 {
        self.0.values().map(TrafficFlow::ingress).sum()
    }
}

impl FromIterator<(Circuit, TrafficFlow)> for Segment {
    fn from_iter<I: IntoIterator<Item = (Circuit, TrafficFlow)>>(iter: I) -> Segment {
        Segment(iter.into_iter().collect())
    }
}

/// Produces a sanitized copy of `segment` satisfying:
///
/// 1. every circuit's ingress is `>= min_prod`;
/// 2. every circuit's egress is `<= (sum of all ingresses) - its own ingress`.
///
/// Idempotent: `sanitize(sanitize(s, m), m) == sanitize(s, m)`.
pub fn sanitize(segment: &Segment, min_prod: f64) -> Segment {
    let raised: Vec<(Circuit, TrafficFlow)> = segment
        .iter()
        .map(|(c, f)| {
            let ingress = f.ingress().max(min_prod);
            (c.clone(), TrafficFlow::new(ingress, f.egress()).expect("raised ingress stays finite and non-negative"))
        })
        .collect();

    let total_ingress: f64 = raised.iter().map(|(_, f)| f.ingress()).sum();

    raised
        .into_iter()
        .map(|(c, f)| {
            let bound = (total_ingress - f.ingress()).max(0.0);
            let egress = f.egress().min(bound);
            (c, TrafficFlow::new(f.ingress(), egress).expect("bounded egress stays non-negative"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Terminal;

    #[test]
    fn sanitize_raises_low_ingress_to_min_prod() {
        let t1 = Circuit::new(Terminal::new_atomic("t1"), 1);
        let mut s = Segment::new();
        s.insert(t1.clone(), TrafficFlow::new(0.0, 0.0).unwrap());
        let out = sanitize(&s, 0.01);
        assert_eq!(out.get(&t1).unwrap().ingress(), 0.01);
    }

    #[test]
    fn sanitize_bounds_egress_by_remaining_ingress() {
        let t1 = Circuit::new(Terminal::new_atomic("t1"), 1);
        let t2 = Circuit::new(Terminal::new_atomic("t2"), 1);
        let mut s = Segment::new();
        s.insert(t1, TrafficFlow::new(5.0, 0.0).unwrap());
        s.insert(t2.clone(), TrafficFlow::new(5.0, 100.0).unwrap());
        let out = sanitize(&s, 0.01);
        // total ingress is 10; t2's egress is bounded by 10 - 5 = 5.
        assert_eq!(out.get(&t2).unwrap().egress(), 5.0);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let t1 = Circuit::new(Terminal::new_atomic("t1"), 1);
        let t2 = Circuit::new(Terminal::new_atomic("t2"), 1);
        let mut s = Segment::new();
        s.insert(t1, TrafficFlow::new(0.0, 50.0).unwrap());
        s.insert(t2, TrafficFlow::new(5.0, 0.0).unwrap());
        let once = sanitize(&s, 0.01);
        let twice = sanitize(&once, 0.01);
        for c in once.circuits() {
            assert_eq!(once.get(c).unwrap().ingress(), twice.get(c).unwrap().ingress());
            assert_eq!(once.get(c).unwrap().egress(), twice.get(c).unwrap().egress());
        }
    }
}
