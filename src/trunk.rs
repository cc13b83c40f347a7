//! The trunk resource manager: label-range registry, per-direction
//! bandwidth ledger, tunnel allocation, and the commissioning flag.
//!
//! A `Trunk` is owned by exactly one aggregator and is always mutated under
//! that aggregator's mutex; `Trunk` itself therefore has no internal
//! locking of its own — it is a plain state struct the aggregator holds
//! behind its own lock rather than giving every trunk its own.

use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::identity::Circuit;

/// One direction's bandwidth ledger for a trunk.
#[derive(Debug, Default)]
struct Ledger {
    available: f64,
    allocated: BTreeMap<i32, f64>,
}

impl Ledger {
    fn check_provide(amount: f64) -> Result<()> {
        if amount < 0.0 {
            return Err(Error::invalid_argument("provided bandwidth must be non-negative"));
        }
        Ok(())
    }

    fn provide(&mut self, amount: f64) -> Result<()> {
        Self::check_provide(amount)?;
        self.available += amount;
        Ok(())
    }

    fn check_withdraw(&self, amount: f64) -> Result<()> {
        if amount < 0.0 {
            return Err(Error::invalid_argument("withdrawn bandwidth must be non-negative"));
        }
        if amount > self.available {
            return Err(Error::invalid_argument("cannot withdraw more bandwidth than is available"));
        }
        Ok(())
    }

    fn withdraw(&mut self, amount: f64) -> Result<()> {
        self.check_withdraw(amount)?;
        self.available -= amount;
        Ok(())
    }

    fn allocate(&mut self, label: i32, amount: f64) -> Result<()> {
        if amount < 0.0 {
            return Err(Error::invalid_argument("allocated bandwidth must be non-negative"));
        }
        if amount > self.available {
            return Err(Error::invalid_argument("insufficient bandwidth"));
        }
        self.available -= amount;
        self.allocated.insert(label, amount);
        Ok(())
    }

    fn release(&mut self, label: i32) -> Option<f64> {
        let amount = self.allocated.remove(&label)?;
        self.available += amount;
        Some(amount)
    }
}

/// A bandwidth-capped, labelled link between two terminals of inferior
/// networks, owned by an aggregator.
///
/// Invariants maintained by this type:
/// - `available_labels ⊆ dom(start_to_end)`
/// - a label is either free or present in exactly one of the allocation
///   ledgers, never both
/// - `upstream_avail + Σ upstream_alloc` is conserved across
///   allocate/release (likewise downstream)
#[derive(Debug)]
pub struct Trunk {
    delay: f64,
    upstream: Ledger,
    downstream: Ledger,
    start_to_end: BTreeMap<i32, i32>,
    end_to_start: BTreeMap<i32, i32>,
    free_start_labels: HashSet<i32>,
    commissioned: bool,
}

impl Trunk {
    pub fn new(delay: f64) -> Trunk {
        Trunk {
            delay,
            upstream: Ledger::default(),
            downstream: Ledger::default(),
            start_to_end: BTreeMap::new(),
            end_to_start: BTreeMap::new(),
            free_start_labels: HashSet::new(),
            commissioned: true,
        }
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn set_delay(&mut self, delay: f64) -> Result<()> {
        if delay < 0.0 {
            return Err(Error::invalid_argument("delay must be non-negative"));
        }
        self.delay = delay;
        Ok(())
    }

    pub fn is_commissioned(&self) -> bool {
        self.commissioned
    }

    pub fn decommission(&mut self) {
        self.commissioned = false;
    }

    pub fn recommission(&mut self) {
        self.commissioned = true;
    }

    pub fn upstream_available(&self) -> f64 {
        self.upstream.available
    }

    pub fn downstream_available(&self) -> f64 {
        self.downstream.available
    }

    pub fn free_label_count(&self) -> usize {
        self.free_start_labels.len()
    }

    /// Adds `[start_base, start_base+amount)` <-> `[end_base, end_base+amount)`
    /// to both bijections and marks the start-side labels free.
    ///
    /// Fails without mutating state if either range overflows `i32` or any
    /// label in either range is already defined (partial failure is not
    /// permitted: the check precedes the mutation).
    pub fn define_label_range(&mut self, start_base: i32, amount: u32, end_base: i32) -> Result<()> {
        let amount = amount as i64;
        if amount == 0 {
            return Ok(());
        }
        let start_end = (start_base as i64)
            .checked_add(amount)
            .ok_or_else(|| Error::invalid_argument("start label range overflows"))?;
        let end_end = (end_base as i64)
            .checked_add(amount)
            .ok_or_else(|| Error::invalid_argument("end label range overflows"))?;
        if start_end > i32::MAX as i64 || end_end > i32::MAX as i64 {
            return Err(Error::invalid_argument("label range exceeds representable range"));
        }

        for i in 0..amount {
            let s = start_base + i as i32;
            let e = end_base + i as i32;
            if self.start_to_end.contains_key(&s) || self.end_to_start.contains_key(&e) {
                return Err(Error::name_in_use(format!(
                    "label range [{}, {}) or [{}, {}) overlaps an existing range",
                    start_base, start_end, end_base, end_end
                )));
            }
        }

        for i in 0..amount {
            let s = start_base + i as i32;
            let e = end_base + i as i32;
            self.start_to_end.insert(s, e);
            self.end_to_start.insert(e, s);
            self.free_start_labels.insert(s);
        }
        Ok(())
    }

    /// Removes labels `[start_base, start_base+amount)` from the bijection.
    ///
    /// Best-effort: unknown labels are silently ignored. Labels currently
    /// allocated are removed too — the caller (the aggregator) is
    /// responsible for not revoking a range while tunnels on it are in
    /// use.
    pub fn revoke_start_label_range(&mut self, start_base: i32, amount: u32) {
        for i in 0..amount as i64 {
            let s = start_base + i as i32;
            if let Some(e) = self.start_to_end.remove(&s) {
                self.end_to_start.remove(&e);
            }
            self.free_start_labels.remove(&s);
            self.upstream.allocated.remove(&s);
            self.downstream.allocated.remove(&s);
        }
    }

    /// Removes labels `[end_base, end_base+amount)` from the bijection.
    pub fn revoke_end_label_range(&mut self, end_base: i32, amount: u32) {
        for i in 0..amount as i64 {
            let e = end_base + i as i32;
            if let Some(s) = self.end_to_start.remove(&e) {
                self.start_to_end.remove(&s);
                self.free_start_labels.remove(&s);
                self.upstream.allocated.remove(&s);
                self.downstream.allocated.remove(&s);
            }
        }
    }

    pub fn provide_bandwidth(&mut self, up: f64, down: f64) -> Result<()> {
        Ledger::check_provide(up)?;
        Ledger::check_provide(down)?;
        self.upstream.provide(up).expect("checked above");
        self.downstream.provide(down).expect("checked above");
        Ok(())
    }

    pub fn withdraw_bandwidth(&mut self, up: f64, down: f64) -> Result<()> {
        self.upstream.check_withdraw(up)?;
        self.downstream.check_withdraw(down)?;
        self.upstream.withdraw(up).expect("checked above");
        self.downstream.withdraw(down).expect("checked above");
        Ok(())
    }

    /// Reserves the lowest free start-side label able to carry `up`/`down`
    /// bandwidth, returning the start-side circuit. `None` if no free
    /// label exists or bandwidth is insufficient in either direction.
    pub fn allocate_tunnel(&mut self, up: f64, down: f64) -> Result<Option<i32>> {
        if up < 0.0 || down < 0.0 {
            return Err(Error::invalid_argument("tunnel bandwidth must be non-negative"));
        }
        if up > self.upstream.available || down > self.downstream.available {
            return Ok(None);
        }
        let label = match self.free_start_labels.iter().min().copied() {
            Some(l) => l,
            None => return Ok(None),
        };
        self.free_start_labels.remove(&label);
        self.upstream.allocate(label, up).expect("checked availability above");
        self.downstream.allocate(label, down).expect("checked availability above");
        Ok(Some(label))
    }

    /// Releases the tunnel identified by either end's label, returning
    /// both bandwidths to the ledgers and marking the label free.
    ///
    /// `circuit_label` may be either a start-side or end-side label;
    /// `from_end` selects which bijection to use.
    pub fn release_tunnel(&mut self, label: i32, from_end: bool) -> Result<()> {
        let start_label = if from_end {
            *self
                .end_to_start
                .get(&label)
                .ok_or_else(|| Error::invalid_argument("unknown tunnel label"))?
        } else {
            if !self.start_to_end.contains_key(&label) {
                return Err(Error::invalid_argument("unknown tunnel label"));
            }
            label
        };

        if self.free_start_labels.contains(&start_label) {
            return Err(Error::invalid_argument("label is currently free, not allocated"));
        }
        let up = self
            .upstream
            .release(start_label)
            .ok_or_else(|| Error::invalid_argument("label not present in upstream ledger"))?;
        let down = self
            .downstream
            .release(start_label)
            .ok_or_else(|| Error::invalid_argument("label not present in downstream ledger"))?;
        let _ = (up, down);
        self.free_start_labels.insert(start_label);
        Ok(())
    }

    /// The other end's label for a circuit naming either end of a tunnel.
    pub fn peer_label(&self, label: i32, from_end: bool) -> Result<i32> {
        if from_end {
            self.end_to_start
                .get(&label)
                .copied()
                .ok_or_else(|| Error::invalid_argument("circuit belongs to neither terminal of this trunk"))
        } else {
            self.start_to_end
                .get(&label)
                .copied()
                .ok_or_else(|| Error::invalid_argument("circuit belongs to neither terminal of this trunk"))
        }
    }

    /// `max(upstream_avail, downstream_avail)` — the selection threshold
    /// the planner uses to choose graph edge weights.
    pub fn max_available(&self) -> f64 {
        self.upstream.available.max(self.downstream.available)
    }
}

/// A tunnel a service holds on one trunk: the start-side circuit it was
/// allocated, kept so the service can release it later.
#[derive(Clone)]
pub struct Tunnel {
    pub start_circuit: Circuit,
}
