//! Custodian/ward keep-alive edges between proxies.
//!
//! An edge `ward -> custodian` stands for a strong reference from custodian to
//! ward on the host side. Severing it never deallocates anything; it only lets
//! the ward be finalized on its own schedule.

use std::collections::BTreeSet;

use crate::error::InvariantViolation;
use crate::handle::ProxyRef;
use crate::registry::ProxyRegistry;

/// Depth-first search over `next`, which yields the custodians of a node.
pub(crate) fn path_exists<N, F, I>(from: N, to: N, mut next: F) -> bool
where
    N: Copy + Ord,
    F: FnMut(N) -> I,
    I: IntoIterator<Item = N>,
{
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(n) = stack.pop() {
        if n == to {
            return true;
        }
        if seen.insert(n) {
            stack.extend(next(n));
        }
    }
    false
}

/// Inserts `ward -> custodian`. Returns false if the edge already existed.
pub(crate) fn add_edge(
    reg: &mut ProxyRegistry,
    ward: ProxyRef,
    custodian: ProxyRef,
) -> Result<bool, InvariantViolation> {
    reg.get(custodian)?;
    if reg.get(ward)?.custodians.contains(&custodian) {
        return Ok(false);
    }
    let cyclic = path_exists(custodian, ward, |n| {
        reg.get(n)
            .map(|p| p.custodians.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default()
    });
    if cyclic {
        return Err(InvariantViolation::CustodianCycle {
            ward: ward.to_string(),
            custodian: custodian.to_string(),
        });
    }

    let w = reg.get_mut(ward)?;
    w.custodians.insert(custodian);
    w.releasable = false;
    reg.get_mut(custodian)?.wards.insert(ward);
    Ok(true)
}

/// Drops every outgoing edge of `ward`.
pub(crate) fn remove_edges_from(reg: &mut ProxyRegistry, ward: ProxyRef) {
    let custodians = match reg.get_mut(ward) {
        Ok(p) => std::mem::take(&mut p.custodians),
        Err(_) => return,
    };
    for c in custodians {
        if let Ok(p) = reg.get_mut(c) {
            p.wards.remove(&ward);
        }
    }
}

/// Severs the incoming edges of a finalized custodian and marks wards with no
/// remaining custodian releasable. Wards are never finalized here.
pub(crate) fn on_custodian_finalized(reg: &mut ProxyRegistry, custodian: ProxyRef) -> Vec<ProxyRef> {
    let wards = match reg.get_mut(custodian) {
        Ok(p) => std::mem::take(&mut p.wards),
        Err(_) => return Vec::new(),
    };
    let mut released = Vec::new();
    for w in wards {
        let Ok(p) = reg.get_mut(w) else {
            continue;
        };
        p.custodians.remove(&custodian);
        if p.custodians.is_empty() {
            p.releasable = true;
            released.push(w);
        }
    }
    released
}

/// Some custodian of `ward` that is still alive.
pub(crate) fn live_custodian(reg: &ProxyRegistry, ward: ProxyRef) -> Option<ProxyRef> {
    let p = reg.get(ward).ok()?;
    p.custodians.iter().copied().find(|c| reg.contains(*c))
}

/// Removes `r` from the graph in both directions. Returns wards that became
/// releasable.
pub(crate) fn detach(reg: &mut ProxyRegistry, r: ProxyRef) -> Vec<ProxyRef> {
    remove_edges_from(reg, r);
    on_custodian_finalized(reg, r)
}
