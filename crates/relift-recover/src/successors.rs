//! Successor list builder.
//!
//! Projects the trace's `(pc, successor_pc)` edges onto per-unit successor
//! metadata. Purely additive: duplicates and holes introduced by later
//! destructive edits are resolved by the pruning pass, not here.

use tracing::debug;

use relift_ir::{Module, Target};
use relift_trace::TraceInfo;

/// Append one successor entry per trace edge whose endpoints both resolve
/// to captured units. Returns the number of edges projected.
pub fn build_successor_lists(module: &mut Module, trace: &TraceInfo) -> usize {
    let mut added = 0;
    let mut unresolved = 0;

    for &(pc, succ_pc) in &trace.successors {
        let (Some(pred), Some(succ)) = (module.unit_by_addr(pc), module.unit_by_addr(succ_pc))
        else {
            unresolved += 1;
            continue;
        };
        if let Some(unit) = module.unit_mut(pred) {
            unit.succs.push(Some(Target::Unit(succ)));
            added += 1;
        }
    }

    if unresolved > 0 {
        debug!(unresolved, "trace edges without captured endpoints");
    }
    added
}
