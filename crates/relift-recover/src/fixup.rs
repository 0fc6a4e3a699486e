//! Control-flow fix-up.
//!
//! Captured edges conflate intra-function branches, call/return pairs, and
//! tail-call jumps. Library stubs make the difference observable: a
//! predecessor that matches one of the stub entry's recorded caller blocks
//! reached it through a call, anything else reached it through a jump
//! (tail call). Either way execution continues after the library call at a
//! follow-up address the capture knows - the call site's own follow-up for
//! call edges, the follow-up one call-frame up the chain for jump edges.
//! Those synthesized continuations become new dispatch-table cases on the
//! stub, all sharing one error default.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use relift_ir::{
    Expr, FuncId, Inst, Module, Target, Terminator, TranslationUnit, UnitId, UnitRole,
};
use relift_trace::TraceInfo;

use crate::Result;

/// Reserved address of the shared error unit that dispatch defaults trap
/// into.
pub const ERROR_UNIT_ADDR: u64 = u64::MAX;

/// Counters reported by [`fix_control_flow`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FixupStats {
    pub call_edges: usize,
    pub jump_edges: usize,
    pub cases_added: usize,
}

/// Reclassify edges into library stubs and synthesize their post-call
/// continuations. With `no_link_lift`, classification still runs but no
/// successors are synthesized.
pub fn fix_control_flow(
    module: &mut Module,
    trace: &TraceInfo,
    no_link_lift: bool,
) -> Result<FixupStats> {
    let mut stats = FixupStats::default();

    let stubs: Vec<(UnitId, u64)> = module
        .unit_ids()
        .into_iter()
        .filter_map(|id| module.unit(id).map(|u| (id, u)))
        .filter(|(_, u)| u.role == UnitRole::ExternStub || u.extern_symbol.is_some())
        .map(|(id, u)| (id, u.start))
        .collect();
    if stubs.is_empty() {
        return Ok(stats);
    }

    let block_owner = block_owner_map(module);

    let mut synthesized: Vec<(UnitId, Vec<(u64, Target)>)> = Vec::new();
    for &(stub_id, entry) in &stubs {
        let follow_ups = classify_stub_edges(module, trace, stub_id, entry, &mut stats);
        if no_link_lift {
            continue;
        }

        let mut resolved = Vec::new();
        for addr in follow_ups {
            match resolve_continuation(module, &block_owner, addr) {
                Some(target) => resolved.push((addr, target)),
                None => {
                    // Best effort: an unresolvable PLT fallthrough is a
                    // warning, not an abort.
                    warn!(
                        stub = format_args!("{entry:#x}"),
                        follow_up = format_args!("{addr:#x}"),
                        "unresolvable library-call fallthrough successor"
                    );
                }
            }
        }
        if !resolved.is_empty() {
            synthesized.push((stub_id, resolved));
        }
    }

    if synthesized.is_empty() {
        return Ok(stats);
    }

    let error = error_unit(module);
    let pc = module.registers.pc();
    for (stub_id, cases) in synthesized {
        let Some(stub) = module.unit_mut(stub_id) else {
            continue;
        };
        if !stub.term.is_dispatch() {
            stub.term = Terminator::dispatch(Expr::reg(pc), Target::Unit(error));
        }
        for (addr, target) in cases {
            if stub.term.add_dispatch_case(addr, target) {
                stats.cases_added += 1;
            }
            if !stub.has_successor(target) {
                stub.succs.push(Some(target));
            }
        }
        if !stub.has_successor(Target::Unit(error)) {
            stub.succs.push(Some(Target::Unit(error)));
        }
    }

    debug!(
        call_edges = stats.call_edges,
        jump_edges = stats.jump_edges,
        cases_added = stats.cases_added,
        "control-flow fix-up"
    );
    Ok(stats)
}

/// Classify every predecessor edge of one stub and collect the follow-up
/// addresses its continuations should cover.
fn classify_stub_edges(
    module: &Module,
    trace: &TraceInfo,
    stub_id: UnitId,
    entry: u64,
    stats: &mut FixupStats,
) -> BTreeSet<u64> {
    let log = &trace.function_log;
    let caller_pcs = log.entry_to_caller.get(&entry);
    let mut follow_ups = BTreeSet::new();

    for (pred_last_pc, pred_entry) in stub_predecessors(module, stub_id) {
        let through_call = caller_pcs.is_some_and(|pcs| pcs.contains(&pred_last_pc));
        if through_call {
            stats.call_edges += 1;
            match log.caller_to_follow_up.get(&pred_last_pc) {
                Some(&fu) => {
                    follow_ups.insert(fu);
                }
                None => warn!(
                    caller = format_args!("{pred_last_pc:#x}"),
                    "call edge without recorded follow-up"
                ),
            }
        } else {
            stats.jump_edges += 1;
            // Tail call: the continuation lives one call frame up. Walk
            // from the jump source's own entry to its caller, then to
            // that caller's follow-up.
            let Some(pred_entry) = pred_entry else {
                warn!(
                    pred = format_args!("{pred_last_pc:#x}"),
                    "tail call from unattributed glue; cannot walk the frame chain"
                );
                continue;
            };
            let Some(callers) = log.entry_to_caller.get(&pred_entry) else {
                warn!(
                    entry = format_args!("{pred_entry:#x}"),
                    "tail-call source entry has no recorded callers"
                );
                continue;
            };
            for caller in callers {
                match log.caller_to_follow_up.get(caller) {
                    Some(&fu) => {
                        follow_ups.insert(fu);
                    }
                    None => warn!(
                        caller = format_args!("{caller:#x}"),
                        "jump edge caller without recorded follow-up"
                    ),
                }
            }
        }
    }

    follow_ups
}

/// Predecessor edges of a stub: `(last_pc, owning function entry)` per
/// block or unit whose successor metadata references it.
fn stub_predecessors(module: &Module, stub_id: UnitId) -> Vec<(u64, Option<u64>)> {
    let mut preds = Vec::new();

    for fid in module.function_ids() {
        let Some(function) = module.function(fid) else {
            continue;
        };
        for block in &function.blocks {
            if block.has_successor(Target::Unit(stub_id)) {
                preds.push((block.last_pc, Some(function.entry)));
            }
        }
    }
    for uid in module.unit_ids() {
        let Some(unit) = module.unit(uid) else {
            continue;
        };
        if uid != stub_id && unit.has_successor(Target::Unit(stub_id)) {
            preds.push((unit.last_pc, None));
        }
    }

    preds
}

/// Resolve a follow-up address to a referencable target. Cross-function
/// block references become function-level, matching recovery's rule.
fn resolve_continuation(
    module: &Module,
    block_owner: &FxHashMap<u64, FuncId>,
    addr: u64,
) -> Option<Target> {
    if let Some(&fid) = block_owner.get(&addr) {
        return Some(Target::Func(fid));
    }
    module.unit_by_addr(addr).map(Target::Unit)
}

fn block_owner_map(module: &Module) -> FxHashMap<u64, FuncId> {
    let mut map = FxHashMap::default();
    for fid in module.function_ids() {
        let Some(function) = module.function(fid) else {
            continue;
        };
        for block in &function.blocks {
            if !block.synthetic {
                map.entry(block.start).or_insert(fid);
            }
        }
    }
    map
}

/// The shared error unit: traps on any program-counter value no dispatch
/// case covers.
pub fn error_unit(module: &mut Module) -> UnitId {
    if let Some(id) = module.unit_by_addr(ERROR_UNIT_ADDR) {
        return id;
    }
    let pc = module.registers.pc();
    let mut unit = TranslationUnit::new(ERROR_UNIT_ADDR);
    unit.body
        .push(Inst::helper(ERROR_UNIT_ADDR, "unreachable_pc", vec![Expr::reg(pc)]));
    unit.term = Terminator::Unreachable;
    module
        .add_unit(unit)
        .expect("error unit address is reserved")
}
