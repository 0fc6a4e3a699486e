//! Function recovery.
//!
//! Merges every translation unit attributed to one trace entry into a
//! recovered function: the entry member becomes the canonical entry block,
//! other members become address-named internal blocks, and successor
//! references are rewritten - to the sibling clone when the target stayed
//! inside the same function, to the callee function itself when it did not.
//! Extern stubs are never recovered; they remain standalone glue units.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use relift_ir::{
    Block, FuncId, Function, Inst, Module, Target, Terminator, UnitId, UnitRole,
};
use relift_trace::TraceInfo;

use crate::{LiftError, Result};

/// Synthetic entry address of the wrapper function.
pub const WRAPPER_ENTRY: u64 = 0;

/// Counters reported by [`recover_functions`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryStats {
    pub functions: usize,
    pub blocks: usize,
    /// Successor references that became function-level.
    pub cross_refs: usize,
}

/// Merge units into functions by entry address.
pub fn recover_functions(module: &mut Module, trace: &TraceInfo) -> Result<RecoveryStats> {
    let planned = plan_functions(module, trace);
    let mut stats = RecoveryStats::default();

    // Unit addresses survive past the clone phase so successor rewriting
    // can resolve them after the originals are discarded.
    let mut unit_addrs: FxHashMap<UnitId, u64> = FxHashMap::default();
    for id in module.unit_ids() {
        if let Some(unit) = module.unit(id) {
            unit_addrs.insert(id, unit.start);
        }
    }

    // Clone phase.
    let mut built: Vec<(FuncId, FxHashMap<u64, relift_ir::BlockId>)> = Vec::new();
    let mut entry_owner: FxHashMap<u64, FuncId> = FxHashMap::default();
    let mut member_owner: FxHashMap<u64, FuncId> = FxHashMap::default();
    let mut consumed: FxHashSet<UnitId> = FxHashSet::default();

    for plan in &planned {
        let mut function = Function::new(plan.entry);
        let mut local = FxHashMap::default();
        for &(addr, uid) in &plan.members {
            let Some(unit) = module.unit(uid) else {
                warn!(addr = format_args!("{addr:#x}"), "member unit vanished before recovery");
                continue;
            };
            let mut block = Block::new(addr);
            block.last_pc = unit.last_pc;
            block.body = unit.body.clone();
            block.term = unit.term.clone();
            block.succs = unit.succs.clone();
            block.extern_symbol = unit.extern_symbol.clone();
            block.role = unit.role;
            let bid = function.push_block(block);
            local.insert(addr, bid);
            consumed.insert(uid);
            stats.blocks += 1;
        }
        if function.blocks.is_empty() {
            warn!(
                entry = format_args!("{:#x}", plan.entry),
                "entry has no recoverable members"
            );
            continue;
        }
        let fid = module.add_function(function);
        entry_owner.insert(plan.entry, fid);
        for &(addr, _) in &plan.members {
            member_owner.entry(addr).or_insert(fid);
        }
        built.push((fid, local));
        stats.functions += 1;
    }

    // Rewrite phase: unit references become block or function references.
    for (fid, local) in &built {
        let Some(function) = module.function_mut(*fid) else {
            continue;
        };
        for block in &mut function.blocks {
            for succ in &mut block.succs {
                if let Some(Target::Unit(uid)) = *succ {
                    *succ = rewrite_unit_ref(
                        uid,
                        &unit_addrs,
                        local,
                        &entry_owner,
                        &member_owner,
                        &consumed,
                        &mut stats.cross_refs,
                    );
                }
            }
            block.term.map_targets(|t| match t {
                Target::Unit(uid) => rewrite_unit_ref(
                    uid,
                    &unit_addrs,
                    local,
                    &entry_owner,
                    &member_owner,
                    &consumed,
                    &mut stats.cross_refs,
                )
                .unwrap_or(t),
                other => other,
            });
        }
    }

    // Discard the original standalone units.
    for uid in &consumed {
        module.remove_unit(*uid);
    }

    debug!(
        functions = stats.functions,
        blocks = stats.blocks,
        cross_refs = stats.cross_refs,
        "function recovery complete"
    );
    Ok(stats)
}

fn rewrite_unit_ref(
    uid: UnitId,
    unit_addrs: &FxHashMap<UnitId, u64>,
    local: &FxHashMap<u64, relift_ir::BlockId>,
    entry_owner: &FxHashMap<u64, FuncId>,
    member_owner: &FxHashMap<u64, FuncId>,
    consumed: &FxHashSet<UnitId>,
    cross_refs: &mut usize,
) -> Option<Target> {
    let addr = *unit_addrs.get(&uid)?;
    if let Some(&bid) = local.get(&addr) {
        return Some(Target::Block(bid));
    }
    if let Some(&fid) = entry_owner.get(&addr).or_else(|| member_owner.get(&addr)) {
        *cross_refs += 1;
        return Some(Target::Func(fid));
    }
    if consumed.contains(&uid) {
        // Cloned somewhere we failed to attribute; drop the edge.
        return None;
    }
    // Still a standalone glue unit (extern stub or unattributed block).
    Some(Target::Unit(uid))
}

struct PlannedFunction {
    entry: u64,
    /// Entry member first, remaining members in ascending address order.
    members: Vec<(u64, UnitId)>,
}

fn plan_functions(module: &Module, trace: &TraceInfo) -> Vec<PlannedFunction> {
    if !trace.has_function_detail() {
        return plan_catch_all(module, trace);
    }

    let mut entries: Vec<u64> = Vec::new();
    let mut seen = FxHashSet::default();
    for &entry in &trace.function_log.entries {
        if seen.insert(entry) {
            entries.push(entry);
        }
    }
    for &entry in trace.function_log.entry_to_members.keys() {
        if seen.insert(entry) {
            entries.push(entry);
        }
    }

    let mut planned = Vec::new();
    for entry in entries {
        let Some(entry_unit) = module.unit_by_addr(entry) else {
            warn!(entry = format_args!("{entry:#x}"), "entry has no captured unit");
            continue;
        };
        if module
            .unit(entry_unit)
            .is_some_and(|u| u.role == UnitRole::ExternStub)
        {
            debug!(entry = format_args!("{entry:#x}"), "extern stub left unrecovered");
            continue;
        }

        let mut members = vec![(entry, entry_unit)];
        if let Some(set) = trace.function_log.entry_to_members.get(&entry) {
            for &addr in set {
                if addr == entry {
                    continue;
                }
                let Some(uid) = module.unit_by_addr(addr) else {
                    continue;
                };
                if module
                    .unit(uid)
                    .is_some_and(|u| u.role == UnitRole::ExternStub)
                {
                    continue;
                }
                members.push((addr, uid));
            }
        }
        planned.push(PlannedFunction { entry, members });
    }
    planned
}

/// Without trace detail every captured unit lands in one catch-all
/// function.
fn plan_catch_all(module: &Module, trace: &TraceInfo) -> Vec<PlannedFunction> {
    let mut addrs: Vec<(u64, UnitId)> = module
        .unit_ids()
        .into_iter()
        .filter_map(|id| module.unit(id).map(|u| (u.start, id)))
        .filter(|(_, id)| {
            module
                .unit(*id)
                .is_some_and(|u| u.role != UnitRole::ExternStub)
        })
        .collect();
    addrs.sort_unstable();
    if addrs.is_empty() {
        return Vec::new();
    }

    let entry = trace
        .function_log
        .entries
        .first()
        .copied()
        .filter(|e| module.unit_by_addr(*e).is_some())
        .unwrap_or(addrs[0].0);

    let mut members = Vec::with_capacity(addrs.len());
    if let Some(pos) = addrs.iter().position(|&(a, _)| a == entry) {
        members.push(addrs.remove(pos));
    }
    members.extend(addrs);
    vec![PlannedFunction { entry, members }]
}

/// Discover the program's true entry point.
///
/// From the lowest-level capture entry, follow exactly two successor hops
/// (the startup sequence pushes through two glue blocks) and read the last
/// constant stored to the accumulator in the third block reached. Runs
/// before recovery, while units are still standalone.
pub fn discover_program_entry(module: &Module, trace: &TraceInfo) -> Result<u64> {
    let &capture_entry = trace
        .function_log
        .entries
        .first()
        .ok_or_else(|| LiftError::EntryDiscovery("no capture entries recorded".to_string()))?;

    let mut current = module.unit_by_addr(capture_entry).ok_or_else(|| {
        LiftError::EntryDiscovery(format!("no unit at capture entry {capture_entry:#x}"))
    })?;

    for hop in 0..2 {
        current = module
            .unit(current)
            .and_then(|u| u.unit_successors().next())
            .ok_or_else(|| {
                LiftError::EntryDiscovery(format!(
                    "startup sequence ends after {hop} successor hops"
                ))
            })?;
    }

    let third = module
        .unit(current)
        .ok_or_else(|| LiftError::EntryDiscovery("dangling successor reference".to_string()))?;
    third
        .last_const_store(module.registers.accumulator())
        .ok_or_else(|| {
            LiftError::EntryDiscovery(format!(
                "no constant accumulator store in block {:#x}",
                third.start
            ))
        })
}

/// Build the trivial wrapper function: a single call into recovered main.
pub fn build_wrapper(module: &mut Module, main_addr: u64) -> Result<FuncId> {
    let callee = module
        .function_by_entry(main_addr)
        .ok_or(LiftError::UnknownCallee { addr: main_addr })?;

    let mut function = Function::new(WRAPPER_ENTRY);
    function.is_wrapper = true;
    let mut block = Block::synthetic(WRAPPER_ENTRY);
    block.body.push(Inst::call(WRAPPER_ENTRY, callee));
    block.term = Terminator::Return;
    function.push_block(block);
    Ok(module.add_function(function))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relift_ir::{Expr, RegisterFile, TranslationUnit};

    fn add_unit(m: &mut Module, start: u64, succ_addrs: &[u64]) -> UnitId {
        let id = m.add_unit(TranslationUnit::new(start)).unwrap();
        let succs: Vec<_> = succ_addrs
            .iter()
            .map(|&a| m.unit_by_addr(a).map(Target::Unit))
            .collect();
        m.unit_mut(id).unwrap().succs = succs;
        id
    }

    fn trace_with_members(sets: &[(u64, &[u64])]) -> TraceInfo {
        let mut t = TraceInfo::default();
        for &(entry, members) in sets {
            t.function_log.entries.push(entry);
            let set = t.function_log.entry_to_members.entry(entry).or_default();
            set.extend(members.iter().copied());
        }
        t
    }

    #[test]
    fn test_recover_two_functions() {
        let mut m = Module::new(RegisterFile::i386());
        m.add_unit(TranslationUnit::new(0x1000)).unwrap();
        m.add_unit(TranslationUnit::new(0x1010)).unwrap();
        m.add_unit(TranslationUnit::new(0x2000)).unwrap();
        // 0x1000 -> 0x1010 (internal), 0x1010 -> 0x2000 (cross-function).
        add_unit(&mut m, 0x3000, &[]); // unattributed glue stays standalone
        m.unit_mut(m.unit_by_addr(0x1000).unwrap()).unwrap().succs =
            vec![Some(Target::Unit(m.unit_by_addr(0x1010).unwrap()))];
        m.unit_mut(m.unit_by_addr(0x1010).unwrap()).unwrap().succs =
            vec![Some(Target::Unit(m.unit_by_addr(0x2000).unwrap()))];

        let trace = trace_with_members(&[(0x1000, &[0x1010]), (0x2000, &[])]);
        let stats = recover_functions(&mut m, &trace).unwrap();

        assert_eq!(stats.functions, 2);
        assert_eq!(m.function_count(), 2);
        assert_eq!(m.unit_count(), 1); // only the glue unit remains

        let f = m.function(m.function_by_entry(0x1000).unwrap()).unwrap();
        assert_eq!(f.blocks.len(), 2);
        assert_eq!(f.blocks[0].start, 0x1000); // canonical entry block
        let internal = f.blocks[0].succs[0].unwrap();
        assert_eq!(internal, Target::Block(f.block_by_addr(0x1010).unwrap()));

        let callee = m.function_by_entry(0x2000).unwrap();
        assert_eq!(f.blocks[1].succs[0], Some(Target::Func(callee)));
    }

    #[test]
    fn test_cross_ref_to_internal_block_is_function_level() {
        let mut m = Module::new(RegisterFile::i386());
        m.add_unit(TranslationUnit::new(0x1000)).unwrap();
        m.add_unit(TranslationUnit::new(0x2000)).unwrap();
        m.add_unit(TranslationUnit::new(0x2010)).unwrap();
        // 0x1000 jumps into the middle of the other function.
        m.unit_mut(m.unit_by_addr(0x1000).unwrap()).unwrap().succs =
            vec![Some(Target::Unit(m.unit_by_addr(0x2010).unwrap()))];

        let trace = trace_with_members(&[(0x1000, &[]), (0x2000, &[0x2010])]);
        recover_functions(&mut m, &trace).unwrap();

        let f = m.function(m.function_by_entry(0x1000).unwrap()).unwrap();
        let callee = m.function_by_entry(0x2000).unwrap();
        assert_eq!(f.blocks[0].succs[0], Some(Target::Func(callee)));
    }

    #[test]
    fn test_catch_all_without_detail() {
        let mut m = Module::new(RegisterFile::i386());
        m.add_unit(TranslationUnit::new(0x1010)).unwrap();
        m.add_unit(TranslationUnit::new(0x1000)).unwrap();

        let stats = recover_functions(&mut m, &TraceInfo::default()).unwrap();
        assert_eq!(stats.functions, 1);
        let f = m.function(m.function_by_entry(0x1000).unwrap()).unwrap();
        assert_eq!(f.blocks.len(), 2);
        assert_eq!(f.blocks[0].start, 0x1000);
    }

    #[test]
    fn test_entry_discovery() {
        let regs = RegisterFile::i386();
        let eax = regs.accumulator();
        let mut m = Module::new(regs);
        m.add_unit(TranslationUnit::new(0x100)).unwrap();
        m.add_unit(TranslationUnit::new(0x200)).unwrap();
        let mut third = TranslationUnit::new(0x300);
        third.body.push(Inst::write_reg(0x300, eax, Expr::imm(0x1111)));
        third.body.push(Inst::write_reg(0x304, eax, Expr::imm(0x4000)));
        m.add_unit(third).unwrap();

        let b0 = m.unit_by_addr(0x100).unwrap();
        let b1 = m.unit_by_addr(0x200).unwrap();
        let b2 = m.unit_by_addr(0x300).unwrap();
        m.unit_mut(b0).unwrap().succs = vec![Some(Target::Unit(b1))];
        m.unit_mut(b1).unwrap().succs = vec![Some(Target::Unit(b2))];

        let mut trace = TraceInfo::default();
        trace.function_log.entries.push(0x100);

        // Last constant stored to the accumulator in the third block.
        assert_eq!(discover_program_entry(&m, &trace).unwrap(), 0x4000);
    }

    #[test]
    fn test_wrapper_calls_main() {
        let mut m = Module::new(RegisterFile::i386());
        m.add_unit(TranslationUnit::new(0x4000)).unwrap();
        let trace = trace_with_members(&[(0x4000, &[])]);
        recover_functions(&mut m, &trace).unwrap();

        let wrapper = build_wrapper(&mut m, 0x4000).unwrap();
        let f = m.function(wrapper).unwrap();
        assert!(f.is_wrapper);
        assert_eq!(f.blocks.len(), 1);
        assert!(matches!(
            f.blocks[0].body[0].kind,
            relift_ir::InstKind::Call { .. }
        ));

        assert!(build_wrapper(&mut m, 0x9999).is_err());
    }
}
