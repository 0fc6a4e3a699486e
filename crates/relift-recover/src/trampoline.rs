//! Callback trampolines.
//!
//! A library function that received a function pointer will call back into
//! recovered code. The capture shows this as a library entry whose member
//! set is suspiciously large: the callback's blocks executed under the
//! library's entry. For each recovered callback entry this pass builds an
//! "enter" trampoline (swap to native stack state, raise the
//! inside-callback flag, branch into the recovered function) and for each
//! recorded return site a conditional "exit" trampoline (guarded by the
//! flag, restore native state, return to the original call site). Both
//! hang off new dispatch cases on the library stub. Recovered callback
//! entries are emitted to the `rfuncs` sidecar for the downstream patcher.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use relift_ir::{
    BinOp, Expr, FuncId, Inst, Module, Target, Terminator, TranslationUnit, UnitId, UnitRole,
};
use relift_trace::TraceInfo;

use crate::fixup::error_unit;
use crate::Result;

/// A library entry whose member-block set is larger than this plausibly
/// invoked a callback.
pub const CALLBACK_MEMBER_THRESHOLD: usize = 3;

/// Anti-aliasing filter: successor addresses this close to a known caller
/// are call-return artifacts, not callback entries.
pub const CALLER_ALIAS_OFFSET: u64 = 16;

/// Counters reported by [`synthesize_trampolines`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TrampolineStats {
    pub callback_sites: usize,
    pub entries: usize,
    pub exits: usize,
    pub skipped: usize,
}

/// Result of trampoline synthesis.
#[derive(Clone, Debug, Default)]
pub struct TrampolineReport {
    pub stats: TrampolineStats,
    /// Recovered callback entry addresses, ascending.
    pub callback_entries: Vec<u64>,
}

/// Detect callback-taking library call sites and bridge them.
pub fn synthesize_trampolines(
    module: &mut Module,
    trace: &TraceInfo,
) -> Result<TrampolineReport> {
    let mut report = TrampolineReport::default();
    let log = &trace.function_log;

    let stubs: Vec<(UnitId, u64)> = module
        .unit_ids()
        .into_iter()
        .filter_map(|id| module.unit(id).map(|u| (id, u)))
        .filter(|(_, u)| u.role == UnitRole::ExternStub || u.extern_symbol.is_some())
        .map(|(id, u)| (id, u.start))
        .collect();

    let block_owner = block_owner_map(module);

    for (stub_id, entry) in stubs {
        let Some(members) = log.entry_to_members.get(&entry) else {
            continue;
        };
        if members.len() <= CALLBACK_MEMBER_THRESHOLD {
            continue;
        }
        report.stats.callback_sites += 1;

        let callers = log.entry_to_caller.get(&entry);
        let candidates = callback_candidates(module, stub_id, members, callers);
        let returns: BTreeSet<u64> = log
            .entry_to_return
            .get(&entry)
            .cloned()
            .unwrap_or_default();

        for addr in candidates {
            match bridge_entry(module, stub_id, addr) {
                Some(()) => {
                    report.stats.entries += 1;
                    report.callback_entries.push(addr);
                }
                None => {
                    report.stats.skipped += 1;
                    warn!(
                        stub = format_args!("{entry:#x}"),
                        candidate = format_args!("{addr:#x}"),
                        "unmatched callback entry candidate"
                    );
                }
            }
        }
        for addr in returns {
            match bridge_return(module, stub_id, addr, &block_owner) {
                Some(()) => report.stats.exits += 1,
                None => {
                    report.stats.skipped += 1;
                    warn!(
                        stub = format_args!("{entry:#x}"),
                        ret = format_args!("{addr:#x}"),
                        "unmatched callback return candidate"
                    );
                }
            }
        }
    }

    report.callback_entries.sort_unstable();
    report.callback_entries.dedup();
    debug!(
        sites = report.stats.callback_sites,
        entries = report.stats.entries,
        exits = report.stats.exits,
        skipped = report.stats.skipped,
        "trampoline synthesis"
    );
    Ok(report)
}

/// Write recovered callback entries to the flat `rfuncs` sidecar.
pub fn write_rfuncs(path: &Path, entries: &[u64]) -> Result<()> {
    let mut out = Vec::new();
    for addr in entries {
        writeln!(out, "{addr:x}")?;
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Successor addresses of the stub that belong to its own member set,
/// minus anything aliasing a known caller.
fn callback_candidates(
    module: &Module,
    stub_id: UnitId,
    members: &BTreeSet<u64>,
    callers: Option<&BTreeSet<u64>>,
) -> BTreeSet<u64> {
    let Some(stub) = module.unit(stub_id) else {
        return BTreeSet::new();
    };

    let mut succ_addrs = BTreeSet::new();
    for target in stub.successors() {
        if let Some(addr) = target_addr(module, target) {
            succ_addrs.insert(addr);
        }
    }
    if let Terminator::Dispatch { cases, .. } = &stub.term {
        for case in cases {
            succ_addrs.insert(case.addr);
        }
    }

    succ_addrs
        .into_iter()
        .filter(|a| members.contains(a))
        .filter(|a| {
            callers.is_none_or(|cs| {
                cs.iter().all(|c| a.abs_diff(*c) > CALLER_ALIAS_OFFSET)
            })
        })
        .collect()
}

/// Build the enter trampoline for one callback entry: swap to callback
/// stack state, raise the flag, branch into the recovered function.
fn bridge_entry(module: &mut Module, stub_id: UnitId, addr: u64) -> Option<()> {
    let callback_fn = module.function_by_entry(addr)?;

    let regs = &module.registers;
    let (sp, flag, sp_save, pc) = (
        regs.sp(),
        regs.callback_flag(),
        regs.callback_sp_save(),
        regs.pc(),
    );

    let tramp_addr = synthetic_addr(module);
    let mut tramp = TranslationUnit::new(tramp_addr);
    tramp.role = UnitRole::Callback;
    tramp
        .body
        .push(Inst::write_reg(addr, sp_save, Expr::reg(sp)));
    tramp
        .body
        .push(Inst::write_reg(addr, flag, Expr::imm(1)));
    tramp.term = Terminator::jump(Target::Func(callback_fn));
    tramp.succs = vec![Some(Target::Func(callback_fn))];
    let tramp_id = module.add_unit(tramp).ok()?;

    if let Some(function) = module.function_mut(callback_fn) {
        if let Some(entry_block) = function.blocks.first_mut() {
            entry_block.role = UnitRole::Callback;
        }
    }

    add_stub_case(module, stub_id, addr, Target::Unit(tramp_id), pc);
    Some(())
}

/// Build the conditional exit trampoline for one recorded return site.
fn bridge_return(
    module: &mut Module,
    stub_id: UnitId,
    addr: u64,
    block_owner: &FxHashMap<u64, FuncId>,
) -> Option<()> {
    let native_path = if let Some(&fid) = block_owner.get(&addr) {
        Target::Func(fid)
    } else {
        Target::Unit(module.unit_by_addr(addr)?)
    };

    let regs = &module.registers;
    let (sp, flag, sp_save, pc) = (
        regs.sp(),
        regs.callback_flag(),
        regs.callback_sp_save(),
        regs.pc(),
    );

    // Restore block: drop the flag, restore the native stack pointer,
    // return to the original call site.
    let restore_addr = synthetic_addr(module);
    let mut restore = TranslationUnit::new(restore_addr);
    restore.role = UnitRole::Callback;
    restore.body.push(Inst::write_reg(addr, flag, Expr::imm(0)));
    restore
        .body
        .push(Inst::write_reg(addr, sp, Expr::reg(sp_save)));
    restore.term = Terminator::Return;
    let restore_id = module.add_unit(restore).ok()?;

    // Guard block: only divert when execution is inside a callback.
    let guard_addr = synthetic_addr(module);
    let mut guard = TranslationUnit::new(guard_addr);
    guard.role = UnitRole::Callback;
    guard.term = Terminator::branch(
        Expr::binary(BinOp::Ne, Expr::reg(flag), Expr::imm(0)),
        Target::Unit(restore_id),
        native_path,
    );
    guard.succs = vec![Some(Target::Unit(restore_id)), Some(native_path)];
    let guard_id = module.add_unit(guard).ok()?;

    add_stub_case(module, stub_id, addr, Target::Unit(guard_id), pc);
    Some(())
}

fn add_stub_case(
    module: &mut Module,
    stub_id: UnitId,
    addr: u64,
    target: Target,
    pc: relift_ir::RegId,
) {
    let error = error_unit(module);
    let Some(stub) = module.unit_mut(stub_id) else {
        return;
    };
    if !stub.term.is_dispatch() {
        stub.term = Terminator::dispatch(Expr::reg(pc), Target::Unit(error));
    }
    stub.term.add_dispatch_case(addr, target);
    if !stub.has_successor(target) {
        stub.succs.push(Some(target));
    }
    if !stub.has_successor(Target::Unit(error)) {
        stub.succs.push(Some(Target::Unit(error)));
    }
}

/// A fresh address for synthetic glue, descending from just below the
/// reserved error-unit address.
fn synthetic_addr(module: &Module) -> u64 {
    let mut addr = crate::fixup::ERROR_UNIT_ADDR - 1;
    while module.unit_by_addr(addr).is_some() {
        addr -= 1;
    }
    addr
}

fn target_addr(module: &Module, target: Target) -> Option<u64> {
    match target {
        Target::Unit(id) => module.unit(id).map(|u| u.start),
        Target::Func(id) => module.function(id).map(|f| f.entry),
        Target::Block(_) => None,
    }
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
