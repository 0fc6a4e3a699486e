//! Call insertion.
//!
//! After recovery, a block whose successors leave its function is an
//! implicit call: captured code stored the callee's address into the PC
//! register and returned to the dynamic dispatcher. This pass makes the
//! call explicit: the stored next-PC constant is removed, a call
//! instruction is inserted, and the block falls through to the call's
//! follow-up block. Blocks that restore the PC from the stack are real
//! returns and are left alone. Ambiguous call sites (several candidate
//! callees observed) dispatch over the runtime target through one thunk
//! per candidate with an unreachable default.

use rustc_hash::FxHashMap;
use tracing::debug;

use relift_ir::{
    Block, BlockId, ENTRY_BLOCK, Expr, FuncId, Inst, InstKind, Module, Place, Target,
    Terminator,
};
use relift_trace::TraceInfo;

use crate::{LiftError, Result};

/// Counters reported by [`insert_calls`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CallStats {
    pub direct: usize,
    pub indirect: usize,
    pub thunks: usize,
}

/// Convert implicit cross-function fallthrough into real calls.
pub fn insert_calls(
    module: &mut Module,
    trace: &TraceInfo,
    trace_calls: bool,
) -> Result<CallStats> {
    let entry_of: FxHashMap<FuncId, u64> = module
        .function_ids()
        .into_iter()
        .filter_map(|fid| module.function(fid).map(|f| (fid, f.entry)))
        .collect();
    let pc_reg = module.registers.pc();
    let sp_reg = module.registers.sp();
    let mut stats = CallStats::default();

    for fid in module.function_ids() {
        let Some(function) = module.function(fid) else {
            continue;
        };
        if function.is_wrapper {
            continue;
        }

        // Decide per block, then apply: applying pushes thunk blocks.
        let mut edits = Vec::new();
        for bid in function.block_ids() {
            let block = function.block(bid);
            if block.role == relift_ir::UnitRole::ExternStub || block.extern_symbol.is_some() {
                continue;
            }
            if is_return_block(block, pc_reg, sp_reg) {
                continue;
            }

            let mut callees: Vec<FuncId> = Vec::new();
            for target in block.successors() {
                match target {
                    Target::Func(g) if !callees.contains(&g) => callees.push(g),
                    // The function's own entry: a recursive call.
                    Target::Block(b) if b == ENTRY_BLOCK => {
                        if !callees.contains(&fid) {
                            callees.push(fid);
                        }
                    }
                    _ => {}
                }
            }
            if callees.is_empty() {
                continue;
            }

            let follow_up = call_follow_up(trace, function, block, bid)?;
            edits.push((bid, callees, follow_up));
        }

        if edits.is_empty() {
            continue;
        }
        let Some(function) = module.function_mut(fid) else {
            continue;
        };
        for (bid, callees, follow_up) in edits {
            apply_call_edit(
                function, bid, &callees, follow_up, &entry_of, pc_reg, trace_calls, &mut stats,
            );
        }
    }

    debug!(
        direct = stats.direct,
        indirect = stats.indirect,
        thunks = stats.thunks,
        "call insertion"
    );
    Ok(stats)
}

/// A return restores the PC from the stack rather than storing a target.
fn is_return_block(
    block: &Block,
    pc_reg: relift_ir::RegId,
    sp_reg: relift_ir::RegId,
) -> bool {
    for inst in block.body.iter().rev() {
        if let InstKind::Write {
            dst: Place::Reg(dst),
            value,
        } = &inst.kind
        {
            if *dst != pc_reg {
                continue;
            }
            if let Expr::Load { addr, .. } = value {
                let mut reads_sp = false;
                addr.for_each_reg(&mut |r| reads_sp |= r == sp_reg);
                return reads_sp;
            }
            return false;
        }
    }
    false
}

/// The block execution continues in once the call returns.
fn call_follow_up(
    trace: &TraceInfo,
    function: &relift_ir::Function,
    block: &Block,
    _bid: BlockId,
) -> Result<BlockId> {
    if let Some(&addr) = trace.function_log.caller_to_follow_up.get(&block.last_pc) {
        if let Some(bid) = function.block_by_addr(addr) {
            return Ok(bid);
        }
    }
    // Fall back to the continuation fix-up already recorded: the first
    // internal successor that is not the entry block.
    block
        .successors()
        .filter_map(Target::as_block)
        .find(|&b| b != ENTRY_BLOCK)
        .ok_or(LiftError::MissingFollowUp { block: block.start })
}

#[allow(clippy::too_many_arguments)]
fn apply_call_edit(
    function: &mut relift_ir::Function,
    bid: BlockId,
    callees: &[FuncId],
    follow_up: BlockId,
    entry_of: &FxHashMap<FuncId, u64>,
    pc_reg: relift_ir::RegId,
    trace_calls: bool,
    stats: &mut CallStats,
) {
    let site_pc = function.block(bid).last_pc;

    // Remove the implicit "store next PC" in the exit block. Indirect
    // sites keep their computed PC write; the dispatch selector reads it.
    {
        let block = function.block_mut(bid);
        if let Some(idx) = block
            .body
            .iter()
            .rposition(|i| i.const_store_to(pc_reg).is_some())
        {
            block.body.remove(idx);
        }
    }

    if let [callee] = callees {
        let callee = *callee;
        let block = function.block_mut(bid);
        if trace_calls {
            let entry = entry_of.get(&callee).copied().unwrap_or_default();
            block
                .body
                .push(Inst::helper(site_pc, "call_trace", vec![Expr::imm(entry)]));
        }
        block.body.push(Inst::call(site_pc, callee));
        block.term = Terminator::jump(Target::Block(follow_up));
        block.succs = vec![Some(Target::Block(follow_up))];
        stats.direct += 1;
        return;
    }

    // Function-pointer dispatch: load the runtime target, switch over it
    // into one thunk per candidate callee, unreachable default.
    let selector = function.add_local("call_target".to_string(), None);
    let mut thunk_ids = Vec::with_capacity(callees.len());
    for &callee in callees {
        let entry = entry_of.get(&callee).copied().unwrap_or_default();
        let mut thunk = Block::synthetic(entry);
        if trace_calls {
            thunk
                .body
                .push(Inst::helper(site_pc, "call_trace", vec![Expr::imm(entry)]));
        }
        thunk.body.push(Inst::call(site_pc, callee));
        thunk.term = Terminator::jump(Target::Block(follow_up));
        thunk.succs = vec![Some(Target::Block(follow_up))];
        let tid = function.push_block(thunk);
        thunk_ids.push((entry, tid));
        stats.thunks += 1;
    }
    let mut default = Block::synthetic(site_pc);
    default.term = Terminator::Unreachable;
    let default = function.push_block(default);

    let block = function.block_mut(bid);
    block
        .body
        .push(Inst::write(site_pc, Place::Local(selector), Expr::reg(pc_reg)));
    let mut term = Terminator::dispatch(Expr::local(selector), Target::Block(default));
    let mut succs = Vec::with_capacity(thunk_ids.len() + 1);
    for (entry, tid) in thunk_ids {
        term.add_dispatch_case(entry, Target::Block(tid));
        succs.push(Some(Target::Block(tid)));
    }
    succs.push(Some(Target::Block(default)));
    block.term = term;
    block.succs = succs;
    stats.indirect += 1;
}
