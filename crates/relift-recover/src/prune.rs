//! Dead and null successor pruning.
//!
//! Two passes. Hole stripping removes the null entries destructive edits
//! leave behind in successor lists. Trivially-dead pruning narrows a
//! block's successor list to the single edge its stored program counter
//! actually takes: when the terminating block of a jump chain stores a
//! known constant to the PC register, every other recorded successor is a
//! capture artifact. A stored PC that is missing from the successor list
//! means two runs disagreed about control flow (multi-threaded tracing);
//! that capture cannot be lifted and the pass fails loudly.

use rustc_hash::FxHashSet;
use tracing::debug;

use relift_ir::{BlockId, FuncId, Module, Target, Terminator, UnitId};

use crate::{LiftError, Result};

/// Strip null holes from every successor list. Returns holes removed.
pub fn strip_null_successors(module: &mut Module) -> usize {
    let mut removed = 0;

    for uid in module.unit_ids() {
        if let Some(unit) = module.unit_mut(uid) {
            let before = unit.succs.len();
            unit.succs.retain(Option::is_some);
            removed += before - unit.succs.len();
        }
    }
    for fid in module.function_ids() {
        if let Some(function) = module.function_mut(fid) {
            for block in &mut function.blocks {
                let before = block.succs.len();
                block.succs.retain(Option::is_some);
                removed += before - block.succs.len();
            }
        }
    }

    removed
}

/// Narrow successor lists using stored PC constants. Returns edges
/// discarded. Idempotent.
pub fn prune_trivially_dead(module: &mut Module) -> Result<usize> {
    let mut discarded = 0;

    for fid in module.function_ids() {
        let Some(function) = module.function(fid) else {
            continue;
        };

        // Decide first, then apply: the decision phase reads glue units
        // and other functions, the apply phase mutates this function.
        let mut keep: Vec<(BlockId, Target)> = Vec::new();
        for bid in function.block_ids() {
            let block = function.block(bid);
            if block.succs.len() < 2 {
                continue;
            }
            let Some(stored_pc) = chain_stored_pc(module, fid, bid) else {
                continue;
            };

            let matching = block.successors().find(|t| {
                target_addr(module, fid, *t) == Some(stored_pc)
            });
            match matching {
                Some(target) => keep.push((bid, target)),
                None => {
                    return Err(LiftError::NondeterministicCapture {
                        block: block.start,
                        stored_pc,
                    });
                }
            }
        }

        if keep.is_empty() {
            continue;
        }
        let Some(function) = module.function_mut(fid) else {
            continue;
        };
        for (bid, target) in keep {
            let block = function.block_mut(bid);
            discarded += block.succs.len() - 1;
            block.succs = vec![Some(target)];
        }
    }

    let trimmed = enforce_dispatch_invariant(module);
    if discarded > 0 || trimmed > 0 {
        debug!(discarded, cases_trimmed = trimmed, "trivially-dead pruning");
    }
    Ok(discarded)
}

/// The stored PC constant governing `bid`'s exit, found by walking the
/// jump chain through non-recovered glue units to its terminating block.
/// Explicit worklist, deterministic order; gives up on branches.
fn chain_stored_pc(module: &Module, fid: FuncId, bid: BlockId) -> Option<u64> {
    let pc_reg = module.registers.pc();
    let function = module.function(fid)?;
    let block = function.block(bid);

    // Path from the block through glue units, innermost last.
    let mut glue_path: Vec<UnitId> = Vec::new();
    let mut visited: FxHashSet<UnitId> = FxHashSet::default();

    let mut next_glue = match &block.term {
        Terminator::Return => None,
        // An unconditional branch into a recovered block terminates the
        // chain at the block itself.
        Terminator::Jump {
            target: Target::Block(_) | Target::Func(_),
        } => None,
        Terminator::Jump {
            target: Target::Unit(uid),
        } => Some(*uid),
        // Conditional or dispatching exits have no single stored PC.
        _ => return None,
    };

    while let Some(uid) = next_glue {
        if !visited.insert(uid) {
            return None;
        }
        let unit = module.unit(uid)?;
        glue_path.push(uid);
        next_glue = match &unit.term {
            Terminator::Return => None,
            Terminator::Jump {
                target: Target::Block(_) | Target::Func(_),
            } => None,
            Terminator::Jump {
                target: Target::Unit(next),
            } => Some(*next),
            _ => return None,
        };
    }

    // Last stored constant wins: terminating glue first, block last.
    for uid in glue_path.iter().rev() {
        if let Some(pc) = module.unit(*uid).and_then(|u| u.last_const_store(pc_reg)) {
            return Some(pc);
        }
    }
    block.last_const_store(pc_reg)
}

/// Address a successor target resolves to, if it has one.
fn target_addr(module: &Module, fid: FuncId, target: Target) -> Option<u64> {
    match target {
        Target::Block(bid) => module.function(fid).map(|f| f.block(bid).start),
        Target::Func(callee) => module.function(callee).map(|f| f.entry),
        Target::Unit(uid) => module.unit(uid).map(|u| u.start),
    }
}

/// After pruning, every dispatch case must target a recorded successor.
fn enforce_dispatch_invariant(module: &mut Module) -> usize {
    let mut trimmed = 0;
    for fid in module.function_ids() {
        let Some(function) = module.function_mut(fid) else {
            continue;
        };
        for block in &mut function.blocks {
            let succs: Vec<Target> = block.successors().collect();
            if let Terminator::Dispatch { cases, .. } = &mut block.term {
                let before = cases.len();
                cases.retain(|c| succs.contains(&c.target));
                trimmed += before - cases.len();
            }
        }
    }
    trimmed
}
