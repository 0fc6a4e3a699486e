//! Overlap resolver.
//!
//! The capture front end records whichever block the dynamic execution
//! entered, so two units attributed to one function may cover overlapping
//! instruction ranges ending at the same address. Merging splits the
//! earlier unit where the later one begins and chains them with an
//! unconditional branch. After this pass no two sibling units within one
//! prospective function share an end address.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use tracing::debug;

use relift_ir::{Module, Target, Terminator, UnitId, UnitRole};
use relift_trace::TraceInfo;

use crate::{LiftError, Result};

/// Merge units with equal end addresses within each prospective function.
/// Returns the number of pair merges performed.
pub fn resolve_overlaps(module: &mut Module, trace: &TraceInfo) -> Result<usize> {
    let groups = member_groups(module, trace);
    let mut merges = 0;

    for group in groups {
        // Bucket by current end address; merges below never change the
        // end address of the unit that survives the bucket.
        let mut by_end: BTreeMap<u64, Vec<UnitId>> = BTreeMap::new();
        for &id in &group {
            if let Some(unit) = module.unit(id) {
                by_end.entry(unit.last_pc).or_default().push(id);
            }
        }

        for (end, mut ids) in by_end {
            if ids.len() < 2 {
                continue;
            }
            ids.sort_by_key(|&id| module.unit(id).map_or(u64::MAX, |u| u.start));
            ids.dedup();
            debug!(end = format_args!("{end:#x}"), count = ids.len(), "overlap group");
            for i in 0..ids.len() - 1 {
                merge_pair(module, ids[i], ids[i + 1])?;
                merges += 1;
            }
        }
    }

    Ok(merges)
}

/// Merge an overlapping pair `(a, b)` with `b.start > a.start`: split `a`
/// at `b`'s start, branch the head into `b`, and give `b` the union of
/// both prior successor sets minus self-references.
fn merge_pair(module: &mut Module, a_id: UnitId, b_id: UnitId) -> Result<()> {
    let Some(b_start) = module.unit(b_id).map(|u| u.start) else {
        return Ok(());
    };

    let old_a_succs = {
        let Some(a) = module.unit_mut(a_id) else {
            return Ok(());
        };
        let split = a
            .body
            .iter()
            .position(|i| i.pc == b_start)
            .filter(|&i| i > 0)
            .ok_or(LiftError::SplitPointMissing {
                unit: a.start,
                addr: b_start,
            })?;
        let head_last = a.body[split - 1].pc;
        a.body.truncate(split);
        a.last_pc = head_last;
        a.term = Terminator::jump(Target::Unit(b_id));
        a.role = UnitRole::Merged;
        std::mem::replace(&mut a.succs, vec![Some(Target::Unit(b_id))])
    };

    let Some(b) = module.unit_mut(b_id) else {
        return Ok(());
    };
    let old_b_succs = std::mem::take(&mut b.succs);
    let mut seen = FxHashSet::default();
    for target in old_a_succs.into_iter().chain(old_b_succs).flatten() {
        if target == Target::Unit(a_id) || target == Target::Unit(b_id) {
            continue;
        }
        if seen.insert(target) {
            b.succs.push(Some(target));
        }
    }
    b.role = UnitRole::Merged;
    Ok(())
}

/// Resolve "exception overlaps": a unit whose own end address equals the
/// start of one of its successors, an artifact of an inlined
/// exception-raising helper. The duplicated leading instruction and the
/// helper call are stripped and the successor's own successors adopted.
pub fn resolve_exception_overlaps(module: &mut Module) -> usize {
    let mut fixes = Vec::new();
    for uid in module.unit_ids() {
        let Some(unit) = module.unit(uid) else {
            continue;
        };
        for target in unit.successors() {
            let Some(sid) = target.as_unit() else {
                continue;
            };
            if sid == uid {
                continue;
            }
            if module.unit(sid).is_some_and(|s| s.start == unit.last_pc) {
                fixes.push((uid, sid));
                break;
            }
        }
    }

    let count = fixes.len();
    for (uid, sid) in fixes {
        let Some((succ_start, succ_succs)) =
            module.unit(sid).map(|s| (s.start, s.succs.clone()))
        else {
            continue;
        };
        let Some(unit) = module.unit_mut(uid) else {
            continue;
        };
        unit.body.retain(|i| i.pc < succ_start);
        unit.last_pc = unit.body.last().map_or(unit.start, |i| i.pc);
        unit.succs = succ_succs;
        unit.role = UnitRole::Merged;
    }
    count
}

/// Units grouped by the function entry the trace attributes them to, or
/// one catch-all group when the capture recorded no function detail.
fn member_groups(module: &Module, trace: &TraceInfo) -> Vec<Vec<UnitId>> {
    if !trace.has_function_detail() {
        return vec![module.unit_ids()];
    }
    trace
        .function_log
        .entry_to_members
        .iter()
        .map(|(entry, members)| {
            members
                .iter()
                .chain(std::iter::once(entry))
                .filter_map(|&addr| module.unit_by_addr(addr))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relift_ir::{Expr, Inst, RegisterFile, TranslationUnit};

    fn unit_with_insts(start: u64, pcs: &[u64]) -> TranslationUnit {
        let mut u = TranslationUnit::new(start);
        let eax = RegisterFile::i386().accumulator();
        for &pc in pcs {
            u.body.push(Inst::write_reg(pc, eax, Expr::imm(pc)));
            u.last_pc = pc;
        }
        u
    }

    #[test]
    fn test_merge_preserves_coverage() {
        let mut m = Module::new(RegisterFile::i386());
        // A covers 0x1000..=0x100c, B covers 0x1008..=0x100c: equal end.
        let a = m
            .add_unit(unit_with_insts(0x1000, &[0x1000, 0x1004, 0x1008, 0x100c]))
            .unwrap();
        let b = m.add_unit(unit_with_insts(0x1008, &[0x1008, 0x100c])).unwrap();
        let c = m.add_unit(TranslationUnit::new(0x2000)).unwrap();
        let d = m.add_unit(TranslationUnit::new(0x3000)).unwrap();
        m.unit_mut(a).unwrap().succs = vec![Some(Target::Unit(c)), Some(Target::Unit(b))];
        m.unit_mut(b).unwrap().succs = vec![Some(Target::Unit(d))];

        let merges = resolve_overlaps(&mut m, &TraceInfo::default()).unwrap();
        assert_eq!(merges, 1);

        let ua = m.unit(a).unwrap();
        assert!(ua.last_pc < 0x1008);
        assert_eq!(ua.last_pc, 0x1004);
        assert_eq!(ua.body.len(), 2);
        assert_eq!(ua.succs, vec![Some(Target::Unit(b))]);
        assert_eq!(ua.term, Terminator::jump(Target::Unit(b)));
        assert_eq!(ua.role, UnitRole::Merged);

        let ub = m.unit(b).unwrap();
        // Union of old successor sets minus self-references.
        assert_eq!(
            ub.succs,
            vec![Some(Target::Unit(c)), Some(Target::Unit(d))]
        );
    }

    #[test]
    fn test_merge_chain_of_three() {
        let mut m = Module::new(RegisterFile::i386());
        let a = m
            .add_unit(unit_with_insts(0x1000, &[0x1000, 0x1004, 0x1008, 0x100c]))
            .unwrap();
        let b = m
            .add_unit(unit_with_insts(0x1004, &[0x1004, 0x1008, 0x100c]))
            .unwrap();
        let c = m.add_unit(unit_with_insts(0x1008, &[0x1008, 0x100c])).unwrap();

        let merges = resolve_overlaps(&mut m, &TraceInfo::default()).unwrap();
        assert_eq!(merges, 2);

        assert_eq!(m.unit(a).unwrap().last_pc, 0x1000);
        assert_eq!(m.unit(a).unwrap().succs, vec![Some(Target::Unit(b))]);
        assert_eq!(m.unit(b).unwrap().last_pc, 0x1004);
        assert_eq!(m.unit(b).unwrap().succs, vec![Some(Target::Unit(c))]);
        assert_eq!(m.unit(c).unwrap().last_pc, 0x100c);
    }

    #[test]
    fn test_missing_split_point_is_error() {
        let mut m = Module::new(RegisterFile::i386());
        // A has no instruction at B's start address.
        m.add_unit(unit_with_insts(0x1000, &[0x1000, 0x100c])).unwrap();
        m.add_unit(unit_with_insts(0x1004, &[0x1004, 0x100c])).unwrap();

        assert!(matches!(
            resolve_overlaps(&mut m, &TraceInfo::default()),
            Err(LiftError::SplitPointMissing {
                unit: 0x1000,
                addr: 0x1004
            })
        ));
    }

    #[test]
    fn test_exception_overlap_strip() {
        let mut m = Module::new(RegisterFile::i386());
        // U ends at 0x1008, which is also the start of its successor S.
        let mut u = unit_with_insts(0x1000, &[0x1000, 0x1004, 0x1008]);
        u.body.push(Inst::helper(0x1008, "raise_exception", vec![]));
        let u = m.add_unit(u).unwrap();
        let s = m.add_unit(unit_with_insts(0x1008, &[0x1008, 0x100c])).unwrap();
        let t = m.add_unit(TranslationUnit::new(0x2000)).unwrap();
        m.unit_mut(u).unwrap().succs = vec![Some(Target::Unit(s))];
        m.unit_mut(s).unwrap().succs = vec![Some(Target::Unit(t))];

        let fixed = resolve_exception_overlaps(&mut m);
        assert_eq!(fixed, 1);

        let uu = m.unit(u).unwrap();
        assert_eq!(uu.last_pc, 0x1004);
        assert!(uu.body.iter().all(|i| i.pc < 0x1008));
        assert_eq!(uu.succs, vec![Some(Target::Unit(t))]);
    }
}
