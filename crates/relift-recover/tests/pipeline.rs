//! Whole-pipeline integration tests.

use relift_ir::{
    Expr, Inst, InstKind, Module, Place, RegisterFile, Target, Terminator, TranslationUnit,
};
use relift_recover::{prune_trivially_dead, run_lift, PipelineConfig};
use relift_trace::TraceInfo;

/// A small capture: the startup sequence (three blocks, the third storing
/// the main address into the accumulator), main at 0x1000 falling through
/// to 0x1010.
fn sample_capture() -> (Module, TraceInfo) {
    let regs = RegisterFile::i386();
    let (eax, pc) = (regs.accumulator(), regs.pc());
    let mut m = Module::new(regs);

    let mut start = TranslationUnit::new(0x100);
    start.body.push(Inst::write_reg(0x100, pc, Expr::imm(0x200)));
    m.add_unit(start).unwrap();
    let mut glue = TranslationUnit::new(0x200);
    glue.body.push(Inst::write_reg(0x200, pc, Expr::imm(0x300)));
    m.add_unit(glue).unwrap();
    let mut loader = TranslationUnit::new(0x300);
    loader.body.push(Inst::write_reg(0x300, eax, Expr::imm(0x1111)));
    loader.body.push(Inst::write_reg(0x304, eax, Expr::imm(0x1000)));
    m.add_unit(loader).unwrap();

    let mut main = TranslationUnit::new(0x1000);
    main.last_pc = 0x1004;
    main.body.push(Inst::write_reg(0x1004, pc, Expr::imm(0x1010)));
    m.add_unit(main).unwrap();
    let mut tail = TranslationUnit::new(0x1010);
    tail.last_pc = 0x1010;
    m.add_unit(tail).unwrap();

    let mut trace = TraceInfo::default();
    trace.successors.extend([
        (0x100, 0x200),
        (0x200, 0x300),
        (0x1000, 0x1010),
    ]);
    let log = &mut trace.function_log;
    log.entries = vec![0x100, 0x1000];
    log.entry_to_members
        .entry(0x100)
        .or_default()
        .extend([0x200, 0x300]);
    log.entry_to_members.entry(0x1000).or_default().insert(0x1010);

    (m, trace)
}

#[test]
fn test_lift_recovers_functions_and_wrapper() {
    let (mut m, trace) = sample_capture();
    let stats = run_lift(&mut m, &trace, &PipelineConfig::default()).unwrap();

    assert_eq!(stats.functions, 2);
    assert_eq!(stats.edges_projected, 3);

    // Both trace entries became functions, plus the wrapper.
    let main = m.function_by_entry(0x1000).unwrap();
    assert!(m.function_by_entry(0x100).is_some());
    let wrapper_id = m
        .function_ids()
        .into_iter()
        .find(|&f| m.function(f).unwrap().is_wrapper)
        .expect("wrapper built");

    // The wrapper body is a single call into recovered main (plus the
    // register mirroring added by specialization).
    let wrapper = m.function(wrapper_id).unwrap();
    let calls: Vec<_> = wrapper.blocks[0]
        .body
        .iter()
        .filter_map(|i| match &i.kind {
            InstKind::Call { callee, .. } => Some(*callee),
            _ => None,
        })
        .collect();
    assert_eq!(calls, vec![main]);
}

#[test]
fn test_single_stored_pc_edge_survives_lift_and_prune() {
    // A block at 0x1000 storing PC=0x1010 then returning, with the only
    // recorded edge (0x1000, 0x1010), yields exactly one successor edge
    // after the pipeline, unchanged by a further prune.
    let (mut m, trace) = sample_capture();
    run_lift(&mut m, &trace, &PipelineConfig::default()).unwrap();

    let main = m.function(m.function_by_entry(0x1000).unwrap()).unwrap();
    let tail = main.block_by_addr(0x1010).unwrap();
    assert_eq!(main.blocks[0].succs, vec![Some(Target::Block(tail))]);

    let pruned = prune_trivially_dead(&mut m).unwrap();
    assert_eq!(pruned, 0);
    let main = m.function(m.function_by_entry(0x1000).unwrap()).unwrap();
    let tail = main.block_by_addr(0x1010).unwrap();
    assert_eq!(main.blocks[0].succs, vec![Some(Target::Block(tail))]);
}

#[test]
fn test_no_trivial_register_globals_after_lift() {
    let (mut m, trace) = sample_capture();
    run_lift(&mut m, &trace, &PipelineConfig::default()).unwrap();

    for fid in m.function_ids() {
        let f = m.function(fid).unwrap();
        if f.is_wrapper {
            continue;
        }
        assert!(f.signature.is_some(), "fn {:#x} not specialized", f.entry);
        for block in &f.blocks {
            for inst in &block.body {
                let mut regs = Vec::new();
                inst.for_each_read_reg(&mut |r| regs.push(r));
                if let Some(w) = inst.written_reg() {
                    regs.push(w);
                }
                for r in regs {
                    assert!(
                        !m.registers.is_trivial(r),
                        "trivial register survives in fn {:#x}",
                        f.entry
                    );
                }
            }
            if let Terminator::Branch { cond, .. } = &block.term {
                let mut reads = Vec::new();
                cond.for_each_reg(&mut |r| reads.push(r));
                assert!(reads.iter().all(|r| !m.registers.is_trivial(*r)));
            }
        }
    }
}

#[test]
fn test_catch_all_lift_without_function_detail() {
    let regs = RegisterFile::i386();
    let pc = regs.pc();
    let mut m = Module::new(regs);
    let mut a = TranslationUnit::new(0x1000);
    a.body.push(Inst::write_reg(0x1000, pc, Expr::imm(0x1010)));
    m.add_unit(a).unwrap();
    m.add_unit(TranslationUnit::new(0x1010)).unwrap();

    let mut trace = TraceInfo::default();
    trace.successors.insert((0x1000, 0x1010));

    let stats = run_lift(&mut m, &trace, &PipelineConfig::default()).unwrap();
    assert_eq!(stats.functions, 1);
    // No capture entries: no wrapper, one catch-all function.
    assert!(m
        .function_ids()
        .into_iter()
        .all(|f| !m.function(f).unwrap().is_wrapper));
}

#[test]
fn test_lift_is_deterministic() {
    let (mut m1, trace) = sample_capture();
    let (mut m2, _) = sample_capture();
    run_lift(&mut m1, &trace, &PipelineConfig::default()).unwrap();
    run_lift(&mut m2, &trace, &PipelineConfig::default()).unwrap();
    assert_eq!(relift_ir::dump_module(&m1), relift_ir::dump_module(&m2));
}

#[test]
fn test_wrapper_mirror_discipline() {
    let (mut m, trace) = sample_capture();
    run_lift(&mut m, &trace, &PipelineConfig::default()).unwrap();

    let wrapper = m
        .function_ids()
        .into_iter()
        .find(|&f| m.function(f).unwrap().is_wrapper)
        .unwrap();
    let w = m.function(wrapper).unwrap();
    assert!(w.signature.is_none());

    let body = &w.blocks[0].body;
    // Globals mirrored into locals before the call and back after it.
    let call_pos = body
        .iter()
        .position(|i| matches!(i.kind, InstKind::Call { .. }))
        .unwrap();
    assert!(body[..call_pos].iter().any(|i| matches!(
        i.kind,
        InstKind::Write {
            dst: Place::Local(_),
            value: Expr::Reg(_)
        }
    )));
    assert!(body[call_pos + 1..].iter().any(|i| matches!(
        i.kind,
        InstKind::Write {
            dst: Place::Reg(_),
            value: Expr::Local(_)
        }
    )));
}
