//! Recovery pipeline driver.
//!
//! Stages execute strictly in dependency order over one exclusively-owned
//! module; any fatal condition aborts the whole run.

use tracing::{debug, info, trace_span};

use relift_ir::{Module, UnitRole};
use relift_trace::TraceInfo;

use crate::{
    build_successor_lists, build_wrapper, discover_program_entry, fix_control_flow,
    insert_calls, prune_trivially_dead, recover_functions, recover_register_flow,
    resolve_exception_overlaps, resolve_overlaps, strip_null_successors,
    synthesize_trampolines, Result,
};

/// Pipeline modifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineConfig {
    /// Skip extern-stub successor synthesis during fix-up.
    pub no_link_lift: bool,
    /// Instrument every inserted call with a tracing helper.
    pub trace_calls: bool,
    /// Strip `Merged` diagnostic tags after lifting.
    pub clean_names: bool,
}

/// Counters accumulated across the whole run.
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub units_in: usize,
    pub edges_projected: usize,
    pub overlap_merges: usize,
    pub exception_merges: usize,
    pub functions: usize,
    pub blocks: usize,
    pub holes_stripped: usize,
    pub dead_pruned: usize,
    pub call_edges: usize,
    pub jump_edges: usize,
    pub dispatch_cases: usize,
    pub direct_calls: usize,
    pub indirect_calls: usize,
    pub trampoline_entries: usize,
    pub trampoline_exits: usize,
    /// Recovered callback entry addresses for the `rfuncs` sidecar.
    pub callback_entries: Vec<u64>,
}

/// Run the full recovery pipeline (stages 2 through 9).
pub fn run_lift(
    module: &mut Module,
    trace: &TraceInfo,
    config: &PipelineConfig,
) -> Result<PipelineStats> {
    let mut stats = PipelineStats {
        units_in: module.unit_count(),
        ..PipelineStats::default()
    };

    {
        let _span = trace_span!("successor_lists").entered();
        stats.edges_projected = build_successor_lists(module, trace);
    }

    {
        let _span = trace_span!("overlap_resolver").entered();
        stats.overlap_merges = resolve_overlaps(module, trace)?;
        stats.exception_merges = resolve_exception_overlaps(module);
    }

    {
        let _span = trace_span!("function_recovery").entered();
        // The startup chain only exists while units are standalone.
        let main_addr = if trace.function_log.entries.is_empty() {
            debug!("no capture entries; skipping program-entry discovery");
            None
        } else {
            Some(discover_program_entry(module, trace)?)
        };
        let recovered = recover_functions(module, trace)?;
        stats.functions = recovered.functions;
        stats.blocks = recovered.blocks;
        if let Some(main_addr) = main_addr {
            build_wrapper(module, main_addr)?;
        }
    }

    {
        let _span = trace_span!("successor_pruning").entered();
        stats.holes_stripped = strip_null_successors(module);
        stats.dead_pruned = prune_trivially_dead(module)?;
    }

    {
        let _span = trace_span!("cfg_fixup").entered();
        let fixup = fix_control_flow(module, trace, config.no_link_lift)?;
        stats.call_edges = fixup.call_edges;
        stats.jump_edges = fixup.jump_edges;
        stats.dispatch_cases = fixup.cases_added;
    }

    {
        let _span = trace_span!("call_insertion").entered();
        let calls = insert_calls(module, trace, config.trace_calls)?;
        stats.direct_calls = calls.direct;
        stats.indirect_calls = calls.indirect;
    }

    {
        let _span = trace_span!("register_flow").entered();
        recover_register_flow(module)?;
    }

    {
        let _span = trace_span!("trampolines").entered();
        let report = synthesize_trampolines(module, trace)?;
        stats.trampoline_entries = report.stats.entries;
        stats.trampoline_exits = report.stats.exits;
        stats.callback_entries = report.callback_entries;
    }

    if config.clean_names {
        let cleared = clean_merged_names(module);
        debug!(cleared, "merged diagnostic tags cleared");
    }

    info!(
        units_in = stats.units_in,
        functions = stats.functions,
        blocks = stats.blocks,
        direct_calls = stats.direct_calls,
        indirect_calls = stats.indirect_calls,
        callback_entries = stats.callback_entries.len(),
        "lift pipeline complete"
    );
    Ok(stats)
}

/// Run only the cleanup passes (`--clean`).
pub fn run_clean(module: &mut Module, clean_names: bool) -> Result<PipelineStats> {
    let mut stats = PipelineStats {
        units_in: module.unit_count(),
        ..PipelineStats::default()
    };
    stats.holes_stripped = strip_null_successors(module);
    stats.dead_pruned = prune_trivially_dead(module)?;
    if clean_names {
        clean_merged_names(module);
    }
    info!(
        holes = stats.holes_stripped,
        pruned = stats.dead_pruned,
        "clean pass complete"
    );
    Ok(stats)
}

/// Strip `Merged` diagnostic tags back to `Ordinary`.
pub fn clean_merged_names(module: &mut Module) -> usize {
    let mut cleared = 0;
    for uid in module.unit_ids() {
        if let Some(unit) = module.unit_mut(uid) {
            if unit.role == UnitRole::Merged {
                unit.role = UnitRole::Ordinary;
                cleared += 1;
            }
        }
    }
    for fid in module.function_ids() {
        if let Some(function) = module.function_mut(fid) {
            for block in &mut function.blocks {
                if block.role == UnitRole::Merged {
                    block.role = UnitRole::Ordinary;
                    cleared += 1;
                }
            }
        }
    }
    cleared
}
