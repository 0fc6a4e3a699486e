//! relift - trace recompiler orchestrator.
//!
//! Loads a captured module plus its sidecars, runs the recovery pipeline
//! from `relift-recover`, and writes the transformed module back out in
//! its compact binary and textual forms.
//!
//! # Example
//!
//! ```ignore
//! use relift::{LiftOptions, run};
//!
//! let mut opts = LiftOptions::new("capture/trace.rlm");
//! opts.lift = true;
//! run(&opts)?;
//! ```

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use relift_ir::{Module, UnitRole};
use relift_recover::{
    dump_memory_dependences, run_clean, run_lift, write_rfuncs, PipelineConfig,
};
use relift_trace::{
    load_sidecar, parse_data_imports, parse_function_pairs, parse_main_addrs, parse_symbols,
    TraceInfo, TRACE_INFO_FILE,
};

/// Orchestrator errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ir(#[from] relift_ir::IrError),
    #[error(transparent)]
    Trace(#[from] relift_trace::TraceError),
    #[error(transparent)]
    Lift(#[from] relift_recover::LiftError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One orchestrator invocation.
#[derive(Clone, Debug, Default)]
pub struct LiftOptions {
    /// Captured module (compact binary form).
    pub trace_path: PathBuf,
    /// Basename for outputs.
    pub output_base: PathBuf,

    // Stage selection.
    pub link_prep_1: bool,
    pub link_prep_2: bool,
    pub clean: bool,
    pub lift: bool,
    pub optimize: bool,
    pub optimize_better: bool,
    pub compile: bool,

    // Modifiers.
    pub no_link_lift: bool,
    pub clean_names: bool,
    pub trace_calls: bool,
}

impl LiftOptions {
    pub fn new(trace_path: impl Into<PathBuf>) -> Self {
        Self {
            trace_path: trace_path.into(),
            output_base: PathBuf::from("lifted"),
            ..Self::default()
        }
    }
}

/// Load the captured module and every sidecar next to it.
pub fn load_inputs(trace_path: &Path) -> Result<(Module, TraceInfo)> {
    let data = std::fs::read(trace_path)?;
    let mut module = relift_ir::read_module(&data)?;
    let dir = trace_path.parent().unwrap_or_else(|| Path::new("."));

    let mut trace = TraceInfo::load(&dir.join(TRACE_INFO_FILE))?;
    apply_symbols(&mut module, dir)?;
    apply_data_imports(&mut module, dir)?;
    apply_function_pairs(&mut trace, dir)?;
    apply_main_addr_whitelist(&mut trace, dir)?;

    debug!(
        units = module.unit_count(),
        edges = trace.successors.len(),
        entries = trace.function_log.entries.len(),
        "inputs loaded"
    );
    Ok((module, trace))
}

/// Run the selected stages and write outputs.
pub fn run(opts: &LiftOptions) -> Result<()> {
    let (mut module, trace) = load_inputs(&opts.trace_path)?;

    // Default to lifting when no engine-owned stage was selected.
    let lift = opts.lift || !(opts.clean || delegated_stage_selected(opts));

    for stage in delegated_stages(opts) {
        info!(stage, "stage delegated to the downstream native toolchain");
    }

    let mut callback_entries = Vec::new();
    if lift {
        let config = PipelineConfig {
            no_link_lift: opts.no_link_lift,
            trace_calls: opts.trace_calls,
            clean_names: opts.clean_names,
        };
        let stats = run_lift(&mut module, &trace, &config)?;
        callback_entries = stats.callback_entries;
    } else if opts.clean {
        run_clean(&mut module, opts.clean_names)?;
    }

    write_outputs(&module, &opts.output_base, &callback_entries)?;
    Ok(())
}

/// Serialize the module (binary and text), the memory-dependence dump,
/// and the `rfuncs` sidecar.
pub fn write_outputs(
    module: &Module,
    output_base: &Path,
    callback_entries: &[u64],
) -> Result<()> {
    let binary_path = output_base.with_extension("rlm");
    std::fs::write(&binary_path, relift_ir::write_module(module))?;

    let text_path = output_base.with_extension("rlm.txt");
    std::fs::write(&text_path, relift_ir::dump_module(module))?;

    let memdep_path = output_base.with_extension("memdeps");
    std::fs::write(&memdep_path, dump_memory_dependences(module))?;

    let rfuncs_path = output_base
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("rfuncs");
    write_rfuncs(&rfuncs_path, callback_entries)?;

    info!(
        binary = %binary_path.display(),
        text = %text_path.display(),
        callbacks = callback_entries.len(),
        "outputs written"
    );
    Ok(())
}

fn delegated_stage_selected(opts: &LiftOptions) -> bool {
    opts.link_prep_1 || opts.link_prep_2 || opts.optimize || opts.optimize_better || opts.compile
}

fn delegated_stages(opts: &LiftOptions) -> Vec<&'static str> {
    let mut stages = Vec::new();
    if opts.link_prep_1 {
        stages.push("link-prep-1");
    }
    if opts.link_prep_2 {
        stages.push("link-prep-2");
    }
    if opts.optimize {
        stages.push("optimize");
    }
    if opts.optimize_better {
        stages.push("optimize-better");
    }
    if opts.compile {
        stages.push("compile");
    }
    stages
}

/// Tag units named in the `symbols` sidecar as extern stubs.
fn apply_symbols(module: &mut Module, dir: &Path) -> Result<()> {
    let symbols = load_sidecar(&dir.join("symbols"), parse_symbols)?;
    for sym in symbols {
        match module.unit_by_addr(sym.addr) {
            Some(id) => {
                if let Some(unit) = module.unit_mut(id) {
                    unit.extern_symbol = Some(sym.name);
                    unit.role = UnitRole::ExternStub;
                }
            }
            None => debug!(
                addr = format_args!("{:#x}", sym.addr),
                name = sym.name,
                "symbol without captured unit"
            ),
        }
    }
    Ok(())
}

fn apply_data_imports(module: &mut Module, dir: &Path) -> Result<()> {
    let imports = load_sidecar(&dir.join("data_imports"), parse_data_imports)?;
    for imp in imports {
        module.data_imports.push(relift_ir::DataImport {
            addr: imp.addr,
            size: imp.size,
            symbol: imp.symbol,
        });
    }
    Ok(())
}

/// Merge pre-identified functions into the trace's function log.
fn apply_function_pairs(trace: &mut TraceInfo, dir: &Path) -> Result<()> {
    let pairs = load_sidecar(&dir.join("binary.functions"), parse_function_pairs)?;
    for pair in pairs {
        let log = &mut trace.function_log;
        if !log.entries.contains(&pair.target) {
            log.entries.push(pair.target);
        }
        log.entry_to_return
            .entry(pair.target)
            .or_default()
            .insert(pair.ret);
    }
    Ok(())
}

/// Restrict recovery entries to the `main-addrs` whitelist, when present.
/// An address counts as an allowed entry if it carries the `e` flag or no
/// flags at all.
fn apply_main_addr_whitelist(trace: &mut TraceInfo, dir: &Path) -> Result<()> {
    let addrs = load_sidecar(&dir.join("main-addrs"), parse_main_addrs)?;
    if addrs.is_empty() {
        return Ok(());
    }
    let allowed: Vec<u64> = addrs
        .iter()
        .filter(|a| a.entry || (!a.entry && !a.exit))
        .map(|a| a.addr)
        .collect();
    let before = trace.function_log.entries.len();
    trace.function_log.entries.retain(|e| allowed.contains(e));
    let dropped = before - trace.function_log.entries.len();
    if dropped > 0 {
        warn!(dropped, "entries outside the main-addrs whitelist");
    }
    Ok(())
}
