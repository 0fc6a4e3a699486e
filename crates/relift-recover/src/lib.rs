//! Control-flow and function recovery for the relift trace recompiler.
//!
//! The capture front end produces a flat bag of translation units plus a
//! side-channel trace. The passes in this crate turn that into structured
//! functions: successor projection, overlap resolution, function recovery,
//! successor pruning, control-flow fix-up, call insertion, register-flow
//! (calling-convention) recovery, and callback trampolines. `pipeline`
//! runs them in dependency order over one exclusively-owned module.

mod calls;
mod fixup;
mod functions;
mod memdep;
mod overlap;
mod pipeline;
mod prune;
mod regflow;
mod successors;
mod trampoline;

pub use calls::*;
pub use fixup::*;
pub use functions::*;
pub use memdep::*;
pub use overlap::*;
pub use pipeline::*;
pub use prune::*;
pub use regflow::*;
pub use successors::*;
pub use trampoline::*;

use thiserror::Error;

/// Lifting errors. Each message names the originating pass and the
/// violated condition.
#[derive(Error, Debug)]
pub enum LiftError {
    #[error(
        "overlap resolver: unit {unit:#x} has no instruction at split address {addr:#x}"
    )]
    SplitPointMissing { unit: u64, addr: u64 },
    #[error(
        "successor pruning: stored pc {stored_pc:#x} is absent from the successor list of \
         block {block:#x}; the capture looks non-deterministic (multi-threaded tracing?)"
    )]
    NondeterministicCapture { block: u64, stored_pc: u64 },
    #[error("function recovery: program entry discovery failed: {0}")]
    EntryDiscovery(String),
    #[error("function recovery: no recovered function at entry {addr:#x}")]
    UnknownCallee { addr: u64 },
    #[error("call insertion: no follow-up block for call site {block:#x}")]
    MissingFollowUp { block: u64 },
    #[error("register-flow recovery: {0}")]
    RegFlow(String),
    #[error(transparent)]
    Ir(#[from] relift_ir::IrError),
    #[error(transparent)]
    Trace(#[from] relift_trace::TraceError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LiftError>;
