//! Standalone translation units (captured basic blocks).

use crate::inst::Inst;
use crate::terminator::{Target, Terminator};

/// Role of a translation unit or block.
///
/// Closed set - passes branch on the role, never on name encodings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnitRole {
    /// Plain captured block.
    #[default]
    Ordinary,
    /// Stub for an imported library symbol.
    ExternStub,
    /// Diagnostic tag: produced or reshaped by overlap merging.
    Merged,
    /// Entry block of a function invoked as a callback from library code.
    Callback,
}

/// One decoded basic block, uniquely named by its start address.
#[derive(Clone, Debug)]
pub struct TranslationUnit {
    /// Address of the first decoded instruction.
    pub start: u64,
    /// Address of the final decoded instruction.
    pub last_pc: u64,
    pub body: Vec<Inst>,
    pub term: Terminator,
    /// Ordered successor references. Destructive edits elsewhere may leave
    /// transient holes; pruning strips them. Before function recovery all
    /// entries are unit targets; fix-up may add function-level targets.
    pub succs: Vec<Option<Target>>,
    /// Imported-symbol tag for library stubs.
    pub extern_symbol: Option<String>,
    pub role: UnitRole,
}

impl TranslationUnit {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            last_pc: start,
            body: Vec::new(),
            term: Terminator::Return,
            succs: Vec::new(),
            extern_symbol: None,
            role: UnitRole::Ordinary,
        }
    }

    /// Live successors, holes skipped.
    pub fn successors(&self) -> impl Iterator<Item = Target> + '_ {
        self.succs.iter().filter_map(|s| *s)
    }

    /// Live unit-valued successors, holes and function targets skipped.
    pub fn unit_successors(&self) -> impl Iterator<Item = crate::module::UnitId> + '_ {
        self.successors().filter_map(Target::as_unit)
    }

    /// Whether `target` is already present in the successor list.
    pub fn has_successor(&self, target: Target) -> bool {
        self.succs.contains(&Some(target))
    }

    /// Last constant stored to `reg` in the body, scanning from the end.
    pub fn last_const_store(&self, reg: crate::regfile::RegId) -> Option<u64> {
        self.body.iter().rev().find_map(|i| i.const_store_to(reg))
    }
}
