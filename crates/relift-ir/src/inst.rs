//! Instruction IR.

use crate::expr::{Expr, LocalId};
use crate::module::FuncId;
use crate::regfile::RegId;

/// Write destination: a register global or a function-local slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Place {
    Reg(RegId),
    Local(LocalId),
}

/// One lifted instruction, tagged with the address it was decoded from.
///
/// Synthetic instructions (inserted calls, trampoline glue) carry the
/// address of the site they were synthesized for.
#[derive(Clone, Debug)]
pub struct Inst {
    pub pc: u64,
    pub kind: InstKind,
}

/// Instruction kinds.
#[derive(Clone, Debug)]
pub enum InstKind {
    /// Write to a register global or local slot.
    Write { dst: Place, value: Expr },
    /// Memory store.
    Store {
        addr: Expr,
        value: Expr,
        width: u8,
    },
    /// Explicit call to a recovered function.
    ///
    /// `args`/`rets` are empty until register-flow recovery routes the
    /// callee's signature through the caller's local slots.
    Call {
        callee: FuncId,
        args: Vec<LocalId>,
        rets: Vec<LocalId>,
    },
    /// Runtime helper invocation (exception raising, call tracing).
    Helper { name: String, args: Vec<Expr> },
}

impl Inst {
    pub const fn write(pc: u64, dst: Place, value: Expr) -> Self {
        Self {
            pc,
            kind: InstKind::Write { dst, value },
        }
    }

    pub const fn write_reg(pc: u64, reg: RegId, value: Expr) -> Self {
        Self::write(pc, Place::Reg(reg), value)
    }

    pub const fn store(pc: u64, addr: Expr, value: Expr, width: u8) -> Self {
        Self {
            pc,
            kind: InstKind::Store { addr, value, width },
        }
    }

    pub const fn call(pc: u64, callee: FuncId) -> Self {
        Self {
            pc,
            kind: InstKind::Call {
                callee,
                args: Vec::new(),
                rets: Vec::new(),
            },
        }
    }

    pub fn helper(pc: u64, name: &str, args: Vec<Expr>) -> Self {
        Self {
            pc,
            kind: InstKind::Helper {
                name: name.to_string(),
                args,
            },
        }
    }

    /// Register written by this instruction, if any.
    pub fn written_reg(&self) -> Option<RegId> {
        match &self.kind {
            InstKind::Write {
                dst: Place::Reg(id),
                ..
            } => Some(*id),
            _ => None,
        }
    }

    /// Constant stored to `reg`, if this instruction is such a write.
    pub fn const_store_to(&self, reg: RegId) -> Option<u64> {
        match &self.kind {
            InstKind::Write {
                dst: Place::Reg(id),
                value: Expr::Const(v),
            } if id.0 == reg.0 => Some(*v),
            _ => None,
        }
    }

    /// Visit every register read by this instruction.
    pub fn for_each_read_reg(&self, f: &mut impl FnMut(RegId)) {
        match &self.kind {
            InstKind::Write { value, .. } => value.for_each_reg(f),
            InstKind::Store { addr, value, .. } => {
                addr.for_each_reg(f);
                value.for_each_reg(f);
            }
            InstKind::Call { .. } => {}
            InstKind::Helper { args, .. } => {
                for a in args {
                    a.for_each_reg(f);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_store_to() {
        let pc_reg = RegId(11);
        let i = Inst::write_reg(0x1000, pc_reg, Expr::imm(0x2000));
        assert_eq!(i.const_store_to(pc_reg), Some(0x2000));
        assert_eq!(i.const_store_to(RegId(0)), None);

        let j = Inst::write_reg(0x1004, pc_reg, Expr::reg(RegId(0)));
        assert_eq!(j.const_store_to(pc_reg), None);
    }

    #[test]
    fn test_written_reg() {
        let i = Inst::write_reg(0x10, RegId(2), Expr::imm(1));
        assert_eq!(i.written_reg(), Some(RegId(2)));
        let s = Inst::store(0x10, Expr::imm(0x80), Expr::imm(1), 4);
        assert_eq!(s.written_reg(), None);
    }
}
