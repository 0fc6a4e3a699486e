//! Block terminator IR.

use crate::expr::Expr;
use crate::module::{BlockId, FuncId, UnitId};

/// Control-flow target of a terminator or successor-list entry.
///
/// Before function recovery, edges reference standalone translation units.
/// After recovery, intra-function edges reference blocks of the enclosing
/// function and cross-function edges reference the callee function itself
/// (individual blocks of another function are no longer addressable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Unit(UnitId),
    Block(BlockId),
    Func(FuncId),
}

impl Target {
    pub const fn as_unit(self) -> Option<UnitId> {
        match self {
            Self::Unit(id) => Some(id),
            _ => None,
        }
    }

    pub const fn as_block(self) -> Option<BlockId> {
        match self {
            Self::Block(id) => Some(id),
            _ => None,
        }
    }

    pub const fn as_func(self) -> Option<FuncId> {
        match self {
            Self::Func(id) => Some(id),
            _ => None,
        }
    }
}

/// One case of a dispatch terminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchCase {
    /// Program-counter value selecting this case.
    pub addr: u64,
    pub target: Target,
}

/// Block terminator - controls where execution goes next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    /// Return to the caller (or, before call insertion, to the dynamic
    /// dispatcher that consumes the stored program counter).
    Return,
    /// Unconditional jump.
    Jump { target: Target },
    /// Conditional branch.
    Branch {
        cond: Expr,
        taken: Target,
        fall: Target,
    },
    /// Select a successor by the runtime program-counter value, one case
    /// per known target plus an error default.
    Dispatch {
        selector: Expr,
        cases: Vec<DispatchCase>,
        default: Target,
    },
    /// Control never reaches past this block.
    Unreachable,
}

impl Terminator {
    pub const fn jump(target: Target) -> Self {
        Self::Jump { target }
    }

    pub fn branch(cond: Expr, taken: Target, fall: Target) -> Self {
        Self::Branch { cond, taken, fall }
    }

    pub fn dispatch(selector: Expr, default: Target) -> Self {
        Self::Dispatch {
            selector,
            cases: Vec::new(),
            default,
        }
    }

    pub const fn is_return(&self) -> bool {
        matches!(self, Self::Return)
    }

    pub const fn is_jump(&self) -> bool {
        matches!(self, Self::Jump { .. })
    }

    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch { .. })
    }

    /// All explicit targets of this terminator.
    pub fn targets(&self) -> Vec<Target> {
        match self {
            Self::Return | Self::Unreachable => Vec::new(),
            Self::Jump { target } => vec![*target],
            Self::Branch { taken, fall, .. } => vec![*taken, *fall],
            Self::Dispatch { cases, default, .. } => {
                let mut out: Vec<Target> = cases.iter().map(|c| c.target).collect();
                out.push(*default);
                out
            }
        }
    }

    /// Rewrite every target in place.
    pub fn map_targets(&mut self, mut f: impl FnMut(Target) -> Target) {
        match self {
            Self::Return | Self::Unreachable => {}
            Self::Jump { target } => *target = f(*target),
            Self::Branch { taken, fall, .. } => {
                *taken = f(*taken);
                *fall = f(*fall);
            }
            Self::Dispatch { cases, default, .. } => {
                for case in cases.iter_mut() {
                    case.target = f(case.target);
                }
                *default = f(*default);
            }
        }
    }

    /// Add a dispatch case, keeping the case list deduplicated by address.
    ///
    /// Returns false if a case for `addr` already exists.
    pub fn add_dispatch_case(&mut self, addr: u64, target: Target) -> bool {
        match self {
            Self::Dispatch { cases, .. } => {
                if cases.iter().any(|c| c.addr == addr) {
                    return false;
                }
                cases.push(DispatchCase { addr, target });
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets() {
        let t = Terminator::branch(
            Expr::imm(1),
            Target::Block(BlockId(1)),
            Target::Block(BlockId(2)),
        );
        assert_eq!(
            t.targets(),
            vec![Target::Block(BlockId(1)), Target::Block(BlockId(2))]
        );
        assert!(Terminator::Return.targets().is_empty());
    }

    #[test]
    fn test_dispatch_case_dedup() {
        let mut t = Terminator::dispatch(Expr::imm(0), Target::Block(BlockId(0)));
        assert!(t.add_dispatch_case(0x1000, Target::Block(BlockId(1))));
        assert!(!t.add_dispatch_case(0x1000, Target::Block(BlockId(2))));
        match t {
            Terminator::Dispatch { ref cases, .. } => assert_eq!(cases.len(), 1),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_map_targets() {
        let mut t = Terminator::jump(Target::Unit(UnitId(3)));
        t.map_targets(|_| Target::Func(FuncId(0)));
        assert_eq!(t.targets(), vec![Target::Func(FuncId(0))]);
    }
}
