//! Recovered functions and their blocks.

use crate::expr::LocalId;
use crate::inst::Inst;
use crate::module::BlockId;
use crate::regfile::{RegId, RegSet};
use crate::terminator::{Target, Terminator};
use crate::unit::UnitRole;

/// A block inside a recovered function.
///
/// Cloned from a translation unit by function recovery, or synthesized by a
/// later pass (dispatch thunks, trampolines). Synthesized blocks carry the
/// address of the site they were created for and `synthetic = true`.
#[derive(Clone, Debug)]
pub struct Block {
    pub start: u64,
    pub last_pc: u64,
    pub body: Vec<Inst>,
    pub term: Terminator,
    /// Ordered successor references; holes are transient.
    pub succs: Vec<Option<Target>>,
    pub extern_symbol: Option<String>,
    pub role: UnitRole,
    pub synthetic: bool,
}

impl Block {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            last_pc: start,
            body: Vec::new(),
            term: Terminator::Return,
            succs: Vec::new(),
            extern_symbol: None,
            role: UnitRole::Ordinary,
            synthetic: false,
        }
    }

    pub fn synthetic(start: u64) -> Self {
        Self {
            synthetic: true,
            ..Self::new(start)
        }
    }

    /// Live successors, holes skipped.
    pub fn successors(&self) -> impl Iterator<Item = Target> + '_ {
        self.succs.iter().filter_map(|s| *s)
    }

    pub fn has_successor(&self, target: Target) -> bool {
        self.succs.contains(&Some(target))
    }

    /// Last constant stored to `reg` in the body, scanning from the end.
    pub fn last_const_store(&self, reg: RegId) -> Option<u64> {
        self.body.iter().rev().find_map(|i| i.const_store_to(reg))
    }
}

/// A function-local slot created by register-flow specialization.
#[derive(Clone, Debug)]
pub struct Local {
    pub name: String,
    /// Register this slot shadows, if it was created for one.
    pub reg: Option<RegId>,
}

/// Register-flow signature of a recovered function.
///
/// `input` and `output` are always subsets of `used`; the ordered argument
/// and return-value lists are derived from them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    pub used: RegSet,
    pub input: RegSet,
    pub output: RegSet,
    pub args: Vec<RegId>,
    pub rets: Vec<RegId>,
}

/// The unit produced by merging every translation unit attributed to one
/// entry address. Exactly one entry block, at index zero.
#[derive(Clone, Debug)]
pub struct Function {
    /// Entry address; also the function's canonical name.
    pub entry: u64,
    pub blocks: Vec<Block>,
    pub locals: Vec<Local>,
    pub signature: Option<Signature>,
    /// The wrapper mirrors register globals into locals at entry and back
    /// at exit; register-flow specialization exempts it.
    pub is_wrapper: bool,
}

/// Index of the entry block within a function.
pub const ENTRY_BLOCK: BlockId = BlockId(0);

impl Function {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            blocks: Vec::new(),
            locals: Vec::new(),
            signature: None,
            is_wrapper: false,
        }
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Append a block, returning its id.
    pub fn push_block(&mut self, block: Block) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        id
    }

    /// Block ids in index order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Find a non-synthetic block by its start address.
    pub fn block_by_addr(&self, addr: u64) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| !b.synthetic && b.start == addr)
            .map(|i| BlockId(i as u32))
    }

    /// Add a local slot, returning its id.
    pub fn add_local(&mut self, name: String, reg: Option<RegId>) -> LocalId {
        let id = LocalId(self.locals.len() as u16);
        self.locals.push(Local { name, reg });
        id
    }

    /// Local slot shadowing `reg`, if one exists.
    pub fn local_for_reg(&self, reg: RegId) -> Option<LocalId> {
        self.locals
            .iter()
            .position(|l| l.reg == Some(reg))
            .map(|i| LocalId(i as u16))
    }

    /// Reverse-post-order over reachable blocks, following intra-function
    /// edges only. Deterministic: successor lists are visited in order.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let n = self.blocks.len();
        let mut visited = vec![false; n];
        let mut post = Vec::with_capacity(n);
        // Explicit stack: (block, next successor index to visit).
        let mut stack: Vec<(usize, usize)> = Vec::new();

        if n == 0 {
            return post;
        }
        visited[0] = true;
        stack.push((0, 0));

        while let Some(frame) = stack.last_mut() {
            let (block, next) = *frame;
            let succs: Vec<usize> = self.blocks[block]
                .successors()
                .chain(self.blocks[block].term.targets())
                .filter_map(|t| t.as_block())
                .map(BlockId::index)
                .collect();
            if next < succs.len() {
                frame.1 += 1;
                let s = succs[next];
                if s < n && !visited[s] {
                    visited[s] = true;
                    stack.push((s, 0));
                }
            } else {
                post.push(BlockId(block as u32));
                stack.pop();
            }
        }

        post.reverse();
        post
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_lookup() {
        let mut f = Function::new(0x1000);
        let entry = f.push_block(Block::new(0x1000));
        let b1 = f.push_block(Block::new(0x1010));
        assert_eq!(entry, ENTRY_BLOCK);
        assert_eq!(f.block_by_addr(0x1010), Some(b1));
        assert_eq!(f.block_by_addr(0x9999), None);
    }

    #[test]
    fn test_locals() {
        let mut f = Function::new(0x1000);
        let id = f.add_local("esp".to_string(), Some(RegId(0)));
        assert_eq!(f.local_for_reg(RegId(0)), Some(id));
        assert_eq!(f.local_for_reg(RegId(1)), None);
    }

    #[test]
    fn test_reverse_post_order() {
        // entry -> b1 -> b2, entry -> b2
        let mut f = Function::new(0x1000);
        let entry = f.push_block(Block::new(0x1000));
        let b1 = f.push_block(Block::new(0x1010));
        let b2 = f.push_block(Block::new(0x1020));
        f.block_mut(entry).succs = vec![Some(Target::Block(b1)), Some(Target::Block(b2))];
        f.block_mut(b1).succs = vec![Some(Target::Block(b2))];

        let rpo = f.reverse_post_order();
        assert_eq!(rpo[0], entry);
        assert_eq!(rpo.len(), 3);
        let pos = |id: BlockId| rpo.iter().position(|&b| b == id).unwrap();
        assert!(pos(b1) < pos(b2));
    }
}
