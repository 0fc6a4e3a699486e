//! Memory-dependence diagnostic.
//!
//! A deliberately shallow may-alias scan over the final module: for each
//! recovered function, report store/load pairs that touch the same
//! constant address or share the same base slot. Downstream optimization
//! reads the dump to sanity-check its own, stronger analysis.

use std::fmt::Write as _;

use relift_ir::{Expr, InstKind, Module};

/// One reported dependence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemDependence {
    pub function: u64,
    pub store_pc: u64,
    pub load_pc: u64,
    pub via: AliasKind,
}

/// Why the pair may alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliasKind {
    /// Both access the same constant address.
    SameConst(u64),
    /// Both address expressions are rooted at the same local slot.
    SameBase(u16),
}

/// Scan every function for ordered store/load pairs that may alias.
pub fn analyze_memory_dependences(module: &Module) -> Vec<MemDependence> {
    let mut out = Vec::new();

    for fid in module.function_ids() {
        let Some(function) = module.function(fid) else {
            continue;
        };
        // (pc, base) per store, in program order per block.
        for block in &function.blocks {
            let mut stores: Vec<(u64, AddrRoot)> = Vec::new();
            for inst in &block.body {
                match &inst.kind {
                    InstKind::Store { addr, .. } => {
                        stores.push((inst.pc, addr_root(addr)));
                    }
                    InstKind::Write { value, .. } => {
                        report_loads(value, inst.pc, &stores, function.entry, &mut out);
                    }
                    InstKind::Helper { args, .. } => {
                        for arg in args {
                            report_loads(arg, inst.pc, &stores, function.entry, &mut out);
                        }
                    }
                    InstKind::Call { .. } => {}
                }
            }
        }
    }

    out
}

/// Render the dependences as the diagnostic dump.
pub fn dump_memory_dependences(module: &Module) -> String {
    let mut text = String::new();
    for dep in analyze_memory_dependences(module) {
        let via = match dep.via {
            AliasKind::SameConst(addr) => format!("const {addr:#x}"),
            AliasKind::SameBase(local) => format!("base %{local}"),
        };
        let _ = writeln!(
            text,
            "fn_{:x}: store {:#x} may reach load {:#x} ({via})",
            dep.function, dep.store_pc, dep.load_pc
        );
    }
    text
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AddrRoot {
    Const(u64),
    Local(u16),
    Unknown,
}

fn addr_root(expr: &Expr) -> AddrRoot {
    match expr {
        Expr::Const(v) => AddrRoot::Const(*v),
        Expr::Local(id) => AddrRoot::Local(id.0),
        Expr::Binary { lhs, .. } => addr_root(lhs),
        _ => AddrRoot::Unknown,
    }
}

fn report_loads(
    expr: &Expr,
    pc: u64,
    stores: &[(u64, AddrRoot)],
    function: u64,
    out: &mut Vec<MemDependence>,
) {
    match expr {
        Expr::Load { addr, .. } => {
            let root = addr_root(addr);
            for &(store_pc, store_root) in stores {
                let via = match (store_root, root) {
                    (AddrRoot::Const(a), AddrRoot::Const(b)) if a == b => {
                        Some(AliasKind::SameConst(a))
                    }
                    (AddrRoot::Local(a), AddrRoot::Local(b)) if a == b => {
                        Some(AliasKind::SameBase(a))
                    }
                    _ => None,
                };
                if let Some(via) = via {
                    out.push(MemDependence {
                        function,
                        store_pc,
                        load_pc: pc,
                        via,
                    });
                }
            }
            report_loads(addr, pc, stores, function, out);
        }
        Expr::Binary { lhs, rhs, .. } => {
            report_loads(lhs, pc, stores, function, out);
            report_loads(rhs, pc, stores, function, out);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relift_ir::{Block, Function, Inst, Place, RegisterFile, LocalId};

    #[test]
    fn test_const_store_load_pair() {
        let mut m = Module::new(RegisterFile::i386());
        let mut f = Function::new(0x1000);
        let slot = f.add_local("eax".to_string(), None);
        let mut b = Block::new(0x1000);
        b.body
            .push(Inst::store(0x1000, Expr::imm(0x8000), Expr::imm(7), 4));
        b.body.push(Inst::write(
            0x1004,
            Place::Local(slot),
            Expr::load(Expr::imm(0x8000), 4),
        ));
        f.push_block(b);
        m.add_function(f);

        let deps = analyze_memory_dependences(&m);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].store_pc, 0x1000);
        assert_eq!(deps[0].load_pc, 0x1004);
        assert_eq!(deps[0].via, AliasKind::SameConst(0x8000));

        let text = dump_memory_dependences(&m);
        assert!(text.contains("fn_1000"));
        assert!(text.contains("const 0x8000"));
    }

    #[test]
    fn test_same_base_pair_and_misses() {
        let mut m = Module::new(RegisterFile::i386());
        let mut f = Function::new(0x2000);
        let esp = f.add_local("esp".to_string(), None);
        let other = f.add_local("ebx".to_string(), None);
        let mut b = Block::new(0x2000);
        b.body.push(Inst::store(
            0x2000,
            Expr::binary(
                relift_ir::BinOp::Add,
                Expr::local(esp),
                Expr::imm(4),
            ),
            Expr::imm(1),
            4,
        ));
        // Same base: reported. Different base: not reported.
        b.body.push(Inst::write(
            0x2004,
            Place::Local(LocalId(0)),
            Expr::load(Expr::local(esp), 4),
        ));
        b.body.push(Inst::write(
            0x2008,
            Place::Local(LocalId(1)),
            Expr::load(Expr::local(other), 4),
        ));
        f.push_block(b);
        m.add_function(f);

        let deps = analyze_memory_dependences(&m);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].via, AliasKind::SameBase(esp.0));
    }
}
