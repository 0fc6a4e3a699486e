//! Textual module form.
//!
//! One-way, human-readable dump of the whole program. The compact binary
//! form in `codec` is the machine-readable interchange format.

use std::fmt::Write;

use crate::expr::{BinOp, Expr};
use crate::function::{Block, Function};
use crate::inst::{Inst, InstKind, Place};
use crate::module::Module;
use crate::terminator::{Target, Terminator};
use crate::unit::UnitRole;

/// Render the whole module.
pub fn dump_module(module: &Module) -> String {
    let mut out = String::new();

    for id in module.unit_ids() {
        let unit = module.unit(id).expect("live unit");
        let _ = writeln!(
            out,
            "unit unit_{:x} {{  ; last_pc={:#x}{}{}",
            unit.start,
            unit.last_pc,
            role_suffix(unit.role),
            unit.extern_symbol
                .as_deref()
                .map(|s| format!(" extern={s}"))
                .unwrap_or_default(),
        );
        for inst in &unit.body {
            let _ = writeln!(out, "  {}", render_inst(module, inst));
        }
        let _ = writeln!(out, "  {}", render_term(module, &unit.term));
        let succs: Vec<String> = unit
            .succs
            .iter()
            .map(|s| match s {
                Some(target) => render_target(module, *target),
                None => "_".to_string(),
            })
            .collect();
        if !succs.is_empty() {
            let _ = writeln!(out, "  succs [{}]", succs.join(", "));
        }
        let _ = writeln!(out, "}}");
    }

    for id in module.function_ids() {
        let function = module.function(id).expect("live function");
        dump_function(module, function, &mut out);
    }

    out
}

fn dump_function(module: &Module, function: &Function, out: &mut String) {
    let name = if function.is_wrapper {
        "wrapper".to_string()
    } else {
        format!("fn_{:x}", function.entry)
    };
    let _ = write!(out, "function {name}(");
    if let Some(sig) = &function.signature {
        let args: Vec<&str> = sig
            .args
            .iter()
            .map(|r| module.registers.name(*r))
            .collect();
        let _ = write!(out, "{}", args.join(", "));
        let _ = write!(out, ") -> (");
        let rets: Vec<&str> = sig
            .rets
            .iter()
            .map(|r| module.registers.name(*r))
            .collect();
        let _ = write!(out, "{}", rets.join(", "));
    }
    let _ = writeln!(out, ") {{");

    for (i, local) in function.locals.iter().enumerate() {
        let _ = writeln!(out, "  local %{i} = {}", local.name);
    }

    for (i, block) in function.blocks.iter().enumerate() {
        let label = if i == 0 {
            "entry".to_string()
        } else {
            block_label(block)
        };
        let _ = writeln!(out, " {label}:  ; {:#x}{}", block.start, role_suffix(block.role));
        for inst in &block.body {
            let _ = writeln!(out, "  {}", render_inst(module, inst));
        }
        let _ = writeln!(out, "  {}", render_term(module, &block.term));
    }

    let _ = writeln!(out, "}}");
}

fn block_label(block: &Block) -> String {
    if block.synthetic {
        format!("synth_{:x}", block.start)
    } else {
        format!("bb_{:x}", block.start)
    }
}

fn role_suffix(role: UnitRole) -> &'static str {
    match role {
        UnitRole::Ordinary => "",
        UnitRole::ExternStub => " [extern-stub]",
        UnitRole::Merged => " [merged]",
        UnitRole::Callback => " [callback]",
    }
}

fn render_inst(module: &Module, inst: &Inst) -> String {
    match &inst.kind {
        InstKind::Write { dst, value } => format!(
            "{:#x}: {} = {}",
            inst.pc,
            render_place(module, *dst),
            render_expr(module, value)
        ),
        InstKind::Store { addr, value, width } => format!(
            "{:#x}: store.{} [{}] = {}",
            inst.pc,
            width,
            render_expr(module, addr),
            render_expr(module, value)
        ),
        InstKind::Call { callee, args, rets } => {
            let args: Vec<String> = args.iter().map(|a| format!("%{}", a.0)).collect();
            let rets: Vec<String> = rets.iter().map(|r| format!("%{}", r.0)).collect();
            let callee = module
                .function(*callee)
                .map_or_else(|| format!("fn#{}", callee.0), |f| format!("fn_{:x}", f.entry));
            format!(
                "{:#x}: ({}) = call {callee}({})",
                inst.pc,
                rets.join(", "),
                args.join(", ")
            )
        }
        InstKind::Helper { name, args } => {
            let args: Vec<String> = args.iter().map(|a| render_expr(module, a)).collect();
            format!("{:#x}: helper {name}({})", inst.pc, args.join(", "))
        }
    }
}

fn render_place(module: &Module, place: Place) -> String {
    match place {
        Place::Reg(id) => format!("${}", module.registers.name(id)),
        Place::Local(id) => format!("%{}", id.0),
    }
}

fn render_expr(module: &Module, expr: &Expr) -> String {
    match expr {
        Expr::Const(v) => format!("{v:#x}"),
        Expr::Reg(id) => format!("${}", module.registers.name(*id)),
        Expr::Local(id) => format!("%{}", id.0),
        Expr::Load { addr, width } => {
            format!("load.{} [{}]", width, render_expr(module, addr))
        }
        Expr::Binary { op, lhs, rhs } => format!(
            "({} {} {})",
            render_expr(module, lhs),
            binop_str(*op),
            render_expr(module, rhs)
        ),
    }
}

const fn binop_str(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::And => "&",
        BinOp::Or => "|",
        BinOp::Xor => "^",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
    }
}

fn render_target(module: &Module, target: Target) -> String {
    match target {
        Target::Unit(id) => module
            .unit(id)
            .map_or_else(|| format!("unit#{}", id.0), |u| format!("unit_{:x}", u.start)),
        Target::Block(id) => format!("block#{}", id.0),
        Target::Func(id) => module
            .function(id)
            .map_or_else(|| format!("fn#{}", id.0), |f| format!("fn_{:x}", f.entry)),
    }
}

fn render_term(module: &Module, term: &Terminator) -> String {
    match term {
        Terminator::Return => "ret".to_string(),
        Terminator::Jump { target } => format!("jmp {}", render_target(module, *target)),
        Terminator::Branch { cond, taken, fall } => format!(
            "br {} ? {} : {}",
            render_expr(module, cond),
            render_target(module, *taken),
            render_target(module, *fall)
        ),
        Terminator::Dispatch {
            selector,
            cases,
            default,
        } => {
            let mut s = format!("dispatch {} [", render_expr(module, selector));
            for (i, case) in cases.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                let _ = write!(s, "{:#x} => {}", case.addr, render_target(module, case.target));
            }
            let _ = write!(s, "] default {}", render_target(module, *default));
            s
        }
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regfile::RegisterFile;
    use crate::unit::TranslationUnit;

    #[test]
    fn test_dump_contains_units_and_functions() {
        let regs = RegisterFile::i386();
        let pc = regs.pc();
        let mut m = Module::new(regs);
        let mut u = TranslationUnit::new(0x1000);
        u.body.push(Inst::write_reg(0x1000, pc, Expr::imm(0x2000)));
        m.add_unit(u).unwrap();
        m.add_function(Function::new(0x4000));

        let text = dump_module(&m);
        assert!(text.contains("unit unit_1000"));
        assert!(text.contains("$pc = 0x2000"));
        assert!(text.contains("function fn_4000"));
    }
}
