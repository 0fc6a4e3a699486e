//! Compact binary module form.
//!
//! Little-endian, versioned. The register file is written as a name table
//! and validated against the builtin layout on read, so a module captured
//! by a front end with a different register file fails loudly instead of
//! silently remapping state.

use rustc_hash::FxHashMap;

use crate::expr::{BinOp, Expr, LocalId};
use crate::function::{Block, Function, Local, Signature};
use crate::inst::{Inst, InstKind, Place};
use crate::module::{BlockId, DataImport, FuncId, Module, UnitId};
use crate::regfile::{RegId, RegSet, RegisterFile};
use crate::terminator::{DispatchCase, Target, Terminator};
use crate::unit::{TranslationUnit, UnitRole};
use crate::{IrError, Result};

const MAGIC: &[u8; 4] = b"RLFT";
const VERSION: u32 = 1;

// ===== Writing =====

/// Serialize a module to the compact binary form.
pub fn write_module(module: &Module) -> Vec<u8> {
    let mut w = Writer::default();
    w.bytes(MAGIC);
    w.u32(VERSION);

    w.u16(module.registers.len() as u16);
    for (_, decl) in module.registers.iter() {
        w.str(&decl.name);
    }

    w.u32(module.data_imports.len() as u32);
    for imp in &module.data_imports {
        w.u64(imp.addr);
        w.u64(imp.size);
        w.str(&imp.symbol);
    }

    w.u32(module.units.len() as u32);
    for slot in &module.units {
        match slot {
            Some(unit) => {
                w.u8(1);
                write_unit(&mut w, unit);
            }
            None => w.u8(0),
        }
    }

    w.u32(module.functions.len() as u32);
    for slot in &module.functions {
        match slot {
            Some(function) => {
                w.u8(1);
                write_function(&mut w, function);
            }
            None => w.u8(0),
        }
    }

    w.out
}

fn write_unit(w: &mut Writer, unit: &TranslationUnit) {
    w.u64(unit.start);
    w.u64(unit.last_pc);
    w.u8(role_tag(unit.role));
    w.opt_str(unit.extern_symbol.as_deref());
    w.u32(unit.body.len() as u32);
    for inst in &unit.body {
        write_inst(w, inst);
    }
    write_term(w, &unit.term);
    w.u32(unit.succs.len() as u32);
    for succ in &unit.succs {
        match succ {
            Some(target) => {
                w.u8(1);
                write_target(w, *target);
            }
            None => w.u8(0),
        }
    }
}

fn write_function(w: &mut Writer, function: &Function) {
    w.u64(function.entry);
    w.u8(u8::from(function.is_wrapper));
    w.u32(function.blocks.len() as u32);
    for block in &function.blocks {
        write_block(w, block);
    }
    w.u16(function.locals.len() as u16);
    for local in &function.locals {
        w.str(&local.name);
        match local.reg {
            Some(reg) => {
                w.u8(1);
                w.u16(reg.0);
            }
            None => w.u8(0),
        }
    }
    match &function.signature {
        Some(sig) => {
            w.u8(1);
            w.u32(sig.used.bits());
            w.u32(sig.input.bits());
            w.u32(sig.output.bits());
            w.u8(sig.args.len() as u8);
            for reg in &sig.args {
                w.u16(reg.0);
            }
            w.u8(sig.rets.len() as u8);
            for reg in &sig.rets {
                w.u16(reg.0);
            }
        }
        None => w.u8(0),
    }
}

fn write_block(w: &mut Writer, block: &Block) {
    w.u64(block.start);
    w.u64(block.last_pc);
    w.u8(role_tag(block.role));
    w.u8(u8::from(block.synthetic));
    w.opt_str(block.extern_symbol.as_deref());
    w.u32(block.body.len() as u32);
    for inst in &block.body {
        write_inst(w, inst);
    }
    write_term(w, &block.term);
    w.u32(block.succs.len() as u32);
    for succ in &block.succs {
        match succ {
            Some(target) => {
                w.u8(1);
                write_target(w, *target);
            }
            None => w.u8(0),
        }
    }
}

fn write_inst(w: &mut Writer, inst: &Inst) {
    w.u64(inst.pc);
    match &inst.kind {
        InstKind::Write { dst, value } => {
            w.u8(0);
            write_place(w, *dst);
            write_expr(w, value);
        }
        InstKind::Store { addr, value, width } => {
            w.u8(1);
            write_expr(w, addr);
            write_expr(w, value);
            w.u8(*width);
        }
        InstKind::Call { callee, args, rets } => {
            w.u8(2);
            w.u32(callee.0);
            w.u16(args.len() as u16);
            for a in args {
                w.u16(a.0);
            }
            w.u16(rets.len() as u16);
            for r in rets {
                w.u16(r.0);
            }
        }
        InstKind::Helper { name, args } => {
            w.u8(3);
            w.str(name);
            w.u16(args.len() as u16);
            for a in args {
                write_expr(w, a);
            }
        }
    }
}

fn write_place(w: &mut Writer, place: Place) {
    match place {
        Place::Reg(id) => {
            w.u8(0);
            w.u16(id.0);
        }
        Place::Local(id) => {
            w.u8(1);
            w.u16(id.0);
        }
    }
}

fn write_expr(w: &mut Writer, expr: &Expr) {
    match expr {
        Expr::Const(v) => {
            w.u8(0);
            w.u64(*v);
        }
        Expr::Reg(id) => {
            w.u8(1);
            w.u16(id.0);
        }
        Expr::Local(id) => {
            w.u8(2);
            w.u16(id.0);
        }
        Expr::Load { addr, width } => {
            w.u8(3);
            write_expr(w, addr);
            w.u8(*width);
        }
        Expr::Binary { op, lhs, rhs } => {
            w.u8(4);
            w.u8(binop_tag(*op));
            write_expr(w, lhs);
            write_expr(w, rhs);
        }
    }
}

fn write_term(w: &mut Writer, term: &Terminator) {
    match term {
        Terminator::Return => w.u8(0),
        Terminator::Jump { target } => {
            w.u8(1);
            write_target(w, *target);
        }
        Terminator::Branch { cond, taken, fall } => {
            w.u8(2);
            write_expr(w, cond);
            write_target(w, *taken);
            write_target(w, *fall);
        }
        Terminator::Dispatch {
            selector,
            cases,
            default,
        } => {
            w.u8(3);
            write_expr(w, selector);
            w.u32(cases.len() as u32);
            for case in cases {
                w.u64(case.addr);
                write_target(w, case.target);
            }
            write_target(w, *default);
        }
        Terminator::Unreachable => w.u8(4),
    }
}

fn write_target(w: &mut Writer, target: Target) {
    match target {
        Target::Unit(id) => {
            w.u8(0);
            w.u32(id.0);
        }
        Target::Block(id) => {
            w.u8(1);
            w.u32(id.0);
        }
        Target::Func(id) => {
            w.u8(2);
            w.u32(id.0);
        }
    }
}

const fn role_tag(role: UnitRole) -> u8 {
    match role {
        UnitRole::Ordinary => 0,
        UnitRole::ExternStub => 1,
        UnitRole::Merged => 2,
        UnitRole::Callback => 3,
    }
}

const fn binop_tag(op: BinOp) -> u8 {
    match op {
        BinOp::Add => 0,
        BinOp::Sub => 1,
        BinOp::And => 2,
        BinOp::Or => 3,
        BinOp::Xor => 4,
        BinOp::Shl => 5,
        BinOp::Shr => 6,
        BinOp::Eq => 7,
        BinOp::Ne => 8,
    }
}

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }
    fn str(&mut self, v: &str) {
        self.u16(v.len() as u16);
        self.bytes(v.as_bytes());
    }
    fn opt_str(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.u8(1);
                self.str(s);
            }
            None => self.u8(0),
        }
    }
}

// ===== Reading =====

/// Parse a module from the compact binary form.
pub fn read_module(data: &[u8]) -> Result<Module> {
    let mut r = Reader { data, offset: 0 };

    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(IrError::BadMagic);
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(IrError::UnsupportedVersion(version));
    }

    let registers = RegisterFile::i386();
    let reg_count = r.u16()? as usize;
    if reg_count != registers.len() {
        return Err(IrError::UnknownRegister(format!(
            "register count {reg_count}"
        )));
    }
    for id in 0..reg_count {
        let name = r.str()?;
        if registers.name(RegId(id as u16)) != name {
            return Err(IrError::UnknownRegister(name));
        }
    }

    let mut module = Module::new(registers);

    let import_count = r.u32()? as usize;
    for _ in 0..import_count {
        let addr = r.u64()?;
        let size = r.u64()?;
        let symbol = r.str()?;
        module.data_imports.push(DataImport { addr, size, symbol });
    }

    let unit_slots = r.u32()? as usize;
    let mut units = Vec::with_capacity(unit_slots);
    let mut unit_index = FxHashMap::default();
    for i in 0..unit_slots {
        if r.u8()? == 0 {
            units.push(None);
            continue;
        }
        let unit = read_unit(&mut r)?;
        if unit_index.insert(unit.start, UnitId(i as u32)).is_some() {
            return Err(IrError::DuplicateUnit { addr: unit.start });
        }
        units.push(Some(unit));
    }
    module.units = units;
    module.unit_index = unit_index;

    let func_slots = r.u32()? as usize;
    let mut functions = Vec::with_capacity(func_slots);
    for _ in 0..func_slots {
        if r.u8()? == 0 {
            functions.push(None);
            continue;
        }
        functions.push(Some(read_function(&mut r)?));
    }
    module.functions = functions;

    Ok(module)
}

fn read_unit(r: &mut Reader) -> Result<TranslationUnit> {
    let start = r.u64()?;
    let last_pc = r.u64()?;
    let role = read_role(r)?;
    let extern_symbol = r.opt_str()?;
    let body_len = r.u32()? as usize;
    let mut body = Vec::with_capacity(body_len);
    for _ in 0..body_len {
        body.push(read_inst(r)?);
    }
    let term = read_term(r)?;
    let succ_len = r.u32()? as usize;
    let mut succs = Vec::with_capacity(succ_len);
    for _ in 0..succ_len {
        if r.u8()? == 0 {
            succs.push(None);
        } else {
            succs.push(Some(read_target(r)?));
        }
    }
    Ok(TranslationUnit {
        start,
        last_pc,
        body,
        term,
        succs,
        extern_symbol,
        role,
    })
}

fn read_function(r: &mut Reader) -> Result<Function> {
    let entry = r.u64()?;
    let is_wrapper = r.u8()? != 0;
    let block_len = r.u32()? as usize;
    let mut blocks = Vec::with_capacity(block_len);
    for _ in 0..block_len {
        blocks.push(read_block(r)?);
    }
    let local_len = r.u16()? as usize;
    let mut locals = Vec::with_capacity(local_len);
    for _ in 0..local_len {
        let name = r.str()?;
        let reg = if r.u8()? != 0 {
            Some(RegId(r.u16()?))
        } else {
            None
        };
        locals.push(Local { name, reg });
    }
    let signature = if r.u8()? != 0 {
        let used = RegSet::from_bits(r.u32()?);
        let input = RegSet::from_bits(r.u32()?);
        let output = RegSet::from_bits(r.u32()?);
        let arg_len = r.u8()? as usize;
        let mut args = Vec::with_capacity(arg_len);
        for _ in 0..arg_len {
            args.push(RegId(r.u16()?));
        }
        let ret_len = r.u8()? as usize;
        let mut rets = Vec::with_capacity(ret_len);
        for _ in 0..ret_len {
            rets.push(RegId(r.u16()?));
        }
        Some(Signature {
            used,
            input,
            output,
            args,
            rets,
        })
    } else {
        None
    };
    Ok(Function {
        entry,
        blocks,
        locals,
        signature,
        is_wrapper,
    })
}

fn read_block(r: &mut Reader) -> Result<Block> {
    let start = r.u64()?;
    let last_pc = r.u64()?;
    let role = read_role(r)?;
    let synthetic = r.u8()? != 0;
    let extern_symbol = r.opt_str()?;
    let body_len = r.u32()? as usize;
    let mut body = Vec::with_capacity(body_len);
    for _ in 0..body_len {
        body.push(read_inst(r)?);
    }
    let term = read_term(r)?;
    let succ_len = r.u32()? as usize;
    let mut succs = Vec::with_capacity(succ_len);
    for _ in 0..succ_len {
        if r.u8()? == 0 {
            succs.push(None);
        } else {
            succs.push(Some(read_target(r)?));
        }
    }
    Ok(Block {
        start,
        last_pc,
        body,
        term,
        succs,
        extern_symbol,
        role,
        synthetic,
    })
}

fn read_inst(r: &mut Reader) -> Result<Inst> {
    let pc = r.u64()?;
    let tag = r.u8()?;
    let kind = match tag {
        0 => InstKind::Write {
            dst: read_place(r)?,
            value: read_expr(r)?,
        },
        1 => InstKind::Store {
            addr: read_expr(r)?,
            value: read_expr(r)?,
            width: r.u8()?,
        },
        2 => {
            let callee = FuncId(r.u32()?);
            let arg_len = r.u16()? as usize;
            let mut args = Vec::with_capacity(arg_len);
            for _ in 0..arg_len {
                args.push(LocalId(r.u16()?));
            }
            let ret_len = r.u16()? as usize;
            let mut rets = Vec::with_capacity(ret_len);
            for _ in 0..ret_len {
                rets.push(LocalId(r.u16()?));
            }
            InstKind::Call { callee, args, rets }
        }
        3 => {
            let name = r.str()?;
            let arg_len = r.u16()? as usize;
            let mut args = Vec::with_capacity(arg_len);
            for _ in 0..arg_len {
                args.push(read_expr(r)?);
            }
            InstKind::Helper { name, args }
        }
        _ => {
            return Err(IrError::BadTag {
                what: "instruction",
                tag,
                offset: r.offset,
            });
        }
    };
    Ok(Inst { pc, kind })
}

fn read_place(r: &mut Reader) -> Result<Place> {
    let tag = r.u8()?;
    match tag {
        0 => Ok(Place::Reg(RegId(r.u16()?))),
        1 => Ok(Place::Local(LocalId(r.u16()?))),
        _ => Err(IrError::BadTag {
            what: "place",
            tag,
            offset: r.offset,
        }),
    }
}

fn read_expr(r: &mut Reader) -> Result<Expr> {
    let tag = r.u8()?;
    match tag {
        0 => Ok(Expr::Const(r.u64()?)),
        1 => Ok(Expr::Reg(RegId(r.u16()?))),
        2 => Ok(Expr::Local(LocalId(r.u16()?))),
        3 => {
            let addr = read_expr(r)?;
            let width = r.u8()?;
            Ok(Expr::load(addr, width))
        }
        4 => {
            let op = read_binop(r)?;
            let lhs = read_expr(r)?;
            let rhs = read_expr(r)?;
            Ok(Expr::binary(op, lhs, rhs))
        }
        _ => Err(IrError::BadTag {
            what: "expression",
            tag,
            offset: r.offset,
        }),
    }
}

fn read_term(r: &mut Reader) -> Result<Terminator> {
    let tag = r.u8()?;
    match tag {
        0 => Ok(Terminator::Return),
        1 => Ok(Terminator::Jump {
            target: read_target(r)?,
        }),
        2 => Ok(Terminator::Branch {
            cond: read_expr(r)?,
            taken: read_target(r)?,
            fall: read_target(r)?,
        }),
        3 => {
            let selector = read_expr(r)?;
            let case_len = r.u32()? as usize;
            let mut cases = Vec::with_capacity(case_len);
            for _ in 0..case_len {
                let addr = r.u64()?;
                let target = read_target(r)?;
                cases.push(DispatchCase { addr, target });
            }
            let default = read_target(r)?;
            Ok(Terminator::Dispatch {
                selector,
                cases,
                default,
            })
        }
        4 => Ok(Terminator::Unreachable),
        _ => Err(IrError::BadTag {
            what: "terminator",
            tag,
            offset: r.offset,
        }),
    }
}

fn read_target(r: &mut Reader) -> Result<Target> {
    let tag = r.u8()?;
    match tag {
        0 => Ok(Target::Unit(UnitId(r.u32()?))),
        1 => Ok(Target::Block(BlockId(r.u32()?))),
        2 => Ok(Target::Func(FuncId(r.u32()?))),
        _ => Err(IrError::BadTag {
            what: "target",
            tag,
            offset: r.offset,
        }),
    }
}

fn read_role(r: &mut Reader) -> Result<UnitRole> {
    let tag = r.u8()?;
    match tag {
        0 => Ok(UnitRole::Ordinary),
        1 => Ok(UnitRole::ExternStub),
        2 => Ok(UnitRole::Merged),
        3 => Ok(UnitRole::Callback),
        _ => Err(IrError::BadTag {
            what: "role",
            tag,
            offset: r.offset,
        }),
    }
}

fn read_binop(r: &mut Reader) -> Result<BinOp> {
    let tag = r.u8()?;
    match tag {
        0 => Ok(BinOp::Add),
        1 => Ok(BinOp::Sub),
        2 => Ok(BinOp::And),
        3 => Ok(BinOp::Or),
        4 => Ok(BinOp::Xor),
        5 => Ok(BinOp::Shl),
        6 => Ok(BinOp::Shr),
        7 => Ok(BinOp::Eq),
        8 => Ok(BinOp::Ne),
        _ => Err(IrError::BadTag {
            what: "binary operator",
            tag,
            offset: r.offset,
        }),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.data.len() {
            return Err(IrError::Truncated(self.offset));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| IrError::Truncated(self.offset))
    }

    fn opt_str(&mut self) -> Result<Option<String>> {
        if self.u8()? == 0 {
            Ok(None)
        } else {
            Ok(Some(self.str()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_units() {
        let regs = RegisterFile::i386();
        let pc = regs.pc();
        let mut m = Module::new(regs);
        let mut u = TranslationUnit::new(0x1000);
        u.last_pc = 0x1008;
        u.body.push(Inst::write_reg(0x1000, pc, Expr::imm(0x2000)));
        u.body
            .push(Inst::store(0x1004, Expr::reg(RegId(0)), Expr::imm(7), 4));
        u.extern_symbol = Some("memcpy".to_string());
        u.role = UnitRole::ExternStub;
        let a = m.add_unit(u).unwrap();
        let b = m.add_unit(TranslationUnit::new(0x2000)).unwrap();
        m.unit_mut(a).unwrap().succs = vec![Some(Target::Unit(b)), None];

        let bytes = write_module(&m);
        let back = read_module(&bytes).unwrap();

        assert_eq!(back.unit_count(), 2);
        let ua = back.unit(a).unwrap();
        assert_eq!(ua.start, 0x1000);
        assert_eq!(ua.last_pc, 0x1008);
        assert_eq!(ua.role, UnitRole::ExternStub);
        assert_eq!(ua.extern_symbol.as_deref(), Some("memcpy"));
        assert_eq!(ua.body.len(), 2);
        assert_eq!(ua.succs, vec![Some(Target::Unit(b)), None]);
        assert_eq!(back.unit_by_addr(0x2000), Some(b));
    }

    #[test]
    fn test_round_trip_function() {
        let regs = RegisterFile::i386();
        let sp = regs.sp();
        let mut m = Module::new(regs);
        let mut f = Function::new(0x4000);
        let mut entry = Block::new(0x4000);
        entry.term = Terminator::dispatch(Expr::reg(sp), Target::Block(BlockId(1)));
        entry.term.add_dispatch_case(0x4010, Target::Block(BlockId(1)));
        f.push_block(entry);
        f.push_block(Block::synthetic(0x4010));
        f.add_local("esp".to_string(), Some(sp));
        f.signature = Some(Signature {
            used: RegSet::from_bits(1),
            input: RegSet::from_bits(1),
            output: RegSet::from_bits(1),
            args: vec![sp],
            rets: vec![sp],
        });
        let id = m.add_function(f);

        let bytes = write_module(&m);
        let back = read_module(&bytes).unwrap();
        let f = back.function(id).unwrap();
        assert_eq!(f.entry, 0x4000);
        assert_eq!(f.blocks.len(), 2);
        assert!(f.blocks[1].synthetic);
        assert_eq!(f.signature.as_ref().unwrap().args, vec![sp]);
        assert_eq!(f.local_for_reg(sp), Some(LocalId(0)));
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(read_module(b"NOPE"), Err(IrError::BadMagic)));
    }

    #[test]
    fn test_truncated() {
        let m = Module::new(RegisterFile::i386());
        let bytes = write_module(&m);
        assert!(matches!(
            read_module(&bytes[..bytes.len() - 1]),
            Err(IrError::Truncated(_))
        ));
    }
}
