//! Bytecode assembler
//!
//! A small builder for method bodies with forward and backward labels. Used
//! by tests and by embedders that generate code without a class-file reader.
//!
//! ```ignore
//! let mut a = Assembler::new();
//! let done = a.label();
//! a.load(Opcode::Iload, 0);
//! a.branch(Opcode::Ifeq, done);
//! a.push_int(7);
//! a.op(Opcode::Ireturn);
//! a.bind(done);
//! a.push_int(0);
//! a.op(Opcode::Ireturn);
//! let code = a.finish_code(1, 1)?;
//! ```

use crate::jit::bytecode::opcode::Opcode;
use crate::vm::method::{Code, ExceptionHandler};

/// Assembler failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    /// A branch refers to a label that was never bound
    #[error("label {0} is never bound")]
    UnboundLabel(usize),

    /// A short branch does not fit in 16 bits
    #[error("branch at offset {0} is out of 16-bit range")]
    BranchRange(u32),
}

/// Branch target placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct Fixup {
    insn_pc: u32,
    at: usize,
    label: Label,
    wide: bool,
}

struct PendingHandler {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: Option<u16>,
}

/// Method body builder
#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    handlers: Vec<PendingHandler>,
    lines: Vec<(u32, u32)>,
}

impl Assembler {
    /// Empty body
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next emitted byte
    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    /// New unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.pc());
        self
    }

    /// Offset a label is bound to
    pub fn offset_of(&self, label: Label) -> Option<u32> {
        self.labels.get(label.0).copied().flatten()
    }

    /// Emit a bare opcode
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    /// Emit a raw byte
    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self
    }

    /// Emit an opcode with a big-endian u16 operand (pool references)
    pub fn op_u16(&mut self, op: Opcode, operand: u16) -> &mut Self {
        self.code.push(op as u8);
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    /// Push an int constant with the shortest encoding. Values outside the
    /// 16-bit range are built from two halves.
    pub fn push_int(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op(Opcode::from_u8((Opcode::Iconst0 as u8 as i32 + value) as u8).unwrap_or(Opcode::Iconst0)),
            -128..=127 => self.op(Opcode::Bipush).byte(value as i8 as u8),
            -32768..=32767 => {
                self.op(Opcode::Sipush);
                self.code.extend_from_slice(&(value as i16).to_be_bytes());
                self
            }
            _ => {
                // (hi << 16) | (lo & 0xffff) without a pool entry
                let (hi, lo) = (value >> 16, i32::from(value as i16));
                self.push_int(hi).push_int(16).op(Opcode::Ishl);
                self.push_int(lo).op(Opcode::IconstM1).push_int(16).op(Opcode::Iushr).op(Opcode::Iand);
                self.op(Opcode::Ior)
            }
        }
    }

    /// Local load or store (`Iload`, `Astore`, ...), using the short form
    /// for slots 0..=3 and `wide` above 255
    pub fn load(&mut self, op: Opcode, slot: u16) -> &mut Self {
        let base = op as u8;
        let short = match op {
            Opcode::Iload | Opcode::Lload | Opcode::Fload | Opcode::Dload | Opcode::Aload => {
                Some(Opcode::Iload0 as u8 + (base - Opcode::Iload as u8) * 4)
            }
            Opcode::Istore | Opcode::Lstore | Opcode::Fstore | Opcode::Dstore | Opcode::Astore => {
                Some(Opcode::Istore0 as u8 + (base - Opcode::Istore as u8) * 4)
            }
            _ => None,
        };
        match (short, slot) {
            (Some(first), 0..=3) => self.byte(first + slot as u8),
            (_, 0..=255) => self.op(op).byte(slot as u8),
            _ => {
                self.op(Opcode::Wide);
                self.op_u16(op, slot)
            }
        }
    }

    /// Alias of [`Assembler::load`] for stores
    pub fn store(&mut self, op: Opcode, slot: u16) -> &mut Self {
        self.load(op, slot)
    }

    /// `iinc`
    pub fn iinc(&mut self, slot: u16, delta: i16) -> &mut Self {
        if slot <= 255 && (-128..=127).contains(&delta) {
            self.op(Opcode::Iinc).byte(slot as u8).byte(delta as i8 as u8)
        } else {
            self.op(Opcode::Wide).op_u16(Opcode::Iinc, slot);
            self.code.extend_from_slice(&delta.to_be_bytes());
            self
        }
    }

    /// `ret`
    pub fn ret(&mut self, slot: u8) -> &mut Self {
        self.op(Opcode::Ret).byte(slot)
    }

    /// `newarray` with a primitive type code (4 = boolean ... 11 = long)
    pub fn newarray(&mut self, atype: u8) -> &mut Self {
        self.op(Opcode::Newarray).byte(atype)
    }

    /// `invokeinterface`
    pub fn invokeinterface(&mut self, index: u16, count: u8) -> &mut Self {
        self.op_u16(Opcode::Invokeinterface, index).byte(count).byte(0)
    }

    /// `multianewarray`
    pub fn multianewarray(&mut self, index: u16, dims: u8) -> &mut Self {
        self.op_u16(Opcode::Multianewarray, index).byte(dims)
    }

    /// Branch with a 16-bit offset (`goto`, `jsr`, `if*`)
    pub fn branch(&mut self, op: Opcode, target: Label) -> &mut Self {
        let insn_pc = self.pc();
        self.op(op);
        self.fixups.push(Fixup { insn_pc, at: self.code.len(), label: target, wide: false });
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    /// Branch with a 32-bit offset (`goto_w`, `jsr_w`)
    pub fn branch_wide(&mut self, op: Opcode, target: Label) -> &mut Self {
        let insn_pc = self.pc();
        self.op(op);
        self.wide_target(insn_pc, target);
        self
    }

    fn wide_target(&mut self, insn_pc: u32, target: Label) {
        self.fixups.push(Fixup { insn_pc, at: self.code.len(), label: target, wide: true });
        self.code.extend_from_slice(&[0, 0, 0, 0]);
    }

    fn pad(&mut self) {
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
    }

    /// `tableswitch` over `low..low + targets.len()`
    pub fn tableswitch(&mut self, low: i32, targets: &[Label], default: Label) -> &mut Self {
        let insn_pc = self.pc();
        self.op(Opcode::Tableswitch);
        self.pad();
        self.wide_target(insn_pc, default);
        let high = low + targets.len() as i32 - 1;
        self.code.extend_from_slice(&low.to_be_bytes());
        self.code.extend_from_slice(&high.to_be_bytes());
        for target in targets {
            self.wide_target(insn_pc, *target);
        }
        self
    }

    /// `lookupswitch`; pairs are sorted by key
    pub fn lookupswitch(&mut self, pairs: &[(i32, Label)], default: Label) -> &mut Self {
        let insn_pc = self.pc();
        self.op(Opcode::Lookupswitch);
        self.pad();
        self.wide_target(insn_pc, default);
        let mut sorted = pairs.to_vec();
        sorted.sort_by_key(|(key, _)| *key);
        self.code.extend_from_slice(&(sorted.len() as i32).to_be_bytes());
        for (key, target) in sorted {
            self.code.extend_from_slice(&key.to_be_bytes());
            self.wide_target(insn_pc, target);
        }
        self
    }

    /// Protect `[start, end)` with a handler at `handler`. `catch_type` is
    /// a class constant index; `None` catches everything.
    pub fn handler(&mut self, start: Label, end: Label, handler: Label, catch_type: Option<u16>) -> &mut Self {
        self.handlers.push(PendingHandler { start, end, handler, catch_type });
        self
    }

    /// Attribute code from the current offset on to source `line`
    pub fn line(&mut self, line: u32) -> &mut Self {
        let pc = self.pc();
        self.lines.push((pc, line));
        self
    }

    fn resolve(&self, label: Label) -> Result<u32, AsmError> {
        self.offset_of(label).ok_or(AsmError::UnboundLabel(label.0))
    }

    /// Patch every branch and return the bytecode
    pub fn finish(&mut self) -> Result<Vec<u8>, AsmError> {
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label)?;
            let offset = i64::from(target) - i64::from(fixup.insn_pc);
            if fixup.wide {
                self.code[fixup.at..fixup.at + 4].copy_from_slice(&(offset as i32).to_be_bytes());
            } else {
                let short = i16::try_from(offset).map_err(|_| AsmError::BranchRange(fixup.insn_pc))?;
                self.code[fixup.at..fixup.at + 2].copy_from_slice(&short.to_be_bytes());
            }
        }
        Ok(self.code.clone())
    }

    /// Finish into a method body with its exception table and line table
    pub fn finish_code(&mut self, max_locals: u16, max_stack: u16) -> Result<Code, AsmError> {
        let bytecode = self.finish()?;
        let mut code = Code::new(bytecode, max_locals, max_stack).with_lines(self.lines.clone());
        for pending in &self.handlers {
            code = code.with_handler(ExceptionHandler {
                start_pc: self.resolve(pending.start)?,
                end_pc: self.resolve(pending.end)?,
                handler_pc: self.resolve(pending.handler)?,
                catch_type: pending.catch_type,
            });
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::bytecode::decoder::{decode_method, Operand};

    #[test]
    fn test_forward_and_backward_branches() {
        let mut a = Assembler::new();
        let top = a.label();
        let out = a.label();
        a.bind(top);
        a.load(Opcode::Iload, 0);
        a.branch(Opcode::Ifeq, out);
        a.iinc(0, -1);
        a.branch(Opcode::Goto, top);
        a.bind(out);
        a.op(Opcode::Return);
        let code = a.finish().unwrap();

        let insns = decode_method(&code).unwrap();
        assert_eq!(insns[1].operand, Operand::Branch(10));
        assert_eq!(insns[3].operand, Operand::Branch(0));
        assert_eq!(insns[2].operand, Operand::Iinc { local: 0, delta: -1 });
    }

    #[test]
    fn test_int_encodings() {
        let mut a = Assembler::new();
        a.push_int(-1).push_int(5).push_int(100).push_int(-300);
        let code = a.finish().unwrap();
        assert_eq!(code, vec![0x02, 0x08, 0x10, 100, 0x11, 0xfe, 0xd4]);
    }

    #[test]
    fn test_switch_round_trip() {
        let mut a = Assembler::new();
        let (x, y, d) = (a.label(), a.label(), a.label());
        a.op(Opcode::Iconst0);
        a.tableswitch(1, &[x, y], d);
        a.bind(x).op(Opcode::Return);
        a.bind(y).op(Opcode::Return);
        a.bind(d).op(Opcode::Return);
        let code = a.finish().unwrap();
        let insns = decode_method(&code).unwrap();
        match &insns[1].operand {
            Operand::Table { low, targets, default } => {
                assert_eq!(*low, 1);
                assert_eq!(targets.len(), 2);
                assert_eq!(*default, insns[4].pc);
            }
            other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn test_unbound_label() {
        let mut a = Assembler::new();
        let nowhere = a.label();
        a.branch(Opcode::Goto, nowhere);
        assert_eq!(a.finish(), Err(AsmError::UnboundLabel(0)));
    }

    #[test]
    fn test_handlers_and_lines() {
        let mut a = Assembler::new();
        let (start, end, catch) = (a.label(), a.label(), a.label());
        a.line(1).bind(start);
        a.op(Opcode::AconstNull).op(Opcode::Athrow);
        a.bind(end).bind(catch).line(2);
        a.op(Opcode::Areturn);
        a.handler(start, end, catch, Some(3));
        let code = a.finish_code(1, 1).unwrap();
        assert_eq!(code.handlers.len(), 1);
        assert_eq!(code.handlers[0].handler_pc, 2);
        assert_eq!(code.line_for(2), Some(2));
    }
}
