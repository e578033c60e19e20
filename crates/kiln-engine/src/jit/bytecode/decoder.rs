//! Bytecode instruction decoder
//!
//! Decodes a method body into typed instructions. Malformed input (unknown
//! opcode, truncated operands, a branch into the middle of an instruction)
//! is rejected as a whole; no bytes are ever skipped.

use std::fmt;

use crate::jit::bytecode::opcode::Opcode;

/// Error during bytecode decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Byte does not name an opcode
    #[error("invalid opcode byte {byte:#04x} at offset {pc}")]
    InvalidOpcode {
        /// Offending byte
        byte: u8,
        /// Offset of the instruction
        pc: u32,
    },

    /// Operands run past the end of the code
    #[error("truncated operands for instruction at offset {0}")]
    Truncated(u32),

    /// `wide` applied to an opcode that has no wide form
    #[error("opcode {byte:#04x} at offset {pc} has no wide form")]
    BadWide {
        /// Widened opcode byte
        byte: u8,
        /// Offset of the `wide` prefix
        pc: u32,
    },

    /// Branch target outside the code or not on an instruction boundary
    #[error("branch at offset {pc} targets invalid offset {target}")]
    BadTarget {
        /// Branch offset
        pc: u32,
        /// Target offset
        target: i64,
    },

    /// Operand value out of range (switch bounds, array dimensions)
    #[error("invalid operand for instruction at offset {0}")]
    BadOperand(u32),

    /// Method body has no instructions
    #[error("empty method body")]
    Empty,
}

/// Decoded operands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// No operands
    None,
    /// Immediate integer (`bipush`, `sipush`, `newarray` type code)
    Int(i32),
    /// Local variable index
    Local(u16),
    /// Constant pool index
    Pool(u16),
    /// Absolute branch target
    Branch(u32),
    /// `iinc`
    Iinc {
        /// Local variable index
        local: u16,
        /// Increment
        delta: i32,
    },
    /// `tableswitch`
    Table {
        /// Default target
        default: u32,
        /// Key of the first target
        low: i32,
        /// Targets for keys `low..low + targets.len()`
        targets: Vec<u32>,
    },
    /// `lookupswitch`
    Lookup {
        /// Default target
        default: u32,
        /// `(key, target)` pairs
        pairs: Vec<(i32, u32)>,
    },
    /// `invokeinterface`
    Interface {
        /// Method reference
        index: u16,
        /// Argument slot count including the receiver
        count: u8,
    },
    /// `multianewarray`
    MultiArray {
        /// Array class reference
        index: u16,
        /// Dimensions to allocate
        dims: u8,
    },
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Offset of the first byte (including any `wide` prefix)
    pub pc: u32,
    /// Opcode; short local forms are normalized (`iload_2` is `Iload` with `Local(2)`)
    pub op: Opcode,
    /// Operands
    pub operand: Operand,
    /// Encoded length in bytes
    pub len: u32,
}

impl Insn {
    /// Offset of the next instruction
    pub fn next_pc(&self) -> u32 {
        self.pc + self.len
    }

    /// Every branch target of this instruction
    pub fn targets(&self) -> Vec<u32> {
        match &self.operand {
            Operand::Branch(target) => vec![*target],
            Operand::Table { default, targets, .. } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            Operand::Lookup { default, pairs } => {
                let mut all = vec![*default];
                all.extend(pairs.iter().map(|(_, t)| *t));
                all
            }
            _ => Vec::new(),
        }
    }

    /// Local index operand
    pub fn local(&self) -> Option<u16> {
        match self.operand {
            Operand::Local(index) | Operand::Iinc { local: index, .. } => Some(index),
            _ => None,
        }
    }

    /// Constant pool operand
    pub fn pool_index(&self) -> Option<u16> {
        match self.operand {
            Operand::Pool(index) | Operand::Interface { index, .. } | Operand::MultiArray { index, .. } => Some(index),
            _ => None,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pc, self.op)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Int(v) => write!(f, " {}", v),
            Operand::Local(i) => write!(f, " {}", i),
            Operand::Pool(i) => write!(f, " #{}", i),
            Operand::Branch(t) => write!(f, " {}", t),
            Operand::Iinc { local, delta } => write!(f, " {} {}", local, delta),
            Operand::Table { default, low, targets } => {
                write!(f, " low={} default={} [", low, default)?;
                for (i, t) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, "]")
            }
            Operand::Lookup { default, pairs } => {
                write!(f, " default={} [", default)?;
                for (i, (k, t)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, t)?;
                }
                write!(f, "]")
            }
            Operand::Interface { index, count } => write!(f, " #{} {}", index, count),
            Operand::MultiArray { index, dims } => write!(f, " #{} {}", index, dims),
        }
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
    start: u32,
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.code.get(self.pos).ok_or(DecodeError::Truncated(self.start))?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    fn target(&self, offset: i64) -> Result<u32, DecodeError> {
        let target = i64::from(self.start) + offset;
        if target < 0 || target >= self.code.len() as i64 {
            return Err(DecodeError::BadTarget { pc: self.start, target });
        }
        Ok(target as u32)
    }
}

/// Generic opcode and local index of a short load/store form
fn short_form(byte: u8) -> Option<(Opcode, u16)> {
    let (base, first) = match byte {
        0x1a..=0x2d => (Opcode::Iload as u8, 0x1a),
        0x3b..=0x4e => (Opcode::Istore as u8, 0x3b),
        _ => return None,
    };
    let rel = byte - first;
    Opcode::from_u8(base + rel / 4).map(|op| (op, u16::from(rel % 4)))
}

fn decode_one(code: &[u8], pc: usize) -> Result<Insn, DecodeError> {
    let start = pc as u32;
    let mut r = Reader { code, pos: pc, start };
    let byte = r.u8()?;
    let op = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode { byte, pc: start })?;

    if let Some((op, local)) = short_form(byte) {
        return Ok(Insn {
            pc: start,
            op,
            operand: Operand::Local(local),
            len: 1,
        });
    }

    let (op, operand) = match op {
        Opcode::Bipush => (op, Operand::Int(i32::from(r.u8()? as i8))),
        Opcode::Sipush => (op, Operand::Int(i32::from(r.i16()?))),
        Opcode::Newarray => (op, Operand::Int(i32::from(r.u8()?))),
        Opcode::Ldc => (op, Operand::Pool(u16::from(r.u8()?))),

        Opcode::LdcW
        | Opcode::Ldc2W
        | Opcode::Getstatic
        | Opcode::Putstatic
        | Opcode::Getfield
        | Opcode::Putfield
        | Opcode::Invokevirtual
        | Opcode::Invokespecial
        | Opcode::Invokestatic
        | Opcode::New
        | Opcode::Anewarray
        | Opcode::Checkcast
        | Opcode::Instanceof => (op, Operand::Pool(r.u16()?)),

        Opcode::Iload
        | Opcode::Lload
        | Opcode::Fload
        | Opcode::Dload
        | Opcode::Aload
        | Opcode::Istore
        | Opcode::Lstore
        | Opcode::Fstore
        | Opcode::Dstore
        | Opcode::Astore
        | Opcode::Ret => (op, Operand::Local(u16::from(r.u8()?))),

        Opcode::Iinc => {
            let local = u16::from(r.u8()?);
            let delta = i32::from(r.u8()? as i8);
            (op, Operand::Iinc { local, delta })
        }

        Opcode::Goto | Opcode::Jsr => {
            let offset = r.i16()?;
            (op, Operand::Branch(r.target(i64::from(offset))?))
        }
        Opcode::GotoW | Opcode::JsrW => {
            let offset = r.i32()?;
            let target = r.target(i64::from(offset))?;
            // The wide forms behave exactly like their short forms
            let op = if op == Opcode::GotoW { Opcode::Goto } else { Opcode::Jsr };
            (op, Operand::Branch(target))
        }
        op if op.is_conditional() => {
            let offset = r.i16()?;
            (op, Operand::Branch(r.target(i64::from(offset))?))
        }

        Opcode::Tableswitch => {
            // Operands are 4-byte aligned relative to the start of the code
            while r.pos % 4 != 0 {
                r.u8()?;
            }
            let default = r.i32()?;
            let default = r.target(i64::from(default))?;
            let low = r.i32()?;
            let high = r.i32()?;
            if high < low {
                return Err(DecodeError::BadOperand(start));
            }
            let count = (i64::from(high) - i64::from(low) + 1) as usize;
            if count > code.len() {
                return Err(DecodeError::Truncated(start));
            }
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                let offset = r.i32()?;
                targets.push(r.target(i64::from(offset))?);
            }
            (op, Operand::Table { default, low, targets })
        }
        Opcode::Lookupswitch => {
            while r.pos % 4 != 0 {
                r.u8()?;
            }
            let default = r.i32()?;
            let default = r.target(i64::from(default))?;
            let npairs = r.i32()?;
            if npairs < 0 {
                return Err(DecodeError::BadOperand(start));
            }
            if npairs as usize > code.len() {
                return Err(DecodeError::Truncated(start));
            }
            let mut pairs = Vec::with_capacity(npairs as usize);
            for _ in 0..npairs {
                let key = r.i32()?;
                let offset = r.i32()?;
                pairs.push((key, r.target(i64::from(offset))?));
            }
            (op, Operand::Lookup { default, pairs })
        }

        Opcode::Invokeinterface => {
            let index = r.u16()?;
            let count = r.u8()?;
            let _zero = r.u8()?;
            (op, Operand::Interface { index, count })
        }
        Opcode::Multianewarray => {
            let index = r.u16()?;
            let dims = r.u8()?;
            if dims == 0 {
                return Err(DecodeError::BadOperand(start));
            }
            (op, Operand::MultiArray { index, dims })
        }

        Opcode::Wide => {
            let byte = r.u8()?;
            let widened = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode { byte, pc: start + 1 })?;
            match widened {
                Opcode::Iinc => {
                    let local = r.u16()?;
                    let delta = i32::from(r.i16()?);
                    (widened, Operand::Iinc { local, delta })
                }
                Opcode::Iload
                | Opcode::Lload
                | Opcode::Fload
                | Opcode::Dload
                | Opcode::Aload
                | Opcode::Istore
                | Opcode::Lstore
                | Opcode::Fstore
                | Opcode::Dstore
                | Opcode::Astore
                | Opcode::Ret => (widened, Operand::Local(r.u16()?)),
                _ => return Err(DecodeError::BadWide { byte, pc: start }),
            }
        }

        _ => (op, Operand::None),
    };

    Ok(Insn {
        pc: start,
        op,
        operand,
        len: (r.pos - pc) as u32,
    })
}

/// Decode a whole method body
pub fn decode_method(code: &[u8]) -> Result<Vec<Insn>, DecodeError> {
    if code.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut insns = Vec::new();
    let mut boundaries = vec![false; code.len()];
    let mut pc = 0;
    while pc < code.len() {
        let insn = decode_one(code, pc)?;
        boundaries[pc] = true;
        pc += insn.len as usize;
        insns.push(insn);
    }

    for insn in &insns {
        for target in insn.targets() {
            if !boundaries[target as usize] {
                return Err(DecodeError::BadTarget { pc: insn.pc, target: i64::from(target) });
            }
        }
    }
    Ok(insns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_forms_are_normalized() {
        let insns = decode_method(&[0x1c, 0x2b, 0x4e, 0xb1]).unwrap();
        assert_eq!(insns[0].op, Opcode::Iload);
        assert_eq!(insns[0].operand, Operand::Local(2));
        assert_eq!(insns[1].op, Opcode::Aload);
        assert_eq!(insns[1].operand, Operand::Local(1));
        assert_eq!(insns[2].op, Opcode::Astore);
        assert_eq!(insns[2].operand, Operand::Local(3));
        assert_eq!(insns[3].pc, 3);
    }

    #[test]
    fn test_branch_targets_are_absolute() {
        // 0: iconst_0, 1: ifeq +5 -> 6, 4: iconst_1, 5: nop, 6: return
        let insns = decode_method(&[0x03, 0x99, 0x00, 0x05, 0x04, 0x00, 0xb1]).unwrap();
        assert_eq!(insns[1].operand, Operand::Branch(6));
        assert_eq!(insns[1].next_pc(), 4);
    }

    #[test]
    fn test_tableswitch_padding() {
        // 0: iload_0, 1: tableswitch (pad to 4), default -> 0, low 0, high 1
        let mut code = vec![0x1a, 0xaa, 0, 0];
        code.extend_from_slice(&(-1i32).to_be_bytes()); // default: 1 + -1 = 0
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&(-1i32).to_be_bytes());
        code.extend_from_slice(&(-1i32).to_be_bytes());
        let insns = decode_method(&code).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[1].len as usize, code.len() - 1);
        match &insns[1].operand {
            Operand::Table { default, low, targets } => {
                assert_eq!(*default, 0);
                assert_eq!(*low, 0);
                assert_eq!(targets, &vec![0, 0]);
            }
            other => panic!("unexpected operand {:?}", other),
        }
    }

    #[test]
    fn test_lookupswitch_pairs() {
        // 0: iload_0, 1: lookupswitch (pad to 4), default -> 0, keys 5 and 9 -> 0
        let mut code = vec![0x1a, 0xab, 0, 0];
        code.extend_from_slice(&(-1i32).to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        for key in [5i32, 9] {
            code.extend_from_slice(&key.to_be_bytes());
            code.extend_from_slice(&(-1i32).to_be_bytes());
        }
        let insns = decode_method(&code).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[1].len as usize, code.len() - 1);
        assert_eq!(
            insns[1].operand,
            Operand::Lookup {
                default: 0,
                pairs: vec![(5, 0), (9, 0)],
            }
        );
    }

    #[test]
    fn test_wide_forms() {
        let insns = decode_method(&[0xc4, 0x15, 0x01, 0x00, 0xc4, 0x84, 0x00, 0x02, 0xff, 0xff, 0xb1]).unwrap();
        assert_eq!(insns[0].op, Opcode::Iload);
        assert_eq!(insns[0].operand, Operand::Local(256));
        assert_eq!(insns[0].len, 4);
        assert_eq!(insns[1].operand, Operand::Iinc { local: 2, delta: -1 });
        assert_eq!(insns[1].len, 6);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert_eq!(decode_method(&[]), Err(DecodeError::Empty));
        assert_eq!(
            decode_method(&[0x00, 0xba]),
            Err(DecodeError::InvalidOpcode { byte: 0xba, pc: 1 })
        );
        assert_eq!(decode_method(&[0x11, 0x01]), Err(DecodeError::Truncated(0)));
        // goto into the middle of sipush
        assert!(matches!(
            decode_method(&[0x11, 0x00, 0x01, 0xa7, 0xff, 0xfe]),
            Err(DecodeError::BadTarget { pc: 3, target: 1 })
        ));
        assert!(matches!(decode_method(&[0xa7, 0x00, 0x10]), Err(DecodeError::BadTarget { .. })));
        assert_eq!(decode_method(&[0xc4, 0x60]), Err(DecodeError::BadWide { byte: 0x60, pc: 0 }));
    }
}
