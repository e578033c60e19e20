//! Exploration pass
//!
//! Walks a decoded method body once, before any IR is emitted, and records
//! per-offset facts the emit pass relies on:
//!
//! - which offsets start a basic block (branch and switch targets, the
//!   instruction after a block end or a conditional branch, and every
//!   handler boundary), each getting its IR block up front
//! - the list of handlers covering each instruction; every distinct list
//!   gets one dispatch block that tests the handlers in table order
//! - the return sites of subroutine calls, numbered in offset order
//!
//! Handler boundaries always start a block, so every instruction of a block
//! has the same covering list.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::jit::bytecode::{decode_method, Insn};
use crate::jit::compiler::CompileError;
use crate::jit::ir::{BlockId, Builder, JitType};
use crate::vm::method::Code;

/// Facts about one instruction
#[derive(Debug, Clone, Default)]
pub struct Opinfo {
    /// IR block starting at this instruction
    pub block: Option<BlockId>,
    /// Index into `Exploration::regions` of the handlers covering it
    pub region: Option<usize>,
    /// Whether a handler's entry is here
    pub handler_entry: bool,
}

/// Handlers shared by a run of instructions
#[derive(Debug, Clone)]
pub struct Region {
    /// Rows of the exception table, in priority order
    pub handlers: Vec<usize>,
    /// Block that receives the exception (one `Ref` parameter) and selects
    /// among `handlers`
    pub dispatch: BlockId,
    /// The dispatch block's exception parameter
    pub exception: crate::jit::ir::Reg,
}

/// Result of exploring one method body
#[derive(Debug)]
pub struct Exploration {
    /// Decoded instructions in offset order
    pub insns: Vec<Insn>,
    /// One entry per instruction
    pub opinfo: Vec<Opinfo>,
    /// Distinct handler lists
    pub regions: Vec<Region>,
    /// Offsets following each `jsr`; the tag pushed by a `jsr` is its index
    pub return_sites: Vec<u32>,
    index: FxHashMap<u32, usize>,
}

impl Exploration {
    /// Instruction index of `pc`
    pub fn index_of(&self, pc: u32) -> Option<usize> {
        self.index.get(&pc).copied()
    }

    /// Block starting at `pc`
    pub fn block_at(&self, pc: u32) -> Option<BlockId> {
        self.index_of(pc).and_then(|i| self.opinfo[i].block)
    }

    /// Handler region of the instruction at `pc`
    pub fn region_at(&self, pc: u32) -> Option<&Region> {
        self.index_of(pc)
            .and_then(|i| self.opinfo[i].region)
            .map(|r| &self.regions[r])
    }

    /// Offsets that start a block, ascending
    pub fn block_starts(&self) -> impl Iterator<Item = u32> + '_ {
        self.insns
            .iter()
            .zip(&self.opinfo)
            .filter(|(_, info)| info.block.is_some())
            .map(|(insn, _)| insn.pc)
    }

    /// Tag pushed by the `jsr` returning to `return_pc`
    pub fn return_tag(&self, return_pc: u32) -> Option<i32> {
        self.return_sites.iter().position(|pc| *pc == return_pc).map(|i| i as i32)
    }
}

/// Decode `code`, find its blocks and create them (and the handler
/// dispatch blocks) in `builder`'s function
pub fn explore(code: &Code, builder: &mut Builder<'_>) -> Result<Exploration, CompileError> {
    let insns = decode_method(&code.bytecode)?;
    let code_len = code.bytecode.len() as u32;

    let index: FxHashMap<u32, usize> = insns.iter().enumerate().map(|(i, insn)| (insn.pc, i)).collect();
    let mut starts: BTreeSet<u32> = BTreeSet::new();
    starts.insert(0);

    for (row, handler) in code.handlers.iter().enumerate() {
        let boundary = |pc: u32| index.contains_key(&pc);
        let end_ok = handler.end_pc == code_len || boundary(handler.end_pc);
        if handler.start_pc >= handler.end_pc
            || !boundary(handler.start_pc)
            || !end_ok
            || !boundary(handler.handler_pc)
        {
            return Err(CompileError::BadHandler { row });
        }
        starts.insert(handler.start_pc);
        starts.insert(handler.handler_pc);
        if handler.end_pc < code_len {
            starts.insert(handler.end_pc);
        }
    }

    let mut return_sites = Vec::new();
    for insn in &insns {
        starts.extend(insn.targets());
        if insn.op.ends_block() || insn.op.is_conditional() {
            if insn.next_pc() < code_len {
                starts.insert(insn.next_pc());
            }
        }
        if matches!(insn.op, crate::jit::bytecode::Opcode::Jsr) {
            return_sites.push(insn.next_pc());
        }
    }

    let mut opinfo = vec![Opinfo::default(); insns.len()];
    for pc in &starts {
        if let Some(&i) = index.get(pc) {
            opinfo[i].block = Some(builder.create_block());
        }
    }
    for handler in &code.handlers {
        if let Some(&i) = index.get(&handler.handler_pc) {
            opinfo[i].handler_entry = true;
        }
    }

    // Group instructions by covering list
    let mut regions: Vec<Region> = Vec::new();
    let mut by_list: FxHashMap<Vec<usize>, usize> = FxHashMap::default();
    for (insn, info) in insns.iter().zip(opinfo.iter_mut()) {
        let covering: Vec<usize> = code
            .handlers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.covers(insn.pc))
            .map(|(row, _)| row)
            .collect();
        if covering.is_empty() {
            continue;
        }
        let region = match by_list.get(&covering) {
            Some(&r) => r,
            None => {
                let dispatch = builder.create_block();
                let exception = builder.add_param(dispatch, JitType::Ref);
                regions.push(Region {
                    handlers: covering.clone(),
                    dispatch,
                    exception,
                });
                by_list.insert(covering, regions.len() - 1);
                regions.len() - 1
            }
        };
        info.region = Some(region);
    }

    Ok(Exploration {
        insns,
        opinfo,
        regions,
        return_sites,
        index,
    })
}
