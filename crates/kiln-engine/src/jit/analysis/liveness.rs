//! Reference liveness and stack maps
//!
//! A backward dataflow over the IR computes, for every GC point (calls and
//! safepoint polls), the reference registers whose values are still needed
//! after it. A register defined by the GC point itself is not part of its map.
//! Faults inside a block may continue in its handler, so whatever the handler
//! needs is live at every instruction of the block.
//!
//! Locals are not covered here; the executor roots every reference held in a
//! local slot.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::jit::ir::{Block, BlockId, Function, JitType, Reg};

/// Live reference registers at each GC point
#[derive(Debug, Clone, Default)]
pub struct StackMaps {
    maps: FxHashMap<(BlockId, usize), Vec<Reg>>,
}

impl StackMaps {
    /// Registers live across instruction `index` of `block`, ascending.
    /// Empty for instructions that are not GC points.
    pub fn at(&self, block: BlockId, index: usize) -> &[Reg] {
        self.maps.get(&(block, index)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether a map was recorded for the instruction
    pub fn contains(&self, block: BlockId, index: usize) -> bool {
        self.maps.contains_key(&(block, index))
    }

    /// Number of GC points
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether the function has no GC points
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

type LiveSet = BTreeSet<Reg>;

struct Liveness<'a> {
    func: &'a Function,
    live_in: Vec<LiveSet>,
}

impl<'a> Liveness<'a> {
    fn is_ref(&self, reg: Reg) -> bool {
        self.func.reg_type(reg) == Some(JitType::Ref)
    }

    fn handler_in(&self, block: &Block) -> LiveSet {
        block
            .handler
            .map(|h| self.live_in[h.0 as usize].clone())
            .unwrap_or_default()
    }

    fn live_out(&self, block: &Block, handler_in: &LiveSet) -> LiveSet {
        let mut live = handler_in.clone();
        for call in block.terminator.successors() {
            live.extend(self.live_in[call.block.0 as usize].iter().copied());
        }
        live.extend(block.terminator.uses().into_iter().filter(|r| self.is_ref(*r)));
        live
    }

    /// Walk `block` backwards from its live-out set, calling `visit` with the
    /// set live after each instruction. Returns the block's live-in set.
    fn walk(&self, block: &Block, mut visit: impl FnMut(usize, &LiveSet)) -> LiveSet {
        let handler_in = self.handler_in(block);
        let mut live = self.live_out(block, &handler_in);
        for (index, instr) in block.instrs.iter().enumerate().rev() {
            visit(index, &live);
            if let Some(dest) = instr.dest() {
                live.remove(&dest);
            }
            live.extend(instr.uses().into_iter().filter(|r| self.is_ref(*r)));
            live.extend(handler_in.iter().copied());
        }
        for param in &block.params {
            live.remove(param);
        }
        live
    }
}

/// Compute the stack maps of `func`
pub fn compute_stack_maps(func: &Function) -> StackMaps {
    let mut analysis = Liveness {
        func,
        live_in: vec![LiveSet::new(); func.blocks.len()],
    };

    loop {
        let mut changed = false;
        for block in func.blocks.iter().rev() {
            let live = analysis.walk(block, |_, _| {});
            let slot = &mut analysis.live_in[block.id.0 as usize];
            if *slot != live {
                *slot = live;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut maps = FxHashMap::default();
    for block in &func.blocks {
        analysis.walk(block, |index, live| {
            let instr = &block.instrs[index];
            if instr.is_gc_point() {
                let dest = instr.dest();
                let regs: Vec<Reg> = live.iter().copied().filter(|r| Some(*r) != dest).collect();
                maps.insert((block.id, index), regs);
            }
        });
    }
    StackMaps { maps }
}
