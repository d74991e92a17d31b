// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Function Analyzer (component C).
//!
//! Builds a per-function basic-block CFG by a single linear sweep of the
//! decoder, then computes the worst-case intra-function stack depth
//! (`prologue_cost`) and the set of outgoing call sites.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::decode::{decode, Instruction};
use crate::error::AnalysisError;
use crate::loader::Image;

/// Where a call site's target points, once the Function Analyzer has done
/// everything it can on its own. Resolution of `Indirect` happens later,
/// in the Call Graph Builder, via config hints.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallTarget {
    Direct(u32),
    Indirect,
}

#[derive(Clone, Debug)]
pub struct CallSite {
    pub address: u32,
    pub target: CallTarget,
    /// Stack depth already consumed by the caller at this point, measured
    /// from the caller's own entry (i.e. includes the caller's
    /// `prologue_cost` contribution up to this instruction).
    pub depth_at_call: u32,
    /// True for a computed tail-branch (no return to this function after
    /// the transfer); false for `BL`/`BLX`, which come back.
    pub is_tail: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    FallThrough(u32),
    Branch(u32),
    /// A resolved call's return point (the instruction after the call).
    CallReturn(u32),
    Terminal,
}

#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub start: u32,
    pub end: u32,
    pub instructions: Vec<(u32, Instruction)>,
    pub edges: Vec<Edge>,
}

impl BasicBlock {
    /// Sum of every instruction's stack delta (the block's net effect on
    /// depth from its start to its end).
    pub fn net_delta(&self) -> i32 {
        self.instructions.iter().map(|(_, i)| i.stack_delta()).sum()
    }

    /// The deepest point reached strictly inside the block, relative to
    /// the block's own entry depth (captures e.g. `push` followed by
    /// `sub sp` within one block).
    pub fn internal_max(&self) -> i32 {
        let mut running = 0;
        let mut max = 0;
        for (_, insn) in &self.instructions {
            running += insn.stack_delta();
            max = max.max(running);
        }
        max
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub entry: u32,
    pub extent_end: u32,
    pub blocks: BTreeMap<u32, BasicBlock>,
    pub prologue_cost: u32,
    pub callee_set: Vec<CallSite>,
    pub returns: bool,
}

/// Leader addresses: the entry, every intra-function branch target, and
/// every instruction immediately following a branch/call/return.
fn find_leaders(
    instructions: &[(u32, Instruction)],
    entry: u32,
    extent_end: u32,
) -> BTreeSet<u32> {
    let mut leaders = BTreeSet::new();
    leaders.insert(entry);
    for (i, (_addr, insn)) in instructions.iter().enumerate() {
        let next = instructions
            .get(i + 1)
            .map(|(a, _)| *a)
            .unwrap_or(extent_end);
        match insn {
            Instruction::Branch { target, .. } => {
                if *target >= entry && *target < extent_end {
                    leaders.insert(*target);
                }
                leaders.insert(next);
            }
            Instruction::Call { .. }
            | Instruction::IndirectCall
            | Instruction::BranchIndirect { .. }
            | Instruction::Return
            | Instruction::Pop { pops_pc: true, .. } => {
                leaders.insert(next);
            }
            _ => {}
        }
    }
    leaders
}

fn build_blocks(
    instructions: Vec<(u32, Instruction)>,
    leaders: &BTreeSet<u32>,
    extent_end: u32,
) -> BTreeMap<u32, BasicBlock> {
    let leader_vec: Vec<u32> = leaders.iter().copied().collect();
    let mut blocks = BTreeMap::new();

    for (i, &start) in leader_vec.iter().enumerate() {
        let end = leader_vec.get(i + 1).copied().unwrap_or(extent_end);
        let block_instructions: Vec<(u32, Instruction)> = instructions
            .iter()
            .filter(|(addr, _)| *addr >= start && *addr < end)
            .cloned()
            .collect();

        let mut edges = Vec::new();
        if let Some((last_addr, last_insn)) = block_instructions.last() {
            match last_insn {
                Instruction::Branch { condition, target } => {
                    // A target outside the blocks we built (e.g. a tail
                    // branch into another function) simply isn't in
                    // `blocks`; `reachable_blocks` ignores such edges.
                    edges.push(Edge::Branch(*target));
                    // Conditional branches fall through; the unconditional
                    // form (T2, `condition: None`) does not.
                    if condition.is_some() {
                        edges.push(Edge::FallThrough(end));
                    }
                }
                Instruction::Call { .. } | Instruction::IndirectCall => {
                    edges.push(Edge::CallReturn(end));
                }
                Instruction::Return => edges.push(Edge::Terminal),
                Instruction::BranchIndirect { .. } => edges.push(Edge::Terminal),
                _ => {
                    if let Instruction::Pop { pops_pc: true, .. } = last_insn
                    {
                        edges.push(Edge::Terminal);
                    } else {
                        edges.push(Edge::FallThrough(end));
                    }
                }
            }
            let _ = last_addr;
        }

        blocks.insert(
            start,
            BasicBlock {
                start,
                end,
                instructions: block_instructions,
                edges,
            },
        );
    }

    blocks
}

/// Recognizes the v6-m switch-table idiom and resolves its targets by
/// reading the table bytes out of the image, instead of leaving the block's
/// terminating `BranchIndirect` as an unresolved indirect call.
///
/// The idiom, as gcc emits it for Thumb-1 (there is no `TBB`/`TBH` on this
/// core): a `cmp rN, #bound` bounding the index, a table base computed
/// either by `adr rX, <table>` or a PC-relative `ldr rX, [pc, #k]`, a
/// `ldr rY, [rX, rIndex]` reading one table entry, and finally `mov pc, rY`
/// (or `bx rY`) as the block's last instruction. This only recognizes the
/// case where the table holds absolute code addresses directly (no
/// position-independent `add rY, pc` step) and where the table-reading load
/// is the instruction immediately before the branch.
fn resolve_jump_table(image: &Image, block: &BasicBlock) -> Option<Vec<u32>> {
    let insns = &block.instructions;
    if insns.len() < 2 {
        return None;
    }
    let (_, branch_insn) = insns.last()?;
    let Instruction::BranchIndirect { rm: branch_rm } = branch_insn else {
        return None;
    };
    let (_, table_load) = &insns[insns.len() - 2];
    let Instruction::TableLoad { rd, rn, rm } = table_load else {
        return None;
    };
    if rd != branch_rm {
        return None;
    }
    let index_candidates = [*rn, *rm];

    let mut table_base: Option<u32> = None;
    let mut bound: Option<u32> = None;
    for (_, insn) in &insns[..insns.len() - 2] {
        match insn {
            Instruction::AdrPc { rd, address } => {
                if index_candidates.contains(rd) {
                    table_base = Some(*address);
                }
            }
            Instruction::LoadLiteral { rt, address } => {
                if index_candidates.contains(rt) {
                    let bytes = image.read(*address, 4)?;
                    table_base = Some(u32::from_le_bytes(bytes.try_into().ok()?));
                }
            }
            Instruction::CmpImm { imm, .. } => {
                bound = Some(*imm as u32);
            }
            _ => {}
        }
    }

    let base = table_base?;
    let count = bound?.checked_add(1)?;
    let mut targets = Vec::with_capacity(count as usize);
    for i in 0..count {
        let entry_addr = base.checked_add(4 * i)?;
        let bytes = image.read(entry_addr, 4)?;
        let word = u32::from_le_bytes(bytes.try_into().ok()?);
        targets.push(word & !1);
    }
    Some(targets)
}

/// Analyzes one function, given its symbol entry address and byte size.
pub fn analyze_function(
    image: &Image,
    name: &str,
    entry: u32,
    size: u32,
) -> Result<Function, AnalysisError> {
    let extent_end = entry + size.max(2);

    // 1. Linear sweep.
    let mut instructions = Vec::new();
    let mut addr = entry;
    while addr < extent_end {
        let window = (extent_end - addr).min(4) as usize;
        let bytes = image.read(addr, window).ok_or_else(|| {
            AnalysisError::FunctionUnanalyzable {
                function: name.to_string(),
                address: addr,
            }
        })?;
        let (insn, len) = decode(bytes, addr).map_err(|_| {
            AnalysisError::FunctionUnanalyzable {
                function: name.to_string(),
                address: addr,
            }
        })?;
        if insn == Instruction::StackClobberUnknown {
            return Err(AnalysisError::StackIndeterminate {
                function: name.to_string(),
                reason: format!(
                    "SP overwritten from a register at {addr:#010x}"
                ),
            });
        }
        let terminator = insn.is_terminator();
        instructions.push((addr, insn));
        addr += len as u32;
        if terminator && addr >= extent_end {
            break;
        }
    }

    // 2. Leaders, 3. Blocks + CFG edges.
    let leaders = find_leaders(&instructions, entry, extent_end);
    let blocks = build_blocks(instructions, &leaders, extent_end);

    // 4/5. Depth propagation in address order, then back-edge validation.
    let reachable = reachable_blocks(&blocks, entry);
    let mut entry_depth: BTreeMap<u32, i64> = BTreeMap::new();
    entry_depth.insert(entry, 0);

    let ordered: Vec<u32> = blocks
        .keys()
        .copied()
        .filter(|a| reachable.contains(a))
        .collect();

    for &addr in &ordered {
        let block = &blocks[&addr];
        for edge in &block.edges {
            if let Some(dst) = edge_target(edge) {
                if dst <= addr || !reachable.contains(&dst) {
                    continue; // back edge or out-of-range; handled below
                }
                let candidate =
                    entry_depth.get(&addr).copied().unwrap_or(0)
                        + block.net_delta() as i64;
                let slot = entry_depth.entry(dst).or_insert(candidate);
                *slot = (*slot).max(candidate);
            }
        }
    }

    for &addr in &ordered {
        let block = &blocks[&addr];
        for edge in &block.edges {
            if let Some(dst) = edge_target(edge) {
                if dst > addr || !reachable.contains(&dst) {
                    continue;
                }
                let src_depth = entry_depth.get(&addr).copied().unwrap_or(0);
                let around_loop = src_depth + block.net_delta() as i64;
                let dst_depth = entry_depth.get(&dst).copied().unwrap_or(0);
                if around_loop != dst_depth {
                    return Err(AnalysisError::StackIndeterminate {
                        function: name.to_string(),
                        reason: format!(
                            "loop back-edge at {addr:#010x} does not \
                             restore SP before repeating"
                        ),
                    });
                }
            }
        }
    }

    let prologue_cost = ordered
        .iter()
        .map(|a| {
            let d = entry_depth.get(a).copied().unwrap_or(0);
            d + blocks[a].internal_max() as i64
        })
        .max()
        .unwrap_or(0);

    if prologue_cost < 0 {
        return Err(AnalysisError::StackIndeterminate {
            function: name.to_string(),
            reason: "computed negative prologue cost".into(),
        });
    }

    // 6. Call sites, with depth-at-call computed from the same entry
    // depths plus the running delta up to (and including) the call
    // instruction itself.
    let mut callee_set = Vec::new();
    let mut returns = false;
    for &addr in &ordered {
        let block = &blocks[&addr];
        let base = entry_depth.get(&addr).copied().unwrap_or(0);
        let mut running = 0i64;
        for (iaddr, insn) in &block.instructions {
            running += insn.stack_delta() as i64;
            match insn {
                Instruction::Call { target } => {
                    callee_set.push(CallSite {
                        address: *iaddr,
                        target: CallTarget::Direct(*target),
                        depth_at_call: (base + running).max(0) as u32,
                        is_tail: false,
                    });
                }
                Instruction::IndirectCall => {
                    callee_set.push(CallSite {
                        address: *iaddr,
                        target: CallTarget::Indirect,
                        depth_at_call: (base + running).max(0) as u32,
                        is_tail: false,
                    });
                }
                Instruction::BranchIndirect { .. } => {
                    let depth_at_call = (base + running).max(0) as u32;
                    match resolve_jump_table(image, block) {
                        Some(targets) => {
                            for target in targets {
                                callee_set.push(CallSite {
                                    address: *iaddr,
                                    target: CallTarget::Direct(target),
                                    depth_at_call,
                                    is_tail: true,
                                });
                            }
                        }
                        None => {
                            callee_set.push(CallSite {
                                address: *iaddr,
                                target: CallTarget::Indirect,
                                depth_at_call,
                                is_tail: true,
                            });
                        }
                    }
                }
                _ if insn.is_return() => returns = true,
                _ => {}
            }
        }
    }

    Ok(Function {
        name: name.to_string(),
        entry,
        extent_end,
        blocks,
        prologue_cost: prologue_cost as u32,
        callee_set,
        returns,
    })
}

fn edge_target(edge: &Edge) -> Option<u32> {
    match edge {
        Edge::FallThrough(a) | Edge::Branch(a) | Edge::CallReturn(a) => {
            Some(*a)
        }
        Edge::Terminal => None,
    }
}

fn reachable_blocks(
    blocks: &BTreeMap<u32, BasicBlock>,
    entry: u32,
) -> BTreeSet<u32> {
    let mut seen = BTreeSet::new();
    let mut work = VecDeque::new();
    work.push_back(entry);
    seen.insert(entry);
    while let Some(addr) = work.pop_front() {
        let Some(block) = blocks.get(&addr) else {
            continue;
        };
        for edge in &block.edges {
            if let Some(dst) = edge_target(edge) {
                if blocks.contains_key(&dst) && seen.insert(dst) {
                    work.push_back(dst);
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Image;

    /// Builds a tiny synthetic image with one `.text` section so functions
    /// can be analyzed without a real ELF file on disk.
    fn image_from_text(base: u32, text: &[u8]) -> Image {
        crate::loader::test_support::synthetic_image(base, text)
    }

    #[test]
    fn leaf_function_no_calls() {
        // push {r4,lr}; sub sp,#8; add sp,#8; pop {r4,pc}
        let mut text = Vec::new();
        text.extend_from_slice(&0xB510u16.to_le_bytes()); // push {r4,lr}
        text.extend_from_slice(&0xB082u16.to_le_bytes()); // sub sp,#8
        text.extend_from_slice(&0xB002u16.to_le_bytes()); // add sp,#8
        text.extend_from_slice(&0xBD10u16.to_le_bytes()); // pop {r4,pc}

        let image = image_from_text(0x1000, &text);
        let f = analyze_function(&image, "leaf", 0x1000, text.len() as u32)
            .unwrap();
        assert_eq!(f.prologue_cost, 16);
        assert!(f.returns);
        assert!(f.callee_set.is_empty());
    }

    #[test]
    fn two_level_call_records_depth_at_call() {
        // push {r4,lr}; sub sp,#8; bl +0 (call itself as stand-in target);
        // add sp,#8; pop {r4,pc}
        let mut text = Vec::new();
        text.extend_from_slice(&0xB510u16.to_le_bytes()); // push {r4,lr} (-> +8)
        text.extend_from_slice(&0xB082u16.to_le_bytes()); // sub sp,#8 (-> +8)
        text.extend_from_slice(&0xF000u16.to_le_bytes());
        text.extend_from_slice(&0xF800u16.to_le_bytes()); // bl (offset 0)
        text.extend_from_slice(&0xB002u16.to_le_bytes()); // add sp,#8
        text.extend_from_slice(&0xBD10u16.to_le_bytes()); // pop {r4,pc}

        let image = image_from_text(0x2000, &text);
        let f = analyze_function(&image, "foo", 0x2000, text.len() as u32)
            .unwrap();
        assert_eq!(f.callee_set.len(), 1);
        assert_eq!(f.callee_set[0].depth_at_call, 16);
    }

    #[test]
    fn push_then_sub_in_one_block_sums() {
        let mut text = Vec::new();
        text.extend_from_slice(&0xB5F0u16.to_le_bytes()); // push {r4-r7,lr}: 20
        text.extend_from_slice(&0xB082u16.to_le_bytes()); // sub sp,#8: +8
        text.extend_from_slice(&0x4770u16.to_le_bytes()); // bx lr
        let image = image_from_text(0x3000, &text);
        let f = analyze_function(&image, "g", 0x3000, text.len() as u32)
            .unwrap();
        assert_eq!(f.prologue_cost, 28);
    }

    #[test]
    fn jump_table_idiom_resolves_to_direct_call_sites() {
        // cmp r0,#1; adr r1,table; ldr r2,[r1,r0]; mov pc,r2
        // table: .word case0|1, case1|1
        let mut text = Vec::new();
        text.extend_from_slice(&0x2801u16.to_le_bytes()); // cmp r0,#1
        text.extend_from_slice(&0xA101u16.to_le_bytes()); // adr r1,#4
        text.extend_from_slice(&0x580Au16.to_le_bytes()); // ldr r2,[r1,r0]
        text.extend_from_slice(&0x4697u16.to_le_bytes()); // mov pc,r2
        text.extend_from_slice(&0x2001u32.to_le_bytes()); // table[0] = 0x2000|1
        text.extend_from_slice(&0x3001u32.to_le_bytes()); // table[1] = 0x3000|1

        let image = image_from_text(0x1000, &text);
        let f = analyze_function(&image, "switch_fn", 0x1000, 8).unwrap();

        assert_eq!(f.callee_set.len(), 2);
        let targets: Vec<u32> = f
            .callee_set
            .iter()
            .map(|c| match c.target {
                CallTarget::Direct(t) => t,
                CallTarget::Indirect => panic!("expected resolved target"),
            })
            .collect();
        assert_eq!(targets, vec![0x2000, 0x3000]);
        assert!(f.callee_set.iter().all(|c| c.is_tail));
    }

    #[test]
    fn branch_indirect_without_bound_check_stays_unresolved() {
        // adr r1,table; ldr r2,[r1,r0]; mov pc,r2 — no preceding `cmp`, so
        // there is no sound table-length bound and resolution must not
        // guess one.
        let mut text = Vec::new();
        text.extend_from_slice(&0xA101u16.to_le_bytes()); // adr r1,#4
        text.extend_from_slice(&0x580Au16.to_le_bytes()); // ldr r2,[r1,r0]
        text.extend_from_slice(&0x4697u16.to_le_bytes()); // mov pc,r2
        text.extend_from_slice(&0u16.to_le_bytes()); // padding up to the (aligned) table
        text.extend_from_slice(&0x2001u32.to_le_bytes()); // table[0], never read

        let image = image_from_text(0x1000, &text);
        let f = analyze_function(&image, "switch_fn", 0x1000, 6).unwrap();

        assert_eq!(f.callee_set.len(), 1);
        assert_eq!(f.callee_set[0].target, CallTarget::Indirect);
    }

    #[test]
    fn sp_clobber_is_indeterminate() {
        let mut text = Vec::new();
        text.extend_from_slice(&0xB510u16.to_le_bytes()); // push {r4,lr}
        text.extend_from_slice(&0x468Du16.to_le_bytes()); // mov sp, r1
        text.extend_from_slice(&0x4770u16.to_le_bytes()); // bx lr
        let image = image_from_text(0x4000, &text);
        let err =
            analyze_function(&image, "h", 0x4000, text.len() as u32)
                .unwrap_err();
        assert!(matches!(err, AnalysisError::StackIndeterminate { .. }));
    }
}
