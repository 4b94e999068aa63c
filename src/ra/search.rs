/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Placement search: finding a register window for a value, preferring
//! free space and falling back to live-range splits, budget growth and
//! whole-bank compaction.

use crate::ir::{HwGen, Instruction, Opcode, Program};
use crate::ra::constraints::{subword_def_info, subword_operand_stride};
use crate::ra::copies::{collect_vars, find_vars, place_evicted, PendingCopy};
use crate::ra::file::{Interval, RegisterFile, UnitState};
use crate::ra::RaCtx;
use crate::{PhysReg, RegClass, RegType, Temp, TempId};
use smallvec::SmallVec;

pub(crate) fn align_up(v: u32, a: u32) -> u32 {
    debug_assert!(a.is_power_of_two());
    (v + a - 1) & !(a - 1)
}

/// Unit stride required by a register class on its own.
pub(crate) fn stride_for(rc: RegClass) -> u32 {
    if rc.ty() == RegType::Vgpr {
        return 1;
    }
    let size = rc.size();
    if size == 2 {
        2
    } else if size >= 4 {
        4
    } else {
        1
    }
}

/// Allocatable units of a bank under the current budget.
pub(crate) fn bank_bounds(program: &Program, ty: RegType) -> Interval {
    match ty {
        RegType::Vgpr => Interval::new(PhysReg::VGPR_BASE, program.vgpr_budget as u32),
        RegType::Sgpr => Interval::new(0, program.sgpr_budget as u32),
    }
}

pub(crate) fn adjust_max_used(ctx: &mut RaCtx, program: &Program, rc: RegClass, lo_unit: u32) {
    let size = rc.size();
    if rc.ty() == RegType::Vgpr {
        debug_assert!(lo_unit >= PhysReg::VGPR_BASE);
        let hi = (lo_unit - PhysReg::VGPR_BASE + size - 1) as u16;
        ctx.max_used_vgpr = ctx.max_used_vgpr.max(hi);
    } else if lo_unit + size <= program.sgpr_ceiling as u32 {
        let hi = (lo_unit + size - 1) as u16;
        ctx.max_used_sgpr = ctx.max_used_sgpr.max(hi.min(program.sgpr_ceiling));
    }
}

/// A placement request: effective class, width in units, stride (bytes
/// for sub-dword classes, units otherwise) and the bank interval to
/// search.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SlotRequest {
    pub rc: RegClass,
    pub size: u32,
    pub stride: u32,
    pub bounds: Interval,
}

impl SlotRequest {
    pub fn new(
        program: &Program,
        instr: &Instruction,
        rc: RegClass,
        operand: Option<usize>,
    ) -> Self {
        let mut rc = rc;
        let mut size = rc.size();
        let mut stride = stride_for(rc);
        let bounds = bank_bounds(program, rc.ty());

        if rc.is_subdword() {
            if let Some(idx) = operand {
                stride = subword_operand_stride(program.hw.gen, instr, idx, rc);
            } else {
                let (def_stride, bytes_written) = subword_def_info(program, instr, rc);
                stride = def_stride;
                if bytes_written > rc.bytes() {
                    // The result clobbers more than the value's width:
                    // allocate the wider region.
                    rc = RegClass::get(rc.ty(), bytes_written);
                    size = rc.size();
                    stride = align_up(stride, bytes_written);
                    if !rc.is_subdword() {
                        stride = (stride + 3) / 4;
                    }
                }
                debug_assert!(stride > 0);
            }
        }
        SlotRequest {
            rc,
            size,
            stride,
            bounds,
        }
    }

    /// For values placed outside any instruction context (evictions,
    /// compaction).
    pub fn standalone(program: &Program, rc: RegClass) -> Self {
        let dummy = Instruction::new(
            Opcode::ParallelCopy,
            SmallVec::new(),
            SmallVec::new(),
        );
        SlotRequest::new(program, &dummy, rc, None)
    }
}

/// Search for a free window, without any copies. Tries power-of-two
/// stride promotion first to keep large values aligned, then a best-fit
/// gap scan for unit-stride requests or a strided window scan, and
/// finally byte packing into partially used units for sub-dword
/// requests.
pub(crate) fn find_free(
    ctx: &mut RaCtx,
    program: &Program,
    file: &RegisterFile,
    req: SlotRequest,
) -> Option<PhysReg> {
    let bounds = req.bounds;
    let size = req.size;
    let stride = if req.rc.is_subdword() {
        (req.stride + 3) / 4
    } else {
        req.stride
    };
    let rc = req.rc;

    let mut promoted = req;
    promoted.rc = RegClass::get(rc.ty(), size * 4);
    let mut new_stride = 16;
    while new_stride > stride {
        if size % new_stride == 0 {
            promoted.stride = new_stride;
            if let Some(reg) = find_free(ctx, program, file, promoted) {
                return Some(reg);
            }
        }
        new_stride /= 2;
    }

    let is_free = |u: u32| file.unit_is_free(u) && !ctx.war_hint[u as usize];

    if stride == 1 {
        // Best fit: the smallest gap the value fits in. The scan stops
        // at the high-water mark; everything beyond is one big gap.
        let max_gpr = match rc.ty() {
            RegType::Vgpr => PhysReg::VGPR_BASE + ctx.max_used_vgpr as u32,
            RegType::Sgpr => ctx.max_used_sgpr as u32,
        };
        let scan_end = bounds.hi().min((max_gpr + 1).max(bounds.lo));

        let mut best_gap: Option<Interval> = None;
        let mut u = bounds.lo;
        while u < bounds.hi() {
            let mut lo = u;
            while lo < scan_end && !is_free(lo) {
                lo += 1;
            }
            if lo >= bounds.hi() {
                break;
            }
            let mut hi = lo;
            while hi < scan_end && is_free(hi) {
                hi += 1;
            }
            if hi == scan_end {
                hi = bounds.hi();
            }
            let gap = Interval::new(lo, hi - lo);

            if size == gap.size {
                adjust_max_used(ctx, program, rc, gap.lo);
                return Some(PhysReg::unit_reg(gap.lo));
            }
            if size < gap.size && best_gap.map_or(true, |b| gap.size < b.size) {
                best_gap = Some(gap);
            }
            u = hi;
        }

        if let Some(mut best_gap) = best_gap {
            // Prefer ending the value at an aligned boundary: the space
            // left in front is more useful to strided values.
            let buffer = best_gap.size - size;
            if buffer > 1 {
                let lo = best_gap.lo;
                if ((lo + size) % 8 != 0 && (lo + buffer) % 8 == 0)
                    || ((lo + size) % 4 != 0 && (lo + buffer) % 4 == 0)
                    || ((lo + size) % 2 != 0 && (lo + buffer) % 2 == 0)
                {
                    best_gap = Interval::new(lo + buffer, size);
                }
            }

            adjust_max_used(ctx, program, rc, best_gap.lo);
            return Some(PhysReg::unit_reg(best_gap.lo));
        }
    } else {
        let mut lo = bounds.lo;
        while lo + size <= bounds.hi() {
            if file.unit_is_free(lo) && (lo + 1..lo + size).all(is_free) {
                adjust_max_used(ctx, program, rc, lo);
                return Some(PhysReg::unit_reg(lo));
            }
            lo += stride;
        }
    }

    // Packing into the upper bytes of a unit can force larger
    // encodings, so try it last.
    if rc.is_subdword() {
        for u in bounds.units() {
            let slots = match file.unit(u) {
                UnitState::Subword(slots) => slots,
                _ => continue,
            };
            let mut i = 0;
            while i < 4 {
                let end = core::cmp::min(4, i + rc.bytes());
                let mut found = (i..end)
                    .all(|k| slots[k as usize] == crate::ra::file::SubSlot::Free);
                if found && i + rc.bytes() > 4 {
                    found = u + 1 < crate::ra::file::FILE_UNITS && file.unit_is_free(u + 1);
                }
                if found {
                    adjust_max_used(ctx, program, rc, u);
                    return Some(PhysReg::unit_reg(u).advance(i as i32));
                }
                i += req.stride;
            }
        }
    }

    None
}

/// Search with live-range splits: slide a window over the bank, cost
/// each position by the registers that would have to move, and evict
/// the occupants of the best window via parallel copies.
pub(crate) fn find_with_evictions(
    program: &mut Program,
    ctx: &mut RaCtx,
    file: &RegisterFile,
    copies: &mut Vec<PendingCopy>,
    req: SlotRequest,
    instr: &Instruction,
) -> Option<PhysReg> {
    let bounds = req.bounds;
    let size = req.size;
    let stride = req.stride.max(1);
    let rc = req.rc;

    let regs_free = file.count_free(bounds);

    // Killed operands can be overwritten by the definition; their units
    // don't cost a move.
    let mut killed_ops = 0u32;
    let mut is_killed_unit = vec![false; crate::ra::file::FILE_UNITS as usize];
    if !instr.is_phi() {
        for op in &instr.operands {
            if op.is_temp()
                && op.is_first_kill_before_def()
                && bounds.contains_unit(op.preg().unit())
                && !file.test(
                    PhysReg::unit_reg(op.preg().unit()),
                    align_up(op.bytes() + op.preg().byte(), 4),
                )
            {
                debug_assert!(op.is_fixed());
                for i in 0..op.size() {
                    is_killed_unit[(op.preg().unit() + i) as usize] = true;
                }
                killed_ops += op.get_temp().size();
            }
        }
    }

    debug_assert!(regs_free >= size);
    let op_moves = size.saturating_sub(regs_free - killed_ops);

    let mut best_win: Option<Interval> = None;
    let mut num_moves = 0xFFu32;
    let mut num_vars = 0u32;

    let mut lo = bounds.lo;
    while lo + size <= bounds.hi() {
        let win = Interval::new(lo, size);
        lo += stride;

        // Windows may not start or end inside an allocated variable.
        if win.lo > bounds.lo
            && !file.is_empty_or_blocked(PhysReg::unit_reg(win.lo))
            && file.occupant(PhysReg::unit_reg(win.lo))
                == file.occupant(PhysReg::unit_reg(win.lo).advance(-1))
        {
            continue;
        }
        if win.hi() < bounds.hi()
            && !file.is_empty_or_blocked(PhysReg::unit_reg(win.hi()).advance(-1))
            && file.occupant(PhysReg::unit_reg(win.hi()).advance(-1))
                == file.occupant(PhysReg::unit_reg(win.hi()))
        {
            continue;
        }

        let mut k = op_moves;
        let mut n = 0u32;
        let mut remaining_op_moves = op_moves;
        let mut last_var: Option<TempId> = None;
        let mut found = true;
        let aligned = rc == RegClass::vgpr(4) && win.lo % 4 == 0;
        for j in win.units() {
            // Dead operands effectively reduce the number of moves.
            if is_killed_unit[j as usize] {
                if remaining_op_moves > 0 {
                    k -= 1;
                    remaining_op_moves -= 1;
                }
                continue;
            }
            match file.unit(j) {
                UnitState::Free => continue,
                UnitState::Blocked => {
                    found = false;
                    break;
                }
                UnitState::Subword(_) => {
                    k += 1;
                    n += 1;
                    continue;
                }
                UnitState::Owned(id) => {
                    if Some(id) == last_var {
                        continue;
                    }
                    let var_rc = ctx.assignments[id.index()].rc;
                    // Evicting something at least as large as the
                    // request would just move the problem.
                    if var_rc.size() >= size {
                        found = false;
                        break;
                    }
                    // Linear vgprs may never be live-range split.
                    if var_rc.is_linear_vgpr() {
                        found = false;
                        break;
                    }
                    k += var_rc.size();
                    n += 1;
                    last_var = Some(id);
                }
            }
        }

        if !found || k > num_moves {
            continue;
        }
        if k == num_moves && n < num_vars {
            continue;
        }
        if !aligned && k == num_moves && n == num_vars {
            continue;
        }

        best_win = Some(win);
        num_moves = k;
        num_vars = n;
    }

    let best_win = best_win?;

    let mut tmp_file = file.clone();
    let mut vars = collect_vars(ctx, &mut tmp_file, best_win);

    if instr.opcode == Opcode::CreateVector {
        // Move killed operands that aren't at their lane position yet
        // (cheap swaps from GFX9 on) or that sit inside the window.
        let mut reg = PhysReg::unit_reg(best_win.lo);
        for op in &instr.operands {
            if op.is_temp() && op.is_first_kill_before_def() && op.get_temp().ty() == rc.ty() {
                let overlaps = op.preg().advance(op.bytes() as i32).byte_addr()
                    > best_win.lo * 4
                    && op.preg().byte_addr() < best_win.hi() * 4;
                if op.preg() != reg && (program.hw.gen >= HwGen::Gfx9 || overlaps) {
                    vars.insert((op.bytes(), op.temp_id()));
                    tmp_file.clear_op(op);
                } else {
                    tmp_file.fill_op(op);
                }
            }
            reg = reg.advance(op.bytes() as i32);
        }
    } else if !instr.is_phi() {
        for op in &instr.operands {
            if op.is_temp() && op.is_first_kill_before_def() {
                tmp_file.fill_op(op);
            }
        }
    }

    let mut pc = Vec::new();
    if !place_evicted(program, ctx, &mut tmp_file, &mut pc, vars, bounds, instr, best_win) {
        return None;
    }
    copies.extend(pc);

    adjust_max_used(ctx, program, rc, best_win.lo);
    Some(PhysReg::unit_reg(best_win.lo))
}

/// Validate a specific register for `rc` in the context of `instr`.
pub(crate) fn try_fixed(
    ctx: &mut RaCtx,
    program: &Program,
    file: &RegisterFile,
    rc: RegClass,
    instr: &Instruction,
    reg: PhysReg,
) -> bool {
    let sdw_info = if rc.is_subdword() {
        Some(subword_def_info(program, instr, rc))
    } else {
        None
    };

    if let Some((stride, _)) = sdw_info {
        if reg.byte() % stride != 0 {
            return false;
        }
    } else if reg.byte() != 0 {
        return false;
    }

    if rc.ty() == RegType::Sgpr && reg.unit() % stride_for(rc) != 0 {
        return false;
    }

    let win = Interval::new(reg.unit(), rc.size());
    let bounds = bank_bounds(program, rc.ty());
    // vcc lives outside the allocatable bounds but is a legal home for
    // two-unit scalars.
    let vcc_win = Interval::new(PhysReg::VCC.unit(), 2);
    let is_vcc = rc.ty() == RegType::Sgpr && vcc_win.contains(win);
    if !bounds.contains(win) && !is_vcc {
        return false;
    }

    if let Some((_, bytes_written)) = sdw_info {
        let test_reg = PhysReg::from_byte_addr(reg.byte_addr() & !(bytes_written - 1));
        if file.test(test_reg, bytes_written) {
            return false;
        }
    } else if file.test(reg, rc.bytes()) {
        return false;
    }

    adjust_max_used(ctx, program, rc, win.lo);
    true
}

/// Raise the bank budget by one register if the per-wave ceiling
/// allows.
pub(crate) fn grow_budget(program: &mut Program, ty: RegType) -> bool {
    match ty {
        RegType::Vgpr if program.vgpr_budget < program.vgpr_ceiling => {
            program.vgpr_budget += 1;
            true
        }
        RegType::Sgpr if program.sgpr_budget < program.sgpr_ceiling => {
            program.sgpr_budget += 1;
            true
        }
        _ => false,
    }
}

pub(crate) struct CompactVar {
    /// `None` reserves space (for killed operands and definitions)
    /// instead of moving a value.
    pub id: Option<TempId>,
    pub rc: RegClass,
}

/// Relocate `vars` tightly from `start` upward, emitting copies for
/// every variable that moves. Returns the register reserved for the
/// `None` sentinel, if present.
///
/// Sort order: descending byte stride, then the sentinel, then current
/// register. Placing the sentinel first among equal strides is
/// arbitrary but must stay stable: the chosen space ends up in emitted
/// copies.
pub(crate) fn compact_bank(
    program: &Program,
    ctx: &RaCtx,
    vars: Vec<CompactVar>,
    copies: &mut Vec<PendingCopy>,
    start: PhysReg,
) -> Option<PhysReg> {
    struct Entry {
        id: Option<TempId>,
        rc: RegClass,
        stride_bytes: u32,
    }
    let mut sorted: Vec<Entry> = vars
        .into_iter()
        .map(|v| {
            let req = SlotRequest::standalone(program, v.rc);
            let stride_bytes = req.stride * if req.rc.is_subdword() { 1 } else { 4 };
            Entry {
                id: v.id,
                rc: req.rc,
                stride_bytes,
            }
        })
        .collect();
    sorted.sort_by(|a, b| {
        b.stride_bytes
            .cmp(&a.stride_bytes)
            .then_with(|| match (a.id, b.id) {
                (None, _) => core::cmp::Ordering::Less,
                (_, None) => core::cmp::Ordering::Greater,
                (Some(a_id), Some(b_id)) => ctx.assignments[a_id.index()]
                    .reg
                    .cmp(&ctx.assignments[b_id.index()].reg),
            })
    });

    let mut next_reg = start;
    let mut space_reg = None;
    for var in &sorted {
        next_reg = PhysReg::from_byte_addr(align_up(
            next_reg.byte_addr(),
            var.stride_bytes.max(4),
        ));

        match var.id {
            Some(id) => {
                let cur = &ctx.assignments[id.index()];
                if next_reg != cur.reg {
                    let rc = cur.rc;
                    let mut src = crate::Operand::new(Temp::new(id, rc));
                    src.set_fixed(cur.reg);
                    copies.push(PendingCopy {
                        src,
                        dst_reg: next_reg,
                        dst_rc: rc,
                        dst: None,
                    });
                }
            }
            None => space_reg = Some(next_reg),
        }

        next_reg = next_reg.advance((var.rc.size() * 4) as i32);
    }

    space_reg
}

fn mimg_chain_intact(ctx: &RaCtx, file: &RegisterFile, ops: &[(Option<Temp>, u32)]) -> bool {
    let mut first: Option<PhysReg> = None;
    for (i, (temp, _)) in ops.iter().enumerate() {
        let i = i as u32;
        let assigned = temp
            .filter(|t| ctx.assignments[t.id().index()].assigned)
            .map(|t| ctx.assignments[t.id().index()].reg);
        if let Some(reg) = assigned {
            if let Some(f) = first {
                if reg != f.advance((i * 4) as i32) {
                    return false;
                }
            }
            if reg.unit() - PhysReg::VGPR_BASE < i {
                return false;
            }
            first = Some(reg.advance(-((i * 4) as i32)));
        } else if let Some(f) = first {
            // An unexpected occupant means this chain won't line up.
            let occ = file.occupant(f.advance((i * 4) as i32));
            if occ.is_some() && occ != temp.map(|t| t.id()) {
                return false;
            }
        }
    }
    true
}

/// Find a register for `temp`. Tries, in order: split-vector and
/// direct affinities, co-allocation next to already-placed vector
/// lanes, the free search, the eviction search, budget growth, and
/// finally whole-bank compaction.
pub(crate) fn get_reg(
    program: &mut Program,
    ctx: &mut RaCtx,
    file: &RegisterFile,
    temp: Temp,
    copies: &mut Vec<PendingCopy>,
    instr: &Instruction,
    operand_index: Option<usize>,
) -> PhysReg {
    if let Some(hint) = ctx.split_vectors.get(&temp.id()).cloned() {
        let mut offset = 0i32;
        for (def_id, def_bytes) in &hint.defs {
            if let Some(&aff) = ctx.affinities.get(def_id) {
                if ctx.assignments[aff.index()].assigned {
                    let reg = ctx.assignments[aff.index()].reg.advance(-offset);
                    if try_fixed(ctx, program, file, temp.rc(), instr, reg) {
                        return reg;
                    }
                }
            }
            offset += *def_bytes as i32;
        }
    }

    if let Some(&aff) = ctx.affinities.get(&temp.id()) {
        if ctx.assignments[aff.index()].assigned {
            let reg = ctx.assignments[aff.index()].reg;
            if try_fixed(ctx, program, file, temp.rc(), instr, reg) {
                return reg;
            }
        }
    }

    if let Some(hint) = ctx.vectors.get(&temp.id()).cloned() {
        let mut byte_offset = 0u32;
        for (t, bytes) in &hint.ops {
            if t.map(|t| t.id()) == Some(temp.id()) {
                break;
            }
            byte_offset += bytes;
        }

        if !hint.mimg || mimg_chain_intact(ctx, file, &hint.ops) {
            let mut k = 0u32;
            for (t, bytes) in &hint.ops {
                if let Some(t) = t {
                    if t.id() != temp.id()
                        && t.ty() == temp.ty()
                        && ctx.assignments[t.id().index()].assigned
                    {
                        let reg = ctx.assignments[t.id().index()]
                            .reg
                            .advance(byte_offset as i32 - k as i32);
                        if try_fixed(ctx, program, file, temp.rc(), instr, reg) {
                            return reg;
                        }
                    }
                }
                k += bytes;
            }

            // Try to place the whole future vector contiguously and
            // put this value at its lane offset.
            let vec_rc = RegClass::get(temp.ty(), k);
            let req = SlotRequest::standalone(program, vec_rc);
            if let Some(reg) = find_free(ctx, program, file, req) {
                let reg = reg.advance(byte_offset as i32);
                if try_fixed(ctx, program, file, temp.rc(), instr, reg) {
                    return reg;
                }
            }
        }
    }

    let req = SlotRequest::new(program, instr, temp.rc(), operand_index);

    if !ctx.policy.skip_free_search {
        if let Some(reg) = find_free(ctx, program, file, req) {
            return reg;
        }
    }

    if let Some(reg) = find_with_evictions(program, ctx, file, copies, req, instr) {
        return reg;
    }

    // Failure here means staying under the limit would take too many
    // moves, not that space is lacking.
    debug_assert!(file.count_free(req.bounds) >= req.size);

    if !grow_budget(program, req.rc.ty()) {
        // Fallback: compact the whole bank, reserving room for this
        // definition, the other definitions and the killed operands.
        let ty = req.rc.ty();
        let mut def_size = req.rc.size();
        for def in &instr.definitions {
            if ctx.assignments[def.temp_id().index()].assigned && def.rc().ty() == ty {
                def_size += def.rc().size();
            }
        }

        let mut killed_op_size = 0;
        for op in &instr.operands {
            if op.is_temp() && op.is_kill_before_def() && op.rc().ty() == ty {
                killed_op_size += op.rc().size();
            }
        }

        let regs = bank_bounds(program, ty);

        let mut vars: Vec<CompactVar> = find_vars(ctx, file, regs)
            .into_iter()
            .map(|(_, id)| CompactVar {
                id: Some(id),
                rc: ctx.assignments[id.index()].rc,
            })
            .collect();
        vars.push(CompactVar {
            id: None,
            rc: RegClass::get(ty, def_size.max(killed_op_size) * 4),
        });

        let space = compact_bank(program, ctx, vars, copies, PhysReg::unit_reg(regs.lo))
            .expect("compaction sentinel");

        let killed_op_vars: Vec<CompactVar> = instr
            .operands
            .iter()
            .filter(|op| op.is_temp() && op.is_kill_before_def() && op.rc().ty() == ty)
            .map(|op| CompactVar {
                id: Some(op.temp_id()),
                rc: op.rc(),
            })
            .collect();
        compact_bank(program, ctx, killed_op_vars, copies, space);

        let mut def_vars: Vec<CompactVar> = instr
            .definitions
            .iter()
            .filter(|def| ctx.assignments[def.temp_id().index()].assigned && def.rc().ty() == ty)
            .map(|def| CompactVar {
                id: Some(def.temp_id()),
                rc: def.rc(),
            })
            .collect();
        def_vars.push(CompactVar {
            id: None,
            rc: req.rc,
        });
        return compact_bank(program, ctx, def_vars, copies, space)
            .expect("compaction sentinel");
    }

    get_reg(program, ctx, file, temp, copies, instr, operand_index)
}

/// Find a register for a vector-building definition: prefer positions
/// where dying operands already sit in their lanes, costing each
/// candidate by the bytes that would still have to move.
pub(crate) fn get_reg_create_vector(
    program: &mut Program,
    ctx: &mut RaCtx,
    file: &RegisterFile,
    temp: Temp,
    copies: &mut Vec<PendingCopy>,
    instr: &Instruction,
) -> PhysReg {
    let rc = temp.rc();
    let size = rc.size();
    let bytes = rc.bytes();
    let stride = stride_for(rc);
    let bounds = bank_bounds(program, rc.ty());

    let mut best_pos: Option<u32> = None;
    let mut num_moves = 0xFFu32;
    let mut best_war_hint = true;

    let mut offset = 0u32;
    for i in 0..instr.operands.len() {
        let this_offset = offset;
        offset += instr.operands[i].bytes();
        let op = &instr.operands[i];
        if !op.is_temp() || !op.is_kill_before_def() || op.get_temp().ty() != rc.ty() {
            continue;
        }

        if this_offset > op.preg().byte_addr() {
            continue;
        }
        let reg_lower = op.preg().byte_addr() - this_offset;
        if reg_lower % 4 != 0 {
            continue;
        }
        let win = Interval::new(reg_lower / 4, size);

        if Some(win.lo) == best_pos {
            continue;
        }
        if !bounds.contains(win) || win.lo % stride != 0 {
            continue;
        }
        if win.lo > bounds.lo
            && !file.unit_is_free(win.lo)
            && file.occupant(PhysReg::unit_reg(win.lo))
                == file.occupant(PhysReg::unit_reg(win.lo).advance(-1))
        {
            continue;
        }
        if win.hi() < bounds.hi()
            && !file.unit_is_free(win.hi() - 1)
            && file.occupant(PhysReg::unit_reg(win.hi()).advance(-1))
                == file.occupant(PhysReg::unit_reg(win.hi()))
        {
            continue;
        }

        let mut k = 0u32;
        let mut war_hint = false;
        let mut linear_vgpr = false;
        for j in win.units() {
            if linear_vgpr {
                break;
            }
            match file.unit(j) {
                UnitState::Free => {}
                UnitState::Subword(_) => {
                    let bytes_left = bytes - (j - win.lo) * 4;
                    for byte_idx in 0..core::cmp::min(bytes_left, 4) {
                        if file.test(PhysReg::from_byte_addr(j * 4 + byte_idx), 1) {
                            k += 1;
                        }
                    }
                }
                UnitState::Blocked => k += 4,
                UnitState::Owned(id) => {
                    k += 4;
                    if ctx.assignments[id.index()].rc.is_linear_vgpr() {
                        linear_vgpr = true;
                    }
                }
            }
            war_hint |= ctx.war_hint[j as usize];
        }
        if linear_vgpr || (war_hint && !best_war_hint) {
            continue;
        }

        let mut offset2 = 0u32;
        for j in 0..instr.operands.len() {
            let o2 = offset2;
            offset2 += instr.operands[j].bytes();
            let opj = &instr.operands[j];
            if j == i || !opj.is_temp() || opj.get_temp().ty() != rc.ty() {
                continue;
            }
            if opj.preg().byte_addr() != win.lo * 4 + o2 {
                k += opj.bytes();
            }
        }

        let aligned = rc == RegClass::vgpr(4) && win.lo % 4 == 0;
        if k > num_moves || (!aligned && k == num_moves) {
            continue;
        }

        best_pos = Some(win.lo);
        num_moves = k;
        best_war_hint = war_hint;
    }

    let best_pos = match best_pos {
        Some(pos) if num_moves < bytes => pos,
        _ => return get_reg(program, ctx, file, temp, copies, instr, None),
    };

    // Refill killed operands that sit in the wrong lane; they must be
    // accounted as occupants to be moved.
    let mut tmp_file = file.clone();
    let mut off = 0u32;
    for op in &instr.operands {
        let o = off;
        off += op.bytes();
        if op.is_temp()
            && op.is_first_kill_before_def()
            && op.preg().byte_addr() != best_pos * 4 + o
        {
            tmp_file.fill_op(op);
        }
    }

    let win = Interval::new(best_pos, size);
    let mut vars = collect_vars(ctx, &mut tmp_file, win);

    let mut off = 0u32;
    for op in &instr.operands {
        let o = off;
        off += op.bytes();
        if !op.is_temp() || !op.is_first_kill_before_def() || op.get_temp().ty() != rc.ty() {
            continue;
        }
        let correct_pos = op.preg().byte_addr() == best_pos * 4 + o;
        // From GFX9 on, misplaced dying lanes are moved too: swaps are
        // cheap there.
        if program.hw.gen >= HwGen::Gfx9 && !correct_pos {
            vars.insert((op.bytes(), op.temp_id()));
            tmp_file.clear_op(op);
        } else if correct_pos {
            tmp_file.fill_op(op);
        }
    }

    let mut pc = Vec::new();
    if !place_evicted(program, ctx, &mut tmp_file, &mut pc, vars, bounds, instr, win) {
        if !grow_budget(program, temp.ty()) {
            return get_reg(program, ctx, file, temp, copies, instr, None);
        }
        return get_reg_create_vector(program, ctx, file, temp, copies, instr);
    }

    copies.extend(pc);
    adjust_max_used(ctx, program, rc, best_pos);
    PhysReg::unit_reg(best_pos)
}
