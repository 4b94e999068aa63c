/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Live-range splitting: evicting values out of a claimed window,
//! naming the resulting parallel copies and renaming their uses.

use crate::ir::{Instruction, Opcode, Program};
use crate::ra::file::{Interval, RegisterFile, SubSlot, UnitState};
use crate::ra::search::{adjust_max_used, align_up, find_free, SlotRequest};
use crate::ra::{Assignment, RaCtx};
use crate::{Operand, PhysReg, Temp, TempId};
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// One entry of the parallel copy being assembled for an instruction.
/// `dst` stays `None` until [`apply_copies`] allocates a fresh value
/// for the destination.
#[derive(Clone, Debug)]
pub(crate) struct PendingCopy {
    pub src: Operand,
    pub dst_reg: PhysReg,
    pub dst_rc: crate::RegClass,
    pub dst: Option<Temp>,
}

impl PendingCopy {
    pub fn evict(ctx: &RaCtx, id: TempId, dst_reg: PhysReg) -> Self {
        let rc = ctx.assignments[id.index()].rc;
        let mut src = Operand::new(Temp::new(id, rc));
        src.set_fixed(ctx.assignments[id.index()].reg);
        PendingCopy {
            src,
            dst_reg,
            dst_rc: rc,
            dst: None,
        }
    }
}

/// The variables occupying an interval, ordered by (bytes, id).
pub(crate) fn find_vars(
    ctx: &RaCtx,
    file: &RegisterFile,
    iv: Interval,
) -> BTreeSet<(u32, TempId)> {
    let mut vars = BTreeSet::new();
    for u in iv.units() {
        if file.is_blocked(PhysReg::unit_reg(u)) {
            continue;
        }
        match file.unit(u) {
            UnitState::Subword(slots) => {
                for slot in &slots {
                    if let SubSlot::Owned(id) = *slot {
                        vars.insert((ctx.assignments[id.index()].rc.bytes(), id));
                    }
                }
            }
            UnitState::Owned(id) => {
                vars.insert((ctx.assignments[id.index()].rc.bytes(), id));
            }
            _ => {}
        }
    }
    vars
}

/// Like [`find_vars`], but also clears the found variables out of the
/// file.
pub(crate) fn collect_vars(
    ctx: &RaCtx,
    file: &mut RegisterFile,
    iv: Interval,
) -> BTreeSet<(u32, TempId)> {
    let vars = find_vars(ctx, file, iv);
    for &(_, id) in &vars {
        let var = &ctx.assignments[id.index()];
        file.clear(var.reg, var.rc);
    }
    vars
}

/// Find new homes for evicted variables and queue the copies moving
/// them there. Variables whose new window is itself occupied push their
/// occupants onto the worklist; largest variables are placed first.
/// Placed windows are blocked in `file`, not filled: callers decide
/// what ends up live there.
///
/// Returns false when some variable cannot be placed within `bounds`.
pub(crate) fn place_evicted(
    program: &Program,
    ctx: &mut RaCtx,
    file: &mut RegisterFile,
    copies: &mut Vec<PendingCopy>,
    vars: BTreeSet<(u32, TempId)>,
    bounds: Interval,
    instr: &Instruction,
    def_win: Interval,
) -> bool {
    let dummy = Instruction::new(Opcode::ParallelCopy, SmallVec::new(), SmallVec::new());
    let mut worklist = vars;
    while let Some(&entry) = worklist.iter().next_back() {
        worklist.remove(&entry);
        let (_, id) = entry;
        let var_rc = ctx.assignments[id.index()].rc;
        let var_reg = ctx.assignments[id.index()].reg;
        let mut req = SlotRequest::new(program, &dummy, var_rc, None);
        let size = req.size;

        // A dead operand's space can be reused by the definition; it
        // also supplies the correct sub-dword stride.
        let mut is_dead_operand = false;
        if !instr.is_phi() {
            for (i, op) in instr.operands.iter().enumerate() {
                if op.is_temp() && op.temp_id() == id {
                    if op.is_kill_before_def() {
                        is_dead_operand = true;
                    }
                    req = SlotRequest::new(program, instr, var_rc, Some(i));
                    break;
                }
            }
        }

        let mut res: Option<PhysReg> = None;
        if is_dead_operand {
            if instr.opcode == Opcode::CreateVector {
                // Lane position inside the result vector.
                let mut reg = PhysReg::unit_reg(def_win.lo);
                for op in &instr.operands {
                    if op.is_temp() && op.temp_id() == id {
                        let fits = (!var_rc.is_subdword() || reg.byte() % req.stride == 0)
                            && !file.test(reg, var_rc.bytes());
                        if fits {
                            res = Some(reg);
                        }
                        break;
                    }
                    reg = reg.advance(op.bytes() as i32);
                }
                if res.is_none() && !file.test(var_reg, var_rc.bytes()) {
                    res = Some(var_reg);
                }
            } else {
                req.bounds = def_win;
                res = find_free(ctx, program, file, req);
            }
        } else {
            // Within the bounds but outside of the definition: first
            // below it, then above it.
            let below_hi = def_win.lo.min(bounds.hi());
            req.bounds = Interval::new(bounds.lo, below_hi.saturating_sub(bounds.lo));
            res = find_free(ctx, program, file, req);
            if res.is_none() && def_win.hi() <= bounds.hi() {
                let lo = align_up(def_win.hi(), req.stride.max(1));
                req.bounds = Interval::new(lo, bounds.hi().saturating_sub(lo));
                res = find_free(ctx, program, file, req);
            }
        }

        if let Some(reg) = res {
            file.block(reg, var_rc);
            copies.push(PendingCopy::evict(ctx, id, reg));
            continue;
        }

        // No free space: slide a window over the bounds and cost each
        // position by the occupants that would have to move in turn.
        let mut best_pos: Option<u32> = None;
        let mut num_moves = 0xFFu32;
        let mut num_vars = 0u32;
        let stride = if var_rc.is_subdword() { 1 } else { req.stride };
        let mut lo = bounds.lo;
        while lo + size <= bounds.hi() {
            let win = Interval::new(lo, size);
            lo += stride;
            if !is_dead_operand && win.intersects(def_win) {
                continue;
            }

            let mut k = 0u32;
            let mut n = 0u32;
            let mut last_var: Option<TempId> = None;
            let mut found = true;
            for j in win.units() {
                match file.unit(j) {
                    UnitState::Free => continue,
                    UnitState::Blocked => {
                        found = false;
                        break;
                    }
                    UnitState::Subword(slots) => {
                        if slots.contains(&SubSlot::Blocked) || k > num_moves {
                            found = false;
                            break;
                        }
                        k += 1;
                        n += 1;
                    }
                    UnitState::Owned(vid) => {
                        if Some(vid) == last_var {
                            continue;
                        }
                        if k > num_moves {
                            found = false;
                            break;
                        }
                        let vrc = ctx.assignments[vid.index()].rc;
                        if vrc.is_linear_vgpr() {
                            found = false;
                            break;
                        }
                        let is_kill = instr.operands.iter().any(|op| {
                            op.is_temp() && op.is_kill_before_def() && op.temp_id() == vid
                        });
                        // Evicting a live occupant at least this large
                        // would never terminate.
                        if !is_kill && vrc.size() >= size {
                            found = false;
                            break;
                        }
                        k += vrc.size();
                        last_var = Some(vid);
                        n += 1;
                        if k > num_moves || (k == num_moves && n <= num_vars) {
                            found = false;
                            break;
                        }
                    }
                }
            }

            if found {
                best_pos = Some(win.lo);
                num_moves = k;
                num_vars = n;
            }
        }

        let best_pos = match best_pos {
            Some(pos) => pos,
            None => return false,
        };

        let win = Interval::new(best_pos, size);
        let displaced = collect_vars(ctx, file, win);
        file.block(PhysReg::unit_reg(win.lo), var_rc);
        adjust_max_used(ctx, program, var_rc, win.lo);
        worklist.extend(displaced);

        copies.push(PendingCopy::evict(ctx, id, PhysReg::unit_reg(win.lo)));
    }
    true
}

/// Name the unnamed copies in `copies`: clear their sources out of the
/// file, allocate a fresh value per destination, rename matching
/// operands of `instr` and fill the destinations back in.
///
/// With `rename_not_killed_ops` unset, operands that are killed after
/// the definition keep their old name when the copy doesn't overlap any
/// copy destination; they only gain kill flags.
pub(crate) fn apply_copies(
    program: &mut Program,
    ctx: &mut RaCtx,
    file: &mut RegisterFile,
    copies: &mut Vec<PendingCopy>,
    instr: &mut Instruction,
    rename_not_killed_ops: bool,
) {
    for copy in copies.iter() {
        if copy.dst.is_some() {
            continue;
        }
        file.clear_op(&copy.src);
    }

    for i in 0..copies.len() {
        if copies[i].dst.is_some() {
            continue;
        }

        // The source may itself be the destination of an already named
        // copy; read it from that copy's origin instead.
        for j in 0..copies.len() {
            if let Some(dst) = copies[j].dst {
                if copies[i].src.is_temp() && copies[i].src.get_temp() == dst {
                    let (t, r) = (copies[j].src.get_temp(), copies[j].src.preg());
                    copies[i].src.set_temp(t);
                    copies[i].src.set_fixed(r);
                }
            }
        }

        let new_temp = program.allocate_temp(copies[i].dst_rc);
        ctx.assignments.push(Assignment {
            reg: copies[i].dst_reg,
            rc: copies[i].dst_rc,
            assigned: true,
        });
        debug_assert_eq!(ctx.assignments.len(), program.temp_count());
        copies[i].dst = Some(new_temp);

        let src_id = copies[i].src.temp_id();
        let src_reg = copies[i].src.preg();
        let src_size = copies[i].src.size();
        let dst_reg = copies[i].dst_reg;

        let mut first = true;
        let mut fill = true;
        for op in instr.operands.iter_mut() {
            if !op.is_temp() || op.temp_id() != src_id {
                continue;
            }
            let mut omit_renaming = !rename_not_killed_ops && !op.is_kill_before_def();
            for pc in copies.iter() {
                let def_unit = pc.dst_reg.unit();
                omit_renaming &= if pc.dst_reg > src_reg {
                    src_reg.unit() + src_size <= def_unit
                } else {
                    def_unit + pc.dst_rc.size() <= src_reg.unit()
                };
            }
            if omit_renaming {
                if first {
                    op.set_first_kill(true);
                } else {
                    op.set_kill(true);
                }
                first = false;
                continue;
            }
            op.set_temp(new_temp);
            op.set_fixed(dst_reg);
            fill = !op.is_kill_before_def();
        }

        if fill {
            file.fill(dst_reg, copies[i].dst_rc, new_temp.id());
        }
    }
}

/// Move an operand into a usable register, or move a blocking value
/// away from the register the operand is pinned to.
pub(crate) fn resolve_operand(
    program: &mut Program,
    ctx: &mut RaCtx,
    file: &mut RegisterFile,
    copies: &mut Vec<PendingCopy>,
    instr: &mut Instruction,
    operand_index: usize,
) {
    let mut blocking_var = false;
    let dst;
    if instr.operands[operand_index].is_fixed() {
        let fixed_reg = instr.operands[operand_index].preg();
        debug_assert_ne!(
            fixed_reg,
            ctx.assignments[instr.operands[operand_index].temp_id().index()].reg
        );
        debug_assert!(!matches!(
            file.unit(fixed_reg.unit()),
            UnitState::Subword(_)
        ));

        if let Some(blocking_id) = file.occupant(fixed_reg) {
            let rc = ctx.assignments[blocking_id.index()].rc;
            let mut pc_src = Operand::new(Temp::new(blocking_id, rc));
            pc_src.set_fixed(fixed_reg);

            let mut dummy =
                Instruction::new(Opcode::ParallelCopy, SmallVec::new(), SmallVec::new());
            let reg = crate::ra::search::get_reg(
                program,
                ctx,
                file,
                pc_src.get_temp(),
                copies,
                &dummy,
                None,
            );
            apply_copies(program, ctx, file, copies, &mut dummy, true);
            copies.push(PendingCopy {
                src: pc_src,
                dst_reg: reg,
                dst_rc: rc,
                dst: None,
            });
            blocking_var = true;
        }
        dst = fixed_reg;
    } else {
        let temp = instr.operands[operand_index].get_temp();
        dst = crate::ra::search::get_reg(
            program,
            ctx,
            file,
            temp,
            copies,
            instr,
            Some(operand_index),
        );
        let rename = instr.opcode != Opcode::CreateVector;
        apply_copies(program, ctx, file, copies, instr, rename);
    }

    let mut pc_src = instr.operands[operand_index].clone();
    let rc = pc_src.rc();
    pc_src.set_fixed(ctx.assignments[pc_src.temp_id().index()].reg);
    copies.push(PendingCopy {
        src: pc_src,
        dst_reg: dst,
        dst_rc: rc,
        dst: None,
    });
    apply_copies(program, ctx, file, copies, instr, true);

    if instr.operands[operand_index].is_kill_before_def() {
        let last = copies.last().unwrap();
        file.fill(last.dst_reg, last.dst_rc, last.dst.unwrap().id());
    }
    // A killed blocking var is not refilled by the rename pass.
    if blocking_var {
        let c = &copies[copies.len() - 2];
        file.fill(c.dst_reg, c.dst_rc, c.dst.unwrap().id());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{HwGen, HwInfo};
    use crate::RegClass;

    fn program() -> Program {
        Program::new(
            HwInfo {
                gen: HwGen::Gfx9,
                sram_ecc: false,
            },
            16,
            16,
        )
    }

    fn ctx_for(program: &Program) -> RaCtx {
        RaCtx {
            assignments: (0..program.temp_count())
                .map(|i| Assignment::unassigned(program.temp_rc(TempId::new(i))))
                .collect(),
            renames: vec![Default::default()],
            incomplete_phis: vec![Vec::new()],
            filled: vec![false],
            sealed: vec![false],
            orig_names: Default::default(),
            phi_map: Default::default(),
            subst: Default::default(),
            affinities: Default::default(),
            vectors: Default::default(),
            split_vectors: Default::default(),
            war_hint: vec![false; crate::ra::file::FILE_UNITS as usize],
            max_used_sgpr: 0,
            max_used_vgpr: 0,
            policy: Default::default(),
        }
    }

    fn fixed_src(temp: Temp, reg: PhysReg) -> Operand {
        let mut op = Operand::new(temp);
        op.set_fixed(reg);
        op
    }

    #[test]
    fn chained_copy_reads_the_original_source() {
        let mut program = program();
        let a = program.allocate_temp(RegClass::sgpr(1));
        let mut ctx = ctx_for(&program);
        ctx.assignments[a.id().index()] = Assignment {
            reg: PhysReg::unit_reg(0),
            rc: a.rc(),
            assigned: true,
        };
        let mut file = RegisterFile::new();
        file.fill(PhysReg::unit_reg(0), a.rc(), a.id());

        let mut instr = Instruction::new(Opcode::ParallelCopy, SmallVec::new(), SmallVec::new());
        let mut copies = vec![PendingCopy {
            src: fixed_src(a, PhysReg::unit_reg(0)),
            dst_reg: PhysReg::unit_reg(1),
            dst_rc: a.rc(),
            dst: None,
        }];
        apply_copies(&mut program, &mut ctx, &mut file, &mut copies, &mut instr, true);
        let moved = copies[0].dst.unwrap();

        // A copy of the moved value queued into the same parallel copy
        // must read from the original location: all entries execute
        // simultaneously, so the intermediate register never holds the
        // value at that point.
        copies.push(PendingCopy {
            src: fixed_src(moved, PhysReg::unit_reg(1)),
            dst_reg: PhysReg::unit_reg(2),
            dst_rc: a.rc(),
            dst: None,
        });
        apply_copies(&mut program, &mut ctx, &mut file, &mut copies, &mut instr, true);

        assert!(copies[1].dst.is_some());
        assert_eq!(copies[1].src.temp_id(), a.id());
        assert_eq!(copies[1].src.preg(), PhysReg::unit_reg(0));
    }

    #[test]
    fn swap_copies_keep_both_sources_in_place() {
        let mut program = program();
        let a = program.allocate_temp(RegClass::sgpr(1));
        let b = program.allocate_temp(RegClass::sgpr(1));
        let mut ctx = ctx_for(&program);
        ctx.assignments[a.id().index()] = Assignment {
            reg: PhysReg::unit_reg(0),
            rc: a.rc(),
            assigned: true,
        };
        ctx.assignments[b.id().index()] = Assignment {
            reg: PhysReg::unit_reg(1),
            rc: b.rc(),
            assigned: true,
        };
        let mut file = RegisterFile::new();
        file.fill(PhysReg::unit_reg(0), a.rc(), a.id());
        file.fill(PhysReg::unit_reg(1), b.rc(), b.id());

        let mut instr = Instruction::new(Opcode::ParallelCopy, SmallVec::new(), SmallVec::new());
        let mut copies = vec![
            PendingCopy {
                src: fixed_src(a, PhysReg::unit_reg(0)),
                dst_reg: PhysReg::unit_reg(1),
                dst_rc: a.rc(),
                dst: None,
            },
            PendingCopy {
                src: fixed_src(b, PhysReg::unit_reg(1)),
                dst_reg: PhysReg::unit_reg(0),
                dst_rc: b.rc(),
                dst: None,
            },
        ];
        apply_copies(&mut program, &mut ctx, &mut file, &mut copies, &mut instr, true);

        // A register cycle stays in read-before-write form: both sources
        // keep their pre-copy registers even though each destination
        // overwrites the other's source.
        assert_eq!(copies[0].src.preg(), PhysReg::unit_reg(0));
        assert_eq!(copies[1].src.preg(), PhysReg::unit_reg(1));
        let d0 = copies[0].dst.unwrap();
        let d1 = copies[1].dst.unwrap();
        assert_ne!(d0.id(), d1.id());
        assert_eq!(ctx.assignments[d0.id().index()].reg, PhysReg::unit_reg(1));
        assert_eq!(ctx.assignments[d1.id().index()].reg, PhysReg::unit_reg(0));
    }
}
