/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! SSA repair during the forward walk: on-the-fly renaming, lazy phi
//! construction for live-ins of unsealed blocks, and removal of phis
//! that turn out trivial once all predecessors are known.
//!
//! Removed phi definitions are not rewritten at their uses immediately.
//! Instead a substitution map records the replacement and a final sweep
//! applies it to every surviving instruction.

use crate::ir::{Instruction, Opcode, Program};
use crate::ra::{Assignment, PhiInfo, RaCtx};
use crate::{Definition, Operand, Temp, TempId};
use core::iter::FromIterator;
use smallvec::SmallVec;

/// The current name of `val` in `block`, following the rename map.
pub(crate) fn read_variable(ctx: &RaCtx, val: Temp, block: u32) -> Temp {
    match ctx.renames[block as usize].get(&val.id()) {
        Some(&t) => t,
        None => val,
    }
}

/// Follow the substitution chain of removed trivial phis.
pub(crate) fn resolve_subst(ctx: &RaCtx, mut t: Temp) -> Temp {
    while let Some(&n) = ctx.subst.get(&t.id()) {
        t = n;
    }
    t
}

/// Materialize the value of live-in `val` at the start of `block_idx`:
/// either a rename from the predecessors, or a phi. Phis for unsealed
/// blocks are created with placeholder operands and completed when the
/// block seals.
pub(crate) fn resolve_live_in(
    program: &mut Program,
    ctx: &mut RaCtx,
    val: Temp,
    block_idx: u32,
) -> Temp {
    let preds: Vec<u32> = if val.is_linear() {
        program.blocks[block_idx as usize].linear_preds.clone()
    } else {
        program.blocks[block_idx as usize].logical_preds.clone()
    };
    // Linear vgprs keep one name for their whole lifetime.
    if preds.is_empty() || val.rc().is_linear_vgpr() {
        return val;
    }

    let new_val;
    if !ctx.sealed[block_idx as usize] {
        // Not all predecessors are processed yet: create an incomplete
        // phi, the rename from an already processed predecessor seeds
        // the affinity.
        let tmp = read_variable(ctx, val, preds[0]);

        new_val = program.allocate_temp(val.rc());
        ctx.assignments.push(Assignment::unassigned(val.rc()));
        let opcode = if val.is_linear() {
            Opcode::LinearPhi
        } else {
            Opcode::Phi
        };
        let operands: SmallVec<[Operand; 4]> =
            preds.iter().map(|_| Operand::new(val)).collect();
        let phi = Instruction::new(
            opcode,
            operands,
            SmallVec::from_iter([Definition::new(new_val)]),
        );
        if tmp.rc() == new_val.rc() {
            ctx.affinities.insert(new_val.id(), tmp.id());
        }

        ctx.phi_map.insert(
            new_val.id(),
            PhiInfo {
                block: block_idx,
                uses: Default::default(),
            },
        );
        ctx.incomplete_phis[block_idx as usize].push(new_val.id());
        program.blocks[block_idx as usize]
            .instructions
            .insert(0, phi);
    } else if preds.len() == 1 {
        new_val = read_variable(ctx, val, preds[0]);
    } else {
        let ops: Vec<Temp> = preds
            .iter()
            .map(|&p| read_variable(ctx, val, p))
            .collect();
        let needs_phi = ops.iter().any(|&t| t != ops[0]);

        if needs_phi {
            // The value was renamed differently along the incoming
            // edges, so a phi joins the renames.
            let opcode = if val.is_linear() {
                Opcode::LinearPhi
            } else {
                Opcode::Phi
            };
            new_val = program.allocate_temp(val.rc());
            let mut operands: SmallVec<[Operand; 4]> = SmallVec::new();
            for &op_temp in &ops {
                let mut op = Operand::new(op_temp);
                op.set_fixed(ctx.assignments[op_temp.id().index()].reg);
                operands.push(op);
                if op_temp.rc() == new_val.rc() {
                    ctx.affinities.insert(new_val.id(), op_temp.id());
                }
                if let Some(info) = ctx.phi_map.get_mut(&op_temp.id()) {
                    info.uses.insert(new_val.id());
                }
            }
            let phi = Instruction::new(
                opcode,
                operands,
                SmallVec::from_iter([Definition::new(new_val)]),
            );
            ctx.assignments.push(Assignment::unassigned(val.rc()));
            debug_assert_eq!(ctx.assignments.len(), program.temp_count());
            ctx.phi_map.insert(
                new_val.id(),
                PhiInfo {
                    block: block_idx,
                    uses: Default::default(),
                },
            );
            program.blocks[block_idx as usize]
                .instructions
                .insert(0, phi);
        } else {
            new_val = ops[0];
        }
    }

    if new_val != val {
        ctx.renames[block_idx as usize].insert(val.id(), new_val);
        ctx.orig_names.insert(new_val.id(), val);
    }
    new_val
}

fn find_leading_phi<'a>(
    block: &'a mut crate::ir::Block,
    def_id: TempId,
) -> Option<&'a mut Instruction> {
    for instr in block.instructions.iter_mut() {
        if !instr.is_phi() {
            break;
        }
        if instr
            .definitions
            .first()
            .map_or(false, |d| d.temp_id() == def_id)
        {
            return Some(instr);
        }
    }
    None
}

/// Remove the phi defining `temp_id` if all its resolved operands name
/// one value sitting in the phi's register. Users that are themselves
/// phis are re-checked recursively.
pub(crate) fn prune_trivial_phi(program: &mut Program, ctx: &mut RaCtx, temp_id: TempId) {
    let block_idx = match ctx.phi_map.get(&temp_id) {
        Some(info) if ctx.sealed[info.block as usize] => info.block,
        _ => return,
    };
    debug_assert_ne!(block_idx, 0);

    let (def, operands) = {
        let phi = match find_leading_phi(&mut program.blocks[block_idx as usize], temp_id) {
            Some(phi) => phi,
            None => return,
        };
        (phi.definitions[0].clone(), phi.operands.clone())
    };

    let mut same: Option<Temp> = None;
    for op in &operands {
        if !op.is_temp() {
            return;
        }
        let t = resolve_subst(ctx, op.get_temp());
        if Some(t) == same || t == def.get_temp() {
            continue;
        }
        if same.is_some() || op.preg() != def.preg() {
            return;
        }
        same = Some(t);
    }
    let same = match same {
        Some(t) => t,
        // All operands name the phi itself; cannot happen in valid
        // input.
        None => return,
    };

    let info = ctx.phi_map.remove(&temp_id).unwrap();
    ctx.subst.insert(temp_id, same);
    if let Some(same_info) = ctx.phi_map.get_mut(&same.id()) {
        same_info.uses.extend(info.uses.iter().copied());
    }

    // Live-in resolution may have recorded the removed phi in rename
    // maps under the original name; repair them so later blocks read
    // the replacement.
    let orig_var = ctx
        .orig_names
        .get(&same.id())
        .map(|t| t.id())
        .unwrap_or_else(|| same.id());
    let def_temp = def.get_temp();
    for rename in ctx.renames.iter_mut() {
        if rename.get(&orig_var) == Some(&def_temp) {
            rename.insert(orig_var, same);
        }
    }

    // Cleared definitions flag the phi for the final sweep.
    if let Some(phi) = find_leading_phi(&mut program.blocks[block_idx as usize], temp_id) {
        phi.definitions.clear();
    }

    for user in info.uses {
        if user != temp_id {
            prune_trivial_phi(program, ctx, user);
        }
    }
}

/// Seal `succ_idx`: complete its incomplete phis, prune the trivial
/// ones, and finish the operands of its remaining leading phis.
pub(crate) fn seal_block(program: &mut Program, ctx: &mut RaCtx, succ_idx: u32) {
    ctx.sealed[succ_idx as usize] = true;

    let pending = std::mem::take(&mut ctx.incomplete_phis[succ_idx as usize]);
    for def_id in pending {
        let linear = {
            let phi = match find_leading_phi(&mut program.blocks[succ_idx as usize], def_id) {
                Some(phi) => phi,
                None => continue,
            };
            phi.opcode == Opcode::LinearPhi
        };
        let preds: Vec<u32> = if linear {
            program.blocks[succ_idx as usize].linear_preds.clone()
        } else {
            program.blocks[succ_idx as usize].logical_preds.clone()
        };
        let mut renamed: Vec<(Temp, crate::PhysReg)> = Vec::with_capacity(preds.len());
        {
            let phi = find_leading_phi(&mut program.blocks[succ_idx as usize], def_id).unwrap();
            for (i, op) in phi.operands.iter().enumerate() {
                let t = read_variable(ctx, op.get_temp(), preds[i]);
                renamed.push((t, ctx.assignments[t.id().index()].reg));
            }
            for (op, (t, reg)) in phi.operands.iter_mut().zip(renamed) {
                op.set_temp(t);
                op.set_fixed(reg);
            }
        }
        prune_trivial_phi(program, ctx, def_id);
    }

    // Finish the original phi nodes; their uses of other phis are
    // recorded for the triviality recursion.
    let mut i = 0;
    loop {
        let (opcode, def_id, num_ops) = {
            let block = &program.blocks[succ_idx as usize];
            match block.instructions.get(i) {
                Some(instr) if instr.is_phi() => (
                    instr.opcode,
                    instr.definitions.first().map(|d| d.temp_id()),
                    instr.operands.len(),
                ),
                _ => break,
            }
        };
        i += 1;
        let def_id = match def_id {
            Some(id) => id,
            None => continue,
        };
        let preds: Vec<u32> = if opcode == Opcode::Phi {
            program.blocks[succ_idx as usize].logical_preds.clone()
        } else {
            program.blocks[succ_idx as usize].linear_preds.clone()
        };
        for j in 0..num_ops {
            let op_temp = {
                let op = &program.blocks[succ_idx as usize].instructions[i - 1].operands[j];
                if !op.is_temp() {
                    continue;
                }
                op.get_temp()
            };
            let t = read_variable(ctx, op_temp, preds[j]);
            let reg = ctx.assignments[t.id().index()].reg;
            {
                let op =
                    &mut program.blocks[succ_idx as usize].instructions[i - 1].operands[j];
                op.set_temp(t);
                op.set_fixed(reg);
            }
            if let Some(info) = ctx.phi_map.get_mut(&t.id()) {
                info.uses.insert(def_id);
            }
        }
    }
}

/// Final pass: drop phis flagged for removal and rewrite every operand
/// through the substitution map.
pub(crate) fn apply_subst(program: &mut Program, ctx: &RaCtx) {
    for block in program.blocks.iter_mut() {
        let phi_end = block
            .instructions
            .iter()
            .position(|i| !i.is_phi())
            .unwrap_or(block.instructions.len());
        let mut kept = 0;
        for i in 0..phi_end {
            if block.instructions[i].definitions.is_empty() {
                continue;
            }
            block.instructions.swap(kept, i);
            kept += 1;
        }
        block.instructions.drain(kept..phi_end);

        if ctx.subst.is_empty() {
            continue;
        }
        for instr in block.instructions.iter_mut() {
            for op in instr.operands.iter_mut() {
                if !op.is_temp() {
                    continue;
                }
                let t = resolve_subst(ctx, op.get_temp());
                if t != op.get_temp() {
                    // The register cannot change: removal requires the
                    // replacement to sit in the phi's register.
                    op.set_temp(t);
                }
            }
        }
    }
}
