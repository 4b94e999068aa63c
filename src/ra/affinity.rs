/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Reverse prepass: converts the per-block live-out sets into live-in
//! sets, chains phi-related values into affinity groups and snapshots
//! vector-placement hints.

use crate::ir::{Format, HwGen, Opcode, Program};
use crate::ra::{RaCtx, SplitHint, VecHint};
use crate::{FxHashMap, LiveSet, Operand, Temp, TempId};

fn snapshot_op(op: &Operand) -> (Option<Temp>, u32) {
    let t = if op.is_temp() {
        Some(op.get_temp())
    } else {
        None
    };
    (t, op.bytes())
}

pub(crate) fn prepass(program: &Program, ctx: &mut RaCtx, live_out: &mut [LiveSet]) {
    // chains[i][0] is the last seen member of group i; placement of the
    // others is later biased towards it.
    let mut chains: Vec<Vec<Temp>> = Vec::new();
    let mut temp_to_chain: FxHashMap<TempId, usize> = Default::default();

    for block_idx in (0..program.blocks.len()).rev() {
        let block = &program.blocks[block_idx];
        let live = &mut live_out[block_idx];

        for instr in block.instructions.iter().rev() {
            if instr.is_phi() {
                let def = &instr.definitions[0];
                if def.is_dead() || def.is_fixed() {
                    live.remove(&def.temp_id());
                    continue;
                }
                let mut related = Vec::with_capacity(instr.operands.len() + 2);
                related.push(def.get_temp());
                related.push(def.get_temp());
                for op in &instr.operands {
                    if op.is_temp() && op.rc() == def.rc() {
                        related.push(op.get_temp());
                        temp_to_chain.insert(op.temp_id(), chains.len());
                    }
                }
                chains.push(related);
            } else {
                if instr.opcode == Opcode::CreateVector {
                    let def_ty = instr.definitions[0].rc().ty();
                    let hint = VecHint {
                        mimg: false,
                        ops: instr.operands.iter().map(snapshot_op).collect(),
                    };
                    for op in &instr.operands {
                        if op.is_temp() && op.is_first_kill() && op.get_temp().ty() == def_ty {
                            ctx.vectors.insert(op.temp_id(), hint.clone());
                        }
                    }
                } else if instr.format == Format::Mimg && instr.operands.len() > 4 {
                    // The trailing address registers want to form a
                    // contiguous vector.
                    let hint = VecHint {
                        mimg: true,
                        ops: instr.operands[3..].iter().map(snapshot_op).collect(),
                    };
                    for op in &instr.operands[3..] {
                        if op.is_temp() {
                            ctx.vectors.insert(op.temp_id(), hint.clone());
                        }
                    }
                }

                if instr.opcode == Opcode::SplitVector
                    && instr.operands[0].is_first_kill_before_def()
                {
                    ctx.split_vectors.insert(
                        instr.operands[0].temp_id(),
                        SplitHint {
                            defs: instr
                                .definitions
                                .iter()
                                .map(|d| (d.temp_id(), d.bytes()))
                                .collect(),
                        },
                    );
                }

                for op in &instr.operands {
                    if op.is_temp() {
                        live.insert(op.temp_id());
                    }
                }
            }

            for (i, def) in instr.definitions.iter().enumerate() {
                live.remove(&def.temp_id());

                let chain_idx = match temp_to_chain.get(&def.temp_id()) {
                    Some(&idx) if def.rc() == chains[idx][0].rc() => idx,
                    _ => continue,
                };
                chains[chain_idx][0] = def.get_temp();

                // Copies and accumulator rewrites feeding a phi group
                // extend the group through their source.
                let mut op: Option<&Operand> = None;
                if !def.is_fixed() && instr.opcode == Opcode::ParallelCopy {
                    op = instr.operands.get(i);
                } else if !instr.uses_modifiers
                    && (matches!(instr.opcode, Opcode::VMadF32 | Opcode::VMadF16)
                        || (instr.opcode == Opcode::VFmaF32 && program.hw.gen >= HwGen::Gfx10))
                {
                    op = instr.operands.get(2);
                }
                if let Some(op) = op {
                    if op.is_temp() && op.is_first_kill_before_def() && def.rc() == op.rc() {
                        chains[chain_idx].push(op.get_temp());
                        temp_to_chain.insert(op.temp_id(), chain_idx);
                    }
                }
            }
        }
    }

    for chain in &chains {
        debug_assert!(chain.len() > 1);
        for t in &chain[1..] {
            if t.id() != chain[0].id() {
                ctx.affinities.insert(t.id(), chain[0].id());
            }
        }
    }
}
