/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Validation of an allocated program.
//!
//! The checker recomputes liveness from scratch instead of trusting the
//! kill flags the allocator maintained, then replays the occupancy of
//! the register file per block: at no point may two simultaneously live
//! values overlap, and a value must sit in one register for its whole
//! lifetime (allocation renames on splits, so a moved value is a new
//! temp).

use crate::ir::{Opcode, Program};
use crate::ra::file::RegisterFile;
use crate::{FxHashMap, FxHashSet, PhysReg, RegClass, RegType, TempId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckError {
    /// A temp operand or definition has no register.
    MissingRegister { block: u32, temp: TempId },
    /// The same value appears in two different registers.
    InconsistentLocation {
        temp: TempId,
        first: PhysReg,
        second: PhysReg,
    },
    /// A scalar value in the vector bank or vice versa, or a register
    /// window past the end of the bank.
    BadRegister { temp: TempId, reg: PhysReg },
    /// The value overlaps another live value.
    Overlap { block: u32, temp: TempId },
}

impl core::fmt::Display for CheckError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            CheckError::MissingRegister { block, temp } => {
                write!(f, "temp {} in block {} has no register", temp, block)
            }
            CheckError::InconsistentLocation {
                temp,
                first,
                second,
            } => write!(f, "temp {} at both {} and {}", temp, first, second),
            CheckError::BadRegister { temp, reg } => {
                write!(f, "temp {} at invalid register {}", temp, reg)
            }
            CheckError::Overlap { block, temp } => {
                write!(f, "temp {} overlaps a live value in block {}", temp, block)
            }
        }
    }
}

/// The values live out of `b`: live-ins of the successors (along the
/// matching CFG) plus the phi operands the successors read on the edges
/// from `b`.
pub(crate) fn live_out_of(
    program: &Program,
    live_in: &[FxHashSet<TempId>],
    b: usize,
) -> FxHashSet<TempId> {
    let mut out = FxHashSet::default();
    let block = &program.blocks[b];
    for &(succs, linear) in &[(&block.linear_succs, true), (&block.logical_succs, false)] {
        for &s in succs {
            let succ = &program.blocks[s as usize];
            for &t in &live_in[s as usize] {
                if program.temp_rc(t).is_linear() == linear {
                    out.insert(t);
                }
            }
            let preds = if linear {
                &succ.linear_preds
            } else {
                &succ.logical_preds
            };
            let pos = match preds.iter().position(|&p| p == b as u32) {
                Some(pos) => pos,
                None => continue,
            };
            for phi in &succ.instructions {
                if !phi.is_phi() {
                    break;
                }
                if (phi.opcode == Opcode::LinearPhi) != linear {
                    continue;
                }
                let op = &phi.operands[pos];
                if op.is_temp() {
                    out.insert(op.temp_id());
                }
            }
        }
    }
    out
}

pub(crate) fn compute_live_in(program: &Program) -> Vec<FxHashSet<TempId>> {
    let n = program.blocks.len();
    let mut live_in: Vec<FxHashSet<TempId>> = vec![FxHashSet::default(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..n).rev() {
            let mut live = live_out_of(program, &live_in, b);
            for instr in program.blocks[b].instructions.iter().rev() {
                for def in &instr.definitions {
                    live.remove(&def.temp_id());
                }
                if instr.is_phi() {
                    continue;
                }
                for op in &instr.operands {
                    if op.is_temp() {
                        live.insert(op.temp_id());
                    }
                }
            }
            if live != live_in[b] {
                live_in[b] = live;
                changed = true;
            }
        }
    }
    live_in
}

struct Locations {
    locs: FxHashMap<TempId, PhysReg>,
    errors: Vec<CheckError>,
}

fn enter_live(
    program: &Program,
    locs: &FxHashMap<TempId, PhysReg>,
    errors: &mut Vec<CheckError>,
    block: u32,
    id: TempId,
    live: &mut FxHashSet<TempId>,
    file: &mut RegisterFile,
) {
    if !live.insert(id) {
        return;
    }
    let reg = match locs.get(&id) {
        Some(&reg) => reg,
        None => return,
    };
    let rc = program.temp_rc(id);
    if file.test(reg, rc.bytes()) {
        errors.push(CheckError::Overlap { block, temp: id });
    } else {
        file.fill(reg, rc, id);
    }
}

impl Locations {
    fn note(&mut self, block: u32, temp: TempId, rc: RegClass, reg: Option<PhysReg>) {
        let reg = match reg {
            Some(reg) => reg,
            None => {
                self.errors.push(CheckError::MissingRegister { block, temp });
                return;
            }
        };
        let in_vgpr_bank = reg.is_vgpr();
        let end_unit = reg.unit() + rc.size();
        let bad = match rc.ty() {
            RegType::Vgpr => !in_vgpr_bank || end_unit > crate::ra::file::FILE_UNITS,
            RegType::Sgpr => in_vgpr_bank || end_unit > PhysReg::VGPR_BASE,
        };
        if bad || (reg.byte() != 0 && !rc.is_subdword()) {
            self.errors.push(CheckError::BadRegister { temp, reg });
            return;
        }
        match self.locs.get(&temp) {
            Some(&first) if first != reg => {
                self.errors.push(CheckError::InconsistentLocation {
                    temp,
                    first,
                    second: reg,
                });
            }
            _ => {
                self.locs.insert(temp, reg);
            }
        }
    }
}

/// Check an allocated program. All reported problems are returned, not
/// just the first.
pub fn check(program: &Program) -> Result<(), Vec<CheckError>> {
    let mut state = Locations {
        locs: FxHashMap::default(),
        errors: Vec::new(),
    };

    for (b, block) in program.blocks.iter().enumerate() {
        for instr in &block.instructions {
            for def in &instr.definitions {
                let reg = def.is_fixed().then(|| def.preg());
                state.note(b as u32, def.temp_id(), def.rc(), reg);
            }
            for op in &instr.operands {
                if !op.is_temp() {
                    continue;
                }
                let reg = op.is_fixed().then(|| op.preg());
                state.note(b as u32, op.temp_id(), op.rc(), reg);
            }
        }
    }

    let live_in = compute_live_in(program);

    // Replay each block backwards: values entering the live set claim
    // their bytes, definitions release them.
    for (b, block) in program.blocks.iter().enumerate() {
        let mut file = RegisterFile::new();
        let mut live: FxHashSet<TempId> = FxHashSet::default();

        for id in live_out_of(program, &live_in, b) {
            enter_live(
                program,
                &state.locs,
                &mut state.errors,
                b as u32,
                id,
                &mut live,
                &mut file,
            );
        }

        for instr in block.instructions.iter().rev() {
            for def in &instr.definitions {
                if live.remove(&def.temp_id()) {
                    if let Some(&reg) = state.locs.get(&def.temp_id()) {
                        file.clear(reg, def.rc());
                    }
                }
            }
            if instr.is_phi() {
                continue;
            }
            for op in &instr.operands {
                if op.is_temp() {
                    enter_live(
                        program,
                        &state.locs,
                        &mut state.errors,
                        b as u32,
                        op.temp_id(),
                        &mut live,
                        &mut file,
                    );
                }
            }
        }
    }

    if state.errors.is_empty() {
        Ok(())
    } else {
        Err(state.errors)
    }
}
