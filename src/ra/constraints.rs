/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Instruction encoding constraints, keyed by opcode and hardware
//! generation: tied definition/operand pairs, restricted special
//! registers, sub-dword placement strides, and the instruction rewrites
//! that legalize byte-addressed or upgraded encodings.

use crate::ir::{Format, HwGen, Instruction, Opcode, Program};
use crate::ra::file::{RegisterFile, UnitState};
use crate::ra::search::adjust_max_used;
use crate::ra::RaCtx;
use crate::{PhysReg, RegClass, RegType};

/// The operand index definition 0 is tied to, if any.
pub(crate) fn tied_def_operand(instr: &Instruction) -> Option<usize> {
    match instr.opcode {
        // Accumulator and lane ops read their previous result in place.
        Opcode::VMacF32 | Opcode::VFmacF32 | Opcode::VWritelaneB32 | Opcode::VInterpP2F32 => {
            Some(2)
        }
        // Scalar immediate forms modify their first source in place.
        Opcode::SAddkI32 | Opcode::SMulkI32 => Some(0),
        // Returning buffer atomics overwrite the data source.
        Opcode::BufferAtomicAdd => Some(3),
        _ => None,
    }
}

/// The multiply-accumulate rewrite: a 3-address mad whose accumulator
/// dies at the instruction can become a 2-address mac, coalescing the
/// definition into the accumulator's register.
pub(crate) fn mac_alternative(program: &Program, instr: &Instruction) -> Option<Opcode> {
    let mac = match instr.opcode {
        Opcode::VMadF32 => Opcode::VMacF32,
        Opcode::VFmaF32 if program.hw.gen >= HwGen::Gfx10 => Opcode::VFmacF32,
        _ => return None,
    };
    if instr.uses_modifiers || instr.operands.len() != 3 {
        return None;
    }
    let op2 = &instr.operands[2];
    if !op2.is_temp() || op2.rc().ty() != RegType::Vgpr || !op2.is_kill_before_def() {
        return None;
    }
    let op1 = &instr.operands[1];
    if !op1.is_temp() || op1.rc().ty() != RegType::Vgpr {
        return None;
    }
    // The 2-address form cannot carry a literal.
    if instr.operands[..2].iter().any(|op| op.is_literal()) {
        return None;
    }
    // Byte-addressed sources would need the 3-address encoding.
    if instr
        .operands
        .iter()
        .any(|op| op.is_temp() && op.preg().byte() != 0)
    {
        return None;
    }
    Some(mac)
}

/// Can this operand live at `reg`? Checks the sub-dword stride and the
/// special-register restrictions of the encoding. May pin a lane-select
/// source to m0 as a side effect.
pub(crate) fn operand_can_use_reg(
    gen: HwGen,
    instr: &mut Instruction,
    idx: usize,
    reg: PhysReg,
    rc: RegClass,
) -> bool {
    if instr.operands[idx].is_fixed() {
        return instr.operands[idx].preg() == reg;
    }

    if gen <= HwGen::Gfx9 && instr.opcode == Opcode::VWritelaneB32 && idx <= 1 {
        // Two sgpr sources are only legal when one of them is m0.
        let other = &instr.operands[idx ^ 1];
        let other_is_sgpr = other.is_temp()
            && (!other.is_fixed() || other.preg() != PhysReg::M0);
        if other_is_sgpr && other.temp_id() != instr.operands[idx].temp_id() {
            instr.operands[idx].set_fixed(PhysReg::M0);
            return reg == PhysReg::M0;
        }
    }

    if reg.byte() != 0 {
        let stride = subword_operand_stride(gen, instr, idx, rc);
        if reg.byte() % stride != 0 {
            return false;
        }
    }
    match instr.format {
        Format::Smem => {
            reg != PhysReg::SCC
                && reg != PhysReg::EXEC
                && (reg != PhysReg::M0 || idx == 1 || idx == 3)
                && (reg != PhysReg::VCC
                    || (instr.definitions.is_empty() && idx == 2)
                    || gen >= HwGen::Gfx10)
        }
        _ => true,
    }
}

pub(crate) fn can_use_sdwa(gen: HwGen, instr: &Instruction) -> bool {
    if gen < HwGen::Gfx8 {
        return false;
    }
    if !matches!(instr.format, Format::Vop1 | Format::Vop2) {
        return false;
    }
    if matches!(instr.opcode, Opcode::VMacF32 | Opcode::VFmacF32) {
        return false;
    }
    // SDWA replaces the literal dword.
    !instr.operands.iter().any(|op| op.is_literal())
}

/// `idx` is the operand index, or -1 for the definition.
pub(crate) fn can_use_opsel(gen: HwGen, op: Opcode, _idx: i32) -> bool {
    if gen < HwGen::Gfx9 {
        return false;
    }
    matches!(op, Opcode::VMadF16)
}

/// Placement stride in bytes for a sub-dword operand of `instr`.
pub(crate) fn subword_operand_stride(
    gen: HwGen,
    instr: &Instruction,
    idx: usize,
    rc: RegClass,
) -> u32 {
    if instr.format == Format::Pseudo {
        return if gen >= HwGen::Gfx8 {
            if rc.bytes() % 2 == 0 {
                2
            } else {
                1
            }
        } else {
            4
        };
    }
    if instr.opcode == Opcode::VCvtF32Ubyte0 {
        return 1;
    }
    if can_use_sdwa(gen, instr) {
        return if rc.bytes() % 2 == 0 { 2 } else { 1 };
    }
    if rc.bytes() == 2 && can_use_opsel(gen, instr.opcode, idx as i32) {
        return 2;
    }
    match instr.opcode {
        Opcode::VFmaMixloF16 | Opcode::VFmaMixhiF16 => 2,
        Opcode::DsWriteB8 | Opcode::DsWriteB16 if gen >= HwGen::Gfx8 => 2,
        Opcode::GlobalStoreByte | Opcode::GlobalStoreShort if gen >= HwGen::Gfx9 => 2,
        _ => 4,
    }
}

/// Placement stride and actually-written width in bytes for a sub-dword
/// definition. Pre-GFX10 VALU results and ECC-protected d16 loads
/// clobber the containing dword even when the value is narrower.
pub(crate) fn subword_def_info(program: &Program, instr: &Instruction, rc: RegClass) -> (u32, u32) {
    let gen = program.hw.gen;
    if instr.format == Format::Pseudo {
        return if gen >= HwGen::Gfx8 {
            (if rc.bytes() % 2 == 0 { 2 } else { 1 }, rc.bytes())
        } else {
            (4, rc.size() * 4)
        };
    }
    match instr.format {
        Format::Vop1 | Format::Vop2 | Format::Vop3 | Format::Vopc | Format::Sdwa
        | Format::Vintrp => {
            debug_assert!(rc.bytes() <= 2);
            if can_use_sdwa(gen, instr) {
                return (
                    if rc.bytes() % 2 == 0 { 2 } else { 1 },
                    if gen >= HwGen::Gfx10 { rc.bytes() } else { 4 },
                );
            }
            if rc.bytes() == 2 {
                if matches!(instr.opcode, Opcode::VFmaMixloF16 | Opcode::VFmaMixhiF16) {
                    return (2, 2);
                }
                if can_use_opsel(gen, instr.opcode, -1) {
                    return (2, 2);
                }
            }
            (4, 4)
        }
        _ => match instr.opcode {
            Opcode::DsReadU8D16 | Opcode::DsReadU16D16 | Opcode::GlobalLoadShortD16 => {
                if gen >= HwGen::Gfx9 && !program.hw.sram_ecc {
                    (2, 2)
                } else {
                    (2, 4)
                }
            }
            _ => (4, rc.size() * 4),
        },
    }
}

/// Legalize an operand placed at a nonzero byte offset.
pub(crate) fn add_subword_operand(
    gen: HwGen,
    instr: &mut Instruction,
    idx: usize,
    byte: u32,
    rc: RegClass,
) {
    if instr.format == Format::Pseudo || byte == 0 {
        return;
    }
    debug_assert!(rc.bytes() <= 2);
    if matches!(
        instr.format,
        Format::Vop1 | Format::Vop2 | Format::Vop3 | Format::Vopc
    ) {
        if instr.opcode == Opcode::VCvtF32Ubyte0 {
            instr.opcode = match byte {
                1 => Opcode::VCvtF32Ubyte1,
                2 => Opcode::VCvtF32Ubyte2,
                3 => Opcode::VCvtF32Ubyte3,
                _ => unreachable!(),
            };
            return;
        }
        if can_use_sdwa(gen, instr) {
            instr.format = Format::Sdwa;
            return;
        }
        if rc.bytes() == 2 && can_use_opsel(gen, instr.opcode, idx as i32) {
            debug_assert_eq!(byte, 2);
            instr.opsel |= 1 << idx;
            return;
        }
    }
    if matches!(instr.opcode, Opcode::VFmaMixloF16 | Opcode::VFmaMixhiF16) {
        debug_assert_eq!(byte, 2);
        instr.opsel |= 1 << idx;
        return;
    }
    instr.opcode = match (instr.opcode, byte) {
        (Opcode::DsWriteB8, 2) => Opcode::DsWriteB8D16Hi,
        (Opcode::DsWriteB16, 2) => Opcode::DsWriteB16D16Hi,
        (Opcode::GlobalStoreByte, 2) => Opcode::GlobalStoreByteD16Hi,
        (Opcode::GlobalStoreShort, 2) => Opcode::GlobalStoreShortD16Hi,
        _ => unreachable!("impossible sub-dword operand assignment"),
    };
}

/// Legalize a definition placed at a nonzero byte offset.
pub(crate) fn add_subword_definition(
    program: &Program,
    instr: &mut Instruction,
    reg: PhysReg,
) {
    if instr.format == Format::Pseudo {
        return;
    }
    let gen = program.hw.gen;
    if matches!(
        instr.format,
        Format::Vop1 | Format::Vop2 | Format::Vop3 | Format::Vopc
    ) {
        if can_use_sdwa(gen, instr) {
            instr.format = Format::Sdwa;
            return;
        }
        if reg.byte() == 0 {
            return;
        }
        debug_assert_eq!(reg.byte(), 2);
        if instr.opcode == Opcode::VFmaMixloF16 {
            instr.opcode = Opcode::VFmaMixhiF16;
            return;
        }
        if can_use_opsel(gen, instr.opcode, -1) {
            // Result high-half select.
            instr.opsel |= 1 << 3;
            return;
        }
        unreachable!("impossible sub-dword definition assignment");
    }
    if reg.byte() == 0 {
        return;
    }
    debug_assert_eq!(reg.byte(), 2);
    instr.opcode = match instr.opcode {
        Opcode::DsReadU8D16 => Opcode::DsReadU8D16Hi,
        Opcode::DsReadU16D16 => Opcode::DsReadU16D16Hi,
        Opcode::GlobalLoadShortD16 => Opcode::GlobalLoadShortD16Hi,
        _ => unreachable!("impossible sub-dword definition assignment"),
    };
}

/// Does the encoding need upgrading to VOP3 because a compare result or
/// carry in/out could not be placed in vcc?
pub(crate) fn needs_vop3_upgrade(instr: &Instruction) -> bool {
    if instr.format == Format::Vop3 {
        return false;
    }
    match instr.opcode {
        _ if instr.format == Format::Vopc => {
            instr.definitions[0].preg() != PhysReg::VCC
        }
        Opcode::VCndmaskB32 => instr.operands[2].preg() != PhysReg::VCC,
        Opcode::VAddCoU32 => instr.definitions[1].preg() != PhysReg::VCC,
        _ => false,
    }
}

/// Parallel-copy style pseudo ops are lowered to scalar moves later;
/// when scc holds a live value and scalar registers are both read and
/// written, lowering needs a scratch sgpr to preserve it.
pub(crate) fn handle_pseudo(
    ctx: &mut RaCtx,
    program: &Program,
    file: &RegisterFile,
    instr: &mut Instruction,
) {
    if instr.format != Format::Pseudo {
        return;
    }
    match instr.opcode {
        Opcode::ParallelCopy
        | Opcode::CreateVector
        | Opcode::SplitVector
        | Opcode::ExtractVector
        | Opcode::Wqm => {}
        _ => return,
    }
    let writes_sgpr = instr
        .definitions
        .iter()
        .any(|def| def.rc().ty() == RegType::Sgpr);
    let reads_sgpr = instr
        .operands
        .iter()
        .any(|op| op.is_temp() && op.rc().ty() == RegType::Sgpr);
    let reads_subdword = instr
        .operands
        .iter()
        .any(|op| op.is_temp() && op.rc().is_subdword());
    // Sub-dword moves are lowered through sdwa on newer chips; older
    // ones shuffle via a scratch register.
    let needs_scratch = (writes_sgpr && reads_sgpr)
        || (program.hw.gen <= HwGen::Gfx7 && reads_subdword);
    if !needs_scratch {
        return;
    }
    if !matches!(file.unit(PhysReg::SCC.unit()), UnitState::Free) {
        instr.tmp_in_scc = true;
        let mut found: Option<u32> = None;
        let mut reg: i64 = ctx.max_used_sgpr as i64;
        while reg >= 0 {
            if file.unit_is_free(reg as u32) {
                found = Some(reg as u32);
                break;
            }
            reg -= 1;
        }
        if found.is_none() {
            let mut up = ctx.max_used_sgpr as u32 + 1;
            while up < program.sgpr_budget as u32 {
                if file.unit_is_free(up) {
                    found = Some(up);
                    break;
                }
                up += 1;
            }
        }
        let scratch = match found {
            Some(unit) => PhysReg::unit_reg(unit),
            None => {
                // All allocatable sgprs taken: m0 must be free then.
                assert!(reads_subdword && file.unit_is_free(PhysReg::M0.unit()));
                PhysReg::M0
            }
        };
        adjust_max_used(ctx, program, RegClass::sgpr(1), scratch.unit());
        instr.scratch_sgpr = Some(scratch);
    } else {
        instr.tmp_in_scc = false;
    }
}
