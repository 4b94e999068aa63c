/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The owned shader IR the allocator runs over.
//!
//! This is a deliberately small slice of a real shader backend IR: enough
//! opcodes to cover every constraint class the allocator has to handle
//! (pseudo ops, scalar-immediate forms, multiply-accumulate forms, carry
//! outs, compares, lane ops, sub-dword memory and conversion ops,
//! exports), not an ISA description.

use crate::index::TempId;
use crate::{Definition, Operand, PhysReg, RegClass};
use smallvec::SmallVec;

/// Hardware generations, oldest first. Ordering comparisons are
/// meaningful: constraint rules are usually "from generation X on".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HwGen {
    Gfx6,
    Gfx7,
    Gfx8,
    Gfx9,
    Gfx10,
}

#[derive(Clone, Copy, Debug)]
pub struct HwInfo {
    pub gen: HwGen,
    /// ECC-protected vector memory: d16 loads clobber the full dword.
    pub sram_ecc: bool,
}

/// Encoding families. Allocation rewrites the format when an
/// instruction has to be upgraded (e.g. VOP2 to VOP3 for a non-vcc
/// carry, or VOP1/VOP2 to SDWA for byte-addressed operands).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Pseudo,
    Sop1,
    Sop2,
    Sopk,
    Sopp,
    Smem,
    Vop1,
    Vop2,
    Vop3,
    Vopc,
    Vintrp,
    Sdwa,
    Ds,
    Mubuf,
    Mimg,
    Global,
    Exp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Pseudo instructions.
    Phi,
    LinearPhi,
    ParallelCopy,
    CreateVector,
    SplitVector,
    ExtractVector,
    LogicalEnd,
    Wqm,
    Branch,

    // Scalar ALU.
    SMovB32,
    SAndB32,
    SAddkI32,
    SMulkI32,

    // Scalar memory.
    SLoadDword,
    SLoadDwordx2,

    // Vector ALU.
    VMovB32,
    VAddF32,
    VMadF32,
    VMacF32,
    VFmaF32,
    VFmacF32,
    VMadF16,
    VAddCoU32,
    VCmpLtF32,
    VCndmaskB32,
    VWritelaneB32,
    VInterpP2F32,
    VAddF16,
    VMulF16,
    VCvtF32Ubyte0,
    VCvtF32Ubyte1,
    VCvtF32Ubyte2,
    VCvtF32Ubyte3,
    VFmaMixloF16,
    VFmaMixhiF16,

    // LDS.
    DsWriteB8,
    DsWriteB16,
    DsWriteB8D16Hi,
    DsWriteB16D16Hi,
    DsReadU8D16,
    DsReadU16D16,
    DsReadU8D16Hi,
    DsReadU16D16Hi,

    // Global memory.
    GlobalStoreByte,
    GlobalStoreShort,
    GlobalStoreByteD16Hi,
    GlobalStoreShortD16Hi,
    GlobalLoadShortD16,
    GlobalLoadShortD16Hi,

    // Buffer / image.
    BufferAtomicAdd,
    ImageSample,

    // Export.
    Export,
}

impl Opcode {
    pub fn is_phi(self) -> bool {
        matches!(self, Opcode::Phi | Opcode::LinearPhi)
    }

    pub fn default_format(self) -> Format {
        use Opcode::*;
        match self {
            Phi | LinearPhi | ParallelCopy | CreateVector | SplitVector | ExtractVector
            | LogicalEnd | Wqm => Format::Pseudo,
            Branch => Format::Sopp,
            SMovB32 => Format::Sop1,
            SAndB32 => Format::Sop2,
            SAddkI32 | SMulkI32 => Format::Sopk,
            SLoadDword | SLoadDwordx2 => Format::Smem,
            VMovB32 | VCvtF32Ubyte0 | VCvtF32Ubyte1 | VCvtF32Ubyte2 | VCvtF32Ubyte3 => {
                Format::Vop1
            }
            VAddF32 | VMacF32 | VFmacF32 | VAddCoU32 | VCndmaskB32 | VAddF16 | VMulF16 => {
                Format::Vop2
            }
            VMadF32 | VFmaF32 | VMadF16 | VWritelaneB32 | VFmaMixloF16 | VFmaMixhiF16 => {
                Format::Vop3
            }
            VCmpLtF32 => Format::Vopc,
            VInterpP2F32 => Format::Vintrp,
            DsWriteB8 | DsWriteB16 | DsWriteB8D16Hi | DsWriteB16D16Hi | DsReadU8D16
            | DsReadU16D16 | DsReadU8D16Hi | DsReadU16D16Hi => Format::Ds,
            GlobalStoreByte | GlobalStoreShort | GlobalStoreByteD16Hi | GlobalStoreShortD16Hi
            | GlobalLoadShortD16 | GlobalLoadShortD16Hi => Format::Global,
            BufferAtomicAdd => Format::Mubuf,
            ImageSample => Format::Mimg,
            Export => Format::Exp,
        }
    }
}

pub type OperandList = SmallVec<[Operand; 4]>;
pub type DefinitionList = SmallVec<[Definition; 2]>;

#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub format: Format,
    pub operands: OperandList,
    pub definitions: DefinitionList,
    /// Output/operand modifiers are in use; blocks some rewrites
    /// (mad->mac, SDWA conversion).
    pub uses_modifiers: bool,
    /// Half-word operand/result selection bits for mixed-precision ops.
    pub opsel: u16,
    /// Parallel-copy only: scc is live across the copy and a scalar
    /// source aliases a destination, so lowering must go through
    /// `scratch_sgpr`.
    pub tmp_in_scc: bool,
    pub scratch_sgpr: Option<PhysReg>,
}

impl Instruction {
    pub fn new<O, D>(opcode: Opcode, operands: O, definitions: D) -> Self
    where
        O: Into<OperandList>,
        D: Into<DefinitionList>,
    {
        Instruction {
            opcode,
            format: opcode.default_format(),
            operands: operands.into(),
            definitions: definitions.into(),
            uses_modifiers: false,
            opsel: 0,
            tmp_in_scc: false,
            scratch_sgpr: None,
        }
    }

    pub fn is_phi(&self) -> bool {
        self.opcode.is_phi()
    }
}

/// A basic block. Blocks carry both edge relations of the shader CFG:
/// logical edges follow thread-level control flow (vector values),
/// linear edges follow wave-level control flow (scalar and linear
/// vector values).
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub instructions: Vec<Instruction>,
    pub logical_preds: Vec<u32>,
    pub logical_succs: Vec<u32>,
    pub linear_preds: Vec<u32>,
    pub linear_succs: Vec<u32>,
    /// Set by allocation: scc holds a live value on exit and the branch
    /// lowering must preserve it through `scratch_sgpr`.
    pub scc_live_out: bool,
    pub scratch_sgpr: Option<PhysReg>,
}

/// A program in SSA form, blocks in reverse postorder.
#[derive(Debug)]
pub struct Program {
    pub blocks: Vec<Block>,
    pub hw: HwInfo,
    /// Current per-bank allocation budget in registers. Allocation may
    /// grow these up to the ceilings.
    pub sgpr_budget: u16,
    pub vgpr_budget: u16,
    /// Hard per-wave occupancy limits.
    pub sgpr_ceiling: u16,
    pub vgpr_ceiling: u16,
    temp_classes: Vec<RegClass>,
}

impl Program {
    pub fn new(hw: HwInfo, sgpr_budget: u16, vgpr_budget: u16) -> Self {
        Program {
            blocks: Vec::new(),
            hw,
            sgpr_budget,
            vgpr_budget,
            sgpr_ceiling: 102,
            vgpr_ceiling: 256,
            temp_classes: Vec::new(),
        }
    }

    pub fn allocate_temp(&mut self, rc: RegClass) -> crate::Temp {
        let id = TempId::new(self.temp_classes.len());
        self.temp_classes.push(rc);
        crate::Temp::new(id, rc)
    }

    #[inline(always)]
    pub fn temp_count(&self) -> usize {
        self.temp_classes.len()
    }

    #[inline(always)]
    pub fn temp_rc(&self, id: TempId) -> RegClass {
        self.temp_classes[id.index()]
    }
}
