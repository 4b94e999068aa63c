/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! wavealloc: a register allocator for wide-SIMD GPU shader programs.
//!
//! The input is a program in SSA form over two register banks (scalar and
//! vector) with byte-granular register classes. Allocation is a single
//! forward pass over the blocks in reverse postorder: values are renamed
//! on the fly (live-range splits and parallel copies introduce fresh
//! temporaries), phis are completed lazily when all predecessors of a
//! block have been processed, and instruction encoding constraints are
//! satisfied by rewriting instructions in place.

// Even when trace logging is compiled out, arguments still typecheck.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

mod index;
pub use index::TempId;

pub mod ir;
pub use ir::{Block, Format, HwGen, HwInfo, Instruction, Opcode, Program};

pub(crate) mod ra;

pub mod checker;

use core::hash::BuildHasherDefault;
use rustc_hash::FxHasher;

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FxHashSet<V> = hashbrown::HashSet<V, BuildHasherDefault<FxHasher>>;

/// Per-block set of live value ids, as produced by a liveness pass.
pub type LiveSet = FxHashSet<TempId>;

/// The two register banks of the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegType {
    Sgpr,
    Vgpr,
}

/// A physical register address with byte granularity.
///
/// The register file is modeled as 512 dword units: scalar registers
/// occupy units 0..256 (including the named specials), vector registers
/// occupy units 256..512. Sub-dword values address individual bytes
/// within a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysReg {
    reg_b: u32,
}

impl PhysReg {
    pub const VCC: PhysReg = PhysReg::unit_reg(106);
    pub const M0: PhysReg = PhysReg::unit_reg(124);
    pub const EXEC: PhysReg = PhysReg::unit_reg(126);
    pub const SCC: PhysReg = PhysReg::unit_reg(253);

    /// First unit of the vector bank.
    pub const VGPR_BASE: u32 = 256;

    #[inline(always)]
    pub const fn unit_reg(unit: u32) -> Self {
        PhysReg { reg_b: unit * 4 }
    }

    #[inline(always)]
    pub const fn from_byte_addr(reg_b: u32) -> Self {
        PhysReg { reg_b }
    }

    /// The dword unit this register starts in.
    #[inline(always)]
    pub const fn unit(self) -> u32 {
        self.reg_b / 4
    }

    /// Byte offset within the starting unit (0..4).
    #[inline(always)]
    pub const fn byte(self) -> u32 {
        self.reg_b % 4
    }

    /// Raw byte address within the register file.
    #[inline(always)]
    pub const fn byte_addr(self) -> u32 {
        self.reg_b
    }

    #[inline(always)]
    pub fn advance(self, bytes: i32) -> PhysReg {
        PhysReg {
            reg_b: (self.reg_b as i32 + bytes) as u32,
        }
    }

    #[inline(always)]
    pub fn is_vgpr(self) -> bool {
        self.unit() >= Self::VGPR_BASE
    }
}

impl core::fmt::Display for PhysReg {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let unit = self.unit();
        match *self {
            PhysReg::VCC => write!(f, "vcc")?,
            PhysReg::M0 => write!(f, "m0")?,
            PhysReg::EXEC => write!(f, "exec")?,
            PhysReg::SCC => write!(f, "scc")?,
            _ if unit >= Self::VGPR_BASE => write!(f, "v{}", unit - Self::VGPR_BASE)?,
            _ => write!(f, "s{}", unit)?,
        }
        if self.byte() != 0 {
            write!(f, ".b{}", self.byte())?;
        }
        Ok(())
    }
}

/// A register class: bank, width in bytes, and the linear flag for
/// vector values that live on the linear (wave-level) CFG and may never
/// be live-range split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegClass {
    ty: RegType,
    bytes: u16,
    linear: bool,
}

impl RegClass {
    pub const fn sgpr(dwords: u32) -> Self {
        RegClass {
            ty: RegType::Sgpr,
            bytes: (dwords * 4) as u16,
            linear: false,
        }
    }

    pub const fn vgpr(dwords: u32) -> Self {
        RegClass {
            ty: RegType::Vgpr,
            bytes: (dwords * 4) as u16,
            linear: false,
        }
    }

    pub const fn vgpr_bytes(bytes: u32) -> Self {
        RegClass {
            ty: RegType::Vgpr,
            bytes: bytes as u16,
            linear: false,
        }
    }

    pub const fn linear_vgpr(dwords: u32) -> Self {
        RegClass {
            ty: RegType::Vgpr,
            bytes: (dwords * 4) as u16,
            linear: true,
        }
    }

    pub fn get(ty: RegType, bytes: u32) -> Self {
        RegClass {
            ty,
            bytes: bytes as u16,
            linear: false,
        }
    }

    #[inline(always)]
    pub fn ty(self) -> RegType {
        self.ty
    }

    #[inline(always)]
    pub fn bytes(self) -> u32 {
        self.bytes as u32
    }

    /// Width in dword units, rounded up.
    #[inline(always)]
    pub fn size(self) -> u32 {
        (self.bytes() + 3) / 4
    }

    #[inline(always)]
    pub fn is_subdword(self) -> bool {
        self.bytes % 4 != 0
    }

    /// Values allocated along the linear CFG: all scalars, plus vector
    /// values explicitly marked linear.
    #[inline(always)]
    pub fn is_linear(self) -> bool {
        self.ty == RegType::Sgpr || self.linear
    }

    #[inline(always)]
    pub fn is_linear_vgpr(self) -> bool {
        self.ty == RegType::Vgpr && self.linear
    }
}

impl core::fmt::Display for RegClass {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let c = match self.ty {
            RegType::Sgpr => 's',
            RegType::Vgpr => 'v',
        };
        if self.is_subdword() {
            write!(f, "{}{}b", c, self.bytes)?;
        } else {
            write!(f, "{}{}", c, self.size())?;
        }
        if self.linear {
            write!(f, ".lin")?;
        }
        Ok(())
    }
}

/// An SSA value: id plus register class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Temp {
    id: TempId,
    rc: RegClass,
}

impl Temp {
    #[inline(always)]
    pub fn new(id: TempId, rc: RegClass) -> Self {
        Temp { id, rc }
    }

    #[inline(always)]
    pub fn id(self) -> TempId {
        self.id
    }

    #[inline(always)]
    pub fn rc(self) -> RegClass {
        self.rc
    }

    #[inline(always)]
    pub fn ty(self) -> RegType {
        self.rc.ty()
    }

    #[inline(always)]
    pub fn bytes(self) -> u32 {
        self.rc.bytes()
    }

    #[inline(always)]
    pub fn size(self) -> u32 {
        self.rc.size()
    }

    #[inline(always)]
    pub fn is_linear(self) -> bool {
        self.rc.is_linear()
    }
}

impl core::fmt::Display for Temp {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}:{}", self.id, self.rc)
    }
}

/// An instruction source: an SSA value, an inline constant, or undef.
/// The allocator fills in the physical register of value operands and
/// maintains the kill flags across renames.
#[derive(Clone, Debug)]
pub struct Operand {
    temp: Option<Temp>,
    constant: Option<u32>,
    reg: Option<PhysReg>,
    literal: bool,
    kill: bool,
    first_kill: bool,
    late_kill: bool,
}

impl Operand {
    pub fn new(temp: Temp) -> Self {
        Operand {
            temp: Some(temp),
            constant: None,
            reg: None,
            literal: false,
            kill: false,
            first_kill: false,
            late_kill: false,
        }
    }

    /// An inline 32-bit constant.
    pub fn c32(v: u32) -> Self {
        Operand {
            temp: None,
            constant: Some(v),
            reg: None,
            literal: false,
            kill: false,
            first_kill: false,
            late_kill: false,
        }
    }

    /// A constant too wide for the inline encoding: carried as a
    /// trailing literal dword.
    pub fn literal32(v: u32) -> Self {
        let mut op = Operand::c32(v);
        op.literal = true;
        op
    }

    pub fn undef() -> Self {
        Operand {
            temp: None,
            constant: None,
            reg: None,
            literal: false,
            kill: false,
            first_kill: false,
            late_kill: false,
        }
    }

    #[inline(always)]
    pub fn is_temp(&self) -> bool {
        self.temp.is_some()
    }

    #[inline(always)]
    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }

    #[inline(always)]
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    #[inline(always)]
    pub fn is_undefined(&self) -> bool {
        self.temp.is_none() && self.constant.is_none()
    }

    #[inline(always)]
    pub fn get_temp(&self) -> Temp {
        self.temp.expect("operand is not a temp")
    }

    #[inline(always)]
    pub fn temp_id(&self) -> TempId {
        self.get_temp().id()
    }

    #[inline(always)]
    pub fn rc(&self) -> RegClass {
        self.get_temp().rc()
    }

    #[inline(always)]
    pub fn bytes(&self) -> u32 {
        match self.temp {
            Some(t) => t.bytes(),
            None => 4,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> u32 {
        (self.bytes() + 3) / 4
    }

    #[inline(always)]
    pub fn constant_value(&self) -> u32 {
        self.constant.expect("operand is not a constant")
    }

    #[inline(always)]
    pub fn set_temp(&mut self, temp: Temp) {
        debug_assert!(self.temp.is_some());
        self.temp = Some(temp);
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        self.reg.is_some()
    }

    #[inline(always)]
    pub fn preg(&self) -> PhysReg {
        self.reg.expect("operand has no register")
    }

    #[inline(always)]
    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.reg = Some(reg);
    }

    /// This operand's value dies at this instruction.
    #[inline(always)]
    pub fn is_kill(&self) -> bool {
        self.kill || self.first_kill
    }

    /// First mention of a dying value among this instruction's operands.
    #[inline(always)]
    pub fn is_first_kill(&self) -> bool {
        self.first_kill
    }

    /// The value dies before the definitions are written, so its
    /// registers may be reused for them.
    #[inline(always)]
    pub fn is_kill_before_def(&self) -> bool {
        self.is_kill() && !self.late_kill
    }

    #[inline(always)]
    pub fn is_first_kill_before_def(&self) -> bool {
        self.first_kill && !self.late_kill
    }

    #[inline(always)]
    pub fn is_late_kill(&self) -> bool {
        self.late_kill
    }

    #[inline(always)]
    pub fn set_kill(&mut self, kill: bool) {
        self.kill = kill;
        if !kill {
            self.first_kill = false;
        }
    }

    #[inline(always)]
    pub fn set_first_kill(&mut self, first_kill: bool) {
        self.first_kill = first_kill;
        if first_kill {
            self.kill = true;
        }
    }

    #[inline(always)]
    pub fn set_late_kill(&mut self, late_kill: bool) {
        self.late_kill = late_kill;
    }
}

/// An instruction result. The allocator assigns the register; a hint,
/// when present, biases placement.
#[derive(Clone, Debug)]
pub struct Definition {
    temp: Temp,
    reg: Option<PhysReg>,
    hint: Option<PhysReg>,
    dead: bool,
}

impl Definition {
    pub fn new(temp: Temp) -> Self {
        Definition {
            temp,
            reg: None,
            hint: None,
            dead: false,
        }
    }

    /// A definition pre-assigned by the frontend (e.g. an ABI register
    /// or a special like vcc).
    pub fn fixed(temp: Temp, reg: PhysReg) -> Self {
        Definition {
            temp,
            reg: Some(reg),
            hint: None,
            dead: false,
        }
    }

    pub fn hinted(temp: Temp, hint: PhysReg) -> Self {
        Definition {
            temp,
            reg: None,
            hint: Some(hint),
            dead: false,
        }
    }

    #[inline(always)]
    pub fn get_temp(&self) -> Temp {
        self.temp
    }

    #[inline(always)]
    pub fn temp_id(&self) -> TempId {
        self.temp.id()
    }

    #[inline(always)]
    pub fn rc(&self) -> RegClass {
        self.temp.rc()
    }

    #[inline(always)]
    pub fn bytes(&self) -> u32 {
        self.temp.bytes()
    }

    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.temp.size()
    }

    #[inline(always)]
    pub fn set_temp(&mut self, temp: Temp) {
        self.temp = temp;
    }

    #[inline(always)]
    pub fn is_fixed(&self) -> bool {
        self.reg.is_some()
    }

    #[inline(always)]
    pub fn preg(&self) -> PhysReg {
        self.reg.expect("definition has no register")
    }

    #[inline(always)]
    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.reg = Some(reg);
    }

    #[inline(always)]
    pub fn hint(&self) -> Option<PhysReg> {
        self.hint
    }

    #[inline(always)]
    pub fn set_hint(&mut self, hint: PhysReg) {
        self.hint = Some(hint);
    }

    /// The result is never read.
    #[inline(always)]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    #[inline(always)]
    pub fn set_dead(&mut self, dead: bool) {
        self.dead = dead;
    }
}

/// Test-only knobs. `skip_free_search` forces every placement through
/// the eviction path so that live-range splitting gets exercised by
/// small inputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct RaTestPolicy {
    pub skip_free_search: bool,
}

/// Final register demand of the allocated program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Output {
    pub num_sgprs: u32,
    pub num_vgprs: u32,
}

/// An error with the input program. Allocator-internal invariant
/// violations panic instead; they are bugs, not conditions a caller can
/// handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegAllocError {
    /// The live-out table does not have one entry per block.
    LiveOutMismatch { blocks: usize, live_sets: usize },
    /// A pred/succ edge list is inconsistent (block index).
    MalformedCfg(u32),
    /// An instruction references a temp id outside the program's id
    /// space (block index).
    BadTempId(u32),
    /// The entry block has live-in values.
    EntryLiveIn,
}

impl core::fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            RegAllocError::LiveOutMismatch { blocks, live_sets } => {
                write!(f, "{} blocks but {} live-out sets", blocks, live_sets)
            }
            RegAllocError::MalformedCfg(b) => write!(f, "inconsistent CFG edges at block {}", b),
            RegAllocError::BadTempId(b) => write!(f, "out-of-range temp id in block {}", b),
            RegAllocError::EntryLiveIn => write!(f, "entry block has live-in values"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RegAllocError {}

/// Run register allocation over `program`.
///
/// `live_out` holds the live-out value ids of every block, in block
/// order. On success every operand and definition carries a physical
/// register, parallel-copy instructions cover all value movement, and
/// the returned [`Output`] reports the high-water marks of both banks.
pub fn run(
    program: &mut Program,
    live_out: Vec<LiveSet>,
    policy: RaTestPolicy,
) -> Result<Output, RegAllocError> {
    if live_out.len() != program.blocks.len() {
        return Err(RegAllocError::LiveOutMismatch {
            blocks: program.blocks.len(),
            live_sets: live_out.len(),
        });
    }
    validate_cfg(program)?;
    ra::run_allocation(program, live_out, policy)
}

fn validate_cfg(program: &Program) -> Result<(), RegAllocError> {
    let nb = program.blocks.len() as u32;
    let num_temps = program.temp_count();
    for (i, block) in program.blocks.iter().enumerate() {
        let b = i as u32;
        for &(list, linear, is_pred) in &[
            (&block.linear_succs, true, false),
            (&block.linear_preds, true, true),
            (&block.logical_succs, false, false),
            (&block.logical_preds, false, true),
        ] {
            for &other in list {
                if other >= nb {
                    return Err(RegAllocError::MalformedCfg(b));
                }
                let back = match (linear, is_pred) {
                    (true, false) => &program.blocks[other as usize].linear_preds,
                    (true, true) => &program.blocks[other as usize].linear_succs,
                    (false, false) => &program.blocks[other as usize].logical_preds,
                    (false, true) => &program.blocks[other as usize].logical_succs,
                };
                if !back.contains(&b) {
                    return Err(RegAllocError::MalformedCfg(b));
                }
            }
        }
        for instr in &block.instructions {
            let bad_op = instr
                .operands
                .iter()
                .filter(|op| op.is_temp())
                .any(|op| op.temp_id().index() >= num_temps);
            let bad_def = instr
                .definitions
                .iter()
                .any(|def| def.temp_id().index() >= num_temps);
            if bad_op || bad_def {
                return Err(RegAllocError::BadTempId(b));
            }
        }
    }
    Ok(())
}
