/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The register file model: 512 dword units with explicit per-unit
//! state, including byte-granular occupancy for packed sub-dword
//! values.

use crate::index::TempId;
use crate::{Definition, Operand, PhysReg, RegClass};

pub(crate) const FILE_UNITS: u32 = 512;

/// A unit interval of the register file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interval {
    pub lo: u32,
    pub size: u32,
}

impl Interval {
    #[inline(always)]
    pub fn new(lo: u32, size: u32) -> Self {
        Interval { lo, size }
    }

    #[inline(always)]
    pub fn hi(self) -> u32 {
        self.lo + self.size
    }

    #[inline(always)]
    pub fn contains_unit(self, unit: u32) -> bool {
        unit >= self.lo && unit < self.hi()
    }

    #[inline(always)]
    pub fn contains(self, other: Interval) -> bool {
        other.lo >= self.lo && other.hi() <= self.hi()
    }

    #[inline(always)]
    pub fn intersects(self, other: Interval) -> bool {
        self.lo < other.hi() && other.lo < self.hi()
    }

    #[inline(always)]
    pub fn units(self) -> core::ops::Range<u32> {
        self.lo..self.hi()
    }
}

/// Occupancy of one byte of a sub-dword unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubSlot {
    Free,
    Blocked,
    Owned(TempId),
}

/// Occupancy of one dword unit. No numeric sentinels: a unit is either
/// wholly free, wholly blocked, owned by one value, or split into four
/// byte slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnitState {
    Free,
    Blocked,
    Owned(TempId),
    Subword([SubSlot; 4]),
}

#[derive(Clone)]
pub(crate) struct RegisterFile {
    units: Vec<UnitState>,
}

impl RegisterFile {
    pub fn new() -> Self {
        RegisterFile {
            units: vec![UnitState::Free; FILE_UNITS as usize],
        }
    }

    #[inline(always)]
    pub fn unit(&self, u: u32) -> UnitState {
        self.units[u as usize]
    }

    #[inline(always)]
    pub fn unit_is_free(&self, u: u32) -> bool {
        matches!(self.units[u as usize], UnitState::Free)
    }

    /// Number of wholly free units in `iv`. Partially occupied
    /// sub-dword units do not count.
    pub fn count_free(&self, iv: Interval) -> u32 {
        iv.units().filter(|&u| self.unit_is_free(u)).count() as u32
    }

    /// Is any of the `num_bytes` bytes starting at `reg` occupied or
    /// blocked?
    pub fn test(&self, reg: PhysReg, num_bytes: u32) -> bool {
        let end_b = reg.byte_addr() + num_bytes;
        let mut u = reg.unit();
        while u * 4 < end_b {
            match self.unit(u) {
                UnitState::Free => {}
                UnitState::Subword(slots) => {
                    let lo = if u == reg.unit() { reg.byte() } else { 0 };
                    let hi = core::cmp::min(4, end_b - u * 4);
                    for k in lo..hi {
                        if slots[k as usize] != SubSlot::Free {
                            return true;
                        }
                    }
                }
                _ => return true,
            }
            u += 1;
        }
        false
    }

    /// The value occupying the byte at `reg`, if any.
    pub fn occupant(&self, reg: PhysReg) -> Option<TempId> {
        match self.unit(reg.unit()) {
            UnitState::Owned(id) => Some(id),
            UnitState::Subword(slots) => match slots[reg.byte() as usize] {
                SubSlot::Owned(id) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_blocked(&self, reg: PhysReg) -> bool {
        match self.unit(reg.unit()) {
            UnitState::Blocked => true,
            UnitState::Subword(slots) => (reg.byte()..4)
                .any(|k| slots[k as usize] == SubSlot::Blocked),
            _ => false,
        }
    }

    pub fn is_empty_or_blocked(&self, reg: PhysReg) -> bool {
        match self.unit(reg.unit()) {
            UnitState::Free | UnitState::Blocked => true,
            UnitState::Subword(slots) => matches!(
                slots[reg.byte() as usize],
                SubSlot::Free | SubSlot::Blocked
            ),
            UnitState::Owned(_) => false,
        }
    }

    fn fill_units(&mut self, start_unit: u32, count: u32, state: UnitState) {
        for u in start_unit..start_unit + count {
            self.units[u as usize] = state;
        }
    }

    fn fill_bytes(&mut self, reg: PhysReg, num_bytes: u32, slot: SubSlot) {
        let end_b = reg.byte_addr() + num_bytes;
        let mut u = reg.unit();
        while u * 4 < end_b {
            let mut slots = match self.unit(u) {
                UnitState::Subword(slots) => slots,
                // A whole-unit state is overwritten, not merged.
                _ => [SubSlot::Free; 4],
            };
            let lo = if u == reg.unit() { reg.byte() } else { 0 };
            let hi = core::cmp::min(4, end_b - u * 4);
            for k in lo..hi {
                slots[k as usize] = slot;
            }
            self.units[u as usize] = if slots == [SubSlot::Free; 4] {
                UnitState::Free
            } else {
                UnitState::Subword(slots)
            };
            u += 1;
        }
    }

    pub fn fill(&mut self, reg: PhysReg, rc: RegClass, id: TempId) {
        if rc.is_subdword() {
            self.fill_bytes(reg, rc.bytes(), SubSlot::Owned(id));
        } else {
            self.fill_units(reg.unit(), rc.size(), UnitState::Owned(id));
        }
    }

    pub fn clear(&mut self, reg: PhysReg, rc: RegClass) {
        if rc.is_subdword() {
            self.fill_bytes(reg, rc.bytes(), SubSlot::Free);
        } else {
            self.fill_units(reg.unit(), rc.size(), UnitState::Free);
        }
    }

    /// Reserve registers without an owner, so that searches reject them
    /// but no value is recorded there.
    pub fn block(&mut self, reg: PhysReg, rc: RegClass) {
        if rc.is_subdword() || reg.byte() != 0 {
            self.fill_bytes(reg, rc.bytes(), SubSlot::Blocked);
        } else {
            self.fill_units(reg.unit(), rc.size(), UnitState::Blocked);
        }
    }

    pub fn fill_def(&mut self, def: &Definition) {
        self.fill(def.preg(), def.rc(), def.temp_id());
    }

    pub fn clear_def(&mut self, def: &Definition) {
        self.clear(def.preg(), def.rc());
    }

    pub fn fill_op(&mut self, op: &Operand) {
        self.fill(op.preg(), op.rc(), op.temp_id());
    }

    pub fn clear_op(&mut self, op: &Operand) {
        self.clear(op.preg(), op.rc());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::TempId;
    use crate::RegClass;

    fn t(i: usize) -> TempId {
        TempId::new(i)
    }

    #[test]
    fn whole_unit_fill_and_clear() {
        let mut file = RegisterFile::new();
        let reg = PhysReg::unit_reg(260);
        file.fill(reg, RegClass::vgpr(2), t(1));
        assert!(file.test(reg, 8));
        assert_eq!(file.occupant(reg), Some(t(1)));
        assert_eq!(file.occupant(reg.advance(4)), Some(t(1)));
        assert!(!file.test(PhysReg::unit_reg(262), 4));
        assert_eq!(file.count_free(Interval::new(260, 4)), 2);
        file.clear(reg, RegClass::vgpr(2));
        assert!(!file.test(reg, 8));
        assert_eq!(file.count_free(Interval::new(260, 4)), 4);
    }

    #[test]
    fn subword_promote_and_demote() {
        let mut file = RegisterFile::new();
        let unit = PhysReg::unit_reg(300);
        file.fill(unit, RegClass::vgpr_bytes(2), t(1));
        file.fill(unit.advance(2), RegClass::vgpr_bytes(2), t(2));
        assert!(matches!(file.unit(300), UnitState::Subword(_)));
        assert_eq!(file.occupant(unit), Some(t(1)));
        assert_eq!(file.occupant(unit.advance(2)), Some(t(2)));
        assert!(file.test(unit, 4));
        assert!(!file.unit_is_free(300));
        // Partial units do not count as free.
        assert_eq!(file.count_free(Interval::new(300, 1)), 0);

        file.clear(unit, RegClass::vgpr_bytes(2));
        assert!(!file.test(unit, 2));
        assert!(file.test(unit.advance(2), 2));
        file.clear(unit.advance(2), RegClass::vgpr_bytes(2));
        // All four bytes free again: the unit collapses to Free.
        assert!(matches!(file.unit(300), UnitState::Free));
    }

    #[test]
    fn subword_straddles_units() {
        let mut file = RegisterFile::new();
        let reg = PhysReg::unit_reg(310).advance(2);
        file.fill(reg, RegClass::vgpr_bytes(6), t(7));
        assert_eq!(file.occupant(reg), Some(t(7)));
        assert_eq!(file.occupant(PhysReg::unit_reg(311)), Some(t(7)));
        assert!(file.test(PhysReg::unit_reg(311), 4));
        assert!(!file.test(PhysReg::unit_reg(310), 2));
        file.clear(reg, RegClass::vgpr_bytes(6));
        assert!(matches!(file.unit(310), UnitState::Free));
        assert!(matches!(file.unit(311), UnitState::Free));
    }

    #[test]
    fn blocked_states() {
        let mut file = RegisterFile::new();
        let reg = PhysReg::unit_reg(270);
        file.block(reg, RegClass::vgpr(1));
        assert!(file.is_blocked(reg));
        assert!(file.is_empty_or_blocked(reg));
        assert_eq!(file.occupant(reg), None);
        assert!(file.test(reg, 4));

        let sub = PhysReg::unit_reg(271).advance(1);
        file.block(sub, RegClass::vgpr_bytes(1));
        assert!(file.is_blocked(PhysReg::unit_reg(271)));
        assert!(!file.is_blocked(sub.advance(1)));
    }
}
