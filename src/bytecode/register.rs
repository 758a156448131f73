//! Register file of the virtual machine.
//!
//! General registers hold 64-bit integers (loop counters, sizes). Extended
//! registers each hold one result list, the unit of inter-instruction
//! dataflow. The register allocation is static: the compiler uses fixed
//! roles, rotating only the two transformation scratch registers.

use crate::EvaluateResults;

/// General-purpose integer registers. The full x86-style set is part of the
/// instruction format; RFLAGS is addressable but the condition flags live in
/// the separate [`Rflags`] bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    /// Loop count (number of operator-result elements).
    Rax = 0,
    /// Per-element chain cursor (`multiChain`).
    Rbx = 1,
    /// Loop cursor.
    Rcx = 2,
    /// Per-element chain count.
    Rdx = 3,
    #[allow(dead_code)]
    Rflags = 4,
}

pub const GPR_COUNT: usize = 5;

/// Extended registers, each one result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xr {
    /// Variable-load output.
    R8 = 0,
    /// Transformation scratch A.
    R9 = 1,
    /// Transformation scratch B.
    R10 = 2,
    /// Operator result.
    R11 = 3,
}

pub const XR_COUNT: usize = 4;

bitflags::bitflags! {
    /// Condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Rflags: u8 {
        /// Zero flag, written by CMP.
        const ZF = 1 << 0;
        /// Operator matched: the last OPERATE instruction matched.
        const OMF = 1 << 1;
        /// Rule matched: any element of any variable of the current rule.
        const RMF = 1 << 2;
    }
}

#[derive(Debug, Default)]
pub struct GeneralRegisters([i64; GPR_COUNT]);

impl std::ops::Index<Gpr> for GeneralRegisters {
    type Output = i64;

    fn index(&self, reg: Gpr) -> &i64 {
        &self.0[reg as usize]
    }
}

impl std::ops::IndexMut<Gpr> for GeneralRegisters {
    fn index_mut(&mut self, reg: Gpr) -> &mut i64 {
        &mut self.0[reg as usize]
    }
}

#[derive(Debug, Default)]
pub struct ExtendedRegisters([EvaluateResults; XR_COUNT]);

impl std::ops::Index<Xr> for ExtendedRegisters {
    type Output = EvaluateResults;

    fn index(&self, reg: Xr) -> &EvaluateResults {
        &self.0[reg as usize]
    }
}

impl std::ops::IndexMut<Xr> for ExtendedRegisters {
    fn index_mut(&mut self, reg: Xr) -> &mut EvaluateResults {
        &mut self.0[reg as usize]
    }
}
