//! Instruction set.
//!
//! Instructions are fixed-shape records: an opcode plus small operands that
//! are, by context, a register, an immediate, a code address, or an index
//! into one of the program's reference tables (the safe-Rust rendition of
//! the source design's raw-pointer operands).
//!
//! The five variable addressing modes stay explicit in the opcode
//! (`LOAD_CC` .. `LOAD_VS`); the per-kind fanout is a `match` over
//! [`crate::VarKind`] inside variable evaluation, which compiles to a jump
//! table.

use super::register::{Gpr, Xr};
use crate::SharedStr;
use crate::transform::TransformKind;

use std::fmt;

/// Absolute code address within one program.
pub type Addr = usize;

/// Index into a program reference table.
pub type RuleId = u32;
pub type VarId = u32;
pub type OperatorId = u32;
pub type ActionId = u32;

#[derive(Debug, Clone)]
pub enum Op {
    /// Load an immediate into a general register.
    Mov { dst: Gpr, imm: i64 },
    Add { dst: Gpr, imm: i64 },
    /// Compare two general registers, writing ZF.
    Cmp { a: Gpr, b: Gpr },

    Jmp(Addr),
    /// Jump if ZF set / clear.
    Jz(Addr),
    #[allow(dead_code)]
    Jnz(Addr),
    /// Jump if OMF set / clear.
    Jom(Addr),
    #[allow(dead_code)]
    Jnom(Addr),
    /// Jump if RMF set / clear.
    Jrm(Addr),
    Jnrm(Addr),
    /// Jump if the result-list element at the cursor is / is not a match.
    /// Drives `firstMatch` loop exits and per-element (`multiChain`) links.
    Jem { results: Xr, cursor: Gpr, target: Addr },
    Jnem { results: Xr, cursor: Gpr, target: Addr },

    #[allow(dead_code)]
    Nop,
    #[allow(dead_code)]
    Debug(SharedStr),

    /// Begin a rule: set the current rule, reset RMF, clear captures and the
    /// matched-variables log.
    RuleStart { rule: RuleId },
    /// Begin a chained continuation: set the current rule, reset RMF.
    ChainStart { rule: RuleId },
    /// Restore the starter as the current rule after a chain.
    ChainEnd { rule: RuleId },
    /// Jump when the current rule was administratively removed in this
    /// transaction by a `ctl:` action.
    JmpIfRemoved(Addr),
    /// Set the current variable expression (handler context).
    SetCurrVar { var: VarId },

    /// Resize the per-element transformation-trail buffer to `len(reg)`.
    TransformStart { reg: Xr },

    /// Variable loads, one opcode per addressing mode.
    LoadCc { dst: Xr, var: VarId },
    LoadCs { dst: Xr, var: VarId },
    LoadVc { dst: Xr, var: VarId },
    LoadVr { dst: Xr, var: VarId },
    LoadVs { dst: Xr, var: VarId },

    /// Elementwise transformation with cache consultation.
    Transform { dst: Xr, src: Xr, kind: TransformKind },
    /// Elementwise operator application; writes OMF/RMF.
    Operate { dst: Xr, src: Xr, operator: OperatorId },

    /// Number of elements of a result list.
    Size { dst: Gpr, src: Xr },

    /// Push the matched element at the loop cursor into the transaction's
    /// matched-variables log.
    PushMatched { transformed: Xr, results: Xr, cursor: Gpr },
    PushAllMatched { transformed: Xr, results: Xr },

    /// Expand the rule's msg/logdata templates into the transaction.
    ExpandMacro { rule: RuleId },
    /// Matched-rule epilogue: record severity, invoke the host callback.
    LogCallback,

    /// Run the action for the current loop element, gated by its branch.
    Action { results: Xr, action: ActionId },
    /// Run the action once, unconditionally (operator-less rules).
    UncAction { action: ActionId },

    /// If the current rule is disruptive and a disposition is decided, write
    /// it as the exit value and terminate the program.
    ExitIfDisruptive,
}

impl Op {
    /// Rewrite this instruction's jump target (relocation).
    pub fn relocate(&mut self, target: Addr) {
        match self {
            Op::Jmp(t)
            | Op::Jz(t)
            | Op::Jnz(t)
            | Op::Jom(t)
            | Op::Jnom(t)
            | Op::Jrm(t)
            | Op::Jnrm(t)
            | Op::Jem { target: t, .. }
            | Op::Jnem { target: t, .. }
            | Op::JmpIfRemoved(t) => *t = target,
            other => {
                debug_assert!(false, "relocating a non-jump instruction: {other:?}");
            }
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Mov { dst, imm } => write!(f, "MOV {dst:?}, {imm}"),
            Op::Add { dst, imm } => write!(f, "ADD {dst:?}, {imm}"),
            Op::Cmp { a, b } => write!(f, "CMP {a:?}, {b:?}"),
            Op::Jmp(t) => write!(f, "JMP {t:#x}"),
            Op::Jz(t) => write!(f, "JZ {t:#x}"),
            Op::Jnz(t) => write!(f, "JNZ {t:#x}"),
            Op::Jom(t) => write!(f, "JOM {t:#x}"),
            Op::Jnom(t) => write!(f, "JNOM {t:#x}"),
            Op::Jrm(t) => write!(f, "JRM {t:#x}"),
            Op::Jnrm(t) => write!(f, "JNRM {t:#x}"),
            Op::Jem { results, cursor, target } => {
                write!(f, "JEM {results:?}[{cursor:?}], {target:#x}")
            }
            Op::Jnem { results, cursor, target } => {
                write!(f, "JNEM {results:?}[{cursor:?}], {target:#x}")
            }
            Op::Nop => write!(f, "NOP"),
            Op::Debug(msg) => write!(f, "DEBUG {msg:?}"),
            Op::RuleStart { rule } => write!(f, "RULE_START r{rule}"),
            Op::ChainStart { rule } => write!(f, "CHAIN_START r{rule}"),
            Op::ChainEnd { rule } => write!(f, "CHAIN_END r{rule}"),
            Op::JmpIfRemoved(t) => write!(f, "JMP_IF_REMOVED {t:#x}"),
            Op::SetCurrVar { var } => write!(f, "SET_CURR_VAR v{var}"),
            Op::TransformStart { reg } => write!(f, "TRANSFORM_START {reg:?}"),
            Op::LoadCc { dst, var } => write!(f, "LOAD_CC {dst:?}, v{var}"),
            Op::LoadCs { dst, var } => write!(f, "LOAD_CS {dst:?}, v{var}"),
            Op::LoadVc { dst, var } => write!(f, "LOAD_VC {dst:?}, v{var}"),
            Op::LoadVr { dst, var } => write!(f, "LOAD_VR {dst:?}, v{var}"),
            Op::LoadVs { dst, var } => write!(f, "LOAD_VS {dst:?}, v{var}"),
            Op::Transform { dst, src, kind } => {
                write!(f, "TRANSFORM_{} {dst:?}, {src:?}", kind.name())
            }
            Op::Operate { dst, src, operator } => {
                write!(f, "OPERATE {dst:?}, {src:?}, o{operator}")
            }
            Op::Size { dst, src } => write!(f, "SIZE {dst:?}, {src:?}"),
            Op::PushMatched { transformed, results, cursor } => {
                write!(f, "PUSH_MATCHED {transformed:?}, {results:?}, {cursor:?}")
            }
            Op::PushAllMatched { transformed, results } => {
                write!(f, "PUSH_ALL_MATCHED {transformed:?}, {results:?}")
            }
            Op::ExpandMacro { rule } => write!(f, "EXPAND_MACRO r{rule}"),
            Op::LogCallback => write!(f, "LOG_CALLBACK"),
            Op::Action { results, action } => write!(f, "ACTION {results:?}, a{action}"),
            Op::UncAction { action } => write!(f, "UNC_ACTION a{action}"),
            Op::ExitIfDisruptive => write!(f, "EXIT_IF_DISRUPTIVE"),
        }
    }
}
