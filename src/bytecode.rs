//! Bytecode: the compiled form of rules and the machine that runs it.
//!
//! The pipeline from directives to dispositions:
//!
//! ```text
//! SecLang text ── seclang::parse ──> Rule tree        (rule.rs)
//!                                      │
//!                        RuleCompiler::compile_phase  (compiler.rs)
//!                                      │
//!                                      v
//!                             Program (one per phase) (program.rs)
//!                                      │
//!            VirtualMachine::execute, per transaction (vm.rs)
//!                                      │
//!                                      v
//!                          Option<Disposition> + matched log
//! ```
//!
//! Programs are immutable and shared by every transaction; the VM binds one
//! program to one transaction for the duration of a phase.

#[path = "bytecode/compiler.rs"]
pub(crate) mod compiler;
#[path = "bytecode/op.rs"]
pub(crate) mod op;
#[path = "bytecode/program.rs"]
pub(crate) mod program;
#[path = "bytecode/register.rs"]
pub(crate) mod register;
#[path = "bytecode/vm.rs"]
pub(crate) mod vm;

pub(crate) use program::Program;
