//! Rule compiler.
//!
//! Lowers one phase's rules, in declared order, into a single [`Program`].
//!
//! A standalone rule compiles to one pass: per variable, load → transform →
//! operate, then the per-element action loop (which also pushes matches into
//! the transaction log when needed):
//!
//! ```text
//! RULE_START ; JMP_IF_REMOVED ──────────────┐
//! per variable:                             │
//!   SET_CURR_VAR ; LOAD_<mode> -> R8        │
//!   TRANSFORM_START R8                      │
//!   TRANSFORM ...   (R9/R10 ping-pong)      │
//!   OPERATE -> R11  (| cascade via JOM)     │
//!   SIZE RAX ; MOV RCX, 0                   │
//!   loop: CMP ; JZ ; ACTION* ;              │
//!         PUSH_MATCHED? ; ADD ; JMP         │
//! JNRM ─────────────────────────────────────┤
//! EXPAND_MACRO ; LOG_CALLBACK ;             │
//! EXIT_IF_DISRUPTIVE                        │
//! <rule end> <───────────────────────────────┘
//! ```
//!
//! A plain chain (every link declared with unprefixed `chain`) compiles to
//! two passes. The predicate pass walks every member with short-circuit
//! (`JNRM`) and records matches with `PUSH_ALL_MATCHED` so later members can
//! read the MATCHED_VAR family; no action runs yet. The action pass, reached
//! only when every member matched, re-evaluates each member (transformations
//! hit the per-transaction cache) and runs its per-element action loops.
//! This keeps a starter's `setvar` from firing when a later chain member
//! fails.
//!
//! Chains carrying a prefixed link (`!chain`, `*chain`) or a per-element
//! link (`multiChain`) compile inline instead: members run one after another
//! with actions in place, each link gating its continuation on the declared
//! branch. A `multiChain` link wraps its continuation in a loop (cursor RBX,
//! count RDX) that re-evaluates the declaring member's predicates per
//! iteration and re-runs the continuation once per element on the branch.
//!
//! `skip:N` resolves after N subsequent rules have been compiled;
//! `skipAfter:MARKER` resolves when the marker is encountered. Unresolved
//! relocations fall off the end of the program, which is a plain exit.

use super::op::{Addr, Op, RuleId};
use super::program::Program;
use super::register::{Gpr, Xr};
use crate::SharedStr;
use crate::action::ActionBranch;
use crate::rule::{ChainMode, Rule, RuleFlags};
use crate::transaction::CurrentRule;
use crate::transform::TransformKind;
use crate::variable::AccessMode;

use std::sync::Arc;

pub struct RuleCompiler;

enum SkipTarget {
    /// Remaining number of rules to skip over.
    Count(u32),
    Marker(SharedStr),
}

struct SkipInfo {
    target: SkipTarget,
    jump_at: Addr,
}

impl RuleCompiler {
    /// Compile one phase's rules into a program.
    pub fn compile_phase(rules: &[Arc<Rule>], default_action: Option<&Arc<Rule>>) -> Program {
        let mut program = Program::new();
        let mut skips: Vec<SkipInfo> = Vec::new();

        for rule in rules {
            if let Some(marker) = &rule.marker {
                let here = program.here();
                skips.retain(|info| match &info.target {
                    SkipTarget::Marker(name) if name == marker => {
                        program.relocate(info.jump_at, here);
                        false
                    }
                    _ => true,
                });
                continue;
            }

            // Expired skip counts land just before this rule.
            let here = program.here();
            skips.retain(|info| match info.target {
                SkipTarget::Count(0) => {
                    program.relocate(info.jump_at, here);
                    false
                }
                _ => true,
            });

            let preexisting = skips.len();
            Self::compile_chain(rule, default_action.map(|d| &**d), &mut program);

            // An action carrier has no operator to set RMF, so its skip is
            // unconditional.
            let skip_op = || {
                if rule.operators.is_empty() && !rule.is_chained() {
                    Op::Jmp(0)
                } else {
                    Op::Jrm(0)
                }
            };
            if let Some(count) = rule.skip {
                let jump_at = program.emit(skip_op());
                skips.push(SkipInfo { target: SkipTarget::Count(count), jump_at });
            }
            if let Some(marker) = &rule.skip_after {
                let jump_at = program.emit(skip_op());
                skips.push(SkipInfo { target: SkipTarget::Marker(marker.clone()), jump_at });
            }

            for info in skips.iter_mut().take(preexisting) {
                if let SkipTarget::Count(count) = &mut info.target {
                    *count = count.saturating_sub(1);
                }
            }
        }

        // Anything unresolved (skip past the last rule, dangling marker)
        // jumps to the program end.
        let end = program.here();
        for info in skips {
            program.relocate(info.jump_at, end);
        }

        program
    }

    fn compile_chain(starter: &Arc<Rule>, default_action: Option<&Rule>, program: &mut Program) {
        let member_ids: Vec<RuleId> = (0..starter.chain_len())
            .map(|i| program.add_rule(CurrentRule { starter: starter.clone(), chain_index: i }))
            .collect();
        let starter_id = member_ids[0];

        program.emit(Op::RuleStart { rule: starter_id });
        let removed_jump = program.emit(Op::JmpIfRemoved(0));

        if starter.operators.is_empty() && !starter.is_chained() {
            // Pure action carrier (`SecAction`): unconditional actions only.
            for action in &starter.actions {
                let action_id = program.add_action(action.clone());
                program.emit(Op::UncAction { action: action_id });
            }
            if starter.disruptive.is_some() {
                program.emit(Op::ExitIfDisruptive);
            }
            program.relocate(removed_jump, program.here());
            return;
        }

        let plain_chain = starter
            .iter_chain()
            .all(|member| member.chain_mode == ChainMode::Gated(ActionBranch::Matched));

        let mut fail_jumps: Vec<Addr> = Vec::new();

        if !starter.is_chained() {
            Self::compile_member(starter, default_action, program, Pass::Single);
            fail_jumps.push(program.emit(Op::Jnrm(0)));
        } else if plain_chain {
            // Predicate pass: short-circuit, pushes only.
            for (member, member_id) in starter.iter_chain().zip(member_ids.iter()) {
                if member.chain_index > 0 {
                    program.emit(Op::ChainStart { rule: *member_id });
                }
                Self::compile_member(member, default_action, program, Pass::Predicates);
                fail_jumps.push(program.emit(Op::Jnrm(0)));
            }

            // Action pass: every member matched; re-evaluate and run the
            // per-element action loops.
            for (member, member_id) in starter.iter_chain().zip(member_ids.iter()) {
                if member.actions.is_empty() && default_action.is_none_or(|d| d.actions.is_empty())
                {
                    continue;
                }
                program.emit(Op::ChainStart { rule: *member_id });
                Self::compile_member(member, default_action, program, Pass::Actions);
            }
            program.emit(Op::ChainEnd { rule: starter_id });
        } else {
            Self::compile_inline_links(
                starter,
                0,
                &member_ids,
                default_action,
                program,
                &mut fail_jumps,
            );
            program.emit(Op::ChainEnd { rule: starter_id });
        }

        if starter.msg.is_some() || starter.log_data.is_some() {
            program.emit(Op::ExpandMacro { rule: starter_id });
        }
        program.emit(Op::LogCallback);
        if starter.iter_chain().any(|member| member.disruptive.is_some()) {
            program.emit(Op::ExitIfDisruptive);
        }

        let end = program.here();
        program.relocate(removed_jump, end);
        for jump_at in fail_jumps {
            program.relocate(jump_at, end);
        }
    }

    /// Compile a chain inline from `index` onwards: each member runs with
    /// its actions in place, and each link gates or loops its continuation
    /// according to the declared [`ChainMode`].
    fn compile_inline_links(
        starter: &Arc<Rule>,
        index: u32,
        member_ids: &[RuleId],
        default_action: Option<&Rule>,
        program: &mut Program,
        fail_jumps: &mut Vec<Addr>,
    ) {
        let Some(member) = starter.chain_at(index) else { return };

        Self::compile_member(member, default_action, program, Pass::Single);

        if member.chain_rule.is_none() {
            fail_jumps.push(program.emit(Op::Jnrm(0)));
            return;
        }
        let next_id = member_ids[index as usize + 1];

        match member.chain_mode {
            ChainMode::Gated(branch) => {
                match branch {
                    ActionBranch::Matched => fail_jumps.push(program.emit(Op::Jnrm(0))),
                    ActionBranch::Unmatched => fail_jumps.push(program.emit(Op::Jrm(0))),
                    ActionBranch::Always => {}
                }
                program.emit(Op::ChainStart { rule: next_id });
                Self::compile_inline_links(
                    starter,
                    index + 1,
                    member_ids,
                    default_action,
                    program,
                    fail_jumps,
                );
            }
            ChainMode::PerElement(branch) => {
                // Loop over the declaring member's operator results. The
                // continuation clobbers every extended register, so the
                // member's predicates are recomputed each iteration (the
                // transformation cache absorbs the cost); RBX/RDX carry the
                // cursor and count across those runs.
                program.emit(Op::Size { dst: Gpr::Rdx, src: Xr::R11 });
                program.emit(Op::Mov { dst: Gpr::Rbx, imm: 0 });
                let loop_start = program.here();
                program.emit(Op::Cmp { a: Gpr::Rbx, b: Gpr::Rdx });
                let loop_exit = program.emit(Op::Jz(0));

                program.emit(Op::ChainStart { rule: member_ids[index as usize] });
                Self::compile_member(member, default_action, program, Pass::Recompute);
                let off_branch = match branch {
                    ActionBranch::Matched => Some(program.emit(Op::Jnem {
                        results: Xr::R11,
                        cursor: Gpr::Rbx,
                        target: 0,
                    })),
                    ActionBranch::Unmatched => Some(program.emit(Op::Jem {
                        results: Xr::R11,
                        cursor: Gpr::Rbx,
                        target: 0,
                    })),
                    ActionBranch::Always => None,
                };

                program.emit(Op::ChainStart { rule: next_id });
                let mut run_fails: Vec<Addr> = Vec::new();
                Self::compile_inline_links(
                    starter,
                    index + 1,
                    member_ids,
                    default_action,
                    program,
                    &mut run_fails,
                );

                // A continuation run that does not match only ends that run,
                // not the whole loop.
                let continue_at = program.here();
                if let Some(jump_at) = off_branch {
                    program.relocate(jump_at, continue_at);
                }
                for jump_at in run_fails {
                    program.relocate(jump_at, continue_at);
                }
                program.emit(Op::Add { dst: Gpr::Rbx, imm: 1 });
                program.emit(Op::Jmp(loop_start));
                program.relocate(loop_exit, program.here());

                fail_jumps.push(program.emit(Op::Jnrm(0)));
            }
        }
    }

    fn compile_member(
        member: &Rule,
        default_action: Option<&Rule>,
        program: &mut Program,
        pass: Pass,
    ) {
        if member.operators.is_empty() {
            if !matches!(pass, Pass::Predicates | Pass::Recompute) {
                for action in &member.actions {
                    let action_id = program.add_action(action.clone());
                    program.emit(Op::UncAction { action: action_id });
                }
            }
            return;
        }

        for var in member.variables.iter().filter(|v| !v.exclude) {
            let src = Self::compile_variable_predicates(member, var, default_action, program);

            match pass {
                Pass::Predicates => {
                    if member.needs_matched_push() {
                        program.emit(Op::PushAllMatched { transformed: src, results: Xr::R11 });
                    }
                }
                Pass::Recompute => {}
                Pass::Single | Pass::Actions => {
                    program.emit(Op::Size { dst: Gpr::Rax, src: Xr::R11 });
                    program.emit(Op::Mov { dst: Gpr::Rcx, imm: 0 });
                    let loop_start = program.here();
                    program.emit(Op::Cmp { a: Gpr::Rcx, b: Gpr::Rax });
                    let loop_exit = program.emit(Op::Jz(0));

                    let default_actions =
                        default_action.map(|d| d.actions.as_slice()).unwrap_or(&[]);
                    for action in default_actions.iter().chain(member.actions.iter()) {
                        let action_id = program.add_action(action.clone());
                        program.emit(Op::Action { results: Xr::R11, action: action_id });
                    }
                    if pass == Pass::Single && member.needs_matched_push() {
                        program.emit(Op::PushMatched {
                            transformed: src,
                            results: Xr::R11,
                            cursor: Gpr::Rcx,
                        });
                    }
                    // firstMatch ends the loop after the first matching
                    // element has run its actions.
                    let first_match_exit = if member.flags.contains(RuleFlags::FIRST_MATCH) {
                        Some(program.emit(Op::Jem {
                            results: Xr::R11,
                            cursor: Gpr::Rcx,
                            target: 0,
                        }))
                    } else {
                        None
                    };
                    program.emit(Op::Add { dst: Gpr::Rcx, imm: 1 });
                    program.emit(Op::Jmp(loop_start));
                    let after_loop = program.here();
                    program.relocate(loop_exit, after_loop);
                    if let Some(jump_at) = first_match_exit {
                        program.relocate(jump_at, after_loop);
                    }
                }
            }
        }
    }

    /// Emit one variable's load, transformation pipeline, and operator
    /// cascade; `R11` holds the operator results afterwards. Returns the
    /// register carrying the final transformed value.
    fn compile_variable_predicates(
        member: &Rule,
        var: &Arc<crate::variable::VarExpr>,
        default_action: Option<&Rule>,
        program: &mut Program,
    ) -> Xr {
        let var_id = program.add_var(var.clone());
        program.emit(Op::SetCurrVar { var: var_id });
        program.emit(match var.mode {
            AccessMode::CounterCollection => Op::LoadCc { dst: Xr::R8, var: var_id },
            AccessMode::CounterSpecific => Op::LoadCs { dst: Xr::R8, var: var_id },
            AccessMode::ValueCollection => Op::LoadVc { dst: Xr::R8, var: var_id },
            AccessMode::ValueRegex => Op::LoadVr { dst: Xr::R8, var: var_id },
            AccessMode::ValueSpecific => Op::LoadVs { dst: Xr::R8, var: var_id },
        });
        program.emit(Op::TransformStart { reg: Xr::R8 });

        let default_transforms: &[TransformKind] = match default_action {
            Some(default) if !member.ignores_default_transform() => &default.transforms,
            _ => &[],
        };
        let transforms: Vec<TransformKind> =
            default_transforms.iter().chain(member.transforms.iter()).copied().collect();

        let mut src = Xr::R8;
        let mut dst = Xr::R9;
        let mut match_jumps: Vec<Addr> = Vec::new();
        let multi_match = member.flags.contains(RuleFlags::MULTI_MATCH);

        // multiMatch re-runs the operator on the untransformed value and
        // after every intermediate transformation; a match anywhere
        // short-circuits past the remaining steps.
        if multi_match && !transforms.is_empty() {
            Self::emit_operators(member, src, program, &mut match_jumps, false);
        }
        for (i, kind) in transforms.iter().enumerate() {
            program.emit(Op::Transform { dst, src, kind: *kind });
            if src == Xr::R8 {
                src = dst;
                dst = Xr::R10;
            } else {
                std::mem::swap(&mut src, &mut dst);
            }
            let last = i + 1 == transforms.len();
            if multi_match && !last {
                Self::emit_operators(member, src, program, &mut match_jumps, false);
            }
        }
        Self::emit_operators(member, src, program, &mut match_jumps, true);

        let after_operators = program.here();
        for jump_at in match_jumps {
            program.relocate(jump_at, after_operators);
        }

        src
    }

    /// Emit the operator alternatives for one source register. Branches are
    /// joined by JOM so a match anywhere short-circuits; when `is_final`, the
    /// last alternative falls through instead.
    fn emit_operators(
        member: &Rule,
        src: Xr,
        program: &mut Program,
        match_jumps: &mut Vec<Addr>,
        is_final: bool,
    ) {
        for (i, operator) in member.operators.iter().enumerate() {
            let operator_id = program.add_operator(operator.clone());
            program.emit(Op::Operate { dst: Xr::R11, src, operator: operator_id });
            let last = i + 1 == member.operators.len();
            if !(is_final && last) {
                match_jumps.push(program.emit(Op::Jom(0)));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Standalone rule, or an inline chain member: predicates and actions
    /// in one pass.
    Single,
    /// Chain pass 1: predicates and matched pushes, no actions.
    Predicates,
    /// Chain pass 2: re-evaluate and run actions.
    Actions,
    /// Per-element chain loop body: predicates only, nothing pushed.
    Recompute,
}

/// The compiler's `needs-matched-push` reachability pass.
///
/// A chain member must push its matches when something evaluated after it
/// reads the MATCHED_VAR family: a later member's variables, operator
/// right-hand side or action macros, or the starter's msg/logdata templates
/// (which expand once the whole chain has run).
pub fn analyze_matched_push(starter: &mut Rule) {
    // Per member: does anything in it read MATCHED_*, and specifically do
    // its actions (which run inside the per-element loop, after pushes of
    // earlier elements) read it.
    let (member_reads, action_reads): (Vec<bool>, Vec<bool>) = {
        let mut reads = Vec::new();
        let mut in_actions = Vec::new();
        let mut member: Option<&Rule> = Some(starter);
        while let Some(rule) = member {
            let from_vars = rule.variables.iter().any(|v| v.reads_matched());
            let from_operators = rule.operators.iter().any(|o| o.reads_matched());
            let from_actions = rule.actions.iter().any(|a| a.reads_matched());
            reads.push(from_vars || from_operators || from_actions);
            in_actions.push(from_actions);
            member = rule.chain_rule.as_deref();
        }
        (reads, in_actions)
    };
    let macros_read = starter.msg.as_ref().is_some_and(|m| m.reads_matched())
        || starter.log_data.as_ref().is_some_and(|m| m.reads_matched());

    fn apply(
        rule: &mut Rule,
        index: usize,
        member_reads: &[bool],
        action_reads: &[bool],
        macros_read: bool,
    ) {
        let later_reads = member_reads.iter().skip(index + 1).any(|r| *r);
        let own_action_reads = action_reads.get(index).copied().unwrap_or(false);
        rule.flags.set(
            RuleFlags::NEEDS_MATCHED_PUSH,
            later_reads || own_action_reads || macros_read,
        );
        if let Some(next) = rule.chain_rule.as_deref_mut() {
            apply(next, index + 1, member_reads, action_reads, macros_read);
        }
    }
    apply(starter, 0, &member_reads, &action_reads, macros_read);
}

/// Hoist a disruptive action declared on a chained continuation up to the
/// starter, where the chain epilogue evaluates it.
pub fn hoist_chain_disruptive(starter: &mut Rule) {
    if starter.disruptive.is_some() {
        return;
    }
    let mut found = None;
    let mut member = starter.chain_rule.as_deref_mut();
    while let Some(rule) = member {
        if let Some(disruptive) = rule.disruptive.take() {
            found = Some((disruptive, rule.status.take()));
            break;
        }
        member = rule.chain_rule.as_deref_mut();
    }
    if let Some((disruptive, status)) = found {
        starter.disruptive = Some(disruptive);
        if starter.status.is_none() {
            starter.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macro_expr::MacroExpr;
    use crate::operator::Operator;
    use crate::variable::VarExpr;

    fn rule_with(variables: &[&str], operator: Option<(&str, &str)>) -> Rule {
        Rule {
            id: 1,
            variables: variables
                .iter()
                .map(|spec| Arc::new(VarExpr::parse(spec).unwrap()))
                .collect(),
            operators: operator
                .map(|(name, arg)| vec![Arc::new(Operator::new(name, arg, false, None).unwrap())])
                .unwrap_or_default(),
            ..Rule::default()
        }
    }

    #[test]
    fn action_carrier_compiles_to_unconditional_actions() {
        let rule = Arc::new(Rule {
            actions: vec![Arc::new(crate::action::Action::new(
                crate::action::ActionBranch::Matched,
                crate::action::ActionKind::SetVar(
                    crate::action::SetVar::parse("tx.x=1").unwrap(),
                ),
            ))],
            ..Rule::default()
        });
        let program = RuleCompiler::compile_phase(&[rule], None);
        let listing = program.disassemble();
        assert!(listing.contains("UNC_ACTION"));
        assert!(!listing.contains("OPERATE"));
    }

    #[test]
    fn operator_rule_emits_the_matched_loop() {
        let rule = Arc::new(rule_with(&["ARGS:foo"], Some(("streq", "x"))));
        let program = RuleCompiler::compile_phase(&[rule], None);
        let listing = program.disassemble();
        for expected in
            ["RULE_START", "LOAD_VS", "TRANSFORM_START", "OPERATE", "SIZE", "CMP", "JNRM"]
        {
            assert!(listing.contains(expected), "missing {expected} in:\n{listing}");
        }
    }

    #[test]
    fn chain_compiles_predicate_and_action_passes() {
        let mut starter = rule_with(&["ARGS:a"], Some(("streq", "x")));
        starter.actions.push(Arc::new(crate::action::Action::new(
            crate::action::ActionBranch::Matched,
            crate::action::ActionKind::SetVar(crate::action::SetVar::parse("tx.s=1").unwrap()),
        )));
        let mut tail = rule_with(&["ARGS:b"], Some(("streq", "y")));
        tail.chain_index = 1;
        starter.chain_rule = Some(Box::new(tail));

        let program = RuleCompiler::compile_phase(&[Arc::new(starter)], None);
        let listing = program.disassemble();

        // Predicate pass short-circuits, action pass re-evaluates: the
        // starter's operator appears in both passes.
        assert!(listing.contains("CHAIN_START"));
        assert!(listing.contains("CHAIN_END"));
        assert_eq!(listing.matches("JNRM").count(), 2);
        assert!(listing.matches("OPERATE").count() >= 3);
        assert!(listing.contains("ACTION"));
    }

    #[test]
    fn per_element_chain_compiles_to_a_continuation_loop() {
        let mut starter = rule_with(&["TX"], Some(("lt", "300")));
        starter.chain_mode = ChainMode::PerElement(ActionBranch::Matched);
        let mut tail = rule_with(&["TX:foo"], Some(("unconditionalMatch", "")));
        tail.chain_index = 1;
        tail.actions.push(Arc::new(crate::action::Action::new(
            crate::action::ActionBranch::Matched,
            crate::action::ActionKind::SetVar(crate::action::SetVar::parse("tx.test=+1").unwrap()),
        )));
        starter.chain_rule = Some(Box::new(tail));

        let program = RuleCompiler::compile_phase(&[Arc::new(starter)], None);
        let listing = program.disassemble();

        // The loop sizes into RDX, cursors RBX, and skips off-branch
        // elements with JNEM before re-entering the continuation.
        assert!(listing.contains("SIZE Rdx"), "{listing}");
        assert!(listing.contains("JNEM R11[Rbx]"), "{listing}");
        assert!(listing.matches("CHAIN_START").count() >= 2, "{listing}");
        assert!(listing.contains("ACTION"), "{listing}");
    }

    #[test]
    fn gated_chain_branch_selects_the_link_jump() {
        let mut starter = rule_with(&["ARGS:a"], Some(("streq", "x")));
        starter.chain_mode = ChainMode::Gated(ActionBranch::Unmatched);
        let mut tail = rule_with(&["ARGS:b"], Some(("streq", "y")));
        tail.chain_index = 1;
        starter.chain_rule = Some(Box::new(tail));

        let program = RuleCompiler::compile_phase(&[Arc::new(starter)], None);
        let listing = program.disassemble();
        // The inline link gates the continuation on the rule NOT matching.
        assert!(listing.contains("JRM"), "{listing}");
    }

    #[test]
    fn first_match_emits_a_loop_exit_on_the_element() {
        let mut rule = rule_with(&["TX"], Some(("gt", "100")));
        rule.flags.insert(RuleFlags::FIRST_MATCH);
        let program = RuleCompiler::compile_phase(&[Arc::new(rule)], None);
        assert!(program.disassemble().contains("JEM R11[Rcx]"));
    }

    #[test]
    fn matched_push_analysis_marks_producers_only() {
        let mut chained = rule_with(&["ARGS:a"], Some(("streq", "x")));
        let mut reader = rule_with(&["MATCHED_VAR"], Some(("streq", "y")));
        reader.chain_index = 2;
        let mut middle = rule_with(&["ARGS:b"], Some(("streq", "z")));
        middle.chain_index = 1;
        middle.chain_rule = Some(Box::new(reader));
        chained.chain_rule = Some(Box::new(middle));

        analyze_matched_push(&mut chained);

        assert!(chained.needs_matched_push());
        assert!(chained.chain_rule.as_ref().unwrap().needs_matched_push());
        // The tail reads but nothing after it does.
        let tail = chained.chain_rule.as_ref().unwrap().chain_rule.as_ref().unwrap();
        assert!(!tail.needs_matched_push());
    }

    #[test]
    fn starter_macros_force_pushes_on_every_member() {
        let mut starter = rule_with(&["ARGS:a"], Some(("streq", "x")));
        starter.log_data = Some(Arc::new(MacroExpr::parse("%{MATCHED_VAR}").unwrap()));
        let mut tail = rule_with(&["ARGS:b"], Some(("streq", "y")));
        tail.chain_index = 1;
        starter.chain_rule = Some(Box::new(tail));

        analyze_matched_push(&mut starter);
        assert!(starter.needs_matched_push());
        assert!(starter.chain_rule.as_ref().unwrap().needs_matched_push());
    }

    #[test]
    fn no_push_without_readers() {
        let mut rule = rule_with(&["ARGS:a"], Some(("streq", "x")));
        analyze_matched_push(&mut rule);
        assert!(!rule.needs_matched_push());
        let program = RuleCompiler::compile_phase(&[Arc::new(rule)], None);
        assert!(!program.disassemble().contains("PUSH_MATCHED"));
    }

    #[test]
    fn disruptive_hoists_from_chain_member() {
        use crate::rule::DisruptiveKind;
        let mut starter = rule_with(&["ARGS:a"], Some(("streq", "x")));
        let mut tail = rule_with(&["ARGS:b"], Some(("streq", "y")));
        tail.chain_index = 1;
        tail.disruptive = Some(DisruptiveKind::Deny);
        tail.status = Some(403);
        starter.chain_rule = Some(Box::new(tail));

        hoist_chain_disruptive(&mut starter);
        assert_eq!(starter.disruptive, Some(DisruptiveKind::Deny));
        assert_eq!(starter.status, Some(403));
        assert!(starter.chain_rule.as_ref().unwrap().disruptive.is_none());
    }

    #[test]
    fn skip_jumps_over_following_rules() {
        let skipping = Arc::new(Rule {
            skip: Some(1),
            ..rule_with(&["ARGS:a"], Some(("streq", "x")))
        });
        let skipped = Arc::new(rule_with(&["ARGS:b"], Some(("streq", "y"))));
        let landing = Arc::new(rule_with(&["ARGS:c"], Some(("streq", "z"))));

        let program = RuleCompiler::compile_phase(&[skipping, skipped, landing], None);
        let listing = program.disassemble();
        assert!(listing.contains("JRM"));
        // The relocation must point inside the program, not at the default 0.
        assert!(!listing.contains("JRM 0x0\n"), "unresolved skip target:\n{listing}");
    }
}
