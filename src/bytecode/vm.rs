//! The virtual machine.
//!
//! Register-based, single-threaded, run-to-completion: one program executes
//! on the calling thread against one transaction, with no suspension. Many
//! VMs may run concurrently on different threads, each bound to its own
//! transaction, all sharing the immutable program.
//!
//! Error handling follows the engine's contract: soft failures (a variable
//! that cannot be produced, an operator without its auxiliary data) surface
//! as empty result lists or unmatched elements; hard failures (an
//! out-of-range jump) terminate the current program only, returning "safe".

use super::op::Op;
use super::program::Program;
use super::register::{ExtendedRegisters, GeneralRegisters, Gpr, Rflags, Xr};
use crate::rule::RuleFlags;
use crate::transaction::{MatchCallback, MatchedVariable, Transaction};
use crate::variable::AccessMode;
use crate::{Disposition, EvaluateResults, ResultElement, SharedStr, Value};

use tracing::{error, trace};

pub struct VirtualMachine<'t, 'e, 'cb> {
    tx: &'t mut Transaction<'e>,
    on_match: MatchCallback<'cb>,
    general: GeneralRegisters,
    extended: ExtendedRegisters,
    flags: Rflags,
    /// Reference-table index of the rule being evaluated.
    curr_rule: Option<u32>,
}

impl<'t, 'e, 'cb> VirtualMachine<'t, 'e, 'cb> {
    pub fn new(tx: &'t mut Transaction<'e>, on_match: MatchCallback<'cb>) -> Self {
        VirtualMachine {
            tx,
            on_match,
            general: GeneralRegisters::default(),
            extended: ExtendedRegisters::default(),
            flags: Rflags::default(),
            curr_rule: None,
        }
    }

    /// Run `program` to completion. `Some` carries a disruptive (or allow)
    /// disposition decided by `EXIT_IF_DISRUPTIVE`; `None` means the program
    /// ran off its end without disrupting — the transaction is safe so far.
    pub fn execute(mut self, program: &Program) -> Option<Disposition> {
        let mut pc: usize = 0;

        while let Some(op) = program.op(pc) {
            trace!(pc, op = %op, "exec");

            match op {
                Op::Mov { dst, imm } => {
                    self.general[*dst] = *imm;
                    pc += 1;
                }
                Op::Add { dst, imm } => {
                    self.general[*dst] += *imm;
                    pc += 1;
                }
                Op::Cmp { a, b } => {
                    self.flags.set(Rflags::ZF, self.general[*a] == self.general[*b]);
                    pc += 1;
                }

                Op::Jmp(target) => match self.jump_target(program, *target) {
                    Some(next) => pc = next,
                    None => return None,
                },
                Op::Jz(target) => match self.conditional(program, pc, *target, Rflags::ZF, true) {
                    Some(next) => pc = next,
                    None => return None,
                },
                Op::Jnz(target) => match self.conditional(program, pc, *target, Rflags::ZF, false)
                {
                    Some(next) => pc = next,
                    None => return None,
                },
                Op::Jom(target) => match self.conditional(program, pc, *target, Rflags::OMF, true)
                {
                    Some(next) => pc = next,
                    None => return None,
                },
                Op::Jnom(target) => {
                    match self.conditional(program, pc, *target, Rflags::OMF, false) {
                        Some(next) => pc = next,
                        None => return None,
                    }
                }
                Op::Jrm(target) => match self.conditional(program, pc, *target, Rflags::RMF, true)
                {
                    Some(next) => pc = next,
                    None => return None,
                },
                Op::Jnrm(target) => {
                    match self.conditional(program, pc, *target, Rflags::RMF, false) {
                        Some(next) => pc = next,
                        None => return None,
                    }
                }
                Op::Jem { results, cursor, target } => {
                    if self.element_matched(*results, *cursor) {
                        match self.jump_target(program, *target) {
                            Some(next) => pc = next,
                            None => return None,
                        }
                    } else {
                        pc += 1;
                    }
                }
                Op::Jnem { results, cursor, target } => {
                    if self.element_matched(*results, *cursor) {
                        pc += 1;
                    } else {
                        match self.jump_target(program, *target) {
                            Some(next) => pc = next,
                            None => return None,
                        }
                    }
                }

                Op::Nop => pc += 1,
                Op::Debug(message) => {
                    trace!(message = %message, "debug");
                    pc += 1;
                }

                Op::RuleStart { rule } => {
                    self.flags.remove(Rflags::RMF);
                    self.curr_rule = Some(*rule);
                    self.tx.set_current(program.rule(*rule).clone());
                    self.tx.clear_capture_ring();
                    self.tx.clear_matched_log();
                    pc += 1;
                }
                Op::ChainStart { rule } => {
                    self.flags.remove(Rflags::RMF);
                    self.curr_rule = Some(*rule);
                    self.tx.set_current(program.rule(*rule).clone());
                    pc += 1;
                }
                Op::ChainEnd { rule } => {
                    self.curr_rule = Some(*rule);
                    self.tx.set_current(program.rule(*rule).clone());
                    pc += 1;
                }
                Op::JmpIfRemoved(target) => {
                    let removed = self
                        .curr_rule
                        .map(|id| self.tx.is_rule_removed(program.rule(id).starter.id))
                        .unwrap_or(false);
                    if removed {
                        match self.jump_target(program, *target) {
                            Some(next) => pc = next,
                            None => return None,
                        }
                    } else {
                        pc += 1;
                    }
                }
                Op::SetCurrVar { var } => {
                    self.tx.set_current_var(program.var(*var).clone());
                    pc += 1;
                }

                Op::TransformStart { reg } => {
                    let len = self.extended[*reg].len();
                    self.tx.trail_reset(len);
                    pc += 1;
                }

                Op::LoadCc { dst, var }
                | Op::LoadCs { dst, var }
                | Op::LoadVc { dst, var }
                | Op::LoadVr { dst, var }
                | Op::LoadVs { dst, var } => {
                    self.exec_load(program, *dst, *var);
                    pc += 1;
                }

                Op::Transform { dst, src, kind } => {
                    self.exec_transform(*dst, *src, *kind);
                    pc += 1;
                }
                Op::Operate { dst, src, operator } => {
                    self.exec_operate(program, *dst, *src, *operator);
                    pc += 1;
                }

                Op::Size { dst, src } => {
                    self.general[*dst] = self.extended[*src].len() as i64;
                    pc += 1;
                }

                Op::PushMatched { transformed, results, cursor } => {
                    let index = self.general[*cursor].max(0) as usize;
                    self.exec_push_matched(program, *transformed, *results, index);
                    pc += 1;
                }
                Op::PushAllMatched { transformed, results } => {
                    for index in 0..self.extended[*results].len() {
                        self.exec_push_matched(program, *transformed, *results, index);
                    }
                    pc += 1;
                }

                Op::ExpandMacro { rule } => {
                    let starter = &program.rule(*rule).starter;
                    if let Some(msg) = &starter.msg {
                        let expanded = msg.expand_str(self.tx);
                        self.tx.set_msg_expanded(expanded);
                    }
                    if let Some(log_data) = &starter.log_data {
                        let expanded = log_data.expand_str(self.tx);
                        self.tx.set_log_data_expanded(expanded);
                    }
                    pc += 1;
                }
                Op::LogCallback => {
                    if let Some(current) = self.curr_rule.map(|id| program.rule(id)) {
                        let rule = current.rule();
                        self.tx.note_rule_matched(rule);
                        if rule.logs() {
                            (self.on_match)(rule);
                        }
                    }
                    pc += 1;
                }

                Op::Action { results, action } => {
                    let index = self.general[Gpr::Rcx].max(0) as usize;
                    let action = program.action(*action).clone();
                    let element_matched = self.element_matched_at(*results, index);
                    let fires = match action.branch {
                        // allMatch withholds matched-branch actions unless
                        // every element of the collection matched.
                        crate::action::ActionBranch::Matched => {
                            element_matched && self.all_match_gate_open(program, *results)
                        }
                        crate::action::ActionBranch::Unmatched => !element_matched,
                        crate::action::ActionBranch::Always => true,
                    };
                    if fires {
                        action.evaluate(self.tx);
                    }
                    pc += 1;
                }
                Op::UncAction { action } => {
                    let action = program.action(*action).clone();
                    action.evaluate(self.tx);
                    pc += 1;
                }

                Op::ExitIfDisruptive => {
                    if let Some(current) = self.curr_rule.map(|id| program.rule(id)) {
                        if let Some(disposition) = self.tx.do_disruptive(current.rule()) {
                            trace!(rule = current.starter.id, ?disposition, "disruptive exit");
                            return Some(disposition);
                        }
                    }
                    pc += 1;
                }
            }
        }

        None
    }

    /// Validate a jump target. Landing exactly on `len` is a normal exit;
    /// anything beyond is malformed bytecode and aborts dispatch as "safe".
    fn jump_target(&self, program: &Program, target: usize) -> Option<usize> {
        if target > program.len() {
            error!(target, len = program.len(), "jump out of range, aborting program");
            return None;
        }
        Some(target)
    }

    fn conditional(
        &self,
        program: &Program,
        pc: usize,
        target: usize,
        flag: Rflags,
        wanted: bool,
    ) -> Option<usize> {
        if self.flags.contains(flag) == wanted {
            self.jump_target(program, target)
        } else {
            Some(pc + 1)
        }
    }

    /// Is the result-list element the cursor register points at a match?
    /// Elements already moved into the matched log count as matches: only
    /// matched elements get taken.
    fn element_matched(&self, results: Xr, cursor: Gpr) -> bool {
        let index = self.general[cursor].max(0) as usize;
        self.element_matched_at(results, index)
    }

    fn element_matched_at(&self, results: Xr, index: usize) -> bool {
        self.extended[results].get(index).map(|el| !el.value.is_int()).unwrap_or(false)
    }

    /// `allMatch` gate: open unless the current rule carries the flag and
    /// some element of the operator results did not match.
    fn all_match_gate_open(&self, program: &Program, results: Xr) -> bool {
        let all_match = self
            .curr_rule
            .map(|id| program.rule(id).rule().flags.contains(RuleFlags::ALL_MATCH))
            .unwrap_or(false);
        if !all_match {
            return true;
        }
        self.extended[results].iter().all(|el| !el.value.is_int())
    }

    fn exec_load(&mut self, program: &Program, dst: Xr, var_id: u32) {
        let var = program.var(var_id);
        let mut out = EvaluateResults::default();
        var.evaluate(self.tx, &mut out);

        // Collection loads honor `!VAR` exclusions on the rule and targets
        // removed earlier in this transaction by `ctl:ruleRemoveTarget*`.
        if matches!(var.mode, AccessMode::ValueCollection | AccessMode::ValueRegex) {
            if let Some(current) = self.curr_rule.map(|id| program.rule(id)) {
                let rule = current.rule();
                let rule_id = current.starter.id;
                let mut filtered = EvaluateResults::default();
                for element in out.iter() {
                    let sub_name = element.sub_name.as_deref();
                    let excluded = rule.variables.iter().any(|x| {
                        x.exclude
                            && x.kind == var.kind
                            && match (&x.sub_name, sub_name) {
                                (None, _) => true,
                                (Some(ex), Some(sub)) => ex.eq_ignore_ascii_case(sub),
                                (Some(_), None) => false,
                            }
                    }) || self.tx.is_target_removed(rule_id, var.kind, sub_name);
                    if !excluded {
                        filtered.append(element.clone());
                    }
                }
                out = filtered;
            }
        }

        self.extended[dst] = out;
    }

    fn exec_transform(&mut self, dst: Xr, src: Xr, kind: crate::transform::TransformKind) {
        let input = self.extended[src].clone();
        let mut out = EvaluateResults::default();

        for (index, element) in input.iter().enumerate() {
            let Value::Str(text) = &element.value else {
                // Not a string: pass through unchanged so sizes stay aligned
                // for the operator and push instructions.
                out.append(element.clone());
                continue;
            };

            match self.tx.transform_cache().lookup(kind, text) {
                Some(Some(cached)) => {
                    trace!(transform = kind.name(), "transform cache hit");
                    self.tx.trail_push(index, kind);
                    out.append(ResultElement::new(Value::Str(cached), element.sub_name.clone()));
                }
                Some(None) => {
                    trace!(transform = kind.name(), "transform cache hit (no change)");
                    out.append(element.clone());
                }
                None => match kind.apply(text) {
                    Some(result) => {
                        let result: SharedStr = result.into();
                        self.tx.transform_cache().store(kind, text.clone(), Some(result.clone()));
                        self.tx.trail_push(index, kind);
                        out.append(ResultElement::new(
                            Value::Str(result),
                            element.sub_name.clone(),
                        ));
                    }
                    None => {
                        self.tx.transform_cache().store(kind, text.clone(), None);
                        out.append(element.clone());
                    }
                },
            }
        }

        self.extended[dst] = out;
    }

    fn exec_operate(&mut self, program: &Program, dst: Xr, src: Xr, operator_id: u32) {
        let operator = program.operator(operator_id).clone();
        let input = self.extended[src].clone();
        let mut out = EvaluateResults::default();
        let mut any_matched = false;

        for element in input.iter() {
            let mut matched = operator.evaluate(self.tx, &element.value);
            matched ^= operator.negated;

            // The host may veto a match through its additional condition.
            if matched {
                if let (Some(current), Some(text)) =
                    (self.curr_rule.map(|id| program.rule(id)), element.value.as_str())
                {
                    let vetoed = {
                        let var = self.tx.current_var().cloned();
                        match (self.tx.additional_condition(), var) {
                            (Some(condition), Some(var)) => {
                                !condition(current.rule(), text, &var)
                            }
                            _ => false,
                        }
                    };
                    if vetoed {
                        matched = false;
                    }
                }
            }

            if matched {
                let capture =
                    self.tx.merge_staged_captures().unwrap_or_else(SharedStr::empty);
                out.append(ResultElement::new(
                    Value::Str(capture),
                    element.sub_name.clone(),
                ));
                any_matched = true;
            } else {
                self.tx.clear_staged_captures();
                out.append(ResultElement::new(Value::Int(0), element.sub_name.clone()));
            }

            trace!(
                operator = operator.name(),
                negated = operator.negated,
                matched,
                "operator evaluated"
            );
        }

        self.extended[dst] = out;
        self.flags.set(Rflags::OMF, any_matched);
        if any_matched {
            self.flags.insert(Rflags::RMF);
        }
    }

    fn exec_push_matched(&mut self, program: &Program, transformed: Xr, results: Xr, index: usize) {
        let Some(current) = self.curr_rule.map(|id| program.rule(id)) else { return };
        let chain_index = current.chain_index;

        if !self.element_matched_at(results, index) {
            return;
        }
        if !self.all_match_gate_open(program, results) {
            return;
        }
        let Some(var) = self.tx.current_var().cloned() else { return };

        // With no transformations the operator source aliases the load
        // register; clone the shared element instead of moving it twice.
        let (original, transformed_element) = if transformed == Xr::R8 {
            let element = self.extended[Xr::R8].take(index).unwrap_or_default();
            (element.clone(), element)
        } else {
            (
                self.extended[Xr::R8].take(index).unwrap_or_default(),
                self.extended[transformed].take(index).unwrap_or_default(),
            )
        };
        let operator_element = self.extended[results].take(index).unwrap_or_default();
        let trail = self.tx.trail_take(index);

        let sub_name = original.sub_name.clone().or_else(|| var.sub_name.clone());
        self.tx.push_matched(MatchedVariable {
            kind: var.kind,
            sub_name,
            chain_index,
            original: original.value,
            transformed: transformed_element.value,
            operator_result: operator_element.value,
            transform_trail: trail,
        });
    }
}
