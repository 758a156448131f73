//! Compiled programs.
//!
//! A program owns a linear instruction stream plus the reference tables its
//! instructions index into: rules (as starter + chain index), variable
//! expressions, operators, and actions. The tables hold shared handles, so a
//! program stays valid for as long as it lives regardless of what happens to
//! the engine's rule list afterwards.

use super::op::{ActionId, Addr, Op, OperatorId, RuleId, VarId};
use crate::action::Action;
use crate::operator::Operator;
use crate::transaction::CurrentRule;
use crate::variable::VarExpr;

use std::sync::Arc;

#[derive(Default)]
pub struct Program {
    code: Vec<Op>,
    rules: Vec<CurrentRule>,
    vars: Vec<Arc<VarExpr>>,
    operators: Vec<Arc<Operator>>,
    actions: Vec<Arc<Action>>,
}

impl Program {
    pub fn new() -> Program {
        Program { code: Vec::with_capacity(1024), ..Program::default() }
    }

    /// Append an instruction, returning its address.
    pub fn emit(&mut self, op: Op) -> Addr {
        self.code.push(op);
        self.code.len() - 1
    }

    /// Next instruction address (the current end of the stream).
    pub fn here(&self) -> Addr {
        self.code.len()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn op(&self, pc: Addr) -> Option<&Op> {
        self.code.get(pc)
    }

    /// Resolve the jump at `at` to `target`.
    pub fn relocate(&mut self, at: Addr, target: Addr) {
        if let Some(op) = self.code.get_mut(at) {
            op.relocate(target);
        }
    }

    pub fn add_rule(&mut self, rule: CurrentRule) -> RuleId {
        self.rules.push(rule);
        (self.rules.len() - 1) as RuleId
    }

    pub fn add_var(&mut self, var: Arc<VarExpr>) -> VarId {
        self.vars.push(var);
        (self.vars.len() - 1) as VarId
    }

    pub fn add_operator(&mut self, operator: Arc<Operator>) -> OperatorId {
        self.operators.push(operator);
        (self.operators.len() - 1) as OperatorId
    }

    pub fn add_action(&mut self, action: Arc<Action>) -> ActionId {
        self.actions.push(action);
        (self.actions.len() - 1) as ActionId
    }

    pub fn rule(&self, id: RuleId) -> &CurrentRule {
        &self.rules[id as usize]
    }

    pub fn var(&self, id: VarId) -> &Arc<VarExpr> {
        &self.vars[id as usize]
    }

    pub fn operator(&self, id: OperatorId) -> &Arc<Operator> {
        &self.operators[id as usize]
    }

    pub fn action(&self, id: ActionId) -> &Arc<Action> {
        &self.actions[id as usize]
    }

    /// Human-readable listing, for tests and debugging.
    pub fn disassemble(&self) -> String {
        self.code
            .iter()
            .enumerate()
            .map(|(addr, op)| format!("{addr:#06x}  {op}\n"))
            .collect()
    }
}
