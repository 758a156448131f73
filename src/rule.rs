//! Rule intermediate representation.
//!
//! A [`Rule`] is the parsed, pre-bytecode form of one `SecRule`/`SecAction`
//! directive, including its chained continuations. Rules are immutable once
//! the engine is initialized; the compiler reads them and the resulting
//! programs reference them through per-program tables.

use crate::action::{Action, ActionBranch};
use crate::macro_expr::MacroExpr;
use crate::operator::Operator;
use crate::transform::TransformKind;
use crate::variable::VarExpr;
use crate::{AllowScope, Phase, Severity, SharedStr};

use std::sync::Arc;

bitflags::bitflags! {
    /// Per-rule boolean switches set by action keywords and compiler analysis.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuleFlags: u16 {
        /// `t:none` was given: the phase's default transformations are skipped.
        const IGNORE_DEFAULT_TRANSFORM = 1 << 0;
        /// Something later in the chain (or the starter's macros) reads the
        /// MATCHED_VAR family, so this rule must push its matches into the
        /// transaction log. Set by the compiler, never by the parser.
        const NEEDS_MATCHED_PUSH = 1 << 1;
        /// `multiMatch`: re-run the operator after every transformation step.
        const MULTI_MATCH = 1 << 2;
        /// `capture`: promote staged operator captures into TX:0..9.
        const CAPTURE = 1 << 3;
        /// `log` (default): invoke the host match callback on match.
        const LOG = 1 << 4;
        /// `auditlog` (default): record the match for audit logging.
        const AUDIT_LOG = 1 << 5;
        /// `allMatch`: per-element actions fire only when every element of
        /// the targeted collection matched.
        const ALL_MATCH = 1 << 6;
        /// `firstMatch`: the per-element action loop stops after the first
        /// matching element.
        const FIRST_MATCH = 1 << 7;
    }
}

/// How a rule's chained continuation is linked to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// `chain` (with an optional `!`/`*` prefix): the continuation is
    /// evaluated once, when this rule fell on the given branch.
    Gated(ActionBranch),
    /// `multiChain` / `!multiChain`: the continuation re-runs once per
    /// element of this rule's operator results that falls on the branch.
    PerElement(ActionBranch),
}

/// The disruptive action a rule carries, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum DisruptiveKind {
    Allow(AllowScope),
    /// `block`: defers to the phase's default-action disruptive kind.
    Block,
    Deny,
    Drop,
    Pass,
    Redirect(SharedStr),
}

/// One compiled-from-SecLang rule, possibly the head of a chain.
///
/// Chained continuations share the starter's id and are reached through
/// [`Rule::chain_rule`]; `chain_index` is 0 for the starter and 1..N for the
/// continuations.
#[derive(Debug)]
pub struct Rule {
    pub id: u64,
    pub phase: Phase,
    pub severity: Option<Severity>,
    pub tags: Vec<SharedStr>,
    pub msg: Option<Arc<MacroExpr>>,
    pub log_data: Option<Arc<MacroExpr>>,
    pub variables: Vec<Arc<VarExpr>>,
    pub transforms: Vec<TransformKind>,
    /// Operator alternatives: the surface `"@opA x|@opB y"` OR-syntax keeps
    /// one entry per branch. Empty for pure action carriers (`SecAction`).
    pub operators: Vec<Arc<Operator>>,
    pub actions: Vec<Arc<Action>>,
    pub chain_rule: Option<Box<Rule>>,
    /// How `chain_rule` is linked; meaningful only when one is attached.
    pub chain_mode: ChainMode,
    pub chain_index: u32,
    pub disruptive: Option<DisruptiveKind>,
    /// Status code attached by `status:N` (used by deny/redirect).
    pub status: Option<u16>,
    pub skip: Option<u32>,
    pub skip_after: Option<SharedStr>,
    pub flags: RuleFlags,
    /// The `SecMarker` label this pseudo-rule defines, if any.
    pub marker: Option<SharedStr>,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            id: 0,
            phase: Phase::RequestBody,
            severity: None,
            tags: Vec::new(),
            msg: None,
            log_data: None,
            variables: Vec::new(),
            transforms: Vec::new(),
            operators: Vec::new(),
            actions: Vec::new(),
            chain_rule: None,
            chain_mode: ChainMode::Gated(ActionBranch::Matched),
            chain_index: 0,
            disruptive: None,
            status: None,
            skip: None,
            skip_after: None,
            flags: RuleFlags::LOG | RuleFlags::AUDIT_LOG,
            marker: None,
        }
    }
}

impl Rule {
    pub fn is_marker(&self) -> bool {
        self.marker.is_some()
    }

    pub fn is_chained(&self) -> bool {
        self.chain_rule.is_some()
    }

    pub fn ignores_default_transform(&self) -> bool {
        self.flags.contains(RuleFlags::IGNORE_DEFAULT_TRANSFORM)
    }

    pub fn captures(&self) -> bool {
        self.flags.contains(RuleFlags::CAPTURE)
    }

    pub fn logs(&self) -> bool {
        self.flags.contains(RuleFlags::LOG)
    }

    pub fn needs_matched_push(&self) -> bool {
        self.flags.contains(RuleFlags::NEEDS_MATCHED_PUSH)
    }

    /// The starter followed by every chained continuation, in order.
    pub fn iter_chain(&self) -> impl Iterator<Item = &Rule> {
        std::iter::successors(Some(self), |rule| rule.chain_rule.as_deref())
    }

    /// The chain member with the given index (0 = the starter itself).
    pub fn chain_at(&self, index: u32) -> Option<&Rule> {
        self.iter_chain().nth(index as usize)
    }

    pub fn chain_len(&self) -> u32 {
        self.iter_chain().count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_iteration_walks_continuations() {
        let tail = Rule { chain_index: 2, ..Rule::default() };
        let mid = Rule { chain_index: 1, chain_rule: Some(Box::new(tail)), ..Rule::default() };
        let head = Rule { id: 9, chain_rule: Some(Box::new(mid)), ..Rule::default() };

        assert_eq!(head.chain_len(), 3);
        let indices: Vec<u32> = head.iter_chain().map(|r| r.chain_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(head.chain_at(2).unwrap().chain_index, 2);
        assert!(head.chain_at(3).is_none());
    }

    #[test]
    fn default_rule_logs_and_audit_logs() {
        let rule = Rule::default();
        assert!(rule.logs());
        assert!(rule.flags.contains(RuleFlags::AUDIT_LOG));
        assert!(!rule.captures());
        assert!(!rule.ignores_default_transform());
    }
}
