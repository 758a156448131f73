//! The engine: rule accumulation, finalization, and transaction creation.
//!
//! Lifecycle:
//!
//! ```text
//! Engine::new ── load / load_file (accumulate) ── init ── make_transaction*
//!                      │                           │
//!                      v                           v
//!            directives -> Rule tree     per-phase compiled Programs
//!            (seclang.rs)                (bytecode/compiler.rs)
//! ```
//!
//! `init` resolves default actions per phase, applies `SecRuleRemove*` and
//! `SecRuleUpdate*`, runs the compiler's static analyses (matched-push
//! reachability, chain-disruptive hoisting), validates `skipAfter` targets,
//! and compiles one program per phase. Loading more directives after `init`
//! is permitted; calling `init` again folds them in.
//!
//! Everything the engine owns is immutable once initialized, so any number
//! of transactions can evaluate concurrently against it.

#[path = "engine/config.rs"]
mod config;
#[cfg(test)]
#[path = "engine/tests.rs"]
mod tests;

pub use config::{EngineConfig, RuleEngineMode};

use crate::action::ActionParseError;
use crate::bytecode::Program;
use crate::bytecode::compiler::{RuleCompiler, analyze_matched_push, hoist_chain_disruptive};
use crate::macro_expr::{MacroExpr, Segment};
use crate::operator::OperatorError;
use crate::rule::Rule;
use crate::seclang::{self, Directive};
use crate::transaction::Transaction;
use crate::variable::VarParseError;
use crate::{PHASE_TOTAL, Phase};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

/// Compile-time / configuration errors. No partial rule is installed when
/// one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unknown directive {0}")]
    UnknownDirective(String),
    #[error("bad directive {directive}: {message}")]
    BadDirective { directive: String, message: String },
    #[error(transparent)]
    Variable(VarParseError),
    #[error(transparent)]
    Operator(#[from] OperatorError),
    #[error(transparent)]
    Action(#[from] ActionParseError),
    #[error("unknown transformation t:{0}")]
    UnknownTransform(String),
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },
    #[error("chained rule has no continuation")]
    DanglingChain,
    #[error("skipAfter target {marker} not found in phase {phase}")]
    BadSkipTarget { marker: String, phase: i64 },
    #[error("cannot read {path}: {error}")]
    Io { path: String, error: String },
}

enum Removal {
    ById(Vec<(u64, u64)>),
    ByMsg(String),
    ByTag(String),
}

enum Update {
    ActionById { id: u64, actions: String },
    TargetById { id: u64, targets: String },
}

pub struct Engine {
    config: EngineConfig,

    /// Rules (and markers) accumulated by `load`, not yet compiled.
    pending: Vec<Rule>,
    /// A `chain` starter waiting for its continuation.
    open_chain: Option<Rule>,
    pending_default_actions: [Option<Rule>; PHASE_TOTAL],
    removals: Vec<Removal>,
    updates: Vec<Update>,

    initialized: bool,
    rules: Vec<Arc<Rule>>,
    by_id: HashMap<u64, usize>,
    default_actions: [Option<Arc<Rule>>; PHASE_TOTAL],
    programs: [Program; PHASE_TOTAL],
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            config: EngineConfig::default(),
            pending: Vec::new(),
            open_chain: None,
            pending_default_actions: Default::default(),
            removals: Vec::new(),
            updates: Vec::new(),
            initialized: false,
            rules: Vec::new(),
            by_id: HashMap::new(),
            default_actions: Default::default(),
            programs: std::array::from_fn(|_| Program::new()),
        }
    }

    /// Parse and accumulate one or more configuration directives.
    pub fn load(&mut self, text: &str) -> Result<(), LoadError> {
        self.load_with_base(text, None)
    }

    /// Load a rule file; `Include` paths resolve relative to its directory.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        self.load_with_base(&text, path.parent())
    }

    fn load_with_base(&mut self, text: &str, base_dir: Option<&Path>) -> Result<(), LoadError> {
        let directives = seclang::parse(text, base_dir)?;
        for directive in directives {
            self.apply_directive(directive, base_dir)?;
        }
        Ok(())
    }

    fn apply_directive(
        &mut self,
        directive: Directive,
        base_dir: Option<&Path>,
    ) -> Result<(), LoadError> {
        match directive {
            Directive::Rule(parsed) => self.accept_rule(parsed),
            Directive::Action(parsed) => {
                // A pure action carrier; never part of a chain.
                self.pending.push(parsed.rule);
                Ok(())
            }
            Directive::DefaultAction(parsed) => {
                let phase = parsed.rule.phase;
                self.pending_default_actions[phase.index()] = Some(parsed.rule);
                Ok(())
            }
            Directive::Marker(name) => {
                self.pending.push(Rule { marker: Some(name), ..Rule::default() });
                Ok(())
            }
            Directive::Config(setting) => {
                self.config.apply(setting);
                Ok(())
            }
            Directive::RemoveById(ranges) => {
                self.removals.push(Removal::ById(ranges));
                Ok(())
            }
            Directive::RemoveByMsg(pattern) => {
                self.removals.push(Removal::ByMsg(pattern));
                Ok(())
            }
            Directive::RemoveByTag(tag) => {
                self.removals.push(Removal::ByTag(tag));
                Ok(())
            }
            Directive::UpdateActionById { id, actions } => {
                self.updates.push(Update::ActionById { id, actions });
                Ok(())
            }
            Directive::UpdateTargetById { id, targets } => {
                self.updates.push(Update::TargetById { id, targets });
                Ok(())
            }
            Directive::Include(path) => self.include(&path, base_dir),
        }
    }

    fn accept_rule(&mut self, parsed: seclang::rule_parser::ParsedRule) -> Result<(), LoadError> {
        let seclang::rule_parser::ParsedRule { mut rule, wants_chain, phase_explicit } = parsed;

        match self.open_chain.take() {
            Some(mut starter) => {
                // This rule is the next continuation of the open chain.
                {
                    let tail = deepest_tail(&mut starter);
                    rule.chain_index = tail.chain_index + 1;
                    if !phase_explicit {
                        rule.phase = tail.phase;
                    }
                }
                rule.id = starter.id;
                let tail = deepest_tail(&mut starter);
                tail.chain_rule = Some(Box::new(rule));

                if wants_chain {
                    self.open_chain = Some(starter);
                } else {
                    self.pending.push(starter);
                }
            }
            None => {
                if wants_chain {
                    self.open_chain = Some(rule);
                } else {
                    self.pending.push(rule);
                }
            }
        }
        Ok(())
    }

    fn include(&mut self, path: &str, base_dir: Option<&Path>) -> Result<(), LoadError> {
        let resolved: PathBuf = match base_dir {
            Some(base) if !Path::new(path).is_absolute() => base.join(path),
            _ => PathBuf::from(path),
        };

        // A final path component may carry a `*` wildcard, the way rule set
        // layouts include whole directories.
        let name = resolved.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.contains('*') {
            let parent = resolved.parent().unwrap_or(Path::new("."));
            let (prefix, suffix) = name.split_once('*').unwrap_or((name, ""));
            let mut matches: Vec<PathBuf> = std::fs::read_dir(parent)
                .map_err(|e| LoadError::Io {
                    path: parent.display().to_string(),
                    error: e.to_string(),
                })?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(prefix) && n.ends_with(suffix))
                })
                .collect();
            matches.sort();
            for file in matches {
                self.load_file(&file)?;
            }
            Ok(())
        } else {
            self.load_file(&resolved)
        }
    }

    /// Finalize: apply removals and updates, run static analyses, resolve
    /// markers, and compile the per-phase programs.
    pub fn init(&mut self) -> Result<(), LoadError> {
        if self.open_chain.is_some() {
            return Err(LoadError::DanglingChain);
        }

        let mut pending = std::mem::take(&mut self.pending);

        for removal in self.removals.drain(..) {
            match removal {
                Removal::ById(ranges) => {
                    pending.retain(|rule| {
                        rule.is_marker()
                            || !ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&rule.id))
                    });
                }
                Removal::ByMsg(pattern) => {
                    pending.retain(|rule| {
                        let text = rule.msg.as_ref().map(|m| macro_literal_text(m));
                        !text.is_some_and(|t| t.contains(&pattern))
                    });
                }
                Removal::ByTag(tag) => {
                    pending.retain(|rule| !rule.tags.iter().any(|t| t.contains(tag.as_str())));
                }
            }
        }

        for update in self.updates.drain(..) {
            match update {
                Update::ActionById { id, actions } => {
                    let parsed = seclang::rule_parser::parse_sec_action(&actions)?;
                    if let Some(rule) = pending.iter_mut().find(|r| r.id == id) {
                        merge_update(rule, parsed.rule);
                    } else {
                        warn!(id, "SecRuleUpdateActionById target not found");
                    }
                }
                Update::TargetById { id, targets } => {
                    let variables = seclang::rule_parser::parse_variables(&targets)?;
                    if let Some(rule) = pending.iter_mut().find(|r| r.id == id) {
                        rule.variables.extend(variables);
                    } else {
                        warn!(id, "SecRuleUpdateTargetById target not found");
                    }
                }
            }
        }

        for rule in &mut pending {
            if !rule.is_marker() {
                hoist_chain_disruptive(rule);
                analyze_matched_push(rule);
            }
        }

        // Markers live in every phase's sequence, so validate skip targets
        // against the global marker set.
        let markers: Vec<String> = pending
            .iter()
            .chain(self.rules.iter().map(|r| &**r))
            .filter_map(|r| r.marker.as_deref().map(str::to_string))
            .collect();
        for rule in &pending {
            for member in rule.iter_chain() {
                if let Some(marker) = &member.skip_after {
                    if !markers.iter().any(|m| m == marker.as_str()) {
                        return Err(LoadError::BadSkipTarget {
                            marker: marker.to_string(),
                            phase: rule.phase.number(),
                        });
                    }
                }
            }
        }

        self.rules.extend(pending.into_iter().map(Arc::new));

        self.by_id = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_marker())
            .map(|(i, r)| (r.id, i))
            .collect();

        for (index, pending) in self.pending_default_actions.iter_mut().enumerate() {
            if let Some(rule) = pending.take() {
                self.default_actions[index] = Some(Arc::new(rule));
            }
        }

        for phase_index in 0..PHASE_TOTAL {
            let phase = Phase::from_number(phase_index as i64 + 1).unwrap();
            let phase_rules: Vec<Arc<Rule>> = self
                .rules
                .iter()
                .filter(|r| r.is_marker() || r.phase == phase)
                .cloned()
                .collect();
            let default_action = self.default_actions[phase_index].as_ref();
            self.programs[phase_index] =
                RuleCompiler::compile_phase(&phase_rules, default_action);
            debug!(
                phase = phase.number(),
                rules = phase_rules.len(),
                instructions = self.programs[phase_index].len(),
                "compiled phase program"
            );
        }

        self.initialized = true;
        Ok(())
    }

    /// Allocate a transaction bound to this engine's immutable state.
    pub fn make_transaction(&self) -> Transaction<'_> {
        debug_assert!(self.initialized, "make_transaction before init");
        Transaction::new(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn program(&self, phase: Phase) -> Option<&Program> {
        let program = &self.programs[phase.index()];
        if program.is_empty() { None } else { Some(program) }
    }

    pub(crate) fn default_action(&self, phase: Phase) -> Option<&Rule> {
        self.default_actions[phase.index()].as_deref()
    }

    pub fn find_rule_by_id(&self, id: u64) -> Option<&Arc<Rule>> {
        self.by_id.get(&id).map(|&index| &self.rules[index])
    }

    pub(crate) fn rule_ids_in_range(&self, lo: u64, hi: u64) -> Vec<u64> {
        self.rules
            .iter()
            .filter(|r| !r.is_marker() && (lo..=hi).contains(&r.id))
            .map(|r| r.id)
            .collect()
    }

    pub(crate) fn rule_ids_with_tag(&self, tag: &str) -> Vec<u64> {
        self.rules
            .iter()
            .filter(|r| !r.is_marker() && r.tags.iter().any(|t| t.contains(tag)))
            .map(|r| r.id)
            .collect()
    }
}

fn deepest_tail(rule: &mut Rule) -> &mut Rule {
    if rule.chain_rule.is_some() {
        deepest_tail(rule.chain_rule.as_deref_mut().unwrap())
    } else {
        rule
    }
}

/// Text content of a macro template's literal segments, used by
/// `SecRuleRemoveByMsg` matching.
fn macro_literal_text(macro_expr: &MacroExpr) -> String {
    match macro_expr {
        MacroExpr::Variable(_) => String::new(),
        MacroExpr::Multi(segments) => segments
            .iter()
            .filter_map(|s| match s {
                Segment::Literal(text) => Some(text.as_str()),
                Segment::Var(_) => None,
            })
            .collect(),
    }
}

/// Merge a `SecRuleUpdateActionById` payload into an existing rule.
fn merge_update(rule: &mut Rule, update: Rule) {
    if update.severity.is_some() {
        rule.severity = update.severity;
    }
    if update.msg.is_some() {
        rule.msg = update.msg;
    }
    if update.log_data.is_some() {
        rule.log_data = update.log_data;
    }
    if update.disruptive.is_some() {
        rule.disruptive = update.disruptive;
    }
    if update.status.is_some() {
        rule.status = update.status;
    }
    if !update.transforms.is_empty() {
        rule.transforms = update.transforms;
    }
    rule.tags.extend(update.tags);
    rule.actions.extend(update.actions);
}
