//! Actions.
//!
//! Side-effectful operations run when (and in the order) their host rule's
//! operator matches for a given input element. Disruptive keywords
//! (`allow`/`deny`/...) and flow keywords (`skip`, `skipAfter`, `chain`) are
//! rule metadata, not actions; this module carries the per-element state
//! writers: `setvar`, `setenv`, `setsid`/`setuid`/`setrsc`, `initcol`, and
//! the `ctl:*` family.
//!
//! Branch markers come from the surface language: `!setvar:...` runs on
//! unmatched elements, `*setvar:...` on every element, and an unprefixed
//! action on matched elements.

use crate::macro_expr::MacroExpr;
use crate::transaction::Transaction;
use crate::variable::{VarExpr, VarKind};
use crate::{SharedStr, Value};

use tracing::debug;

/// Which operator-result elements an action fires for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionBranch {
    Matched,
    Unmatched,
    Always,
}

/// Parse failures for action arguments; surfaced through `LoadError`.
#[derive(Debug, thiserror::Error)]
pub enum ActionParseError {
    #[error("bad setvar specification: {0}")]
    BadSetVar(String),
    #[error("setvar collection {0} requires the persistent storage component")]
    UnsupportedCollection(String),
    #[error("bad ctl specification: {0}")]
    BadCtl(String),
    #[error("unknown ctl option {0}")]
    UnknownCtl(String),
    #[error("bad macro in action: {0}")]
    BadMacro(String),
}

/// Literal-or-macro text, decided at parse time.
#[derive(Debug, Clone)]
pub enum ActionText {
    Literal(SharedStr),
    Macro(MacroExpr),
}

impl ActionText {
    fn parse(text: &str) -> Result<ActionText, ActionParseError> {
        if MacroExpr::is_macro(text) {
            Ok(ActionText::Macro(
                MacroExpr::parse(text).map_err(|e| ActionParseError::BadMacro(e.to_string()))?,
            ))
        } else {
            Ok(ActionText::Literal(text.into()))
        }
    }

    fn expand(&self, tx: &Transaction<'_>) -> SharedStr {
        match self {
            ActionText::Literal(text) => text.clone(),
            ActionText::Macro(macro_expr) => macro_expr.expand_str(tx),
        }
    }

    fn reads_matched(&self) -> bool {
        matches!(self, ActionText::Macro(m) if m.reads_matched())
    }
}

// --- setvar ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetVarOp {
    Create,
    CreateAndInit,
    Remove,
    Increase,
    Decrease,
}

/// A parsed `setvar:` action over the TX collection.
#[derive(Debug)]
pub struct SetVar {
    pub op: SetVarOp,
    pub key: ActionText,
    pub value: Option<ActionText>,
}

impl SetVar {
    /// Parse the argument of `setvar:`, e.g. `tx.score=+5`, `!tx.flag`,
    /// `tx.%{rule.id}=1`.
    pub fn parse(argument: &str) -> Result<SetVar, ActionParseError> {
        let argument = argument.trim().trim_matches('\'');
        let (argument, removing) = match argument.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (argument, false),
        };

        let (target, value) = match argument.split_once('=') {
            Some((target, value)) => (target.trim(), Some(value.trim())),
            None => (argument.trim(), None),
        };

        let (collection, key) = target
            .split_once('.')
            .ok_or_else(|| ActionParseError::BadSetVar(argument.to_string()))?;
        if !collection.eq_ignore_ascii_case("tx") {
            return Err(ActionParseError::UnsupportedCollection(collection.to_string()));
        }
        if key.is_empty() {
            return Err(ActionParseError::BadSetVar(argument.to_string()));
        }

        let key = ActionText::parse(key)?;

        if removing {
            return Ok(SetVar { op: SetVarOp::Remove, key, value: None });
        }

        match value {
            None => Ok(SetVar { op: SetVarOp::Create, key, value: None }),
            Some(value) => {
                let (op, value) = match value.as_bytes().first() {
                    Some(b'+') => (SetVarOp::Increase, &value[1..]),
                    Some(b'-') => (SetVarOp::Decrease, &value[1..]),
                    _ => (SetVarOp::CreateAndInit, value),
                };
                Ok(SetVar { op, key, value: Some(ActionText::parse(value)?) })
            }
        }
    }

    pub fn evaluate(&self, tx: &mut Transaction<'_>) {
        let key = self.key.expand(tx).to_ascii_lowercase();

        match self.op {
            SetVarOp::Create => tx.tx_set(&key, Value::Int(1)),
            SetVarOp::Remove => tx.tx_remove(&key),
            SetVarOp::CreateAndInit => {
                let expanded = self.value.as_ref().map(|v| v.expand(tx)).unwrap_or_default();
                let value = match expanded.trim().parse::<i64>() {
                    Ok(n) => Value::Int(n),
                    Err(_) => Value::Str(expanded),
                };
                tx.tx_set(&key, value);
            }
            SetVarOp::Increase | SetVarOp::Decrease => {
                let delta = self
                    .value
                    .as_ref()
                    .map(|v| v.expand(tx))
                    .and_then(|s| s.trim().parse::<i64>().ok())
                    .unwrap_or(0);
                let current = match tx.tx_get(&key) {
                    Some(Value::Int(n)) => *n,
                    Some(Value::Str(s)) => s.trim().parse().unwrap_or(0),
                    _ => 0,
                };
                let next = if self.op == SetVarOp::Increase {
                    current.saturating_add(delta)
                } else {
                    current.saturating_sub(delta)
                };
                tx.tx_set(&key, Value::Int(next));
            }
        }
    }
}

// --- ctl ---------------------------------------------------------------------

/// A parsed `ctl:` action: a per-transaction engine control.
#[derive(Debug)]
pub enum Ctl {
    /// Accepted for compatibility; the audit-log component is external.
    AuditEngine(SharedStr),
    AuditLogParts(SharedStr),
    RuleEngine(crate::engine::RuleEngineMode),
    RequestBodyAccess(bool),
    RequestBodyProcessor(SharedStr),
    RuleRemoveById(Vec<(u64, u64)>),
    RuleRemoveByTag(SharedStr),
    RuleRemoveTargetById { id: u64, targets: Vec<(VarKind, Option<SharedStr>)> },
    RuleRemoveTargetByTag { tag: SharedStr, targets: Vec<(VarKind, Option<SharedStr>)> },
}

impl Ctl {
    /// Parse the argument of `ctl:`, e.g. `ruleRemoveById=942100`,
    /// `ruleRemoveTargetById=942100;ARGS:foo`, `ruleEngine=Off`.
    pub fn parse(argument: &str) -> Result<Ctl, ActionParseError> {
        let (option, value) = argument
            .split_once('=')
            .ok_or_else(|| ActionParseError::BadCtl(argument.to_string()))?;
        let option = option.trim();
        let value = value.trim();

        match option.to_ascii_lowercase().as_str() {
            "auditengine" => Ok(Ctl::AuditEngine(value.into())),
            "auditlogparts" => Ok(Ctl::AuditLogParts(value.into())),
            "ruleengine" => crate::engine::RuleEngineMode::parse(value)
                .map(Ctl::RuleEngine)
                .ok_or_else(|| ActionParseError::BadCtl(argument.to_string())),
            "requestbodyaccess" => match value.to_ascii_lowercase().as_str() {
                "on" => Ok(Ctl::RequestBodyAccess(true)),
                "off" => Ok(Ctl::RequestBodyAccess(false)),
                _ => Err(ActionParseError::BadCtl(argument.to_string())),
            },
            "requestbodyprocessor" => Ok(Ctl::RequestBodyProcessor(value.into())),
            "ruleremovebyid" => {
                let mut ranges = Vec::new();
                for entry in value.split([',', ' ']).map(str::trim).filter(|e| !e.is_empty()) {
                    let range = match entry.split_once('-') {
                        Some((lo, hi)) => (
                            lo.trim().parse().map_err(|_| {
                                ActionParseError::BadCtl(argument.to_string())
                            })?,
                            hi.trim().parse().map_err(|_| {
                                ActionParseError::BadCtl(argument.to_string())
                            })?,
                        ),
                        None => {
                            let id: u64 = entry.parse().map_err(|_| {
                                ActionParseError::BadCtl(argument.to_string())
                            })?;
                            (id, id)
                        }
                    };
                    ranges.push(range);
                }
                Ok(Ctl::RuleRemoveById(ranges))
            }
            "ruleremovebytag" => Ok(Ctl::RuleRemoveByTag(value.into())),
            "ruleremovetargetbyid" => {
                let (id, targets) = parse_id_and_targets(value, argument)?;
                Ok(Ctl::RuleRemoveTargetById { id, targets })
            }
            "ruleremovetargetbytag" => {
                let (tag, targets) = value
                    .split_once(';')
                    .ok_or_else(|| ActionParseError::BadCtl(argument.to_string()))?;
                Ok(Ctl::RuleRemoveTargetByTag {
                    tag: tag.trim().into(),
                    targets: parse_targets(targets, argument)?,
                })
            }
            _ => Err(ActionParseError::UnknownCtl(option.to_string())),
        }
    }

    pub fn evaluate(&self, tx: &mut Transaction<'_>) {
        match self {
            Ctl::AuditEngine(_) | Ctl::AuditLogParts(_) => {
                debug!("ctl audit controls are accepted but inert");
            }
            Ctl::RuleEngine(mode) => tx.set_rule_engine_override(*mode),
            Ctl::RequestBodyAccess(enabled) => tx.set_request_body_access(*enabled),
            Ctl::RequestBodyProcessor(name) => tx.set_request_body_processor(name.clone()),
            Ctl::RuleRemoveById(ranges) => {
                for (lo, hi) in ranges {
                    tx.remove_rules_in_range(*lo, *hi);
                }
            }
            Ctl::RuleRemoveByTag(tag) => tx.remove_rules_by_tag(tag),
            Ctl::RuleRemoveTargetById { id, targets } => {
                tx.remove_rule_targets(*id, targets.clone());
            }
            Ctl::RuleRemoveTargetByTag { tag, targets } => {
                tx.remove_rule_targets_by_tag(tag, targets.clone());
            }
        }
    }
}

fn parse_id_and_targets(
    value: &str,
    whole: &str,
) -> Result<(u64, Vec<(VarKind, Option<SharedStr>)>), ActionParseError> {
    let (id, targets) =
        value.split_once(';').ok_or_else(|| ActionParseError::BadCtl(whole.to_string()))?;
    let id = id.trim().parse().map_err(|_| ActionParseError::BadCtl(whole.to_string()))?;
    Ok((id, parse_targets(targets, whole)?))
}

fn parse_targets(
    text: &str,
    whole: &str,
) -> Result<Vec<(VarKind, Option<SharedStr>)>, ActionParseError> {
    let mut targets = Vec::new();
    for spec in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let var =
            VarExpr::parse(spec).map_err(|_| ActionParseError::BadCtl(whole.to_string()))?;
        targets.push((var.kind, var.sub_name));
    }
    Ok(targets)
}

// --- Actions -----------------------------------------------------------------

#[derive(Debug)]
pub enum ActionKind {
    SetVar(SetVar),
    SetEnv { key: ActionText, value: Option<ActionText> },
    /// Accepted for compatibility; persistent collections are external.
    InitCol { collection: SharedStr },
    SetSid(ActionText),
    SetUid(ActionText),
    SetRsc(ActionText),
    Ctl(Ctl),
}

/// One executable action with its firing branch.
#[derive(Debug)]
pub struct Action {
    pub branch: ActionBranch,
    pub kind: ActionKind,
}

impl Action {
    pub fn new(branch: ActionBranch, kind: ActionKind) -> Action {
        Action { branch, kind }
    }

    pub fn evaluate(&self, tx: &mut Transaction<'_>) {
        match &self.kind {
            ActionKind::SetVar(setvar) => setvar.evaluate(tx),
            ActionKind::SetEnv { key, value } => {
                let key = key.expand(tx);
                let value = value.as_ref().map(|v| v.expand(tx)).unwrap_or_default();
                tx.env_set(&key, Value::Str(value));
            }
            ActionKind::InitCol { collection } => {
                debug!(collection = %collection, "initcol is accepted but inert");
            }
            ActionKind::SetSid(text) => {
                let sid = text.expand(tx);
                tx.set_session_id(sid);
            }
            ActionKind::SetUid(text) => {
                let uid = text.expand(tx);
                tx.set_user_id(uid);
            }
            ActionKind::SetRsc(text) => {
                let rsc = text.expand(tx);
                tx.set_resource_id(rsc);
            }
            ActionKind::Ctl(ctl) => ctl.evaluate(tx),
        }
    }

    /// True when any macro inside the action reads the MATCHED_VAR family.
    pub fn reads_matched(&self) -> bool {
        match &self.kind {
            ActionKind::SetVar(setvar) => {
                setvar.key.reads_matched()
                    || setvar.value.as_ref().is_some_and(|v| v.reads_matched())
            }
            ActionKind::SetEnv { key, value } => {
                key.reads_matched() || value.as_ref().is_some_and(|v| v.reads_matched())
            }
            ActionKind::SetSid(text) | ActionKind::SetUid(text) | ActionKind::SetRsc(text) => {
                text.reads_matched()
            }
            ActionKind::InitCol { .. } | ActionKind::Ctl(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setvar_parse_forms() {
        let create = SetVar::parse("tx.flag").unwrap();
        assert_eq!(create.op, SetVarOp::Create);

        let init = SetVar::parse("tx.s=100").unwrap();
        assert_eq!(init.op, SetVarOp::CreateAndInit);

        let inc = SetVar::parse("tx.s=+25").unwrap();
        assert_eq!(inc.op, SetVarOp::Increase);

        let dec = SetVar::parse("tx.s=-5").unwrap();
        assert_eq!(dec.op, SetVarOp::Decrease);

        let remove = SetVar::parse("!tx.s").unwrap();
        assert_eq!(remove.op, SetVarOp::Remove);
    }

    #[test]
    fn setvar_rejects_non_tx_collections() {
        assert!(matches!(
            SetVar::parse("ip.counter=+1"),
            Err(ActionParseError::UnsupportedCollection(_))
        ));
        assert!(matches!(SetVar::parse("noseparator"), Err(ActionParseError::BadSetVar(_))));
    }

    #[test]
    fn ctl_parse_forms() {
        assert!(matches!(Ctl::parse("ruleEngine=Off").unwrap(), Ctl::RuleEngine(_)));
        assert!(matches!(
            Ctl::parse("ruleRemoveById=942100").unwrap(),
            Ctl::RuleRemoveById(ranges) if ranges == vec![(942100, 942100)]
        ));
        assert!(matches!(
            Ctl::parse("ruleRemoveById=100-200").unwrap(),
            Ctl::RuleRemoveById(ranges) if ranges == vec![(100, 200)]
        ));
        match Ctl::parse("ruleRemoveTargetById=942100;ARGS:foo,ARGS:bar").unwrap() {
            Ctl::RuleRemoveTargetById { id, targets } => {
                assert_eq!(id, 942100);
                assert_eq!(targets.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(Ctl::parse("noSuchCtl=1"), Err(ActionParseError::UnknownCtl(_))));
    }
}
