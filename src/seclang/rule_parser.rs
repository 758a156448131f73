//! SecRule component parsing: the variable list, the operator string, and
//! the action list.
//!
//! ```text
//! SecRule  ARGS|!ARGS:pw  "!@rx (?i)attack"  "id:1,phase:2,t:lowercase,deny"
//!          └── variables ─┘ └── operator ──┘  └──────── actions ─────────┘
//! ```
//!
//! The action parser also recognizes the branch markers of the surface
//! language: `!action` fires on unmatched elements, `*action` on every
//! element.

use crate::action::{Action, ActionBranch, ActionKind, ActionText, Ctl, SetVar};
use crate::engine::LoadError;
use crate::macro_expr::MacroExpr;
use crate::operator::Operator;
use crate::rule::{ChainMode, DisruptiveKind, Rule, RuleFlags};
use crate::transform::TransformKind;
use crate::variable::VarExpr;
use crate::{AllowScope, Phase, Severity};

use std::path::Path;
use std::sync::Arc;

/// Outcome of parsing one `SecRule`/`SecAction`: the rule plus whether it
/// declared `chain` (the next rule becomes its continuation).
#[derive(Debug)]
pub struct ParsedRule {
    pub rule: Rule,
    pub wants_chain: bool,
    /// Set by an explicit `phase:` action, as opposed to the default.
    pub phase_explicit: bool,
}

/// Parse the variable list of a `SecRule` (entries separated by `|`).
pub fn parse_variables(text: &str) -> Result<Vec<Arc<VarExpr>>, LoadError> {
    let mut variables = Vec::new();
    for spec in text.split('|').map(str::trim).filter(|s| !s.is_empty()) {
        let var = VarExpr::parse(spec).map_err(LoadError::Variable)?;
        variables.push(Arc::new(var));
    }
    if variables.is_empty() {
        return Err(LoadError::BadDirective {
            directive: text.to_string(),
            message: "empty variable list".to_string(),
        });
    }
    Ok(variables)
}

/// Parse the operator string of a `SecRule`.
///
/// Forms: `@name args`, `!@name args`, a bare regex (implicit `@rx`), and
/// the OR-combination `@opA x|@opB y|...` which yields one operator per
/// branch.
pub fn parse_operator(
    text: &str,
    base_dir: Option<&Path>,
) -> Result<Vec<Arc<Operator>>, LoadError> {
    let text = text.trim();

    // A bare pattern is an implicit @rx; `|` inside it is regex alternation,
    // not operator combination.
    if !text.starts_with('@') && !text.starts_with("!@") {
        let negated = text.starts_with('!');
        let pattern = text.strip_prefix('!').unwrap_or(text);
        let operator = Operator::new("rx", pattern, negated, base_dir)?;
        return Ok(vec![Arc::new(operator)]);
    }

    let mut operators = Vec::new();
    for branch in split_operator_branches(text) {
        let branch = branch.trim();
        let (branch, negated) = match branch.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (branch, false),
        };
        let branch = branch.strip_prefix('@').ok_or_else(|| LoadError::BadDirective {
            directive: text.to_string(),
            message: "operator branch does not start with @".to_string(),
        })?;
        let (name, argument) = match branch.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (branch, ""),
        };
        operators.push(Arc::new(Operator::new(name, argument, negated, base_dir)?));
    }
    Ok(operators)
}

/// Split `@opA x|@opB y` on the `|`s that begin a new operator branch.
fn split_operator_branches(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut branches = Vec::new();
    let mut start = 0;

    for (i, b) in bytes.iter().enumerate() {
        if *b != b'|' {
            continue;
        }
        let rest = text[i + 1..].trim_start();
        if rest.starts_with('@') || rest.starts_with("!@") {
            branches.push(&text[start..i]);
            start = i + 1;
        }
    }
    branches.push(&text[start..]);
    branches
}

/// Split an action list on top-level commas (single quotes protect values).
pub fn split_actions(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in text.chars() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts.iter().map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
}

fn unquote(value: &str) -> &str {
    value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')).unwrap_or(value)
}

/// Apply one action token to the rule under construction.
fn apply_action(
    rule: &mut Rule,
    parsed: &mut ParsedRule,
    token: &str,
) -> Result<(), LoadError> {
    let (token, branch) = match token.as_bytes().first() {
        Some(b'!') => (&token[1..], ActionBranch::Unmatched),
        Some(b'*') => (&token[1..], ActionBranch::Always),
        _ => (token, ActionBranch::Matched),
    };

    let (name, value) = match token.split_once(':') {
        Some((name, value)) => (name.trim(), Some(unquote(value.trim()))),
        None => (token.trim(), None),
    };

    let need_value = || {
        value.map(str::to_string).ok_or_else(|| LoadError::BadDirective {
            directive: token.to_string(),
            message: "action requires a value".to_string(),
        })
    };

    match name.to_ascii_lowercase().as_str() {
        "id" => {
            let value = need_value()?;
            rule.id = value.parse().map_err(|_| LoadError::InvalidValue {
                what: "rule id",
                value: value.clone(),
            })?;
        }
        "phase" => {
            let value = need_value()?;
            let number: i64 = value.parse().map_err(|_| LoadError::InvalidValue {
                what: "phase",
                value: value.clone(),
            })?;
            rule.phase = Phase::from_number(number).ok_or(LoadError::InvalidValue {
                what: "phase",
                value,
            })?;
            parsed.phase_explicit = true;
        }
        "t" => {
            let value = need_value()?;
            if value == "none" {
                rule.flags.insert(RuleFlags::IGNORE_DEFAULT_TRANSFORM);
                rule.transforms.clear();
            } else {
                let kind = TransformKind::from_name(&value)
                    .ok_or(LoadError::UnknownTransform(value))?;
                rule.transforms.push(kind);
            }
        }
        "msg" => {
            let value = need_value()?;
            rule.msg = Some(Arc::new(
                MacroExpr::parse(&value).map_err(LoadError::Variable)?,
            ));
        }
        "logdata" => {
            let value = need_value()?;
            rule.log_data = Some(Arc::new(
                MacroExpr::parse(&value).map_err(LoadError::Variable)?,
            ));
        }
        "tag" => rule.tags.push(need_value()?.into()),
        "severity" => {
            let value = need_value()?;
            rule.severity = Some(Severity::parse(&value).ok_or(LoadError::InvalidValue {
                what: "severity",
                value,
            })?);
        }
        "rev" | "ver" | "accuracy" | "maturity" => {
            // Metadata-only keywords; recognized and dropped.
            need_value()?;
        }
        "capture" => rule.flags.insert(RuleFlags::CAPTURE),
        "log" => rule.flags.insert(RuleFlags::LOG),
        "nolog" => rule.flags.remove(RuleFlags::LOG),
        "auditlog" => rule.flags.insert(RuleFlags::AUDIT_LOG),
        "noauditlog" => rule.flags.remove(RuleFlags::AUDIT_LOG),
        "multimatch" => rule.flags.insert(RuleFlags::MULTI_MATCH),
        "allmatch" => rule.flags.insert(RuleFlags::ALL_MATCH),
        "firstmatch" => rule.flags.insert(RuleFlags::FIRST_MATCH),
        "emptymatch" => {
            // Applied onto the operators once the whole list is parsed.
        }
        "chain" => {
            parsed.wants_chain = true;
            rule.chain_mode = ChainMode::Gated(branch);
        }
        "multichain" => {
            parsed.wants_chain = true;
            rule.chain_mode = ChainMode::PerElement(branch);
        }
        "skip" => {
            let value = need_value()?;
            rule.skip = Some(value.parse().map_err(|_| LoadError::InvalidValue {
                what: "skip count",
                value: value.clone(),
            })?);
        }
        "skipafter" => rule.skip_after = Some(need_value()?.into()),
        "allow" => {
            let scope = match value {
                None => AllowScope::Transaction,
                Some("request") => AllowScope::Request,
                Some("phase") => AllowScope::Phase,
                Some("none") => AllowScope::Transaction,
                Some(other) => {
                    return Err(LoadError::InvalidValue {
                        what: "allow scope",
                        value: other.to_string(),
                    });
                }
            };
            rule.disruptive = Some(DisruptiveKind::Allow(scope));
        }
        "block" => rule.disruptive = Some(DisruptiveKind::Block),
        "deny" => rule.disruptive = Some(DisruptiveKind::Deny),
        "drop" => rule.disruptive = Some(DisruptiveKind::Drop),
        "pass" => rule.disruptive = Some(DisruptiveKind::Pass),
        "redirect" => rule.disruptive = Some(DisruptiveKind::Redirect(need_value()?.into())),
        "status" => {
            let value = need_value()?;
            rule.status = Some(value.parse().map_err(|_| LoadError::InvalidValue {
                what: "status",
                value: value.clone(),
            })?);
        }
        "setvar" => {
            let setvar = SetVar::parse(&need_value()?).map_err(LoadError::Action)?;
            rule.actions.push(Arc::new(Action::new(branch, ActionKind::SetVar(setvar))));
        }
        "setenv" => {
            let value = need_value()?;
            let (key, val) = match value.split_once('=') {
                Some((key, val)) => (key.trim(), Some(val.trim())),
                None => (value.as_str(), None),
            };
            let key = parse_action_text(key)?;
            let val = val.map(parse_action_text).transpose()?;
            rule.actions
                .push(Arc::new(Action::new(branch, ActionKind::SetEnv { key, value: val })));
        }
        "initcol" => {
            let value = need_value()?;
            rule.actions.push(Arc::new(Action::new(
                branch,
                ActionKind::InitCol { collection: value.into() },
            )));
        }
        "setsid" => {
            let text = parse_action_text(&need_value()?)?;
            rule.actions.push(Arc::new(Action::new(branch, ActionKind::SetSid(text))));
        }
        "setuid" => {
            let text = parse_action_text(&need_value()?)?;
            rule.actions.push(Arc::new(Action::new(branch, ActionKind::SetUid(text))));
        }
        "setrsc" => {
            let text = parse_action_text(&need_value()?)?;
            rule.actions.push(Arc::new(Action::new(branch, ActionKind::SetRsc(text))));
        }
        "ctl" => {
            let ctl = Ctl::parse(&need_value()?).map_err(LoadError::Action)?;
            rule.actions.push(Arc::new(Action::new(branch, ActionKind::Ctl(ctl))));
        }
        other => {
            return Err(LoadError::BadDirective {
                directive: other.to_string(),
                message: "unknown action keyword".to_string(),
            });
        }
    }

    Ok(())
}

fn parse_action_text(text: &str) -> Result<ActionText, LoadError> {
    if MacroExpr::is_macro(text) {
        Ok(ActionText::Macro(MacroExpr::parse(text).map_err(LoadError::Variable)?))
    } else {
        Ok(ActionText::Literal(text.into()))
    }
}

/// Assemble a `SecRule` from its three arguments.
pub fn parse_sec_rule(
    variables: &str,
    operator: &str,
    actions: Option<&str>,
    base_dir: Option<&Path>,
) -> Result<ParsedRule, LoadError> {
    let mut parsed =
        ParsedRule { rule: Rule::default(), wants_chain: false, phase_explicit: false };
    parsed.rule.variables = parse_variables(variables)?;
    parsed.rule.operators = parse_operator(operator, base_dir)?;

    apply_actions(&mut parsed, actions)?;
    Ok(parsed)
}

/// Assemble a `SecAction`/`SecDefaultAction` from its single action string.
pub fn parse_sec_action(actions: &str) -> Result<ParsedRule, LoadError> {
    let mut parsed =
        ParsedRule { rule: Rule::default(), wants_chain: false, phase_explicit: false };
    apply_actions(&mut parsed, Some(actions))?;
    Ok(parsed)
}

fn apply_actions(parsed: &mut ParsedRule, actions: Option<&str>) -> Result<(), LoadError> {
    let Some(actions) = actions else { return Ok(()) };
    let mut empty_match = false;

    let mut rule = std::mem::take(&mut parsed.rule);
    for token in split_actions(actions) {
        if token.eq_ignore_ascii_case("emptymatch") {
            empty_match = true;
        }
        apply_action(&mut rule, parsed, &token)?;
    }

    if empty_match {
        for operator in &mut rule.operators {
            // Operators are not shared before init, so this in-place update
            // cannot race with anything.
            if let Some(op) = Arc::get_mut(operator) {
                op.empty_match = true;
            }
        }
    }

    parsed.rule = rule;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::OperatorKind;
    use crate::variable::AccessMode;

    #[test]
    fn variable_lists_split_on_pipe() {
        let vars = parse_variables("TX:foo1|TX:foo2|&ARGS|!ARGS:pw").unwrap();
        assert_eq!(vars.len(), 4);
        assert_eq!(vars[2].mode, AccessMode::CounterCollection);
        assert!(vars[3].exclude);
    }

    #[test]
    fn operator_forms() {
        let implicit = parse_operator("(?i)union\\s+select", None).unwrap();
        assert_eq!(implicit.len(), 1);
        assert_eq!(implicit[0].kind, OperatorKind::Rx);

        let negated = parse_operator("!@streq bar", None).unwrap();
        assert!(negated[0].negated);
        assert_eq!(negated[0].kind, OperatorKind::Streq);

        let combined =
            parse_operator("@streq hello|@beginsWith world|@rx h(i|o)", None).unwrap();
        assert_eq!(combined.len(), 3);
        assert_eq!(combined[0].kind, OperatorKind::Streq);
        assert_eq!(combined[1].kind, OperatorKind::BeginsWith);
        // The `|` inside the @rx branch is regex alternation, not a split.
        assert_eq!(combined[2].literal(), "h(i|o)");
    }

    #[test]
    fn action_list_respects_quoted_commas() {
        let parts = split_actions("id:1,msg:'a, quoted, message',phase:2");
        assert_eq!(parts, vec!["id:1", "msg:'a, quoted, message'", "phase:2"]);
    }

    #[test]
    fn sec_rule_assembles_metadata_and_actions() {
        let parsed = parse_sec_rule(
            "ARGS:foo",
            "@streq x",
            Some("id:10,phase:1,chain,capture,t:lowercase,severity:CRITICAL,setvar:tx.seen=1"),
            None,
        )
        .unwrap();
        let rule = &parsed.rule;
        assert_eq!(rule.id, 10);
        assert_eq!(rule.phase, Phase::RequestHeaders);
        assert!(parsed.wants_chain);
        assert!(rule.captures());
        assert_eq!(rule.transforms, vec![TransformKind::Lowercase]);
        assert_eq!(rule.severity, Some(Severity::Critical));
        assert_eq!(rule.actions.len(), 1);
    }

    #[test]
    fn t_none_clears_and_ignores_defaults() {
        let parsed =
            parse_sec_rule("ARGS", "@rx x", Some("id:1,t:lowercase,t:none,t:trim"), None).unwrap();
        assert!(parsed.rule.ignores_default_transform());
        assert_eq!(parsed.rule.transforms, vec![TransformKind::Trim]);
    }

    #[test]
    fn branch_markers_are_recognized() {
        let parsed = parse_sec_rule(
            "ARGS:a",
            "@streq x",
            Some("id:1,setvar:tx.m=1,!setvar:tx.u=1,*setvar:tx.a=1"),
            None,
        )
        .unwrap();
        let branches: Vec<ActionBranch> =
            parsed.rule.actions.iter().map(|a| a.branch).collect();
        assert_eq!(
            branches,
            vec![ActionBranch::Matched, ActionBranch::Unmatched, ActionBranch::Always]
        );
    }

    #[test]
    fn chain_keywords_record_mode_and_branch() {
        let plain = parse_sec_rule("ARGS", "@rx x", Some("id:1,chain"), None).unwrap();
        assert!(plain.wants_chain);
        assert_eq!(plain.rule.chain_mode, ChainMode::Gated(ActionBranch::Matched));

        let negated = parse_sec_rule("ARGS", "@rx x", Some("id:2,!chain"), None).unwrap();
        assert!(negated.wants_chain);
        assert_eq!(negated.rule.chain_mode, ChainMode::Gated(ActionBranch::Unmatched));

        let always = parse_sec_rule("ARGS", "@rx x", Some("id:3,*chain"), None).unwrap();
        assert_eq!(always.rule.chain_mode, ChainMode::Gated(ActionBranch::Always));

        let multi = parse_sec_rule("ARGS", "@rx x", Some("id:4,multiChain"), None).unwrap();
        assert!(multi.wants_chain);
        assert_eq!(multi.rule.chain_mode, ChainMode::PerElement(ActionBranch::Matched));

        let multi_not = parse_sec_rule("ARGS", "@rx x", Some("id:5,!multiChain"), None).unwrap();
        assert_eq!(multi_not.rule.chain_mode, ChainMode::PerElement(ActionBranch::Unmatched));
    }

    #[test]
    fn loop_modifier_flags_are_recorded() {
        let all = parse_sec_rule("TX", "@gt 100", Some("id:1,allMatch"), None).unwrap();
        assert!(all.rule.flags.contains(RuleFlags::ALL_MATCH));

        let first = parse_sec_rule("TX", "@gt 100", Some("id:2,firstMatch"), None).unwrap();
        assert!(first.rule.flags.contains(RuleFlags::FIRST_MATCH));
        assert!(!first.rule.flags.contains(RuleFlags::ALL_MATCH));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = parse_sec_rule("ARGS", "@rx x", Some("id:1,frobnicate:9"), None).unwrap_err();
        assert!(matches!(err, LoadError::BadDirective { .. }));
    }

    #[test]
    fn disruptive_keywords() {
        let deny = parse_sec_rule("ARGS", "@rx x", Some("id:1,deny,status:406"), None).unwrap();
        assert_eq!(deny.rule.disruptive, Some(DisruptiveKind::Deny));
        assert_eq!(deny.rule.status, Some(406));

        let allow = parse_sec_rule("ARGS", "@rx x", Some("id:2,allow:request"), None).unwrap();
        assert_eq!(allow.rule.disruptive, Some(DisruptiveKind::Allow(AllowScope::Request)));

        let bare = parse_sec_rule("ARGS", "@rx x", Some("id:3,allow"), None).unwrap();
        assert_eq!(bare.rule.disruptive, Some(DisruptiveKind::Allow(AllowScope::Transaction)));
    }
}
