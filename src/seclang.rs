//! SecLang directive front-end.
//!
//! Turns configuration text into parsed directives:
//!
//! ```text
//! text ── split_directives ──> one logical directive per entry
//!              │                (continuations joined, comments dropped)
//!              v
//!         tokenize ──> directive name + quoted/bare arguments
//!              │
//!              v
//!       parse_directive ──> Directive (rule, config setting, marker, ...)
//! ```
//!
//! Chain assembly (attaching a `chain`ed rule's continuation) is stateful
//! across directives and therefore lives in the engine, not here.

#[path = "seclang/rule_parser.rs"]
pub(crate) mod rule_parser;

use crate::engine::{LoadError, RuleEngineMode};
use crate::SharedStr;
use rule_parser::ParsedRule;

use std::path::Path;

/// One parsed configuration directive.
pub enum Directive {
    Rule(ParsedRule),
    Action(ParsedRule),
    DefaultAction(ParsedRule),
    Marker(SharedStr),
    Config(ConfigSetting),
    RemoveById(Vec<(u64, u64)>),
    RemoveByMsg(String),
    RemoveByTag(String),
    UpdateActionById { id: u64, actions: String },
    UpdateTargetById { id: u64, targets: String },
    Include(String),
}

/// Engine configuration settings produced by `Sec*` config directives.
pub enum ConfigSetting {
    RuleEngine(RuleEngineMode),
    RequestBodyAccess(bool),
    ResponseBodyAccess(bool),
    RequestBodyLimit(usize),
    ResponseBodyLimit(usize),
    ArgumentSeparator(char),
    PcreMatchLimit(u64),
    PcreMatchLimitRecursion(u64),
    UnicodeMapFile(String),
    ResponseBodyMimeTypes(Vec<String>),
    /// Recognized directives whose concern lives outside this engine
    /// (audit logging, storage directories, upload handling).
    Ignored,
}

/// Parse a block of configuration text into directives.
pub fn parse(text: &str, base_dir: Option<&Path>) -> Result<Vec<Directive>, LoadError> {
    let mut directives = Vec::new();
    for logical in split_directives(text) {
        if let Some(directive) = parse_directive(&logical, base_dir)? {
            directives.push(directive);
        }
    }
    Ok(directives)
}

/// Join continuation lines and drop comments/blanks, yielding one string
/// per logical directive.
fn split_directives(text: &str) -> Vec<String> {
    let mut directives = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }

        if let Some(continued) = trimmed.strip_suffix('\\') {
            current.push_str(continued);
            current.push(' ');
        } else {
            current.push_str(trimmed);
            directives.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        directives.push(current);
    }
    directives
}

/// Take the next argument token: double-quoted (with `\"` escapes),
/// single-quoted, or bare up to whitespace.
fn next_token(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }

    let mut chars = input.char_indices();
    let (_, first) = chars.next()?;

    if first == '"' || first == '\'' {
        let quote = first;
        let mut token = String::new();
        let mut escaped = false;
        for (i, c) in chars {
            if escaped {
                // Only the quote and backslash escape; everything else keeps
                // its backslash (regex patterns depend on it).
                if c != quote && c != '\\' {
                    token.push('\\');
                }
                token.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                return Some((token, &input[i + 1..]));
            } else {
                token.push(c);
            }
        }
        // Unterminated quote: take the rest.
        Some((token, ""))
    } else {
        let end = input.find(char::is_whitespace).unwrap_or(input.len());
        Some((input[..end].to_string(), &input[end..]))
    }
}

fn parse_directive(
    directive: &str,
    base_dir: Option<&Path>,
) -> Result<Option<Directive>, LoadError> {
    let (name, rest) = match directive.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (directive, ""),
    };

    let arg = |what: &'static str| -> Result<(String, &str), LoadError> {
        next_token(rest).ok_or(LoadError::BadDirective {
            directive: directive.to_string(),
            message: format!("missing {what}"),
        })
    };

    let on_off = |value: &str| match value.to_ascii_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    };

    match name.to_ascii_lowercase().as_str() {
        "secrule" => {
            let (variables, rest) = next_token(rest).ok_or(LoadError::BadDirective {
                directive: directive.to_string(),
                message: "missing variables".to_string(),
            })?;
            let (operator, rest) = next_token(rest).ok_or(LoadError::BadDirective {
                directive: directive.to_string(),
                message: "missing operator".to_string(),
            })?;
            let actions = next_token(rest).map(|(actions, _)| actions);
            let parsed = rule_parser::parse_sec_rule(
                &variables,
                &operator,
                actions.as_deref(),
                base_dir,
            )?;
            Ok(Some(Directive::Rule(parsed)))
        }
        "secaction" => {
            let (actions, _) = arg("actions")?;
            Ok(Some(Directive::Action(rule_parser::parse_sec_action(&actions)?)))
        }
        "secdefaultaction" => {
            let (actions, _) = arg("actions")?;
            Ok(Some(Directive::DefaultAction(rule_parser::parse_sec_action(&actions)?)))
        }
        "secmarker" => {
            let (marker, _) = arg("marker name")?;
            Ok(Some(Directive::Marker(marker.as_str().into())))
        }
        "secruleengine" => {
            let (value, _) = arg("mode")?;
            let mode = RuleEngineMode::parse(&value).ok_or(LoadError::InvalidValue {
                what: "SecRuleEngine mode",
                value: value.clone(),
            })?;
            Ok(Some(Directive::Config(ConfigSetting::RuleEngine(mode))))
        }
        "secrequestbodyaccess" => {
            let (value, _) = arg("On|Off")?;
            let enabled = on_off(&value).ok_or(LoadError::InvalidValue {
                what: "SecRequestBodyAccess",
                value,
            })?;
            Ok(Some(Directive::Config(ConfigSetting::RequestBodyAccess(enabled))))
        }
        "secresponsebodyaccess" => {
            let (value, _) = arg("On|Off")?;
            let enabled = on_off(&value).ok_or(LoadError::InvalidValue {
                what: "SecResponseBodyAccess",
                value,
            })?;
            Ok(Some(Directive::Config(ConfigSetting::ResponseBodyAccess(enabled))))
        }
        "secrequestbodylimit" => {
            let (value, _) = arg("limit")?;
            let limit = value.parse().map_err(|_| LoadError::InvalidValue {
                what: "SecRequestBodyLimit",
                value: value.clone(),
            })?;
            Ok(Some(Directive::Config(ConfigSetting::RequestBodyLimit(limit))))
        }
        "secresponsebodylimit" => {
            let (value, _) = arg("limit")?;
            let limit = value.parse().map_err(|_| LoadError::InvalidValue {
                what: "SecResponseBodyLimit",
                value: value.clone(),
            })?;
            Ok(Some(Directive::Config(ConfigSetting::ResponseBodyLimit(limit))))
        }
        "secargumentseparator" => {
            let (value, _) = arg("separator")?;
            let separator = value.chars().next().ok_or(LoadError::InvalidValue {
                what: "SecArgumentSeparator",
                value: value.clone(),
            })?;
            Ok(Some(Directive::Config(ConfigSetting::ArgumentSeparator(separator))))
        }
        "secpcrematchlimit" => {
            let (value, _) = arg("limit")?;
            let limit = value.parse().map_err(|_| LoadError::InvalidValue {
                what: "SecPcreMatchLimit",
                value: value.clone(),
            })?;
            Ok(Some(Directive::Config(ConfigSetting::PcreMatchLimit(limit))))
        }
        "secpcrematchlimitrecursion" => {
            let (value, _) = arg("limit")?;
            let limit = value.parse().map_err(|_| LoadError::InvalidValue {
                what: "SecPcreMatchLimitRecursion",
                value: value.clone(),
            })?;
            Ok(Some(Directive::Config(ConfigSetting::PcreMatchLimitRecursion(limit))))
        }
        "secunicodemapfile" => {
            let (value, _) = arg("path")?;
            Ok(Some(Directive::Config(ConfigSetting::UnicodeMapFile(value))))
        }
        "secresponsebodymimetype" => {
            let types = rest.split_whitespace().map(|t| t.to_ascii_lowercase()).collect();
            Ok(Some(Directive::Config(ConfigSetting::ResponseBodyMimeTypes(types))))
        }
        "secruleremovebyid" => {
            let mut ranges = Vec::new();
            for entry in rest.split_whitespace() {
                let range = match entry.split_once('-') {
                    Some((lo, hi)) => {
                        let lo = lo.parse().map_err(|_| LoadError::InvalidValue {
                            what: "rule id",
                            value: entry.to_string(),
                        })?;
                        let hi = hi.parse().map_err(|_| LoadError::InvalidValue {
                            what: "rule id",
                            value: entry.to_string(),
                        })?;
                        (lo, hi)
                    }
                    None => {
                        let id: u64 = entry.parse().map_err(|_| LoadError::InvalidValue {
                            what: "rule id",
                            value: entry.to_string(),
                        })?;
                        (id, id)
                    }
                };
                ranges.push(range);
            }
            Ok(Some(Directive::RemoveById(ranges)))
        }
        "secruleremovebymsg" => {
            let (value, _) = arg("message pattern")?;
            Ok(Some(Directive::RemoveByMsg(value)))
        }
        "secruleremovebytag" => {
            let (value, _) = arg("tag")?;
            Ok(Some(Directive::RemoveByTag(value)))
        }
        "secruleupdateactionbyid" => {
            let (id, rest) = arg("rule id")?;
            let id = id.parse().map_err(|_| LoadError::InvalidValue {
                what: "rule id",
                value: id.clone(),
            })?;
            let (actions, _) = next_token(rest).ok_or(LoadError::BadDirective {
                directive: directive.to_string(),
                message: "missing actions".to_string(),
            })?;
            Ok(Some(Directive::UpdateActionById { id, actions }))
        }
        "secruleupdatetargetbyid" => {
            let (id, rest) = arg("rule id")?;
            let id = id.parse().map_err(|_| LoadError::InvalidValue {
                what: "rule id",
                value: id.clone(),
            })?;
            let (targets, _) = next_token(rest).ok_or(LoadError::BadDirective {
                directive: directive.to_string(),
                message: "missing targets".to_string(),
            })?;
            Ok(Some(Directive::UpdateTargetById { id, targets }))
        }
        "include" => {
            let (path, _) = arg("path")?;
            Ok(Some(Directive::Include(path)))
        }
        // Recognized directives whose component lives outside this engine.
        "secauditengine" | "secauditlog" | "secauditlogparts" | "secauditlogtype"
        | "secauditlogformat" | "secauditlogrelevantstatus" | "secauditlogstoragedir"
        | "secdebuglog" | "secdebugloglevel" | "sectmpdir" | "secdatadir" | "secuploaddir"
        | "secuploadkeepfiles" | "seccollectiontimeout" | "secrequestbodynofileslimit"
        | "secrequestbodylimitaction" | "secresponsebodylimitaction" | "secstatusengine"
        | "seccomponentsignature" | "secwebappid" => {
            Ok(Some(Directive::Config(ConfigSetting::Ignored)))
        }
        _ => Err(LoadError::UnknownDirective(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuations_and_comments() {
        let text = "# a comment\nSecAction \\\n  \"phase:1,setvar:tx.a=1\"\n\nSecMarker END\n";
        let directives = split_directives(text);
        assert_eq!(directives.len(), 2);
        assert!(directives[0].starts_with("SecAction"));
        assert_eq!(directives[1], "SecMarker END");
    }

    #[test]
    fn quoted_tokens_unescape_quotes_only() {
        let (token, rest) = next_token(r#""@rx a\"b\d+" tail"#).unwrap();
        assert_eq!(token, r#"@rx a"b\d+"#);
        assert_eq!(rest.trim(), "tail");

        let (bare, rest) = next_token("ARGS:foo rest").unwrap();
        assert_eq!(bare, "ARGS:foo");
        assert_eq!(rest.trim(), "rest");
    }

    #[test]
    fn full_sec_rule_parses() {
        let directives =
            parse(r#"SecRule ARGS:foo "@streq x" "id:10,phase:1,setvar:tx.seen=1""#, None)
                .unwrap();
        assert_eq!(directives.len(), 1);
        match &directives[0] {
            Directive::Rule(parsed) => {
                assert_eq!(parsed.rule.id, 10);
                assert_eq!(parsed.rule.variables.len(), 1);
                assert_eq!(parsed.rule.operators.len(), 1);
            }
            _ => panic!("expected a rule"),
        }
    }

    #[test]
    fn engine_config_directives() {
        let directives = parse(
            "SecRuleEngine DetectionOnly\nSecRequestBodyAccess On\nSecArgumentSeparator ;\n",
            None,
        )
        .unwrap();
        assert_eq!(directives.len(), 3);
        assert!(matches!(
            directives[0],
            Directive::Config(ConfigSetting::RuleEngine(RuleEngineMode::DetectionOnly))
        ));
        assert!(matches!(
            directives[2],
            Directive::Config(ConfigSetting::ArgumentSeparator(';'))
        ));
    }

    #[test]
    fn unknown_directive_is_an_error() {
        assert!(matches!(
            parse("SecNoSuchThing On", None),
            Err(LoadError::UnknownDirective(_))
        ));
    }

    #[test]
    fn remove_by_id_accepts_ranges() {
        let directives = parse("SecRuleRemoveById 100 200-300", None).unwrap();
        match &directives[0] {
            Directive::RemoveById(ranges) => {
                assert_eq!(ranges, &vec![(100, 100), (200, 300)])
            }
            _ => panic!("expected RemoveById"),
        }
    }
}
