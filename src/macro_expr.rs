//! Macro expansion.
//!
//! Macros are compile-time parsed templates over transaction state, written
//! `%{VAR}` or `%{COLLECTION.key}`. Two forms exist:
//!
//! - a single variable reference (`%{tx.score}`), which expands to the
//!   variable's result list, and
//! - a multi-segment template (`score is %{tx.score}!`), which expands to one
//!   string with each variable segment joined in.
//!
//! Scalar consumers (operator right-hand sides, setvar values, msg/logdata)
//! use [`MacroExpr::expand_str`]; a multi-element variable expansion joins
//! its elements with a single space.

use crate::transaction::Transaction;
use crate::variable::{VarExpr, VarParseError};
use crate::{EvaluateResults, ResultElement, SharedStr, Value};

#[derive(Debug, Clone)]
pub enum Segment {
    Literal(SharedStr),
    Var(VarExpr),
}

/// A parsed macro template.
#[derive(Debug, Clone)]
pub enum MacroExpr {
    /// The whole template is one `%{...}` reference.
    Variable(VarExpr),
    Multi(Vec<Segment>),
}

impl MacroExpr {
    /// True when `text` contains at least one `%{...}` reference, i.e. when
    /// it must be parsed as a macro rather than used as a literal.
    pub fn is_macro(text: &str) -> bool {
        text.contains("%{")
    }

    pub fn parse(text: &str) -> Result<MacroExpr, VarParseError> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut rest = text;

        while let Some(start) = rest.find("%{") {
            let Some(end) = rest[start..].find('}') else {
                // Unterminated reference: keep the tail as literal.
                break;
            };
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].into()));
            }
            let var = VarExpr::parse_macro_ref(&rest[start + 2..start + end])?;
            segments.push(Segment::Var(var));
            rest = &rest[start + end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.into()));
        }

        if segments.len() == 1 && matches!(segments[0], Segment::Var(_)) {
            let Some(Segment::Var(var)) = segments.pop() else { unreachable!() };
            return Ok(MacroExpr::Variable(var));
        }
        Ok(MacroExpr::Multi(segments))
    }

    /// Evaluate the template to a result list.
    pub fn evaluate(&self, tx: &Transaction<'_>, out: &mut EvaluateResults) {
        match self {
            MacroExpr::Variable(var) => var.evaluate(tx, out),
            MacroExpr::Multi(segments) => {
                let mut joined = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => joined.push_str(text),
                        Segment::Var(var) => {
                            let mut results = EvaluateResults::default();
                            var.evaluate(tx, &mut results);
                            joined.push_str(&join_results(&results));
                        }
                    }
                }
                out.append(ResultElement::new(Value::Str(joined.into()), None));
            }
        }
    }

    /// Evaluate the template as a single string.
    pub fn expand_str(&self, tx: &Transaction<'_>) -> SharedStr {
        let mut results = EvaluateResults::default();
        self.evaluate(tx, &mut results);
        match results.len() {
            0 => SharedStr::empty(),
            1 => match &results.get(0).unwrap().value {
                Value::Str(s) => s.clone(),
                value => SharedStr::from(value.display()),
            },
            _ => SharedStr::from(join_results(&results)),
        }
    }

    /// True when any segment reads the MATCHED_VAR family.
    pub fn reads_matched(&self) -> bool {
        match self {
            MacroExpr::Variable(var) => var.reads_matched(),
            MacroExpr::Multi(segments) => segments.iter().any(|s| match s {
                Segment::Var(var) => var.reads_matched(),
                Segment::Literal(_) => false,
            }),
        }
    }
}

fn join_results(results: &EvaluateResults) -> String {
    let mut joined = String::new();
    for (i, element) in results.iter().enumerate() {
        if i > 0 {
            joined.push(' ');
        }
        joined.push_str(&element.value.display());
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_reference_parses_to_variable_form() {
        match MacroExpr::parse("%{tx.foo}").unwrap() {
            MacroExpr::Variable(var) => assert_eq!(var.sub_name.as_deref(), Some("foo")),
            other => panic!("expected variable form, got {other:?}"),
        }
    }

    #[test]
    fn mixed_template_parses_to_segments() {
        match MacroExpr::parse("score=%{tx.score} of %{tx.limit}").unwrap() {
            MacroExpr::Multi(segments) => {
                assert_eq!(segments.len(), 4);
                assert!(matches!(&segments[0], Segment::Literal(l) if &**l == "score="));
                assert!(matches!(&segments[1], Segment::Var(_)));
                assert!(matches!(&segments[2], Segment::Literal(l) if &**l == " of "));
            }
            other => panic!("expected multi form, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_is_a_single_literal() {
        match MacroExpr::parse("no references here").unwrap() {
            MacroExpr::Multi(segments) => assert_eq!(segments.len(), 1),
            other => panic!("expected multi form, got {other:?}"),
        }
        assert!(!MacroExpr::is_macro("no references here"));
        assert!(MacroExpr::is_macro("%{tx.x}"));
    }

    #[test]
    fn matched_var_references_are_detected() {
        assert!(MacroExpr::parse("%{MATCHED_VAR}").unwrap().reads_matched());
        assert!(MacroExpr::parse("name=%{MATCHED_VARS_NAMES}").unwrap().reads_matched());
        assert!(!MacroExpr::parse("%{tx.foo}").unwrap().reads_matched());
    }
}
