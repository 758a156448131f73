mod action;
mod bytecode;
mod engine;
mod macro_expr;
mod operator;
mod rule;
mod seclang;
mod shared_cache;
mod transaction;
mod transform;
mod variable;

pub use engine::{Engine, EngineConfig, LoadError, RuleEngineMode};
pub use transaction::{MatchedVariable, Transaction};

pub use operator::Operator;
pub use rule::Rule;
pub use variable::{AccessMode, VarExpr, VarKind};

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

// --- Shared strings ----------------------------------------------------------

/// Refcounted immutable string with stable address identity.
///
/// Every string value flowing through the engine (header values, argument
/// values, transformation outputs, captures) is a `SharedStr`. Cloning is a
/// refcount bump, and a clone pins the allocation, so the `(ptr, len)`
/// identity used as a transformation-cache key stays valid for as long as any
/// holder (a cache entry, a matched-variables log entry) keeps a clone.
#[derive(Clone)]
pub struct SharedStr(Arc<str>);

/// Address identity of a [`SharedStr`]: the allocation pointer and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrIdentity(usize, usize);

static EMPTY_STR: Lazy<SharedStr> = Lazy::new(|| SharedStr(Arc::from("")));

impl SharedStr {
    pub fn empty() -> Self {
        EMPTY_STR.clone()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn identity(&self) -> StrIdentity {
        StrIdentity(self.0.as_ptr() as usize, self.0.len())
    }
}

impl Default for SharedStr {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<&str> for SharedStr {
    fn from(s: &str) -> Self {
        if s.is_empty() { Self::empty() } else { SharedStr(Arc::from(s)) }
    }
}

impl From<String> for SharedStr {
    fn from(s: String) -> Self {
        if s.is_empty() { Self::empty() } else { SharedStr(Arc::from(s)) }
    }
}

impl std::ops::Deref for SharedStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SharedStr {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq for SharedStr {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SharedStr {}

impl PartialEq<str> for SharedStr {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl std::hash::Hash for SharedStr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl fmt::Debug for SharedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Value model -------------------------------------------------------------

/// A discriminated value produced by variable evaluation.
///
/// Operator result lists reuse the discriminant as a match marker: a matched
/// element is `Str` (the capture, possibly empty) and an unmatched element is
/// `Int(0)`. Action and push instructions test `is_int` to tell them apart.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Empty,
    Int(i64),
    Str(SharedStr),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    pub fn is_str(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Render the value the way macros and logs print it.
    pub fn display(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Int(n) => n.to_string(),
            Value::Str(s) => s.to_string(),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<SharedStr> for Value {
    fn from(s: SharedStr) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

// --- Result lists ------------------------------------------------------------

/// One element of an evaluation result list: a value plus the sub-name of the
/// collection entry that produced it (e.g. the argument name for `ARGS:foo`).
///
/// Transformations and operators preserve sub-names one-to-one with their
/// inputs so that `MATCHED_VAR_NAME` can reconstruct the qualified name.
#[derive(Debug, Clone, Default)]
pub struct ResultElement {
    pub value: Value,
    pub sub_name: Option<SharedStr>,
}

impl ResultElement {
    pub fn new(value: Value, sub_name: Option<SharedStr>) -> Self {
        ResultElement { value, sub_name }
    }
}

/// Ordered, append-only sequence of [`ResultElement`]s.
///
/// This is the unit of inter-instruction dataflow in the virtual machine: one
/// extended register stores one result list.
#[derive(Debug, Clone, Default)]
pub struct EvaluateResults {
    items: Vec<ResultElement>,
}

impl EvaluateResults {
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn append(&mut self, element: ResultElement) {
        self.items.push(element);
    }

    pub fn append_value(&mut self, value: impl Into<Value>) {
        self.items.push(ResultElement::new(value.into(), None));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResultElement> {
        self.items.get(index)
    }

    /// Destructively remove element `index`, leaving an `Empty` placeholder.
    ///
    /// Used when an element passes ownership to the matched-variables log.
    pub fn take(&mut self, index: usize) -> Option<ResultElement> {
        let slot = self.items.get_mut(index)?;
        Some(std::mem::take(slot))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultElement> {
        self.items.iter()
    }
}

// --- Phases and dispositions -------------------------------------------------

/// Processing point in an HTTP transaction at which rules run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    RequestHeaders = 1,
    RequestBody = 2,
    ResponseHeaders = 3,
    ResponseBody = 4,
    Logging = 5,
}

pub const PHASE_TOTAL: usize = 5;

impl Phase {
    pub fn from_number(n: i64) -> Option<Phase> {
        match n {
            1 => Some(Phase::RequestHeaders),
            2 => Some(Phase::RequestBody),
            3 => Some(Phase::ResponseHeaders),
            4 => Some(Phase::ResponseBody),
            5 => Some(Phase::Logging),
            _ => None,
        }
    }

    pub fn number(self) -> i64 {
        self as i64
    }

    /// Zero-based index into per-phase arrays.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn is_request_side(self) -> bool {
        matches!(self, Phase::RequestHeaders | Phase::RequestBody)
    }
}

/// Rule severity, numerically ordered: 0 is the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Severity {
    pub fn parse(text: &str) -> Option<Severity> {
        match text.to_ascii_uppercase().as_str() {
            "0" | "EMERGENCY" => Some(Severity::Emergency),
            "1" | "ALERT" => Some(Severity::Alert),
            "2" | "CRITICAL" => Some(Severity::Critical),
            "3" | "ERROR" => Some(Severity::Error),
            "4" | "WARNING" => Some(Severity::Warning),
            "5" | "NOTICE" => Some(Severity::Notice),
            "6" | "INFO" => Some(Severity::Info),
            "7" | "DEBUG" => Some(Severity::Debug),
            _ => None,
        }
    }
}

/// Scope of an `allow` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowScope {
    /// Bare `allow`: the rest of the transaction is allowed (request and
    /// response phases are skipped; the logging phase still runs).
    Transaction,
    /// `allow:request`: the remaining request-side phases are skipped.
    Request,
    /// `allow:phase`: terminates only the current phase.
    Phase,
}

/// Final disposition of a transaction phase, surfaced to the host.
///
/// Dispositions are normal return values, not errors: the host decides
/// whether to reject, allow, or continue the transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// No disruptive rule fired; continue.
    Pass,
    Allow(AllowScope),
    /// `deny`/`block`: reject with the given HTTP status.
    Block { status: u16 },
    /// `drop`: close the connection without a response.
    Drop,
    Redirect { status: u16, location: SharedStr },
}

impl Disposition {
    /// True when the host should stop feeding this transaction.
    pub fn is_disruptive(&self) -> bool {
        !matches!(self, Disposition::Pass | Disposition::Allow(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_str_identity_is_stable_across_clones() {
        let a: SharedStr = "hello world, long enough to matter".into();
        let b = a.clone();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a, b);

        let c: SharedStr = "hello world, long enough to matter".into();
        assert_ne!(a.identity(), c.identity());
        assert_eq!(a, c);
    }

    #[test]
    fn take_leaves_placeholder() {
        let mut results = EvaluateResults::default();
        results.append(ResultElement::new(Value::from("x"), Some("a".into())));
        results.append_value(7);

        let moved = results.take(0).unwrap();
        assert_eq!(moved.value.as_str(), Some("x"));
        assert_eq!(results.len(), 2);
        assert!(results.get(0).unwrap().value.is_empty());
        assert_eq!(results.get(1).unwrap().value.as_int(), Some(7));
    }

    #[test]
    fn phase_numbering_round_trips() {
        for n in 1..=5 {
            let phase = Phase::from_number(n).unwrap();
            assert_eq!(phase.number(), n);
            assert_eq!(phase.index() as i64, n - 1);
        }
        assert!(Phase::from_number(0).is_none());
        assert!(Phase::from_number(6).is_none());
    }
}
