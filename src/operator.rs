//! Operators.
//!
//! An operator is a predicate over one value, optionally parameterized by a
//! literal or macro-expanded right-hand side. Per input element it reports
//! matched/unmatched and, on match, may stage capture strings into the
//! transaction's pending capture table (promoted by the VM on merge).
//!
//! `!@op` complement is stored here but applied by the VM; `emptyMatch`
//! decides the verdict when a macro right-hand side expands to nothing.
//!
//! Multi-pattern operators (`@pm`, `@pmFromFile`, `@within`) compile their
//! token set into a scanner shared process-wide through the sharded LRU
//! cache, keyed by an order-independent hash of the tokens.

use crate::macro_expr::MacroExpr;
use crate::shared_cache::{ShardedLruCache, order_independent_hash};
use crate::transaction::Transaction;
use crate::{SharedStr, Value};

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use once_cell::sync::Lazy;
use regex::Regex;

/// Every operator kind the engine evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    BeginsWith,
    Contains,
    ContainsWord,
    DetectSqli,
    DetectXss,
    EndsWith,
    Eq,
    Ge,
    Gt,
    IpMatch,
    IpMatchFromFile,
    Le,
    Lt,
    NoMatch,
    Pm,
    PmFromFile,
    Rx,
    Streq,
    Strmatch,
    UnconditionalMatch,
    ValidateByteRange,
    ValidateUrlEncoding,
    ValidateUtf8Encoding,
    VerifyCc,
    Within,
}

const KIND_NAMES: &[(&str, OperatorKind)] = &[
    ("beginsWith", OperatorKind::BeginsWith),
    ("contains", OperatorKind::Contains),
    ("containsWord", OperatorKind::ContainsWord),
    ("detectSQLi", OperatorKind::DetectSqli),
    ("detectXSS", OperatorKind::DetectXss),
    ("endsWith", OperatorKind::EndsWith),
    ("eq", OperatorKind::Eq),
    ("ge", OperatorKind::Ge),
    ("gt", OperatorKind::Gt),
    ("ipMatch", OperatorKind::IpMatch),
    ("ipMatchFromFile", OperatorKind::IpMatchFromFile),
    ("ipMatchF", OperatorKind::IpMatchFromFile),
    ("le", OperatorKind::Le),
    ("lt", OperatorKind::Lt),
    ("noMatch", OperatorKind::NoMatch),
    ("pm", OperatorKind::Pm),
    ("pmFromFile", OperatorKind::PmFromFile),
    ("pmf", OperatorKind::PmFromFile),
    ("rx", OperatorKind::Rx),
    ("streq", OperatorKind::Streq),
    ("strmatch", OperatorKind::Strmatch),
    ("unconditionalMatch", OperatorKind::UnconditionalMatch),
    ("validateByteRange", OperatorKind::ValidateByteRange),
    ("validateUrlEncoding", OperatorKind::ValidateUrlEncoding),
    ("validateUtf8Encoding", OperatorKind::ValidateUtf8Encoding),
    ("verifyCC", OperatorKind::VerifyCc),
    ("within", OperatorKind::Within),
];

/// Operator names the original language defines but this engine delegates to
/// external backends (filesystem inspection, DNS, geo, XML schemas).
const UNSUPPORTED_NAMES: &[&str] = &[
    "fuzzyHash",
    "geoLookup",
    "inspectFile",
    "rbl",
    "rsub",
    "rxGlobal",
    "validateDTD",
    "validateSchema",
    "verifyCPF",
    "verifySSN",
];

/// Errors constructing an operator; surfaced through `LoadError`.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("unknown operator @{0}")]
    Unknown(String),
    #[error("operator @{0} requires an external component")]
    Unsupported(String),
    #[error("bad regex for @{kind}: {error}")]
    BadRegex { kind: &'static str, error: String },
    #[error("bad argument for @{kind}: {argument}")]
    BadArgument { kind: &'static str, argument: String },
    #[error("cannot read pattern file {path}: {error}")]
    File { path: String, error: String },
}

/// Prepared per-kind auxiliary data, built once at rule load.
#[derive(Debug)]
enum Prepared {
    None,
    Regex(Box<Regex>),
    Scanner(Arc<PatternScanner>),
    Number(i64),
    IpNets(Vec<IpNet>),
    ByteRanges(Vec<(u8, u8)>),
}

/// A compiled operator: kind, complement flag, right-hand side.
#[derive(Debug)]
pub struct Operator {
    pub kind: OperatorKind,
    pub negated: bool,
    /// Treat an empty macro expansion as "match".
    pub empty_match: bool,
    literal: SharedStr,
    rhs_macro: Option<MacroExpr>,
    prepared: Prepared,
}

// --- Shared scanners ---------------------------------------------------------

/// A prepared multi-pattern structure: a substring automaton for `@pm`, a
/// token set for `@within`.
#[derive(Debug)]
pub enum PatternScanner {
    Substrings { automaton: AhoCorasick, patterns: Vec<String> },
    TokenSet(Vec<String>),
}

static SCANNER_CACHE: Lazy<ShardedLruCache<u64, Arc<PatternScanner>>> =
    Lazy::new(|| ShardedLruCache::new(1024));

fn split_tokens(text: &str) -> Vec<String> {
    text.split_whitespace().map(|t| t.to_ascii_lowercase()).collect()
}

fn substring_scanner(tokens: &[String]) -> Arc<PatternScanner> {
    let key = order_independent_hash(tokens.iter().map(|t| ("pm", t.as_str())));
    SCANNER_CACHE.access(&key, || {
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(tokens)
            .expect("aho-corasick construction cannot fail for plain substrings");
        Arc::new(PatternScanner::Substrings { automaton, patterns: tokens.to_vec() })
    })
}

fn token_set_scanner(tokens: &[String]) -> Arc<PatternScanner> {
    let key = order_independent_hash(tokens.iter().map(|t| ("within", t.as_str())));
    SCANNER_CACHE.access(&key, || Arc::new(PatternScanner::TokenSet(tokens.to_vec())))
}

impl PatternScanner {
    /// Scan `haystack`, returning the first matched span (`@pm`).
    fn find(&self, haystack: &str) -> Option<(usize, usize)> {
        match self {
            PatternScanner::Substrings { automaton, .. } => {
                automaton.find(haystack).map(|m| (m.start(), m.end()))
            }
            PatternScanner::TokenSet(_) => None,
        }
    }

    /// True when `input` is entirely composed of set tokens (`@within`):
    /// `helloworld` is within `hello world`, `hello1` is not, and a value
    /// merely prefixed by a token (`GETX` against `GET HEAD`) never passes.
    fn covers(&self, input: &str) -> bool {
        let PatternScanner::TokenSet(tokens) = self else { return false };
        if input.is_empty() || tokens.is_empty() {
            return false;
        }
        let lower = input.to_ascii_lowercase();

        let mut reachable = vec![false; lower.len() + 1];
        reachable[0] = true;
        for i in 0..lower.len() {
            if !reachable[i] {
                continue;
            }
            // A single separator between tokens is allowed, as in the
            // space- or comma-delimited lists the parameter itself uses.
            if matches!(lower.as_bytes()[i], b' ' | b',') {
                reachable[i + 1] = true;
                continue;
            }
            for token in tokens {
                if lower[i..].starts_with(token.as_str()) {
                    reachable[i + token.len()] = true;
                }
            }
        }
        reachable[lower.len()]
    }
}

// --- Construction ------------------------------------------------------------

impl Operator {
    /// Build an operator from its SecLang name and argument text.
    ///
    /// `base_dir` anchors `@pmFromFile`/`@ipMatchFromFile` relative paths
    /// (the directory of the rule file being loaded).
    pub fn new(
        name: &str,
        argument: &str,
        negated: bool,
        base_dir: Option<&Path>,
    ) -> Result<Operator, OperatorError> {
        let kind = KIND_NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, k)| *k)
            .ok_or_else(|| {
                if UNSUPPORTED_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                    OperatorError::Unsupported(name.to_string())
                } else {
                    OperatorError::Unknown(name.to_string())
                }
            })?;

        let argument = argument.trim();
        let rhs_macro = if MacroExpr::is_macro(argument) {
            Some(MacroExpr::parse(argument).map_err(|e| OperatorError::BadArgument {
                kind: kind.name(),
                argument: e.to_string(),
            })?)
        } else {
            None
        };

        let prepared = if rhs_macro.is_some() {
            // Macro right-hand sides are prepared per evaluation.
            Prepared::None
        } else {
            Self::prepare(kind, argument, base_dir)?
        };

        Ok(Operator {
            kind,
            negated,
            empty_match: false,
            literal: argument.into(),
            rhs_macro,
            prepared,
        })
    }

    fn prepare(
        kind: OperatorKind,
        argument: &str,
        base_dir: Option<&Path>,
    ) -> Result<Prepared, OperatorError> {
        Ok(match kind {
            OperatorKind::Rx => Prepared::Regex(Box::new(Regex::new(argument).map_err(|e| {
                OperatorError::BadRegex { kind: kind.name(), error: e.to_string() }
            })?)),
            OperatorKind::VerifyCc => {
                let pattern = if argument.is_empty() { r"\d{13,19}" } else { argument };
                Prepared::Regex(Box::new(Regex::new(pattern).map_err(|e| {
                    OperatorError::BadRegex { kind: kind.name(), error: e.to_string() }
                })?))
            }
            OperatorKind::Pm => Prepared::Scanner(substring_scanner(&split_tokens(argument))),
            OperatorKind::PmFromFile => {
                let tokens = read_pattern_file(argument, base_dir)?;
                Prepared::Scanner(substring_scanner(&tokens))
            }
            OperatorKind::Within => {
                Prepared::Scanner(token_set_scanner(&split_tokens(argument)))
            }
            OperatorKind::Eq | OperatorKind::Ge | OperatorKind::Gt | OperatorKind::Le
            | OperatorKind::Lt => Prepared::Number(parse_int_prefix(argument)),
            OperatorKind::IpMatch => Prepared::IpNets(parse_ip_list(argument, kind)?),
            OperatorKind::IpMatchFromFile => {
                let lines = read_pattern_file(argument, base_dir)?;
                Prepared::IpNets(parse_ip_list(&lines.join(","), kind)?)
            }
            OperatorKind::ValidateByteRange => {
                Prepared::ByteRanges(parse_byte_ranges(argument, kind)?)
            }
            _ => Prepared::None,
        })
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn literal(&self) -> &str {
        &self.literal
    }

    /// True when the right-hand side references the MATCHED_VAR family.
    pub fn reads_matched(&self) -> bool {
        self.rhs_macro.as_ref().is_some_and(|m| m.reads_matched())
    }
}

impl OperatorKind {
    pub fn name(self) -> &'static str {
        KIND_NAMES.iter().find(|(_, k)| *k == self).map(|(n, _)| *n).unwrap_or("unknown")
    }
}

// --- Evaluation --------------------------------------------------------------

impl Operator {
    /// Apply the predicate to one value. The `!` complement is applied by the
    /// VM, not here. On match, captures are staged into the transaction.
    pub fn evaluate(&self, tx: &mut Transaction<'_>, value: &Value) -> bool {
        match self.kind {
            OperatorKind::UnconditionalMatch => true,
            OperatorKind::NoMatch => false,

            OperatorKind::Rx => self.eval_rx(tx, value),
            OperatorKind::Streq => self.with_rhs_str(tx, value, |operand, rhs| operand == rhs),
            OperatorKind::BeginsWith => {
                self.with_rhs_str(tx, value, |operand, rhs| operand.starts_with(rhs))
            }
            OperatorKind::EndsWith => {
                self.with_rhs_str(tx, value, |operand, rhs| operand.ends_with(rhs))
            }
            OperatorKind::Contains | OperatorKind::Strmatch => self.eval_contains(tx, value),
            OperatorKind::ContainsWord => self.eval_contains_word(tx, value),
            OperatorKind::Within | OperatorKind::Pm | OperatorKind::PmFromFile => {
                self.eval_scan(tx, value)
            }

            OperatorKind::Eq => self.eval_compare(tx, value, |l, r| l == r),
            OperatorKind::Ge => self.eval_compare(tx, value, |l, r| l >= r),
            OperatorKind::Gt => self.eval_compare(tx, value, |l, r| l > r),
            OperatorKind::Le => self.eval_compare(tx, value, |l, r| l <= r),
            OperatorKind::Lt => self.eval_compare(tx, value, |l, r| l < r),

            OperatorKind::IpMatch | OperatorKind::IpMatchFromFile => self.eval_ip(value),
            OperatorKind::ValidateByteRange => self.eval_byte_range(value),
            OperatorKind::ValidateUrlEncoding => {
                value.as_str().is_some_and(has_invalid_url_encoding)
            }
            OperatorKind::ValidateUtf8Encoding => {
                // Values are `str`, so malformed sequences only survive as
                // replacement characters from lossy conversion.
                value.as_str().is_some_and(|s| s.contains('\u{fffd}'))
            }
            OperatorKind::VerifyCc => self.eval_verify_cc(tx, value),
            OperatorKind::DetectSqli => value.as_str().is_some_and(looks_like_sqli),
            OperatorKind::DetectXss => value.as_str().is_some_and(looks_like_xss),
        }
    }

    /// Right-hand side as a string: the literal, or the macro expansion.
    /// `None` means an empty macro expansion; the caller applies
    /// `empty_match`.
    fn rhs_str(&self, tx: &Transaction<'_>) -> Option<SharedStr> {
        match &self.rhs_macro {
            None => Some(self.literal.clone()),
            Some(macro_expr) => {
                let expanded = macro_expr.expand_str(tx);
                if expanded.is_empty() { None } else { Some(expanded) }
            }
        }
    }

    fn with_rhs_str(
        &self,
        tx: &Transaction<'_>,
        value: &Value,
        predicate: impl Fn(&str, &str) -> bool,
    ) -> bool {
        let Some(operand) = value.as_str() else { return false };
        match self.rhs_str(tx) {
            Some(rhs) => predicate(operand, &rhs),
            None => self.empty_match,
        }
    }

    fn eval_rx(&self, tx: &mut Transaction<'_>, value: &Value) -> bool {
        let Some(operand) = value.as_str() else { return false };

        // A macro right-hand side compiles per expansion; the literal form
        // uses the regex prepared at load.
        let dynamic;
        let re = match &self.prepared {
            Prepared::Regex(re) => re.as_ref(),
            _ => {
                let Some(rhs) = self.rhs_str(tx) else { return self.empty_match };
                match Regex::new(&rhs) {
                    Ok(re) => {
                        dynamic = re;
                        &dynamic
                    }
                    Err(_) => return false,
                }
            }
        };

        let Some(captures) = re.captures(operand) else { return false };
        for (i, group) in captures.iter().take(10).enumerate() {
            if let Some(group) = group {
                tx.stage_capture(i, group.as_str().into());
            }
        }
        true
    }

    fn eval_contains(&self, tx: &mut Transaction<'_>, value: &Value) -> bool {
        let Some(operand) = value.as_str() else { return false };
        let Some(rhs) = self.rhs_str(tx) else { return self.empty_match };
        let matched = operand.contains(&*rhs);
        if matched {
            tx.stage_capture(0, rhs);
        }
        matched
    }

    fn eval_contains_word(&self, tx: &mut Transaction<'_>, value: &Value) -> bool {
        let Some(operand) = value.as_str() else { return false };
        let Some(rhs) = self.rhs_str(tx) else { return self.empty_match };

        let mut start = 0;
        while let Some(pos) = operand[start..].find(&*rhs) {
            let begin = start + pos;
            let end = begin + rhs.len();
            let before_ok = begin == 0
                || !operand[..begin].chars().next_back().unwrap().is_ascii_alphanumeric();
            let after_ok = end == operand.len()
                || !operand[end..].chars().next().unwrap().is_ascii_alphanumeric();
            if before_ok && after_ok {
                tx.stage_capture(0, rhs);
                return true;
            }
            start = begin + 1;
        }
        false
    }

    fn eval_scan(&self, tx: &mut Transaction<'_>, value: &Value) -> bool {
        let Some(operand) = value.as_str() else { return false };

        // Macro form rebuilds (or fetches) the scanner per expansion.
        let scanner: Arc<PatternScanner> = match &self.prepared {
            Prepared::Scanner(scanner) => scanner.clone(),
            _ => {
                let Some(rhs) = self.rhs_str(tx) else { return self.empty_match };
                let tokens = split_tokens(&rhs);
                if self.kind == OperatorKind::Within {
                    token_set_scanner(&tokens)
                } else {
                    substring_scanner(&tokens)
                }
            }
        };

        if self.kind == OperatorKind::Within {
            let matched = scanner.covers(operand);
            if matched {
                tx.stage_capture(0, operand.into());
            }
            return matched;
        }

        match scanner.find(operand) {
            Some((start, end)) => {
                tx.stage_capture(0, operand[start..end].into());
                true
            }
            None => false,
        }
    }

    fn eval_compare(
        &self,
        tx: &Transaction<'_>,
        value: &Value,
        compare: impl Fn(i64, i64) -> bool,
    ) -> bool {
        let Some(left) = value_as_int(value) else { return false };

        match &self.prepared {
            Prepared::Number(right) => compare(left, *right),
            _ => {
                let Some(macro_expr) = &self.rhs_macro else { return false };
                let mut results = crate::EvaluateResults::default();
                macro_expr.evaluate(tx, &mut results);
                if results.is_empty() {
                    return self.empty_match;
                }
                results
                    .iter()
                    .filter_map(|el| value_as_int(&el.value))
                    .any(|right| compare(left, right))
            }
        }
    }

    fn eval_ip(&self, value: &Value) -> bool {
        let Some(operand) = value.as_str() else { return false };
        let Ok(ip) = operand.trim().parse::<IpAddr>() else { return false };
        match &self.prepared {
            Prepared::IpNets(nets) => nets.iter().any(|net| net.contains(ip)),
            _ => false,
        }
    }

    fn eval_byte_range(&self, value: &Value) -> bool {
        let Some(operand) = value.as_str() else { return false };
        let Prepared::ByteRanges(ranges) = &self.prepared else { return false };
        // Matches when any byte falls outside every allowed range.
        operand
            .bytes()
            .any(|b| !ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&b)))
    }

    fn eval_verify_cc(&self, tx: &mut Transaction<'_>, value: &Value) -> bool {
        let Some(operand) = value.as_str() else { return false };
        let Prepared::Regex(re) = &self.prepared else { return false };

        for m in re.find_iter(operand) {
            let digits: Vec<u8> = m
                .as_str()
                .bytes()
                .filter(u8::is_ascii_digit)
                .map(|b| b - b'0')
                .collect();
            if luhn_valid(&digits) {
                tx.stage_capture(0, m.as_str().into());
                return true;
            }
        }
        false
    }
}

// --- Helpers -----------------------------------------------------------------

fn value_as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Str(s) => s.trim().parse().ok(),
        Value::Empty => None,
    }
}

/// `atoll`-style prefix parse: leading integer or 0.
fn parse_int_prefix(text: &str) -> i64 {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    trimmed[..end].parse().unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn parse_ip_list(argument: &str, kind: OperatorKind) -> Result<Vec<IpNet>, OperatorError> {
    let mut nets = Vec::new();
    for entry in argument.split([',', ' ']).map(str::trim).filter(|e| !e.is_empty()) {
        let (addr_text, prefix_text) = match entry.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (entry, None),
        };
        let addr: IpAddr = addr_text.parse().map_err(|_| OperatorError::BadArgument {
            kind: kind.name(),
            argument: entry.to_string(),
        })?;
        let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_text {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max_prefix)
                .ok_or_else(|| OperatorError::BadArgument {
                    kind: kind.name(),
                    argument: entry.to_string(),
                })?,
            None => max_prefix,
        };
        nets.push(IpNet { addr, prefix });
    }
    Ok(nets)
}

fn parse_byte_ranges(
    argument: &str,
    kind: OperatorKind,
) -> Result<Vec<(u8, u8)>, OperatorError> {
    let mut ranges = Vec::new();
    for entry in argument.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let bad = || OperatorError::BadArgument {
            kind: kind.name(),
            argument: entry.to_string(),
        };
        let (lo, hi) = match entry.split_once('-') {
            Some((lo, hi)) => {
                (lo.trim().parse::<u8>().map_err(|_| bad())?, hi.trim().parse::<u8>().map_err(|_| bad())?)
            }
            None => {
                let b = entry.parse::<u8>().map_err(|_| bad())?;
                (b, b)
            }
        };
        if lo > hi {
            return Err(bad());
        }
        ranges.push((lo, hi));
    }
    Ok(ranges)
}

fn read_pattern_file(
    argument: &str,
    base_dir: Option<&Path>,
) -> Result<Vec<String>, OperatorError> {
    let path = match base_dir {
        Some(base) if !Path::new(argument).is_absolute() => base.join(argument),
        _ => Path::new(argument).to_path_buf(),
    };
    let content = std::fs::read_to_string(&path).map_err(|e| OperatorError::File {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_ascii_lowercase())
        .collect())
}

fn has_invalid_url_encoding(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}

fn luhn_valid(digits: &[u8]) -> bool {
    if digits.len() < 12 {
        return false;
    }
    let mut sum: u32 = 0;
    for (i, d) in digits.iter().rev().enumerate() {
        let mut d = *d as u32;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

static SQLI_QUOTE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'\s*(or|and|union|;|--)").unwrap());
static SQLI_STACKED_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";\s*(drop|delete|insert|update)\b").unwrap());
static XSS_EVENT_HANDLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bon(error|load|click|mouseover|focus)\s*=").unwrap());

/// Compact signal set; the real detectors are external leaves, this carries
/// the contract for rules that reference them.
fn looks_like_sqli(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    let has_quote_break = lower.contains("'") && SQLI_QUOTE_BREAK.is_match(&lower);
    has_quote_break
        || lower.contains("union select")
        || lower.contains("or 1=1")
        || lower.contains("sleep(")
        || lower.contains("benchmark(")
        || SQLI_STACKED_QUERY.is_match(&lower)
}

fn looks_like_xss(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.contains("<script")
        || lower.contains("javascript:")
        || lower.contains("vbscript:")
        || XSS_EVENT_HANDLER.is_match(&lower)
        || lower.contains("<iframe")
        || lower.contains("document.cookie")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_int_prefix_matches_atoll() {
        assert_eq!(parse_int_prefix("123"), 123);
        assert_eq!(parse_int_prefix("  42abc"), 42);
        assert_eq!(parse_int_prefix("-7"), -7);
        assert_eq!(parse_int_prefix("abc"), 0);
        assert_eq!(parse_int_prefix(""), 0);
    }

    #[test]
    fn ip_net_membership() {
        let nets = parse_ip_list("192.168.1.0/24, 10.0.0.1", OperatorKind::IpMatch).unwrap();
        assert!(nets[0].contains("192.168.1.100".parse().unwrap()));
        assert!(!nets[0].contains("192.168.2.1".parse().unwrap()));
        assert!(nets[1].contains("10.0.0.1".parse().unwrap()));
        assert!(!nets[1].contains("10.0.0.2".parse().unwrap()));

        let v6 = parse_ip_list("2001:db8::/32", OperatorKind::IpMatch).unwrap();
        assert!(v6[0].contains("2001:db8::1".parse().unwrap()));
        assert!(!v6[0].contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn bad_ip_entries_are_rejected() {
        assert!(parse_ip_list("not-an-ip", OperatorKind::IpMatch).is_err());
        assert!(parse_ip_list("192.168.1.0/33", OperatorKind::IpMatch).is_err());
    }

    #[test]
    fn byte_ranges_parse_and_bound() {
        let ranges = parse_byte_ranges("32-126, 9", OperatorKind::ValidateByteRange).unwrap();
        assert_eq!(ranges, vec![(32, 126), (9, 9)]);
        assert!(parse_byte_ranges("126-32", OperatorKind::ValidateByteRange).is_err());
    }

    #[test]
    fn luhn_accepts_known_test_numbers() {
        let digits = |s: &str| s.bytes().map(|b| b - b'0').collect::<Vec<u8>>();
        assert!(luhn_valid(&digits("4111111111111111")));
        assert!(luhn_valid(&digits("5500005555555559")));
        assert!(!luhn_valid(&digits("4111111111111112")));
        assert!(!luhn_valid(&digits("123")));
    }

    #[test]
    fn within_token_set_coverage() {
        let scanner = PatternScanner::TokenSet(vec!["hello".into(), "world".into()]);
        assert!(scanner.covers("helloworld"));
        assert!(scanner.covers("hello"));
        assert!(scanner.covers("hello world"));
        assert!(scanner.covers("HELLO"));
        assert!(!scanner.covers("hello1 world1"));
        assert!(!scanner.covers("hell"));
        assert!(!scanner.covers(""));

        let methods = PatternScanner::TokenSet(vec!["get".into(), "head".into()]);
        assert!(methods.covers("GET"));
        assert!(!methods.covers("GETX"));
    }

    #[test]
    fn unknown_and_delegated_operator_names() {
        assert!(matches!(
            Operator::new("noSuchOp", "", false, None),
            Err(OperatorError::Unknown(_))
        ));
        assert!(matches!(
            Operator::new("rbl", "sbl.example.org", false, None),
            Err(OperatorError::Unsupported(_))
        ));
    }

    #[test]
    fn invalid_regex_is_a_load_failure() {
        assert!(matches!(
            Operator::new("rx", "(unclosed", false, None),
            Err(OperatorError::BadRegex { .. })
        ));
    }

    #[test]
    fn url_encoding_validation() {
        assert!(!has_invalid_url_encoding("a%41b"));
        assert!(has_invalid_url_encoding("a%4"));
        assert!(has_invalid_url_encoding("a%zz"));
    }

    #[test]
    fn heuristic_detectors() {
        assert!(looks_like_sqli("1' or 1=1 --"));
        assert!(looks_like_sqli("x union select password from users"));
        assert!(!looks_like_sqli("ordinary text"));
        assert!(looks_like_xss("<script>alert(1)</script>"));
        assert!(looks_like_xss("<img src=x onerror=alert(1)>"));
        assert!(!looks_like_xss("plain words"));
    }
}
