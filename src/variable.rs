//! Variable expressions.
//!
//! A variable expression is the triple `(kind, sub-name, addressing mode)`
//! written on the left side of a `SecRule`. The five addressing modes are:
//!
//! ```text
//! &VAR        CC  count over a collection            -> one Int
//! &VAR:name   CS  count over a specific subkey       -> one Int
//! VAR         VC  whole collection                   -> N elements
//! VAR:/re/    VR  regex-selected subset (sub-names)  -> 0..N elements
//! VAR:name    VS  single subkey / scalar variable    -> 0..1 elements
//! ```
//!
//! Parsing lives here ([`VarExpr::parse`]); evaluation against a transaction
//! lives in `variable/eval.rs`. The kind dispatch is a plain `match`, which
//! the compiler lowers to a jump table.

#[path = "variable/eval.rs"]
mod eval;

use crate::SharedStr;

use regex::Regex;

/// Addressing mode of a variable expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    CounterCollection,
    CounterSpecific,
    ValueCollection,
    ValueRegex,
    ValueSpecific,
}

/// Every variable kind the engine can evaluate.
///
/// Kinds that require a body-processor adapter (multipart, XML, file uploads)
/// or the persistent-collection storage component are not listed; the parser
/// rejects them by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    Args,
    ArgsGet,
    ArgsPost,
    ArgsNames,
    ArgsGetNames,
    ArgsPostNames,
    ArgsCombinedSize,
    QueryString,
    RequestUri,
    RequestUriRaw,
    RequestBasename,
    RequestFilename,
    PathInfo,
    RequestMethod,
    RequestProtocol,
    RequestLine,
    RequestHeaders,
    RequestHeadersNames,
    RequestCookies,
    RequestCookiesNames,
    RequestBody,
    RequestBodyLength,
    FullRequest,
    FullRequestLength,
    RemoteAddr,
    RemoteHost,
    RemotePort,
    RemoteUser,
    ServerAddr,
    ServerName,
    ServerPort,
    ResponseBody,
    ResponseStatus,
    ResponseProtocol,
    ResponseHeaders,
    ResponseHeadersNames,
    ResponseContentLength,
    ResponseContentType,
    StatusLine,
    Tx,
    Env,
    MatchedVar,
    MatchedVarName,
    MatchedVars,
    MatchedVarsNames,
    RuleInfo,
    Duration,
    HighestSeverity,
    UniqueId,
    Time,
    TimeDay,
    TimeEpoch,
    TimeHour,
    TimeMin,
    TimeMon,
    TimeSec,
    TimeWday,
    TimeYear,
}

/// SecLang name <-> kind table. Order matters nowhere; lookups are exact.
const KIND_NAMES: &[(&str, VarKind)] = &[
    ("ARGS", VarKind::Args),
    ("ARGS_GET", VarKind::ArgsGet),
    ("ARGS_POST", VarKind::ArgsPost),
    ("ARGS_NAMES", VarKind::ArgsNames),
    ("ARGS_GET_NAMES", VarKind::ArgsGetNames),
    ("ARGS_POST_NAMES", VarKind::ArgsPostNames),
    ("ARGS_COMBINED_SIZE", VarKind::ArgsCombinedSize),
    ("QUERY_STRING", VarKind::QueryString),
    ("REQUEST_URI", VarKind::RequestUri),
    ("REQUEST_URI_RAW", VarKind::RequestUriRaw),
    ("REQUEST_BASENAME", VarKind::RequestBasename),
    ("REQUEST_FILENAME", VarKind::RequestFilename),
    ("PATH_INFO", VarKind::PathInfo),
    ("REQUEST_METHOD", VarKind::RequestMethod),
    ("REQUEST_PROTOCOL", VarKind::RequestProtocol),
    ("REQUEST_LINE", VarKind::RequestLine),
    ("REQUEST_HEADERS", VarKind::RequestHeaders),
    ("REQUEST_HEADERS_NAMES", VarKind::RequestHeadersNames),
    ("REQUEST_COOKIES", VarKind::RequestCookies),
    ("REQUEST_COOKIES_NAMES", VarKind::RequestCookiesNames),
    ("REQUEST_BODY", VarKind::RequestBody),
    ("REQUEST_BODY_LENGTH", VarKind::RequestBodyLength),
    ("FULL_REQUEST", VarKind::FullRequest),
    ("FULL_REQUEST_LENGTH", VarKind::FullRequestLength),
    ("REMOTE_ADDR", VarKind::RemoteAddr),
    ("REMOTE_HOST", VarKind::RemoteHost),
    ("REMOTE_PORT", VarKind::RemotePort),
    ("REMOTE_USER", VarKind::RemoteUser),
    ("SERVER_ADDR", VarKind::ServerAddr),
    ("SERVER_NAME", VarKind::ServerName),
    ("SERVER_PORT", VarKind::ServerPort),
    ("RESPONSE_BODY", VarKind::ResponseBody),
    ("RESPONSE_STATUS", VarKind::ResponseStatus),
    ("RESPONSE_PROTOCOL", VarKind::ResponseProtocol),
    ("RESPONSE_HEADERS", VarKind::ResponseHeaders),
    ("RESPONSE_HEADERS_NAMES", VarKind::ResponseHeadersNames),
    ("RESPONSE_CONTENT_LENGTH", VarKind::ResponseContentLength),
    ("RESPONSE_CONTENT_TYPE", VarKind::ResponseContentType),
    ("STATUS_LINE", VarKind::StatusLine),
    ("TX", VarKind::Tx),
    ("ENV", VarKind::Env),
    ("MATCHED_VAR", VarKind::MatchedVar),
    ("MATCHED_VAR_NAME", VarKind::MatchedVarName),
    ("MATCHED_VARS", VarKind::MatchedVars),
    ("MATCHED_VARS_NAMES", VarKind::MatchedVarsNames),
    ("RULE", VarKind::RuleInfo),
    ("DURATION", VarKind::Duration),
    ("HIGHEST_SEVERITY", VarKind::HighestSeverity),
    ("UNIQUE_ID", VarKind::UniqueId),
    ("TIME", VarKind::Time),
    ("TIME_DAY", VarKind::TimeDay),
    ("TIME_EPOCH", VarKind::TimeEpoch),
    ("TIME_HOUR", VarKind::TimeHour),
    ("TIME_MIN", VarKind::TimeMin),
    ("TIME_MON", VarKind::TimeMon),
    ("TIME_SEC", VarKind::TimeSec),
    ("TIME_WDAY", VarKind::TimeWday),
    ("TIME_YEAR", VarKind::TimeYear),
];

/// Variable kinds the original language defines but this engine delegates to
/// external components (body processors, persistent storage, geo backends).
const UNSUPPORTED_PREFIXES: &[&str] = &[
    "MULTIPART_", "FILES", "XML", "GEO", "GLOBAL", "IP", "SESSION", "USER", "RESOURCE", "WEBAPPID",
];

impl VarKind {
    pub fn from_name(name: &str) -> Option<VarKind> {
        let upper = name.to_ascii_uppercase();
        KIND_NAMES.iter().find(|(n, _)| *n == upper).map(|(_, k)| *k)
    }

    pub fn name(self) -> &'static str {
        KIND_NAMES.iter().find(|(_, k)| *k == self).map(|(n, _)| *n).unwrap_or("UNKNOWN")
    }

    /// True for kinds whose VC mode yields a keyed sequence.
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            VarKind::Args
                | VarKind::ArgsGet
                | VarKind::ArgsPost
                | VarKind::ArgsNames
                | VarKind::ArgsGetNames
                | VarKind::ArgsPostNames
                | VarKind::RequestHeaders
                | VarKind::RequestHeadersNames
                | VarKind::RequestCookies
                | VarKind::RequestCookiesNames
                | VarKind::ResponseHeaders
                | VarKind::ResponseHeadersNames
                | VarKind::Tx
                | VarKind::Env
                | VarKind::MatchedVars
                | VarKind::MatchedVarsNames
        )
    }

    /// True when a known-but-delegated variable name is being referenced.
    pub fn is_unsupported_name(name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        UNSUPPORTED_PREFIXES.iter().any(|p| upper == p.trim_end_matches('_') || upper.starts_with(p))
    }
}

/// A parsed variable expression.
#[derive(Debug, Clone)]
pub struct VarExpr {
    pub kind: VarKind,
    pub sub_name: Option<SharedStr>,
    pub mode: AccessMode,
    /// Compiled selector for VR mode.
    pub selector: Option<Regex>,
    /// `TX:0`..`TX:9` capture slot, when the sub-name is a single digit.
    pub capture_index: Option<usize>,
    /// `!VAR[:name]` exclusion: not loaded itself, filters sibling loads.
    pub exclude: bool,
}

/// Failures turning a textual variable specification into a [`VarExpr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarParseError {
    Unknown(String),
    Unsupported(String),
    BadSelector(String),
}

impl std::fmt::Display for VarParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarParseError::Unknown(name) => write!(f, "unknown variable {name}"),
            VarParseError::Unsupported(name) => {
                write!(f, "variable {name} requires an external component")
            }
            VarParseError::BadSelector(err) => write!(f, "bad variable selector regex: {err}"),
        }
    }
}

impl std::error::Error for VarParseError {}

impl VarExpr {
    /// Parse one entry of a `SecRule` variable list, e.g. `&ARGS`,
    /// `REQUEST_HEADERS:User-Agent`, `ARGS:/^id_/`, `!ARGS:passwd`.
    pub fn parse(spec: &str) -> Result<VarExpr, VarParseError> {
        let spec = spec.trim();
        let (spec, exclude) = match spec.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (spec, false),
        };
        let (spec, counter) = match spec.strip_prefix('&') {
            Some(rest) => (rest, true),
            None => (spec, false),
        };

        let (name, sub) = match spec.split_once(':') {
            Some((name, sub)) => (name, Some(sub)),
            None => (spec, None),
        };

        let kind = VarKind::from_name(name).ok_or_else(|| {
            if VarKind::is_unsupported_name(name) {
                VarParseError::Unsupported(name.to_string())
            } else {
                VarParseError::Unknown(name.to_string())
            }
        })?;

        Self::build(kind, sub, counter, exclude)
    }

    /// Parse a macro variable reference, e.g. `tx.foo`, `TX.1`,
    /// `MATCHED_VAR`, `remote_addr`. Macros use `.` where rules use `:`.
    pub fn parse_macro_ref(spec: &str) -> Result<VarExpr, VarParseError> {
        let spec = spec.trim();
        let (name, sub) = match spec.split_once(['.', ':']) {
            Some((name, sub)) => (name, Some(sub)),
            None => (spec, None),
        };

        let kind = VarKind::from_name(name).ok_or_else(|| {
            if VarKind::is_unsupported_name(name) {
                VarParseError::Unsupported(name.to_string())
            } else {
                VarParseError::Unknown(name.to_string())
            }
        })?;

        Self::build(kind, sub, false, false)
    }

    fn build(
        kind: VarKind,
        sub: Option<&str>,
        counter: bool,
        exclude: bool,
    ) -> Result<VarExpr, VarParseError> {
        let mut selector = None;
        let mut capture_index = None;

        let sub_name: Option<SharedStr> = match sub {
            Some(s) if !s.is_empty() => {
                if let Some(pattern) = s.strip_prefix('/').and_then(|s| s.strip_suffix('/')) {
                    selector = Some(
                        Regex::new(pattern)
                            .map_err(|e| VarParseError::BadSelector(e.to_string()))?,
                    );
                    Some(s.into())
                } else {
                    if kind == VarKind::Tx && s.len() == 1 {
                        capture_index = s.chars().next().unwrap().to_digit(10).map(|d| d as usize);
                    }
                    Some(s.into())
                }
            }
            _ => None,
        };

        let mode = if counter {
            if sub_name.is_some() {
                AccessMode::CounterSpecific
            } else {
                AccessMode::CounterCollection
            }
        } else if selector.is_some() {
            AccessMode::ValueRegex
        } else if sub_name.is_some() || !kind.is_collection() {
            AccessMode::ValueSpecific
        } else {
            AccessMode::ValueCollection
        };

        Ok(VarExpr { kind, sub_name, mode, selector, capture_index, exclude })
    }

    /// Fully-qualified name as logged, e.g. `ARGS_GET:foo` or `REQUEST_URI`.
    pub fn full_name(&self) -> String {
        match &self.sub_name {
            Some(sub) => format!("{}:{}", self.kind.name(), sub),
            None => self.kind.name().to_string(),
        }
    }

    /// True when this expression reads the MATCHED_VAR family. The compiler
    /// uses this for its `needs-matched-push` reachability pass.
    pub fn reads_matched(&self) -> bool {
        matches!(
            self.kind,
            VarKind::MatchedVar
                | VarKind::MatchedVarName
                | VarKind::MatchedVars
                | VarKind::MatchedVarsNames
        )
    }

    /// True when `other` names the same target, used for target removal.
    pub fn same_target(&self, kind: VarKind, sub_name: Option<&str>) -> bool {
        self.kind == kind
            && match (&self.sub_name, sub_name) {
                (None, None) => true,
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => false,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_covers_all_addressing_modes() {
        let cases: Vec<(&str, VarKind, AccessMode)> = vec![
            ("&ARGS", VarKind::Args, AccessMode::CounterCollection),
            ("&ARGS:foo", VarKind::Args, AccessMode::CounterSpecific),
            ("ARGS", VarKind::Args, AccessMode::ValueCollection),
            ("ARGS:/^id_/", VarKind::Args, AccessMode::ValueRegex),
            ("ARGS:foo", VarKind::Args, AccessMode::ValueSpecific),
            ("REQUEST_URI", VarKind::RequestUri, AccessMode::ValueSpecific),
            ("&REQUEST_URI", VarKind::RequestUri, AccessMode::CounterCollection),
        ];
        for (spec, kind, mode) in cases {
            let var = VarExpr::parse(spec).unwrap();
            assert_eq!(var.kind, kind, "{spec}");
            assert_eq!(var.mode, mode, "{spec}");
        }
    }

    #[test]
    fn parse_exclusion_and_case_insensitivity() {
        let var = VarExpr::parse("!args:passwd").unwrap();
        assert!(var.exclude);
        assert_eq!(var.kind, VarKind::Args);
        assert_eq!(var.sub_name.as_deref(), Some("passwd"));
    }

    #[test]
    fn parse_rejects_unknown_and_delegated_names() {
        assert!(matches!(VarExpr::parse("NO_SUCH_VAR"), Err(VarParseError::Unknown(_))));
        assert!(matches!(VarExpr::parse("XML:/*"), Err(VarParseError::Unsupported(_))));
        assert!(matches!(VarExpr::parse("MULTIPART_NAME"), Err(VarParseError::Unsupported(_))));
    }

    #[test]
    fn macro_refs_use_dotted_form() {
        let var = VarExpr::parse_macro_ref("tx.block_score").unwrap();
        assert_eq!(var.kind, VarKind::Tx);
        assert_eq!(var.sub_name.as_deref(), Some("block_score"));
        assert_eq!(var.mode, AccessMode::ValueSpecific);

        let capture = VarExpr::parse_macro_ref("TX.1").unwrap();
        assert_eq!(capture.capture_index, Some(1));

        let scalar = VarExpr::parse_macro_ref("MATCHED_VAR").unwrap();
        assert!(scalar.reads_matched());
    }

    #[test]
    fn full_names_round_trip() {
        assert_eq!(VarExpr::parse("ARGS_GET:foo").unwrap().full_name(), "ARGS_GET:foo");
        assert_eq!(VarExpr::parse("REQUEST_URI").unwrap().full_name(), "REQUEST_URI");
    }
}
