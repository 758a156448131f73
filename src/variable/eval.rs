//! Variable evaluation against a transaction.
//!
//! Evaluation never fails: a variable that cannot be produced (missing
//! header, body not buffered, no current rule) yields an empty result list,
//! which makes downstream operators not match. This is the engine's
//! soft-error contract.
//!
//! The shape of the dispatch mirrors the split the addressing modes impose:
//! collection kinds produce a keyed item sequence that the mode then counts,
//! filters, or selects from; scalar kinds produce a single value.

use super::{AccessMode, VarExpr, VarKind};
use crate::transaction::Transaction;
use crate::{EvaluateResults, ResultElement, SharedStr, Value};

use chrono::{Datelike, Local, Timelike};

impl VarExpr {
    /// Evaluate this expression, appending results to `out`.
    pub fn evaluate(&self, tx: &Transaction<'_>, out: &mut EvaluateResults) {
        if self.kind.is_collection() {
            self.evaluate_collection(tx, out);
        } else {
            self.evaluate_scalar(tx, out);
        }
    }

    fn evaluate_collection(&self, tx: &Transaction<'_>, out: &mut EvaluateResults) {
        let items = collection_items(self.kind, tx);

        match self.mode {
            AccessMode::CounterCollection => out.append_value(items.len() as i64),
            AccessMode::CounterSpecific => {
                let sub = self.sub_name.as_deref().unwrap_or("");
                let count =
                    items.iter().filter(|(name, _)| name_matches(name.as_deref(), sub)).count();
                out.append_value(count as i64);
            }
            AccessMode::ValueCollection => {
                for (name, value) in items {
                    out.append(ResultElement::new(value, name));
                }
            }
            AccessMode::ValueRegex => {
                let Some(selector) = &self.selector else { return };
                for (name, value) in items {
                    let matches = name.as_deref().is_some_and(|n| selector.is_match(n));
                    if matches {
                        out.append(ResultElement::new(value, name));
                    }
                }
            }
            AccessMode::ValueSpecific => {
                let sub = self.sub_name.as_deref().unwrap_or("");
                if let Some((name, value)) =
                    items.into_iter().find(|(name, _)| name_matches(name.as_deref(), sub))
                {
                    out.append(ResultElement::new(value, name));
                }
            }
        }
    }

    fn evaluate_scalar(&self, tx: &Transaction<'_>, out: &mut EvaluateResults) {
        let value = scalar_value(self.kind, self.sub_name.as_deref(), tx);

        match self.mode {
            AccessMode::CounterCollection | AccessMode::CounterSpecific => {
                out.append_value(if value.is_empty() { 0i64 } else { 1i64 });
            }
            _ => {
                if !value.is_empty() {
                    out.append(ResultElement::new(value, None));
                }
            }
        }
    }
}

fn name_matches(name: Option<&str>, wanted: &str) -> bool {
    name.is_some_and(|n| n.eq_ignore_ascii_case(wanted))
}

/// Keyed items of a collection kind, in declared/received order.
fn collection_items(kind: VarKind, tx: &Transaction<'_>) -> Vec<(Option<SharedStr>, Value)> {
    let pairs = |entries: &[(SharedStr, SharedStr)]| -> Vec<(Option<SharedStr>, Value)> {
        entries.iter().map(|(k, v)| (Some(k.clone()), Value::Str(v.clone()))).collect()
    };
    // A names collection carries the key as both sub-name and value.
    let names = |entries: &[(SharedStr, SharedStr)]| -> Vec<(Option<SharedStr>, Value)> {
        entries.iter().map(|(k, _)| (Some(k.clone()), Value::Str(k.clone()))).collect()
    };

    let req = tx.request();
    let resp = tx.response();

    match kind {
        VarKind::Args => {
            let mut items = pairs(&req.args_get);
            items.extend(pairs(&req.args_post));
            items
        }
        VarKind::ArgsGet => pairs(&req.args_get),
        VarKind::ArgsPost => pairs(&req.args_post),
        VarKind::ArgsNames => {
            let mut items = names(&req.args_get);
            items.extend(names(&req.args_post));
            items
        }
        VarKind::ArgsGetNames => names(&req.args_get),
        VarKind::ArgsPostNames => names(&req.args_post),
        VarKind::RequestHeaders => pairs(&req.headers),
        VarKind::RequestHeadersNames => names(&req.headers),
        VarKind::RequestCookies => pairs(&req.cookies),
        VarKind::RequestCookiesNames => names(&req.cookies),
        VarKind::ResponseHeaders => pairs(&resp.headers),
        VarKind::ResponseHeadersNames => names(&resp.headers),
        VarKind::Tx => tx
            .tx_entries()
            .map(|(name, value)| (Some(SharedStr::from(name)), value.clone()))
            .collect(),
        VarKind::Env => tx
            .env_entries()
            .map(|(name, value)| (Some(SharedStr::from(name)), value.clone()))
            .collect(),
        VarKind::MatchedVars => tx
            .matched_log()
            .iter()
            .map(|m| (Some(SharedStr::from(m.full_name())), m.transformed.clone()))
            .collect(),
        VarKind::MatchedVarsNames => tx
            .matched_log()
            .iter()
            .map(|m| {
                let name = SharedStr::from(m.full_name());
                (Some(name.clone()), Value::Str(name))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Single value of a scalar kind; `Empty` when it cannot be produced.
fn scalar_value(kind: VarKind, sub: Option<&str>, tx: &Transaction<'_>) -> Value {
    let req = tx.request();
    let resp = tx.response();
    let now = Local::now();

    let opt_str = |s: &Option<SharedStr>| -> Value {
        match s {
            Some(s) => Value::Str(s.clone()),
            None => Value::Empty,
        }
    };

    match kind {
        VarKind::ArgsCombinedSize => {
            let total: usize = req
                .args_get
                .iter()
                .chain(req.args_post.iter())
                .map(|(k, v)| k.len() + v.len())
                .sum();
            Value::Int(total as i64)
        }
        VarKind::QueryString => opt_str(&req.query_string),
        VarKind::RequestUri => opt_str(&req.uri),
        VarKind::RequestUriRaw => opt_str(&req.uri_raw),
        VarKind::RequestBasename => opt_str(&req.basename),
        VarKind::RequestFilename => opt_str(&req.path),
        VarKind::PathInfo => opt_str(&req.path_info),
        VarKind::RequestMethod => opt_str(&req.method),
        VarKind::RequestProtocol => opt_str(&req.protocol),
        VarKind::RequestLine => opt_str(&req.request_line),
        VarKind::RequestBody => req.body_joined(),
        VarKind::RequestBodyLength => Value::Int(req.body_len() as i64),
        VarKind::FullRequest => req.full_request(),
        VarKind::FullRequestLength => match req.full_request() {
            Value::Str(s) => Value::Int(s.len() as i64),
            _ => Value::Int(0),
        },
        VarKind::RemoteAddr => opt_str(&req.client_addr),
        VarKind::RemoteHost => opt_str(&req.client_host),
        VarKind::RemotePort => req.client_port.map(|p| Value::Int(p as i64)).unwrap_or_default(),
        VarKind::RemoteUser => opt_str(&req.remote_user),
        VarKind::ServerAddr => opt_str(&req.server_addr),
        VarKind::ServerName => opt_str(&req.server_name),
        VarKind::ServerPort => req.server_port.map(|p| Value::Int(p as i64)).unwrap_or_default(),
        VarKind::ResponseBody => resp.body_joined(),
        VarKind::ResponseStatus => resp.status.map(|s| Value::Int(s as i64)).unwrap_or_default(),
        VarKind::ResponseProtocol => opt_str(&resp.protocol),
        VarKind::ResponseContentLength => Value::Int(resp.body_len() as i64),
        VarKind::ResponseContentType => resp
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| Value::Str(v.clone()))
            .unwrap_or_default(),
        VarKind::StatusLine => opt_str(&resp.status_line),
        VarKind::MatchedVar => {
            tx.matched_log().last().map(|m| m.transformed.clone()).unwrap_or_default()
        }
        VarKind::MatchedVarName => tx
            .matched_log()
            .last()
            .map(|m| Value::Str(m.full_name().into()))
            .unwrap_or_default(),
        VarKind::RuleInfo => {
            let Some(rule) = tx.current_rule() else { return Value::Empty };
            match sub.map(|s| s.to_ascii_lowercase()).as_deref() {
                Some("id") => Value::Int(rule.id as i64),
                Some("phase") => Value::Int(rule.phase.number()),
                Some("severity") => {
                    rule.severity.map(|s| Value::Int(s as i64)).unwrap_or_default()
                }
                _ => Value::Empty,
            }
        }
        VarKind::Duration => Value::Int(tx.elapsed_millis()),
        VarKind::HighestSeverity => {
            tx.highest_severity().map(|s| Value::Int(s as i64)).unwrap_or(Value::Int(255))
        }
        VarKind::UniqueId => Value::Str(tx.unique_id().clone()),
        VarKind::Time => Value::Str(now.format("%H:%M:%S").to_string().into()),
        VarKind::TimeDay => Value::Int(now.day() as i64),
        VarKind::TimeEpoch => Value::Int(now.timestamp()),
        VarKind::TimeHour => Value::Int(now.hour() as i64),
        VarKind::TimeMin => Value::Int(now.minute() as i64),
        VarKind::TimeMon => Value::Int(now.month() as i64),
        VarKind::TimeSec => Value::Int(now.second() as i64),
        VarKind::TimeWday => Value::Int(now.weekday().num_days_from_sunday() as i64),
        VarKind::TimeYear => Value::Int(now.year() as i64),
        // Collection kinds are handled by `evaluate_collection`.
        _ => Value::Empty,
    }
}
