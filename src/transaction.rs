//! Per-request transaction context.
//!
//! A [`Transaction`] owns everything mutable about one HTTP request while the
//! compiled programs stay shared and immutable: the request/response views,
//! the TX and ENV collections, the capture ring, the matched-variables log,
//! the transformation cache and trail buffer, and the removal sets written by
//! `ctl:*` actions.
//!
//! The host drives it phase by phase:
//!
//! ```text
//! process_connection ─ process_uri ─ process_request_headers (phase 1)
//!        │                                   │
//!        v                                   v
//! process_request_body (2) ─ process_response_headers (3)
//!        │                                   │
//!        v                                   v
//! process_response_body (4) ──────── process_logging (5)
//! ```
//!
//! Each phase method returns the [`Disposition`] decided so far; once a
//! disruptive disposition is recorded, later phase methods short-circuit.

#[path = "transaction/cache.rs"]
pub(crate) mod cache;

use crate::bytecode::vm::VirtualMachine;
use crate::engine::{Engine, RuleEngineMode};
use crate::rule::Rule;
use crate::transform::TransformKind;
use crate::variable::{VarExpr, VarKind};
use crate::{AllowScope, Disposition, Phase, Severity, SharedStr, Value};

use cache::TransformCache;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

/// Host callback invoked once per matched-and-logging rule.
pub type MatchCallback<'cb> = &'cb mut dyn FnMut(&Rule);

/// Host-provided extra predicate consulted after an operator match.
pub type AdditionalCondition = Box<dyn Fn(&Rule, &str, &VarExpr) -> bool>;

/// One entry of the matched-variables log: the substrate of the
/// `MATCHED_VAR` family and of per-rule logging.
#[derive(Debug, Clone)]
pub struct MatchedVariable {
    pub kind: VarKind,
    pub sub_name: Option<SharedStr>,
    pub chain_index: u32,
    pub original: Value,
    pub transformed: Value,
    pub operator_result: Value,
    pub transform_trail: Vec<TransformKind>,
}

impl MatchedVariable {
    /// Qualified name as logged, e.g. `ARGS_GET:foo`.
    pub fn full_name(&self) -> String {
        match &self.sub_name {
            Some(sub) => format!("{}:{}", self.kind.name(), sub),
            None => self.kind.name().to_string(),
        }
    }
}

/// The rule the VM is currently evaluating, addressed as starter + chain
/// index so chained continuations resolve through the starter.
#[derive(Debug, Clone)]
pub(crate) struct CurrentRule {
    pub starter: Arc<Rule>,
    pub chain_index: u32,
}

impl CurrentRule {
    pub fn rule(&self) -> &Rule {
        self.starter.chain_at(self.chain_index).unwrap_or(&self.starter)
    }
}

// --- Request / response views ------------------------------------------------

/// Host-supplied request data, populated by the phase methods.
#[derive(Debug, Default)]
pub struct RequestView {
    pub client_addr: Option<SharedStr>,
    pub client_host: Option<SharedStr>,
    pub client_port: Option<u16>,
    pub server_addr: Option<SharedStr>,
    pub server_name: Option<SharedStr>,
    pub server_port: Option<u16>,
    pub remote_user: Option<SharedStr>,
    pub method: Option<SharedStr>,
    pub protocol: Option<SharedStr>,
    pub uri: Option<SharedStr>,
    pub uri_raw: Option<SharedStr>,
    pub path: Option<SharedStr>,
    pub basename: Option<SharedStr>,
    pub path_info: Option<SharedStr>,
    pub query_string: Option<SharedStr>,
    pub request_line: Option<SharedStr>,
    pub args_get: Vec<(SharedStr, SharedStr)>,
    pub args_post: Vec<(SharedStr, SharedStr)>,
    pub headers: Vec<(SharedStr, SharedStr)>,
    pub cookies: Vec<(SharedStr, SharedStr)>,
    pub body: Vec<SharedStr>,
}

impl RequestView {
    pub fn body_len(&self) -> usize {
        self.body.iter().map(|chunk| chunk.len()).sum()
    }

    pub fn body_joined(&self) -> Value {
        match self.body.as_slice() {
            [] => Value::Empty,
            [one] => Value::Str(one.clone()),
            many => Value::Str(many.concat().into()),
        }
    }

    pub fn full_request(&self) -> Value {
        let line = match &self.request_line {
            Some(line) => line.as_str(),
            None => return Value::Empty,
        };
        let mut full = String::with_capacity(line.len() + 64);
        full.push_str(line);
        full.push_str("\r\n");
        for (key, value) in &self.headers {
            full.push_str(key);
            full.push_str(": ");
            full.push_str(value);
            full.push_str("\r\n");
        }
        full.push_str("\r\n");
        if let Value::Str(body) = self.body_joined() {
            full.push_str(&body);
        }
        Value::Str(full.into())
    }
}

/// Host-supplied response data.
#[derive(Debug, Default)]
pub struct ResponseView {
    pub status: Option<u16>,
    pub protocol: Option<SharedStr>,
    pub status_line: Option<SharedStr>,
    pub headers: Vec<(SharedStr, SharedStr)>,
    pub body: Vec<SharedStr>,
}

impl ResponseView {
    pub fn body_len(&self) -> usize {
        self.body.iter().map(|chunk| chunk.len()).sum()
    }

    pub fn body_joined(&self) -> Value {
        match self.body.as_slice() {
            [] => Value::Empty,
            [one] => Value::Str(one.clone()),
            many => Value::Str(many.concat().into()),
        }
    }
}

// --- Transaction -------------------------------------------------------------

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

pub struct Transaction<'e> {
    engine: &'e Engine,

    request: RequestView,
    response: ResponseView,

    tx_vars: BTreeMap<String, Value>,
    env_vars: BTreeMap<String, Value>,

    staged_captures: Vec<(usize, SharedStr)>,
    matched_log: Vec<MatchedVariable>,
    transform_trails: Vec<Vec<TransformKind>>,
    cache: TransformCache,

    current: Option<CurrentRule>,
    current_var: Option<Arc<VarExpr>>,

    removed_rules: HashSet<u64>,
    removed_targets: HashMap<u64, Vec<(VarKind, Option<SharedStr>)>>,

    phase: Option<Phase>,
    disposition: Disposition,
    allow_scope: Option<AllowScope>,

    rule_engine_override: Option<RuleEngineMode>,
    request_body_access_override: Option<bool>,
    request_body_processor: Option<SharedStr>,

    session_id: Option<SharedStr>,
    user_id: Option<SharedStr>,
    resource_id: Option<SharedStr>,

    msg_expanded: SharedStr,
    log_data_expanded: SharedStr,
    highest_severity: Option<Severity>,
    additional_condition: Option<AdditionalCondition>,

    unique_id: SharedStr,
    created: Instant,
}

impl<'e> Transaction<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Transaction<'e> {
        let serial = NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed);
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Transaction {
            engine,
            request: RequestView::default(),
            response: ResponseView::default(),
            tx_vars: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            staged_captures: Vec::new(),
            matched_log: Vec::new(),
            transform_trails: Vec::new(),
            cache: TransformCache::default(),
            current: None,
            current_var: None,
            removed_rules: HashSet::new(),
            removed_targets: HashMap::new(),
            phase: None,
            disposition: Disposition::Pass,
            allow_scope: None,
            rule_engine_override: None,
            request_body_access_override: None,
            request_body_processor: None,
            session_id: None,
            user_id: None,
            resource_id: None,
            msg_expanded: SharedStr::empty(),
            log_data_expanded: SharedStr::empty(),
            highest_severity: None,
            additional_condition: None,
            unique_id: format!("{stamp:x}.{serial:x}").into(),
            created: Instant::now(),
        }
    }

    // --- Phase methods (host API) -------------------------------------------

    /// Record the connection 4-tuple. No rules run here.
    pub fn process_connection(
        &mut self,
        client_addr: &str,
        client_port: u16,
        server_addr: &str,
        server_port: u16,
    ) {
        self.request.client_addr = Some(client_addr.into());
        self.request.client_host = Some(client_addr.into());
        self.request.client_port = Some(client_port);
        self.request.server_addr = Some(server_addr.into());
        self.request.server_name = Some(server_addr.into());
        self.request.server_port = Some(server_port);
    }

    /// Record the request line and split the query string into GET args.
    pub fn process_uri(&mut self, uri: &str, method: &str, version: &str) {
        self.request.method = Some(method.into());
        self.request.protocol = Some(version.into());
        self.request.uri_raw = Some(uri.into());
        self.request.request_line = Some(format!("{method} {uri} {version}").into());

        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };
        // REQUEST_URI keeps the query string; REQUEST_FILENAME drops it.
        self.request.uri = Some(url_decoded(uri).into());
        self.request.path = Some(url_decoded(path).into());
        self.request.basename =
            Some(url_decoded(path.rsplit('/').next().unwrap_or(path)).into());
        self.request.query_string = Some(query.unwrap_or("").into());

        let separator = self.engine.config().argument_separator;
        if let Some(query) = query {
            self.request.args_get = parse_form_args(query, separator);
        }
    }

    /// Run phase 1 over the supplied header pairs.
    pub fn process_request_headers(
        &mut self,
        headers: &[(&str, &str)],
        mut on_match: impl FnMut(&Rule),
    ) -> Disposition {
        self.request.headers =
            headers.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect();
        self.request.cookies = parse_cookies(headers);
        self.run_phase(Phase::RequestHeaders, &mut on_match)
    }

    /// Run phase 2 over the buffered request body.
    pub fn process_request_body(
        &mut self,
        body: &[&str],
        mut on_match: impl FnMut(&Rule),
    ) -> Disposition {
        if self.request_body_access() {
            let limit = self.engine.config().request_body_limit;
            self.request.body = clamp_chunks(body, limit);

            let is_form = self.request.headers.iter().any(|(k, v)| {
                k.eq_ignore_ascii_case("content-type")
                    && v.to_ascii_lowercase().contains("application/x-www-form-urlencoded")
            });
            if is_form {
                if let Value::Str(joined) = self.request.body_joined() {
                    let separator = self.engine.config().argument_separator;
                    self.request.args_post = parse_form_args(&joined, separator);
                }
            }
        }
        self.run_phase(Phase::RequestBody, &mut on_match)
    }

    /// Run phase 3 over the response status line and headers.
    pub fn process_response_headers(
        &mut self,
        status: u16,
        protocol: &str,
        headers: &[(&str, &str)],
        mut on_match: impl FnMut(&Rule),
    ) -> Disposition {
        self.response.status = Some(status);
        self.response.protocol = Some(protocol.into());
        self.response.status_line = Some(format!("{protocol} {status}").into());
        self.response.headers =
            headers.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect();
        self.run_phase(Phase::ResponseHeaders, &mut on_match)
    }

    /// Run phase 4 over the buffered response body.
    pub fn process_response_body(
        &mut self,
        body: &[&str],
        mut on_match: impl FnMut(&Rule),
    ) -> Disposition {
        if self.response_body_inspectable() {
            let limit = self.engine.config().response_body_limit;
            self.response.body = clamp_chunks(body, limit);
        }
        self.run_phase(Phase::ResponseBody, &mut on_match)
    }

    /// Run phase 5. Always runs, regardless of earlier dispositions.
    pub fn process_logging(&mut self, mut on_match: impl FnMut(&Rule)) -> Disposition {
        self.run_phase(Phase::Logging, &mut on_match)
    }

    pub fn set_additional_condition(&mut self, condition: AdditionalCondition) {
        self.additional_condition = Some(condition);
    }

    /// Final disposition decided so far.
    pub fn disposition(&self) -> &Disposition {
        &self.disposition
    }

    /// Read a TX collection value (e.g. in tests and host logging).
    pub fn tx_value(&self, name: &str) -> Option<Value> {
        self.tx_vars.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn msg_expanded(&self) -> &str {
        &self.msg_expanded
    }

    pub fn log_data_expanded(&self) -> &str {
        &self.log_data_expanded
    }

    pub fn matched_log(&self) -> &[MatchedVariable] {
        &self.matched_log
    }

    pub fn unique_id(&self) -> &SharedStr {
        &self.unique_id
    }

    /// The phase most recently driven by the host.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn session_id(&self) -> Option<&SharedStr> {
        self.session_id.as_ref()
    }

    pub fn user_id(&self) -> Option<&SharedStr> {
        self.user_id.as_ref()
    }

    pub fn resource_id(&self) -> Option<&SharedStr> {
        self.resource_id.as_ref()
    }

    /// Body processor requested by `ctl:requestBodyProcessor`, surfaced for
    /// the host's body adapters.
    pub fn request_body_processor(&self) -> Option<&SharedStr> {
        self.request_body_processor.as_ref()
    }

    // --- Phase driver --------------------------------------------------------

    fn run_phase(&mut self, phase: Phase, on_match: MatchCallback<'_>) -> Disposition {
        self.phase = Some(phase);

        if self.disposition.is_disruptive() && phase != Phase::Logging {
            return self.disposition.clone();
        }
        if self.effective_mode() == RuleEngineMode::Off {
            return self.disposition.clone();
        }
        if self.phase_allowed_away(phase) {
            return self.disposition.clone();
        }

        let Some(program) = self.engine.program(phase) else {
            return self.disposition.clone();
        };

        debug!(phase = phase.number(), instructions = program.len(), "running phase program");
        let exit = VirtualMachine::new(self, on_match).execute(program);

        if let Some(disposition) = exit {
            if let Disposition::Allow(scope) = &disposition {
                self.note_allow(*scope);
            }
            self.disposition = disposition;
        }
        self.disposition.clone()
    }

    /// True when a previously granted `allow` skips this phase entirely.
    fn phase_allowed_away(&self, phase: Phase) -> bool {
        match self.allow_scope {
            Some(AllowScope::Transaction) => phase != Phase::Logging,
            Some(AllowScope::Request) => phase.is_request_side(),
            _ => false,
        }
    }

    fn note_allow(&mut self, scope: AllowScope) {
        // A wider scope wins over a narrower one granted earlier.
        let rank = |s: &AllowScope| match s {
            AllowScope::Transaction => 2,
            AllowScope::Request => 1,
            AllowScope::Phase => 0,
        };
        match &self.allow_scope {
            Some(existing) if rank(existing) >= rank(&scope) => {}
            _ => self.allow_scope = Some(scope),
        }
    }

    pub(crate) fn effective_mode(&self) -> RuleEngineMode {
        self.rule_engine_override.unwrap_or(self.engine.config().mode)
    }

    fn request_body_access(&self) -> bool {
        self.request_body_access_override.unwrap_or(self.engine.config().request_body_access)
    }

    fn response_body_inspectable(&self) -> bool {
        if !self.engine.config().response_body_access {
            return false;
        }
        let mime_filter = &self.engine.config().response_body_mime_types;
        if mime_filter.is_empty() {
            return true;
        }
        let content_type = self
            .response
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.to_ascii_lowercase());
        match content_type {
            Some(ct) => mime_filter.iter().any(|m| ct.starts_with(m.as_str())),
            // No content type: inspect, the filter cannot apply.
            None => true,
        }
    }

    // --- State read by variable evaluation ----------------------------------

    pub(crate) fn request(&self) -> &RequestView {
        &self.request
    }

    pub(crate) fn response(&self) -> &ResponseView {
        &self.response
    }

    pub(crate) fn tx_entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.tx_vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn env_entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.env_vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn tx_get(&self, name: &str) -> Option<&Value> {
        self.tx_vars.get(&name.to_ascii_lowercase())
    }

    pub(crate) fn env_get(&self, name: &str) -> Option<Value> {
        match self.env_vars.get(name) {
            Some(value) => Some(value.clone()),
            None => std::env::var(name).ok().map(|v| Value::Str(v.into())),
        }
    }

    pub(crate) fn current_rule(&self) -> Option<&Rule> {
        self.current.as_ref().map(CurrentRule::rule)
    }

    pub(crate) fn current_var(&self) -> Option<&Arc<VarExpr>> {
        self.current_var.as_ref()
    }

    pub(crate) fn elapsed_millis(&self) -> i64 {
        self.created.elapsed().as_millis() as i64
    }

    pub(crate) fn highest_severity(&self) -> Option<Severity> {
        self.highest_severity
    }

    pub(crate) fn additional_condition(&self) -> Option<&AdditionalCondition> {
        self.additional_condition.as_ref()
    }

    // --- State written by actions and the VM --------------------------------

    pub(crate) fn tx_set(&mut self, name: &str, value: Value) {
        self.tx_vars.insert(name.to_ascii_lowercase(), value);
    }

    pub(crate) fn tx_remove(&mut self, name: &str) {
        self.tx_vars.remove(&name.to_ascii_lowercase());
    }

    pub(crate) fn env_set(&mut self, name: &str, value: Value) {
        self.env_vars.insert(name.to_string(), value);
    }

    pub(crate) fn set_session_id(&mut self, id: SharedStr) {
        self.session_id = Some(id);
    }

    pub(crate) fn set_user_id(&mut self, id: SharedStr) {
        self.user_id = Some(id);
    }

    pub(crate) fn set_resource_id(&mut self, id: SharedStr) {
        self.resource_id = Some(id);
    }

    pub(crate) fn set_rule_engine_override(&mut self, mode: RuleEngineMode) {
        self.rule_engine_override = Some(mode);
    }

    pub(crate) fn set_request_body_access(&mut self, enabled: bool) {
        self.request_body_access_override = Some(enabled);
    }

    pub(crate) fn set_request_body_processor(&mut self, name: SharedStr) {
        self.request_body_processor = Some(name);
    }

    pub(crate) fn set_current(&mut self, current: CurrentRule) {
        self.current = Some(current);
    }

    pub(crate) fn set_current_var(&mut self, var: Arc<VarExpr>) {
        self.current_var = Some(var);
    }

    pub(crate) fn set_msg_expanded(&mut self, msg: SharedStr) {
        self.msg_expanded = msg;
    }

    pub(crate) fn set_log_data_expanded(&mut self, log_data: SharedStr) {
        self.log_data_expanded = log_data;
    }

    pub(crate) fn note_rule_matched(&mut self, rule: &Rule) {
        if let Some(severity) = rule.severity {
            let higher = self.highest_severity.map(|s| severity < s).unwrap_or(true);
            if higher {
                self.highest_severity = Some(severity);
            }
        }
    }

    // --- Captures ------------------------------------------------------------

    /// Stage a capture for slot `index`; promoted by [`merge_staged_captures`]
    /// when the operator reports a match on a capturing rule.
    pub(crate) fn stage_capture(&mut self, index: usize, value: SharedStr) {
        if index < 10 {
            self.staged_captures.push((index, value));
        }
    }

    pub(crate) fn clear_staged_captures(&mut self) {
        self.staged_captures.clear();
    }

    /// Promote staged captures into `TX:0..9`. Returns the slot-0 value when
    /// a promotion happened. Without the `capture` flag on the current rule,
    /// staged values are discarded.
    pub(crate) fn merge_staged_captures(&mut self) -> Option<SharedStr> {
        if self.staged_captures.is_empty() {
            return None;
        }
        let captures_enabled = self.current_rule().map(Rule::captures).unwrap_or(false);
        if !captures_enabled {
            self.staged_captures.clear();
            return None;
        }

        let staged = std::mem::take(&mut self.staged_captures);
        let mut slot0 = None;
        for (index, value) in staged {
            if index == 0 {
                slot0 = Some(value.clone());
            }
            self.tx_vars.insert(index.to_string(), Value::Str(value));
        }
        Some(slot0.unwrap_or_else(SharedStr::empty))
    }

    pub(crate) fn clear_capture_ring(&mut self) {
        self.staged_captures.clear();
        for slot in 0..10usize {
            self.tx_vars.remove(&slot.to_string());
        }
    }

    // --- Matched-variables log ----------------------------------------------

    pub(crate) fn clear_matched_log(&mut self) {
        self.matched_log.clear();
    }

    pub(crate) fn push_matched(&mut self, matched: MatchedVariable) {
        self.matched_log.push(matched);
    }

    // --- Transformation trail and cache -------------------------------------

    pub(crate) fn trail_reset(&mut self, len: usize) {
        self.transform_trails.clear();
        self.transform_trails.resize(len, Vec::new());
    }

    pub(crate) fn trail_push(&mut self, index: usize, kind: TransformKind) {
        if let Some(trail) = self.transform_trails.get_mut(index) {
            trail.push(kind);
        }
    }

    pub(crate) fn trail_take(&mut self, index: usize) -> Vec<TransformKind> {
        self.transform_trails.get_mut(index).map(std::mem::take).unwrap_or_default()
    }

    pub(crate) fn transform_cache(&mut self) -> &mut TransformCache {
        &mut self.cache
    }

    // --- Rule removal (ctl) ---------------------------------------------------

    pub(crate) fn remove_rules_in_range(&mut self, lo: u64, hi: u64) {
        for id in self.engine.rule_ids_in_range(lo, hi) {
            self.removed_rules.insert(id);
        }
    }

    pub(crate) fn remove_rules_by_tag(&mut self, tag: &str) {
        for id in self.engine.rule_ids_with_tag(tag) {
            self.removed_rules.insert(id);
        }
    }

    pub(crate) fn remove_rule_targets(
        &mut self,
        id: u64,
        targets: Vec<(VarKind, Option<SharedStr>)>,
    ) {
        self.removed_targets.entry(id).or_default().extend(targets);
    }

    pub(crate) fn remove_rule_targets_by_tag(
        &mut self,
        tag: &str,
        targets: Vec<(VarKind, Option<SharedStr>)>,
    ) {
        for id in self.engine.rule_ids_with_tag(tag) {
            self.removed_targets.entry(id).or_default().extend(targets.iter().cloned());
        }
    }

    pub(crate) fn is_rule_removed(&self, id: u64) -> bool {
        self.removed_rules.contains(&id)
    }

    /// True when `ctl:ruleRemoveTarget*` excluded this (kind, sub-name) for
    /// the given rule earlier in the transaction.
    pub(crate) fn is_target_removed(
        &self,
        rule_id: u64,
        kind: VarKind,
        sub_name: Option<&str>,
    ) -> bool {
        let Some(targets) = self.removed_targets.get(&rule_id) else { return false };
        targets.iter().any(|(t_kind, t_sub)| {
            *t_kind == kind
                && match (t_sub, sub_name) {
                    // A bare target (`ARGS`) removes the whole collection.
                    (None, _) => true,
                    (Some(t), Some(s)) => t.eq_ignore_ascii_case(s),
                    (Some(_), None) => false,
                }
        })
    }

    // --- Disruption ----------------------------------------------------------

    /// Decide the disposition for a matched disruptive rule. `None` means
    /// "keep executing" (pass, no disruptive action, or detection-only mode).
    pub(crate) fn do_disruptive(&mut self, rule: &Rule) -> Option<Disposition> {
        use crate::rule::DisruptiveKind;

        let disruptive = rule.disruptive.as_ref()?;

        if self.effective_mode() == RuleEngineMode::DetectionOnly {
            debug!(rule = rule.id, "detection-only mode suppresses disruptive action");
            return None;
        }

        let status = rule.status.unwrap_or(403);
        match disruptive {
            DisruptiveKind::Pass => None,
            DisruptiveKind::Allow(scope) => Some(Disposition::Allow(*scope)),
            DisruptiveKind::Deny => Some(Disposition::Block { status }),
            DisruptiveKind::Drop => Some(Disposition::Drop),
            DisruptiveKind::Redirect(location) => Some(Disposition::Redirect {
                status: rule.status.unwrap_or(302),
                location: location.clone(),
            }),
            DisruptiveKind::Block => {
                // `block` defers to the phase's default action.
                let default = self.engine.default_action(rule.phase);
                match default.and_then(|d| d.disruptive.as_ref()) {
                    Some(DisruptiveKind::Pass) | None => None,
                    Some(DisruptiveKind::Allow(scope)) => Some(Disposition::Allow(*scope)),
                    Some(DisruptiveKind::Drop) => Some(Disposition::Drop),
                    Some(DisruptiveKind::Redirect(location)) => Some(Disposition::Redirect {
                        status: default.and_then(|d| d.status).unwrap_or(302),
                        location: location.clone(),
                    }),
                    Some(DisruptiveKind::Deny) | Some(DisruptiveKind::Block) => {
                        Some(Disposition::Block {
                            status: default.and_then(|d| d.status).unwrap_or(status),
                        })
                    }
                }
            }
        }
    }
}

// --- Parsing helpers ---------------------------------------------------------

/// Copy body chunks up to the configured size limit, cutting on a character
/// boundary.
fn clamp_chunks(chunks: &[&str], limit: usize) -> Vec<SharedStr> {
    let mut remaining = limit;
    let mut out = Vec::new();
    for chunk in chunks {
        if remaining == 0 {
            break;
        }
        if chunk.len() <= remaining {
            out.push((*chunk).into());
            remaining -= chunk.len();
        } else {
            let mut end = remaining;
            while end > 0 && !chunk.is_char_boundary(end) {
                end -= 1;
            }
            out.push(chunk[..end].into());
            break;
        }
    }
    out
}

fn url_decoded(text: &str) -> String {
    TransformKind::UrlDecode.apply(text).unwrap_or_else(|| text.to_string())
}

fn parse_form_args(query: &str, separator: char) -> Vec<(SharedStr, SharedStr)> {
    query
        .split(separator)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decoded(key).into(), url_decoded(value).into())
        })
        .collect()
}

fn parse_cookies(headers: &[(&str, &str)]) -> Vec<(SharedStr, SharedStr)> {
    let mut cookies = Vec::new();
    for (key, value) in headers {
        if !key.eq_ignore_ascii_case("cookie") {
            continue;
        }
        for pair in value.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            cookies.push((name.trim().into(), value.trim().into()));
        }
    }
    cookies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_args_decode_keys_and_values() {
        let args = parse_form_args("foo=x&bar=a%20b&empty=&solo", '&');
        assert_eq!(args.len(), 4);
        assert_eq!((&*args[0].0, &*args[0].1), ("foo", "x"));
        assert_eq!((&*args[1].0, &*args[1].1), ("bar", "a b"));
        assert_eq!((&*args[2].0, &*args[2].1), ("empty", ""));
        assert_eq!((&*args[3].0, &*args[3].1), ("solo", ""));
    }

    #[test]
    fn cookie_header_splits_into_pairs() {
        let headers = vec![("Host", "example.org"), ("Cookie", "sid=abc; theme=dark")];
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies.len(), 2);
        assert_eq!((&*cookies[0].0, &*cookies[0].1), ("sid", "abc"));
        assert_eq!((&*cookies[1].0, &*cookies[1].1), ("theme", "dark"));
    }
}
