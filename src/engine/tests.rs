//! End-to-end engine tests: literal directives driven through literal
//! transactions, asserting on TX variables, expanded macros, callbacks, and
//! dispositions.

use crate::engine::{Engine, LoadError};
use crate::transaction::Transaction;
use crate::{AllowScope, Disposition, Value};

fn engine_from(directives: &str) -> Engine {
    let mut engine = Engine::new();
    engine.load(directives).unwrap_or_else(|e| panic!("load failed: {e}"));
    engine.init().unwrap_or_else(|e| panic!("init failed: {e}"));
    engine
}

fn tx_int(tx: &Transaction<'_>, name: &str) -> Option<i64> {
    match tx.tx_value(name) {
        Some(Value::Int(n)) => Some(n),
        Some(Value::Str(s)) => s.parse().ok(),
        _ => None,
    }
}

fn tx_str(tx: &Transaction<'_>, name: &str) -> Option<String> {
    tx.tx_value(name).map(|v| v.display())
}

#[test]
fn setvar_create_increase_decrease() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.s=100"
        SecAction "phase:1,setvar:tx.s=+25"
        SecAction "phase:1,setvar:tx.s=-5"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "s"), Some(120));
}

#[test]
fn chain_gates_every_member_action() {
    let directives = r#"
        SecRule ARGS_GET:foo "@streq x" "id:10,phase:1,chain,setvar:tx.seen=1"
        SecRule ARGS_GET:bar "@streq y" "setvar:tx.seen2=1"
    "#;

    // Both members match: both setvars fire.
    let engine = engine_from(directives);
    let mut tx = engine.make_transaction();
    tx.process_uri("/?foo=x&bar=y", "GET", "HTTP/1.1");
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "seen"), Some(1));
    assert_eq!(tx_int(&tx, "seen2"), Some(1));

    // The second member fails: neither setvar fires, including the
    // starter's own.
    let mut tx = engine.make_transaction();
    tx.process_uri("/?foo=x&bar=z", "GET", "HTTP/1.1");
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("seen"), None);
    assert_eq!(tx.tx_value("seen2"), None);
}

#[test]
fn begins_with_macro_rhs() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo=bar,setvar:tx.p=ba"
        SecRule TX:foo "@beginsWith %{tx.p}" "id:1,phase:1,setvar:tx.hit=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "hit"), Some(1));
}

#[test]
fn within_tokenizes_its_parameter() {
    let directives = r#"
        SecAction "phase:1,setvar:tx.foo=%VALUE%"
        SecRule TX:foo "@within hello world" "id:1,phase:1,setvar:tx.hit=1"
    "#;

    let engine = engine_from(&directives.replace("%VALUE%", "helloworld"));
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "hit"), Some(1));

    let engine = engine_from(&directives.replace("%VALUE%", "hello1 world1"));
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("hit"), None);
}

#[test]
fn ipv4_cidr_match() {
    let directives = r#"
        SecRule REMOTE_ADDR "@ipMatch 192.168.1.0/24" "id:1,phase:1,setvar:tx.in=1"
    "#;

    let engine = engine_from(directives);
    let mut tx = engine.make_transaction();
    tx.process_connection("192.168.1.100", 20000, "192.168.1.200", 80);
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "in"), Some(1));

    let mut tx = engine.make_transaction();
    tx.process_connection("10.0.0.1", 20000, "192.168.1.200", 80);
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("in"), None);
}

#[test]
fn allow_scopes_decide_which_phases_run() {
    let directives = r#"
        SecAction "phase:1,setvar:tx.t=1"
        SecRule TX:t "@eq 1" "id:1,phase:1,%ALLOW%,setvar:tx.p1=1"
        SecAction "phase:1,setvar:tx.p1b=1"
        SecRule TX:t "@eq 1" "id:2,phase:2,setvar:tx.p2=1"
        SecRule TX:t "@eq 1" "id:3,phase:3,setvar:tx.p3=1"
    "#;
    let run = |allow: &str| {
        let engine = engine_from(&directives.replace("%ALLOW%", allow));
        let mut tx = engine.make_transaction();
        let d1 = tx.process_request_headers(&[], |_| {});
        assert_eq!(d1, Disposition::Allow(match allow {
            "allow" => AllowScope::Transaction,
            "allow:request" => AllowScope::Request,
            _ => AllowScope::Phase,
        }));
        tx.process_request_body(&[], |_| {});
        tx.process_response_headers(200, "HTTP/1.1", &[], |_| {});
        (
            tx_int(&tx, "p1"),
            tx_int(&tx, "p1b"),
            tx_int(&tx, "p2"),
            tx_int(&tx, "p3"),
        )
    };

    // Bare allow: the rest of the transaction is allowed.
    assert_eq!(run("allow"), (Some(1), None, None, None));
    // allow:request skips the remaining request-side phases only.
    assert_eq!(run("allow:request"), (Some(1), None, None, Some(1)));
    // allow:phase terminates just the current phase.
    assert_eq!(run("allow:phase"), (Some(1), None, Some(1), Some(1)));
}

#[test]
fn deny_produces_a_block_disposition_and_short_circuits() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.bad=1"
        SecRule TX:bad "@eq 1" "id:30,phase:1,deny,status:406"
        SecAction "phase:1,setvar:tx.unreached=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    let disposition = tx.process_request_headers(&[], |_| {});
    assert_eq!(disposition, Disposition::Block { status: 406 });
    assert_eq!(tx.tx_value("unreached"), None);

    // Later request phases short-circuit on a decided disposition.
    let disposition = tx.process_request_body(&[], |_| {});
    assert_eq!(disposition, Disposition::Block { status: 406 });
}

#[test]
fn block_defers_to_the_default_action() {
    let engine = engine_from(
        r#"
        SecDefaultAction "phase:1,deny,status:403"
        SecAction "phase:1,setvar:tx.bad=1"
        SecRule TX:bad "@eq 1" "id:31,phase:1,block"
        "#,
    );
    let mut tx = engine.make_transaction();
    let disposition = tx.process_request_headers(&[], |_| {});
    assert_eq!(disposition, Disposition::Block { status: 403 });
}

#[test]
fn detection_only_suppresses_disruption() {
    let engine = engine_from(
        r#"
        SecRuleEngine DetectionOnly
        SecAction "phase:1,setvar:tx.bad=1"
        SecRule TX:bad "@eq 1" "id:32,phase:1,deny,setvar:tx.seen=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    let disposition = tx.process_request_headers(&[], |_| {});
    assert_eq!(disposition, Disposition::Pass);
    assert_eq!(tx_int(&tx, "seen"), Some(1));
}

#[test]
fn engine_off_runs_nothing() {
    let engine = engine_from(
        r#"
        SecRuleEngine Off
        SecAction "phase:1,setvar:tx.ran=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    assert_eq!(tx.process_request_headers(&[], |_| {}), Disposition::Pass);
    assert_eq!(tx.tx_value("ran"), None);
}

#[test]
fn transformation_pipeline_with_default_and_local_transforms() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo1=%42ar,setvar:tx.foo2=bar123,setvar:tx.foo3=bar,setvar:tx.foo4=BAR"
        SecRule TX:foo1|TX:foo2|TX:foo3|TX:foo4 "@streq bar" "id:80,phase:1,t:none,t:urlDecode,t:lowercase,setvar:tx.test=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "test"), Some(3));
}

#[test]
fn default_transforms_apply_unless_t_none() {
    let engine = engine_from(
        r#"
        SecDefaultAction "phase:1,t:lowercase"
        SecAction "phase:1,setvar:tx.v=BAR"
        SecRule TX:v "@streq bar" "id:40,phase:1,setvar:tx.hit=1"
        SecRule TX:v "@streq bar" "id:41,phase:1,t:none,setvar:tx.miss=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "hit"), Some(1));
    assert_eq!(tx.tx_value("miss"), None);
}

#[test]
fn repeated_lowercase_is_idempotent_through_the_cache() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.v=MiXeD case value long enough to hit the cache"
        SecRule TX:v "@streq mixed case value long enough to hit the cache" \
            "id:42,phase:1,t:lowercase,t:lowercase,setvar:tx.hit=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "hit"), Some(1));
}

#[test]
fn matched_var_family_in_logdata() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.a=bar"
        SecRule TX:a "@streq bar" "id:7,phase:1,log,logdata:'%{MATCHED_VAR_NAME}=%{MATCHED_VAR}'"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.log_data_expanded(), "TX:a=bar");
    assert_eq!(tx.matched_log().len(), 1);
    assert_eq!(tx.matched_log()[0].full_name(), "TX:a");
}

#[test]
fn chained_rule_reads_matched_var_of_its_predecessor() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.a=val1"
        SecRule TX:a "@streq val1" "id:50,phase:1,chain,setvar:tx.c1=1"
        SecRule MATCHED_VAR "@streq val1" "setvar:tx.c2=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "c1"), Some(1));
    assert_eq!(tx_int(&tx, "c2"), Some(1));
}

#[test]
fn multi_chain_reruns_the_continuation_per_element() {
    let directives = r#"
        SecAction "phase:1,setvar:tx.foo=100,setvar:tx.bar=200,setvar:tx.baz=300"
        SecRule TX "@lt 300" "id:1,phase:1,multiChain"
        SecRule TX:foo "@unconditionalMatch" "setvar:tx.test=+1"
    "#;

    // Two of the three TX elements are below 300: the continuation fires
    // once per matching element.
    let engine = engine_from(directives);
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "test"), Some(2));

    // `!multiChain` drives the loop from the unmatched elements instead.
    let engine = engine_from(&directives.replace("multiChain", "!multiChain"));
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "test"), Some(1));
}

#[test]
fn all_match_withholds_actions_unless_every_element_matches() {
    // foo fails @gt 100, so the matched-branch action never fires.
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo=100,setvar:tx.bar=200"
        SecRule TX "@gt 100" "id:1,phase:1,allMatch,setvar:tx.result=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("result"), None);

    // Without allMatch, the one matching element fires its action.
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo=100,setvar:tx.bar=200"
        SecRule TX "@gt 100" "id:1,phase:1,setvar:tx.result=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "result"), Some(1));

    // Every element matching opens the gate, per element as usual.
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo=150,setvar:tx.bar=200"
        SecRule TX "@gt 100" "id:1,phase:1,allMatch,setvar:tx.result=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "result"), Some(2));
}

#[test]
fn first_match_short_circuits_the_element_loop() {
    let directives = r#"
        SecAction "phase:1,setvar:tx.a=200,setvar:tx.b=300,setvar:tx.c=400"
        SecRule TX "@gt 100" "id:1,phase:1,firstMatch,setvar:tx.result=+1"
    "#;
    let engine = engine_from(directives);
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "result"), Some(1));

    // The identical rule without firstMatch fires once per element.
    let engine = engine_from(&directives.replace("firstMatch,", ""));
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "result"), Some(3));
}

#[test]
fn chain_branch_prefixes_gate_the_continuation() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo=foo"
        SecRule TX:foo "!@streq foo" "phase:1,id:1,!chain"
        SecRule TX:foo "@streq foo" "setvar:tx.v1=1"
        SecRule TX:foo "@streq foo" "phase:1,id:2,!chain"
        SecRule TX:foo "@streq foo" "setvar:tx.v2=1"
        SecRule TX:foo "!@streq foo" "phase:1,id:3,*chain"
        SecRule TX:foo "@streq foo" "setvar:tx.v3=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    // Rule 1 did not match; its !chain continuation runs.
    assert_eq!(tx_int(&tx, "v1"), Some(1));
    // Rule 2 matched; its !chain continuation is skipped.
    assert_eq!(tx.tx_value("v2"), None);
    // Rule 3's *chain continuation runs either way.
    assert_eq!(tx_int(&tx, "v3"), Some(1));
}

#[test]
fn capture_promotes_into_tx_slots() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.input=attack123"
        SecRule TX:input "@rx attack(\d+)" "id:5,phase:1,capture,setvar:tx.got=%{TX.1}"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "got"), Some(123));
    assert_eq!(tx_str(&tx, "0").as_deref(), Some("attack123"));
    assert_eq!(tx_str(&tx, "1").as_deref(), Some("123"));
}

#[test]
fn captures_without_the_capture_flag_are_discarded() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.input=attack123"
        SecRule TX:input "@rx attack(\d+)" "id:5,phase:1,setvar:tx.hit=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "hit"), Some(1));
    assert_eq!(tx.tx_value("0"), None);
}

#[test]
fn operator_or_cascade_matches_any_branch() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo=foo"
        SecRule TX:foo "@streq hello|@beginsWith world|@streq foo" "phase:1,id:70,setvar:tx.matched=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "matched"), Some(1));
}

#[test]
fn action_branches_fire_per_element_outcome() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.foo=foo"
        SecRule TX:foo "@streq foo" "phase:1,id:96,!setvar:tx.unmatched0,setvar:tx.matched0,*setvar:tx.always0"
        SecRule TX:foo "!@streq foo" "phase:1,id:97,!setvar:tx.unmatched1,setvar:tx.matched1,*setvar:tx.always1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "matched0"), Some(1));
    assert_eq!(tx.tx_value("unmatched0"), None);
    assert_eq!(tx_int(&tx, "always0"), Some(1));
    assert_eq!(tx.tx_value("matched1"), None);
    assert_eq!(tx_int(&tx, "unmatched1"), Some(1));
    assert_eq!(tx_int(&tx, "always1"), Some(1));
}

#[test]
fn args_loop_runs_actions_per_matching_element() {
    let engine = engine_from(
        r#"
        SecRule ARGS "@streq hit" "id:95,phase:1,setvar:tx.hits=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_uri("/?a=hit&b=hit&c=miss", "GET", "HTTP/1.1");
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "hits"), Some(2));
}

#[test]
fn request_headers_and_cookies() {
    let engine = engine_from(
        r#"
        SecRule REQUEST_HEADERS:User-Agent "@contains evilbot" "id:90,phase:1,t:lowercase,setvar:tx.bot=1"
        SecRule &REQUEST_COOKIES:sid "@eq 1" "id:91,phase:1,setvar:tx.has_sid=1"
        SecRule REQUEST_HEADERS_NAMES "@beginsWith X-Forwarded" "id:92,phase:1,setvar:tx.fwd=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(
        &[
            ("Host", "example.org"),
            ("User-Agent", "EvilBot/1.0"),
            ("Cookie", "sid=abc; theme=dark"),
            ("X-Forwarded-For", "1.2.3.4"),
        ],
        |_| {},
    );
    assert_eq!(tx_int(&tx, "bot"), Some(1));
    assert_eq!(tx_int(&tx, "has_sid"), Some(1));
    assert_eq!(tx_int(&tx, "fwd"), Some(1));
}

#[test]
fn skip_after_jumps_to_the_marker() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.sig=1"
        SecRule TX:sig "@eq 1" "id:20,phase:1,skipAfter:DONE"
        SecAction "phase:1,setvar:tx.skipped=1"
        SecMarker DONE
        SecAction "phase:1,setvar:tx.after=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("skipped"), None);
    assert_eq!(tx_int(&tx, "after"), Some(1));
}

#[test]
fn unmatched_rule_does_not_skip() {
    let engine = engine_from(
        r#"
        SecRule TX:absent "@eq 1" "id:21,phase:1,skipAfter:DONE"
        SecAction "phase:1,setvar:tx.not_skipped=1"
        SecMarker DONE
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "not_skipped"), Some(1));
}

#[test]
fn skip_count_jumps_over_n_rules() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.sig=1"
        SecRule TX:sig "@eq 1" "id:22,phase:1,skip:1"
        SecAction "phase:1,setvar:tx.skipped=1"
        SecAction "phase:1,setvar:tx.after=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("skipped"), None);
    assert_eq!(tx_int(&tx, "after"), Some(1));
}

#[test]
fn ctl_rule_remove_by_id_takes_effect_in_later_phases() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,ctl:ruleRemoveById=100"
        SecAction "phase:1,setvar:tx.t=1"
        SecRule TX:t "@eq 1" "id:100,phase:1,setvar:tx.removed_ran=1"
        SecRule TX:t "@eq 1" "id:101,phase:2,setvar:tx.p2=1"
        SecRule TX:t "@eq 1" "id:102,phase:2,ctl:ruleRemoveById=101"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("removed_ran"), None);

    // Rule 101 runs before 102's removal lands; removal is per-transaction
    // state for phases at or after the ctl.
    tx.process_request_body(&[], |_| {});
    assert_eq!(tx_int(&tx, "p2"), Some(1));
}

#[test]
fn ctl_rule_remove_target_excludes_one_argument() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,ctl:ruleRemoveTargetById=60;ARGS:foo"
        SecRule ARGS "@streq x" "id:60,phase:1,setvar:tx.n=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_uri("/?foo=x&bar=x", "GET", "HTTP/1.1");
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "n"), Some(1));
}

#[test]
fn inline_target_exclusion() {
    let engine = engine_from(
        r#"
        SecRule ARGS|!ARGS:pw "@streq secret" "id:61,phase:1,setvar:tx.n=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_uri("/?pw=secret&q=secret", "GET", "HTTP/1.1");
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "n"), Some(1));
}

#[test]
fn match_callback_fires_for_logging_rules_only() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.t=1"
        SecRule TX:t "@eq 1" "id:200,phase:1"
        SecRule TX:t "@eq 1" "id:201,phase:1,nolog"
        SecRule TX:t "@eq 2" "id:202,phase:1"
        "#,
    );
    let mut tx = engine.make_transaction();
    let mut matched_ids = Vec::new();
    tx.process_request_headers(&[], |rule| matched_ids.push(rule.id));
    assert_eq!(matched_ids, vec![200]);
}

#[test]
fn msg_macro_expands_with_accumulated_state() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.t=1"
        SecRule TX:t "@eq 1" "id:203,phase:1,msg:'state is %{tx.t}',setvar:tx.t=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    // The action increments before the epilogue expands the template.
    assert_eq!(tx.msg_expanded(), "state is 2");
}

#[test]
fn removed_rules_and_updates_at_init() {
    let mut engine = Engine::new();
    engine
        .load(
            r#"
            SecAction "phase:1,setvar:tx.t=1"
            SecRule TX:t "@eq 1" "id:300,phase:1,setvar:tx.a=1"
            SecRule TX:t "@eq 1" "id:301,phase:1,tag:'test/tagged',setvar:tx.b=1"
            SecRule TX:t "@eq 1" "id:302,phase:1,setvar:tx.c=1"
            SecRuleRemoveById 300
            SecRuleRemoveByTag test/tagged
            SecRuleUpdateActionById 302 "severity:CRITICAL"
            "#,
        )
        .unwrap();
    engine.init().unwrap();

    assert!(engine.find_rule_by_id(300).is_none());
    assert!(engine.find_rule_by_id(301).is_none());
    assert_eq!(engine.find_rule_by_id(302).unwrap().severity, Some(crate::Severity::Critical));

    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("a"), None);
    assert_eq!(tx.tx_value("b"), None);
    assert_eq!(tx_int(&tx, "c"), Some(1));
}

#[test]
fn load_rejects_unknown_names_without_installing_rules() {
    let mut engine = Engine::new();
    assert!(matches!(
        engine.load(r#"SecRule NO_SUCH_VAR "@rx x" "id:1,phase:1""#),
        Err(LoadError::Variable(_))
    ));
    assert!(matches!(
        engine.load(r#"SecRule ARGS "@noSuchOp x" "id:1,phase:1""#),
        Err(LoadError::Operator(_))
    ));
    assert!(matches!(
        engine.load(r#"SecRule ARGS "@rx x" "id:1,phase:1,t:noSuchTransform""#),
        Err(LoadError::UnknownTransform(_))
    ));
    assert!(matches!(
        engine.load(r#"SecRule ARGS "@rx x" "id:1,phase:7""#),
        Err(LoadError::InvalidValue { .. })
    ));
}

#[test]
fn bad_skip_target_fails_init() {
    let mut engine = Engine::new();
    engine
        .load(r#"SecRule ARGS "@rx x" "id:1,phase:1,skipAfter:NOWHERE""#)
        .unwrap();
    assert!(matches!(engine.init(), Err(LoadError::BadSkipTarget { .. })));
}

#[test]
fn response_phase_rules_see_response_state() {
    let engine = engine_from(
        r#"
        SecRule RESPONSE_STATUS "@eq 500" "id:400,phase:3,setvar:tx.err=1"
        SecRule RESPONSE_HEADERS:Content-Type "@contains json" "id:401,phase:3,setvar:tx.json=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_request_headers(&[], |_| {});
    tx.process_request_body(&[], |_| {});
    tx.process_response_headers(500, "HTTP/1.1", &[("Content-Type", "application/json")], |_| {});
    assert_eq!(tx_int(&tx, "err"), Some(1));
    assert_eq!(tx_int(&tx, "json"), Some(1));
}

#[test]
fn request_body_args_require_body_access() {
    let directives = r#"
        SecRequestBodyAccess On
        SecRule ARGS_POST:user "@streq admin" "id:500,phase:2,setvar:tx.admin=1"
    "#;
    let engine = engine_from(directives);
    let mut tx = engine.make_transaction();
    tx.process_uri("/login", "POST", "HTTP/1.1");
    tx.process_request_headers(
        &[("Content-Type", "application/x-www-form-urlencoded")],
        |_| {},
    );
    tx.process_request_body(&["user=admin&pass=x"], |_| {});
    assert_eq!(tx_int(&tx, "admin"), Some(1));

    // Without body access the POST arguments never materialize.
    let engine = engine_from(
        r#"
        SecRule ARGS_POST:user "@streq admin" "id:500,phase:2,setvar:tx.admin=1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_uri("/login", "POST", "HTTP/1.1");
    tx.process_request_headers(
        &[("Content-Type", "application/x-www-form-urlencoded")],
        |_| {},
    );
    tx.process_request_body(&["user=admin"], |_| {});
    assert_eq!(tx.tx_value("admin"), None);
}

#[test]
fn redirect_disposition_carries_location_and_status() {
    let engine = engine_from(
        r#"
        SecAction "phase:1,setvar:tx.t=1"
        SecRule TX:t "@eq 1" "id:600,phase:1,redirect:https://example.org/blocked"
        "#,
    );
    let mut tx = engine.make_transaction();
    match tx.process_request_headers(&[], |_| {}) {
        Disposition::Redirect { status, location } => {
            assert_eq!(status, 302);
            assert_eq!(&*location, "https://example.org/blocked");
        }
        other => panic!("expected redirect, got {other:?}"),
    }
}

#[test]
fn additional_condition_can_veto_a_match() {
    let directives = r#"
        SecAction "phase:1,setvar:tx.v=abc"
        SecRule TX:v "@streq abc" "id:910,phase:1,setvar:tx.hit=1"
    "#;

    let engine = engine_from(directives);
    let mut tx = engine.make_transaction();
    tx.set_additional_condition(Box::new(|rule, _value, _var| rule.id != 910));
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx.tx_value("hit"), None);

    let mut tx = engine.make_transaction();
    tx.set_additional_condition(Box::new(|_, value, var| {
        var.full_name() == "TX:v" && value == "abc"
    }));
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "hit"), Some(1));
}

#[test]
fn identical_directives_compile_to_identical_programs() {
    let directives = r#"
        SecDefaultAction "phase:1,t:lowercase"
        SecAction "phase:1,setvar:tx.t=1"
        SecRule TX:t "@eq 1" "id:800,phase:1,chain,msg:'got %{tx.t}'"
        SecRule ARGS "@rx attack" "setvar:tx.hit=1"
        SecMarker END
    "#;
    let a = engine_from(directives);
    let b = engine_from(directives);
    for phase in 1..=5 {
        let phase = crate::Phase::from_number(phase).unwrap();
        let left = a.program(phase).map(|p| p.disassemble()).unwrap_or_default();
        let right = b.program(phase).map(|p| p.disassemble()).unwrap_or_default();
        assert_eq!(left, right);
    }
}

#[test]
fn one_engine_serves_concurrent_transactions() {
    let engine = engine_from(
        r#"
        SecRule ARGS:q "@rx (?i)union\s+select" "id:900,phase:1,deny,status:403"
        SecRule ARGS:q "@streq benign" "id:901,phase:1,setvar:tx.ok=1"
        "#,
    );

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..50 {
                    let hostile = (worker + i) % 2 == 0;
                    let mut tx = engine.make_transaction();
                    if hostile {
                        tx.process_uri("/?q=1%20UNION%20SELECT%20x", "GET", "HTTP/1.1");
                        let d = tx.process_request_headers(&[], |_| {});
                        assert_eq!(d, Disposition::Block { status: 403 });
                    } else {
                        tx.process_uri("/?q=benign", "GET", "HTTP/1.1");
                        let d = tx.process_request_headers(&[], |_| {});
                        assert_eq!(d, Disposition::Pass);
                        assert_eq!(tx_int(&tx, "ok"), Some(1));
                    }
                }
            });
        }
    });
}

#[test]
fn counter_mode_over_collections() {
    let engine = engine_from(
        r#"
        SecRule &ARGS "@eq 3" "id:700,phase:1,setvar:tx.three=1"
        SecRule &ARGS:foo "@eq 1" "id:701,phase:1,setvar:tx.one_foo=1"
        SecRule ARGS:/^id_/ "@streq 42" "id:702,phase:1,setvar:tx.sel=+1"
        "#,
    );
    let mut tx = engine.make_transaction();
    tx.process_uri("/?foo=a&id_x=42&id_y=13", "GET", "HTTP/1.1");
    tx.process_request_headers(&[], |_| {});
    assert_eq!(tx_int(&tx, "three"), Some(1));
    assert_eq!(tx_int(&tx, "one_foo"), Some(1));
    assert_eq!(tx_int(&tx, "sel"), Some(1));
}
