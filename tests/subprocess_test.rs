use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokenflow::EngineError;
use tokenflow::definition::builder::ProcessBuilder;
use tokenflow::runtime::{EngineEvent, ProcessInstance};

fn no_vars() -> HashMap<String, serde_json::Value> {
    HashMap::new()
}

#[test]
fn embedded_scope_leaves_exactly_once_after_its_last_child() {
    let def = ProcessBuilder::new("two-entries")
        .embedded("sub", |s| {
            s.wait_state("a").wait_state("b");
        })
        .wait_state("after")
        .flow("sub", "after")
        .build()
        .expect("valid model");

    let mut instance = ProcessInstance::start(Arc::new(def), no_vars()).expect("start");
    // Two entry activities run as concurrent children of the scope.
    let mut inside: Vec<String> = instance
        .waiting_executions()
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    inside.sort();
    assert_eq!(inside, vec!["a".to_string(), "b".to_string()]);
    instance.drain_events();

    instance.trigger_activity("a", no_vars()).expect("trigger a");
    // One child left; the scope must not leave yet.
    assert_eq!(
        instance
            .waiting_executions()
            .into_iter()
            .map(|(_, id)| id)
            .collect::<Vec<_>>(),
        vec!["b".to_string()]
    );

    instance.trigger_activity("b", no_vars()).expect("trigger b");
    let waiting = instance.waiting_executions();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].1, "after");

    let takes_after = instance
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::TransitionTaken { to, .. } if to == "after"))
        .count();
    assert_eq!(takes_after, 1);
}

#[test]
fn embedded_scope_without_outgoing_ends_with_its_last_child() {
    let def = ProcessBuilder::new("scope-end")
        .embedded("sub", |s| {
            s.wait_state("a").wait_state("b");
        })
        .build()
        .expect("valid model");

    let mut instance = ProcessInstance::start(Arc::new(def), no_vars()).expect("start");
    assert_eq!(instance.waiting_executions().len(), 2);

    instance.trigger_activity("a", no_vars()).expect("trigger a");
    // The scope must outlive its remaining child.
    assert!(!instance.is_ended());

    instance.trigger_activity("b", no_vars()).expect("trigger b");
    assert!(instance.is_ended());
    assert_eq!(instance.live_execution_count(), 0);
}

#[test]
fn completed_event_scope_becomes_a_dormant_anchor() {
    let def = ProcessBuilder::new("event-scope")
        .wait_state("entry")
        .event_scope("es", |s| {
            s.wait_state("inner");
        })
        .wait_state("after")
        .flow("entry", "es")
        .flow("es", "after")
        .build()
        .expect("valid model");

    let mut instance = ProcessInstance::start(Arc::new(def), no_vars()).expect("start");
    instance.trigger_activity("entry", no_vars()).expect("trigger entry");
    assert_eq!(instance.waiting_executions()[0].1, "inner");
    assert!(instance.event_scope_executions().is_empty());

    instance.trigger_activity("inner", no_vars()).expect("trigger inner");

    // The scope converted into a marker and control moved to a sibling.
    let markers = instance.event_scope_executions();
    assert_eq!(markers.len(), 1);
    let marker = markers[0];
    let marker_node = instance.execution(marker).expect("marker");
    assert!(marker_node.is_event_scope());
    assert!(!marker_node.is_active());
    assert!(!marker_node.is_concurrent());

    let waiting = instance.waiting_executions();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].1, "after");
    let continuation = instance.execution(waiting[0].0).expect("continuation");
    assert_eq!(continuation.parent(), marker_node.parent());

    // The marker itself is inert and cannot be resumed.
    let err = instance.trigger(marker, no_vars()).unwrap_err();
    assert!(matches!(err, EngineError::NotWaiting(_)));
}

#[test]
fn compensation_reruns_the_preserved_scope() {
    let def = ProcessBuilder::new("compensation")
        .wait_state("entry")
        .event_scope("es", |s| {
            s.wait_state("inner");
        })
        .wait_state("after")
        .flow("entry", "es")
        .flow("es", "after")
        .build()
        .expect("valid model");

    let mut instance = ProcessInstance::start(Arc::new(def), no_vars()).expect("start");
    instance.trigger_activity("entry", no_vars()).expect("entry");
    instance.trigger_activity("inner", no_vars()).expect("inner");
    instance.drain_events();

    let root = instance.root();
    let triggered = instance.compensate(root).expect("compensate");
    assert_eq!(triggered, 1);

    // The anchor re-ran its content next to the untouched continuation.
    let mut at: Vec<String> = instance
        .waiting_executions()
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    at.sort();
    assert_eq!(at, vec!["after".to_string(), "inner".to_string()]);
    assert!(
        instance
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::CompensationTriggered { .. }))
    );

    // Nothing to compensate when no anchors exist beneath the target.
    let plain = ProcessBuilder::new("plain")
        .wait_state("w")
        .build()
        .expect("valid model");
    let mut plain_instance = ProcessInstance::start(Arc::new(plain), no_vars()).expect("start");
    let plain_root = plain_instance.root();
    assert_eq!(plain_instance.compensate(plain_root).expect("compensate"), 0);
}

#[test]
fn completing_a_compensation_rerun_leaves_one_anchor_and_one_token() {
    let def = ProcessBuilder::new("compensation-rerun")
        .wait_state("entry")
        .event_scope("es", |s| {
            s.wait_state("inner");
        })
        .wait_state("after")
        .flow("entry", "es")
        .flow("es", "after")
        .build()
        .expect("valid model");

    let mut instance = ProcessInstance::start(Arc::new(def), no_vars()).expect("start");
    instance.trigger_activity("entry", no_vars()).expect("entry");
    instance.trigger_activity("inner", no_vars()).expect("inner");

    let root = instance.root();
    assert_eq!(instance.compensate(root).expect("compensate"), 1);
    // Finish the re-run: it must end quietly, not take the scope's
    // outgoing flow again or convert into a second anchor.
    instance.trigger_activity("inner", no_vars()).expect("re-run inner");

    assert_eq!(instance.executions_at("after").len(), 1);
    assert_eq!(instance.event_scope_executions().len(), 1);
    let waiting = instance.waiting_executions();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].1, "after");

    // The preserved anchor supports compensating again.
    assert_eq!(instance.compensate(root).expect("compensate again"), 1);
    instance.trigger_activity("inner", no_vars()).expect("second re-run");
    assert_eq!(instance.event_scope_executions().len(), 1);
    assert_eq!(instance.executions_at("after").len(), 1);
}

#[test]
fn a_join_inside_a_scope_leaves_the_scope_execution_hosting() {
    let def = ProcessBuilder::new("inner-join")
        .embedded("sub", |s| {
            s.wait_state("a")
                .wait_state("b")
                .parallel_gateway("join")
                .task("wrap")
                .flow("a", "join")
                .flow("b", "join")
                .flow("join", "wrap");
        })
        .wait_state("after")
        .flow("sub", "after")
        .build()
        .expect("valid model");

    let mut instance = ProcessInstance::start(Arc::new(def), no_vars()).expect("start");
    instance.drain_events();
    instance.trigger_activity("a", no_vars()).expect("trigger a");
    instance.trigger_activity("b", no_vars()).expect("trigger b");

    // The join collapsed inside the scope; the scope itself then left.
    let waiting = instance.waiting_executions();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].1, "after");
    let takes_after = instance
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::TransitionTaken { to, .. } if to == "after"))
        .count();
    assert_eq!(takes_after, 1);
}

#[test]
fn nested_embedded_scopes_complete_inside_out() {
    let def = ProcessBuilder::new("nested")
        .embedded("outer", |s| {
            s.embedded("inner", |i| {
                i.wait_state("w");
            });
            s.wait_state("tail");
            s.flow("inner", "tail");
        })
        .build()
        .expect("valid model");

    let mut instance = ProcessInstance::start(Arc::new(def), no_vars()).expect("start");
    assert_eq!(instance.waiting_executions()[0].1, "w");

    instance.trigger_activity("w", no_vars()).expect("trigger w");
    // Inner scope completed and took its flow inside the outer scope.
    assert_eq!(instance.waiting_executions()[0].1, "tail");
    assert!(!instance.is_ended());

    instance.trigger_activity("tail", no_vars()).expect("trigger tail");
    assert!(instance.is_ended());
}

#[test]
fn variable_writes_inside_a_scope_land_on_the_defining_scope() {
    let def = ProcessBuilder::new("scoping")
        .embedded("sub", |s| {
            s.wait_state("pause");
            s.assign("bump", "counter", json!(1));
            s.flow("pause", "bump");
        })
        .build()
        .expect("valid model");

    let initial = HashMap::from([("counter".to_string(), json!(0))]);
    let mut instance = ProcessInstance::start(Arc::new(def), initial).expect("start");
    assert_eq!(instance.variable("counter"), Some(json!(0)));

    // Trigger-supplied variables walk up to the instance scope.
    instance
        .trigger_activity("pause", HashMap::from([("note".to_string(), json!("hi"))]))
        .expect("trigger");
    assert!(instance.is_ended());
    assert_eq!(instance.variable("counter"), Some(json!(1)));
    assert_eq!(instance.variable("note"), Some(json!("hi")));
}
