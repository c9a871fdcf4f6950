use crate::definition::Condition;
use crate::error::{EngineError, Result};
use crate::runtime::events::EngineEvent;
use crate::runtime::instance::ProcessInstance;
use crate::runtime::tree::ExecutionId;
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Value as EvalValue};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Parallel-gateway arrival. The arriving execution goes inactive, then the
/// join fires iff the number of parked siblings at this gateway equals the
/// number of declared incoming transitions. A surplus (malformed state)
/// keeps the join parked rather than firing on a partial or inflated count.
pub(crate) fn parallel_arrive(instance: &mut ProcessInstance, exec: ExecutionId) -> Result<()> {
    let def = instance.definition().clone();
    let node = instance
        .tree
        .get(exec)
        .ok_or(EngineError::UnknownExecution(exec))?;
    let Some(act_idx) = node.activity() else {
        return Err(EngineError::UnknownExecution(exec));
    };
    let is_concurrent = node.is_concurrent();
    let parent = node.parent();
    let activity = def.activity(act_idx);

    instance.tree.set_active(exec, false);

    let joined = if is_concurrent {
        let parent = parent.ok_or(EngineError::UnknownExecution(exec))?;
        instance.tree.inactive_concurrent_at(parent, act_idx)
    } else {
        vec![exec]
    };
    let required = activity.incoming.max(1);

    instance.events.push(EngineEvent::JoinArrived {
        execution: exec,
        gateway: activity.id.clone(),
        joined: joined.len(),
        required,
    });
    debug!(
        gateway = %activity.id,
        joined = joined.len(),
        required,
        "parallel gateway arrival"
    );

    if joined.len() == required {
        instance.events.push(EngineEvent::JoinFired {
            gateway: activity.id.clone(),
            consumed: joined.len(),
        });
        instance.take_all(exec, activity.outgoing_targets(), joined)
    } else {
        Ok(())
    }
}

/// Exclusive-gateway routing: conditional flows are evaluated in declaration
/// order and the first one holding wins; the first unconditional flow is the
/// default. No match is a model error.
pub(crate) fn exclusive_take(instance: &mut ProcessInstance, exec: ExecutionId) -> Result<()> {
    let def = instance.definition().clone();
    let node = instance
        .tree
        .get(exec)
        .ok_or(EngineError::UnknownExecution(exec))?;
    let Some(act_idx) = node.activity() else {
        return Err(EngineError::UnknownExecution(exec));
    };
    let activity = def.activity(act_idx);
    let ctx = eval_context(instance.tree.collect_variables(exec));

    let mut chosen = None;
    let mut default = None;
    for transition in &activity.outgoing {
        match &transition.condition {
            Some(condition) => {
                if evaluate(condition, &ctx) {
                    chosen = Some(transition.target);
                    break;
                }
            }
            None => {
                if default.is_none() {
                    default = Some(transition.target);
                }
            }
        }
    }

    let target = chosen.or(default).ok_or_else(|| {
        EngineError::InvalidModel(format!(
            "no outgoing transition matched at exclusive gateway '{}'",
            activity.id
        ))
    })?;
    instance.take(exec, target);
    Ok(())
}

fn evaluate(condition: &Condition, ctx: &HashMapContext<DefaultNumericTypes>) -> bool {
    match condition.compiled.eval_boolean_with_context(ctx) {
        Ok(value) => value,
        Err(err) => {
            warn!(condition = %condition.raw, %err, "condition evaluation failed, treating as false");
            false
        }
    }
}

/// Builds an expression context from the variables visible to the gateway.
/// Arrays and objects are not expression operands and are skipped.
fn eval_context(vars: HashMap<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (name, value) in vars {
        let converted = match value {
            Value::Bool(b) => Some(EvalValue::Boolean(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(EvalValue::Int(i))
                } else {
                    n.as_f64().map(EvalValue::Float)
                }
            }
            Value::String(s) => Some(EvalValue::String(s)),
            Value::Null => Some(EvalValue::Empty),
            Value::Array(_) | Value::Object(_) => None,
        };
        if let Some(converted) = converted
            && let Err(err) = ctx.set_value(name.clone(), converted)
        {
            warn!(variable = %name, %err, "failed to bind variable into expression context");
        }
    }
    ctx
}

#[cfg(test)]
mod tests {
    use crate::behaviors::ActivityBehavior;
    use crate::definition::builder::ProcessBuilder;
    use crate::runtime::events::EngineEvent;
    use crate::runtime::instance::ProcessInstance;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn fork_join_definition() -> Arc<crate::definition::ProcessDefinition> {
        let def = ProcessBuilder::new("fork-join")
            .parallel_gateway("fork")
            .wait_state("w1")
            .wait_state("w2")
            .parallel_gateway("join")
            .end_event("done")
            .flow("fork", "w1")
            .flow("fork", "w2")
            .flow("w1", "join")
            .flow("w2", "join")
            .flow("join", "done")
            .build()
            .unwrap();
        Arc::new(def)
    }

    #[test]
    fn surplus_arrivals_do_not_fire_the_join() {
        let def = fork_join_definition();
        let join = def.find_activity("join").unwrap();
        let mut instance = ProcessInstance::start(def, HashMap::new()).unwrap();
        let root = instance.root();
        instance.drain_events();

        // Corrupt the state: two extra parked arrivals at the join beyond
        // the two the model can produce.
        for _ in 0..2 {
            let extra = instance.tree.create_child(root);
            instance.tree.set_concurrent(extra, true);
            instance.tree.set_activity(extra, join);
            instance.tree.set_active(extra, false);
        }

        // Both real arrivals now see a joined count above the requirement;
        // exact-equality matching keeps the join parked instead of firing.
        instance.trigger_activity("w1", HashMap::new()).unwrap();
        instance.trigger_activity("w2", HashMap::new()).unwrap();

        let events = instance.drain_events();
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, EngineEvent::JoinFired { .. })),
            "join must not fire when arrivals exceed the requirement"
        );
        assert!(!instance.is_ended());
        assert_eq!(instance.executions_at("join").len(), 4);
    }

    #[test]
    fn exclusive_gateway_without_match_is_a_model_error() {
        let def = ProcessBuilder::new("no-default")
            .wait_state("entry")
            .exclusive_gateway("route")
            .end_event("a")
            .end_event("b")
            .flow("entry", "route")
            .flow_if("route", "a", "${amount > 100}")
            .flow_if("route", "b", "${amount < 0}")
            .build()
            .unwrap();
        let mut instance = ProcessInstance::start(Arc::new(def), HashMap::new()).unwrap();
        let vars = HashMap::from([("amount".to_string(), serde_json::json!(50))]);
        let err = instance.trigger_activity("entry", vars).unwrap_err();
        assert!(matches!(err, crate::EngineError::InvalidModel(_)));
    }

    #[test]
    fn condition_errors_fall_through_to_the_default_flow() {
        let def = ProcessBuilder::new("bad-condition")
            .wait_state("entry")
            .exclusive_gateway("route")
            .task("chosen")
            .end_event("fallback")
            .end_event("done")
            .flow("entry", "route")
            .flow_if("route", "chosen", "${missing_var > 10}")
            .flow("route", "fallback")
            .flow("chosen", "done")
            .build()
            .unwrap();
        let mut instance = ProcessInstance::start(Arc::new(def), HashMap::new()).unwrap();
        instance.trigger_activity("entry", HashMap::new()).unwrap();
        assert!(instance.is_ended());
        let events = instance.drain_events();
        assert!(events.iter().any(|e| {
            matches!(e, EngineEvent::TransitionTaken { to, .. } if to == "fallback")
        }));
    }

    #[test]
    fn behavior_predicates() {
        assert!(ActivityBehavior::EmbeddedSubprocess.is_composite());
        assert!(ActivityBehavior::EventScopeSubprocess.is_composite());
        assert!(!ActivityBehavior::Parallel.is_composite());
        assert!(ActivityBehavior::Wait.is_wait_state());
        assert!(!ActivityBehavior::End.is_wait_state());
    }
}
