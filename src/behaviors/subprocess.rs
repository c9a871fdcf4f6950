use crate::behaviors::ActivityBehavior;
use crate::error::{EngineError, Result};
use crate::runtime::events::EngineEvent;
use crate::runtime::instance::{ProcessInstance, TimerSubscription};
use crate::runtime::tree::ExecutionId;
use tracing::{debug, info};

/// Enters a composite activity: registers its boundary timers and starts one
/// child execution per entry activity (concurrent when there are several).
///
/// A composite entered at the tree root first delegates to a scope child:
/// completion conversion and non-interrupting timer branches both need a
/// parent to work under, and the root stays the stable instance anchor.
pub(crate) fn execute_composite(instance: &mut ProcessInstance, exec: ExecutionId) -> Result<()> {
    let def = instance.definition().clone();
    let node = instance
        .tree
        .get(exec)
        .ok_or(EngineError::UnknownExecution(exec))?;
    let Some(act_idx) = node.activity() else {
        return Err(EngineError::UnknownExecution(exec));
    };
    let at_root = node.parent().is_none();
    let activity = def.activity(act_idx);

    let scope = if at_root {
        let child = instance.tree.create_child(exec);
        instance.tree.set_activity(child, act_idx);
        instance.events.push(EngineEvent::ExecutionCreated {
            execution: child,
            parent: Some(exec),
        });
        instance.tree.set_active(exec, false);
        child
    } else {
        exec
    };

    for timer in &activity.timers {
        instance.subscribe_timer(scope, &timer.id, timer.duration_ms, timer.interrupting);
    }

    let entries = activity.entry_activities(&def);
    if entries.is_empty() {
        return Err(EngineError::InvalidModel(format!(
            "composite activity '{}' has no entry activities",
            activity.id
        )));
    }
    let concurrent = entries.len() > 1;
    debug!(scope = %activity.id, entries = entries.len(), "entering composite scope");
    for entry in entries {
        let child = instance.tree.create_child(scope);
        if concurrent {
            instance.tree.set_concurrent(child, true);
        }
        instance.tree.set_activity(child, entry);
        instance.events.push(EngineEvent::ExecutionCreated {
            execution: child,
            parent: Some(scope),
        });
        instance.queue.push_back(child);
    }
    Ok(())
}

/// Completion hook for a composite scope whose last child execution ended.
///
/// An embedded subprocess either leaves along its outgoing transitions or,
/// lacking any, ends. An event-scope subprocess first spawns a continuation
/// sibling and converts itself into a dormant anchor that compensation can
/// later re-run; control then proceeds on the continuation.
pub(crate) fn last_execution_ended(instance: &mut ProcessInstance, scope: ExecutionId) -> Result<()> {
    let def = instance.definition().clone();
    let node = instance
        .tree
        .get(scope)
        .ok_or(EngineError::UnknownExecution(scope))?;
    let Some(act_idx) = node.activity() else {
        return Err(EngineError::UnknownExecution(scope));
    };
    let parent = node.parent();
    let was_concurrent = node.is_concurrent();
    let activity = def.activity(act_idx);

    instance.cancel_subscriptions_for(scope);

    match activity.behavior {
        ActivityBehavior::EmbeddedSubprocess => {
            let targets = activity.outgoing_targets();
            if targets.is_empty() {
                instance.end_execution(scope)
            } else {
                instance.tree.set_active(scope, true);
                instance.take_all(scope, targets, vec![scope])
            }
        }
        ActivityBehavior::EventScopeSubprocess => {
            let Some(parent) = parent else {
                // Root delegation in execute_composite guarantees a parent.
                return instance.end_execution(scope);
            };
            // A compensation re-run lives under the anchor itself. It ends
            // quietly: no new anchor, no outgoing transition, and the
            // original anchor stays available for further compensation.
            if instance.tree.get(parent).is_some_and(|n| n.is_event_scope()) {
                debug!(scope = %activity.id, "compensation re-run completed");
                return instance.end_execution(scope);
            }
            let continuation = instance.tree.create_child(parent);
            instance.tree.set_activity(continuation, act_idx);
            if was_concurrent {
                instance.tree.set_concurrent(continuation, true);
            }
            instance.events.push(EngineEvent::ExecutionCreated {
                execution: continuation,
                parent: Some(parent),
            });

            instance.tree.mark_event_scope(scope);
            instance.events.push(EngineEvent::EventScopeCreated {
                marker: scope,
                activity: activity.id.clone(),
            });
            debug!(scope = %activity.id, marker = %scope, "converted scope into event-scope anchor");

            let targets = activity.outgoing_targets();
            if targets.is_empty() {
                instance.end_execution(continuation)
            } else {
                instance.take_all(continuation, targets, vec![continuation])
            }
        }
        _ => Err(EngineError::InvalidModel(format!(
            "activity '{}' is not a composite scope",
            activity.id
        ))),
    }
}

/// Fires a boundary timer on its scope. Interrupting timers destroy the
/// scope's live subtree before any transition is taken; non-interrupting
/// timers start concurrent branches next to the scope and leave it running.
pub(crate) fn fire_timer(instance: &mut ProcessInstance, sub: TimerSubscription) -> Result<()> {
    let def = instance.definition().clone();
    let scope = sub.execution;
    let node = instance
        .tree
        .get(scope)
        .ok_or(EngineError::UnknownExecution(scope))?;
    let Some(act_idx) = node.activity() else {
        return Err(EngineError::UnknownExecution(scope));
    };
    let parent = node.parent();
    let activity = def.activity(act_idx);
    let decl = activity
        .timer(&sub.timer)
        .ok_or_else(|| EngineError::UnknownTimer(sub.timer.clone()))?;

    instance.remove_subscription(scope, &sub.timer);
    instance.events.push(EngineEvent::TimerFired {
        execution: scope,
        timer: sub.timer.clone(),
    });
    info!(
        scope = %activity.id,
        timer = %sub.timer,
        interrupting = decl.interrupting,
        "boundary timer fired"
    );

    if decl.interrupting {
        let mut removed = 0;
        for child in instance.tree.live_children(scope) {
            removed += 1 + instance.tree.descendants(child).len();
            instance.destroy_subtree(child);
        }
        instance
            .events
            .push(EngineEvent::SubtreeCancelled { scope, removed });
        // Any other timers on this scope die with its content.
        instance.cancel_subscriptions_for(scope);

        instance.tree.set_active(scope, true);
        instance.take_all(scope, decl.outgoing.clone(), vec![scope])
    } else {
        // The new branches live next to the scope, concurrent with it.
        // Root delegation guarantees every composite scope has a parent.
        let host = parent.ok_or(EngineError::UnknownExecution(scope))?;
        for &target in &decl.outgoing {
            let branch = instance.tree.create_child(host);
            instance.tree.set_concurrent(branch, true);
            instance.events.push(EngineEvent::ExecutionCreated {
                execution: branch,
                parent: Some(host),
            });
            instance.take(branch, target);
        }
        Ok(())
    }
}
