use crate::definition::ActivityIdx;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Handle into an [`ExecutionTree`] arena. Handles are never reused within
/// one process instance, so a stale id resolves to nothing instead of to a
/// different execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExecutionId(pub(crate) usize);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// One token of control flow in the process instance tree.
#[derive(Debug)]
pub struct ExecutionNode {
    pub(crate) parent: Option<ExecutionId>,
    /// Insertion order determines sibling processing order.
    pub(crate) children: Vec<ExecutionId>,
    pub(crate) activity: Option<ActivityIdx>,
    pub(crate) is_active: bool,
    pub(crate) is_concurrent: bool,
    pub(crate) is_event_scope: bool,
    pub(crate) variables: HashMap<String, Value>,
}

impl ExecutionNode {
    pub fn parent(&self) -> Option<ExecutionId> {
        self.parent
    }

    pub fn activity(&self) -> Option<ActivityIdx> {
        self.activity
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_concurrent(&self) -> bool {
        self.is_concurrent
    }

    pub fn is_event_scope(&self) -> bool {
        self.is_event_scope
    }

    pub fn children(&self) -> &[ExecutionId] {
        &self.children
    }

    pub fn local_variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    fn fresh(parent: Option<ExecutionId>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            activity: None,
            is_active: true,
            is_concurrent: false,
            is_event_scope: false,
            variables: HashMap::new(),
        }
    }
}

/// Arena of execution nodes. Parent and child links are handles rather than
/// live references, which keeps bidirectional navigation safe under
/// mutation.
#[derive(Debug, Default)]
pub struct ExecutionTree {
    slots: Vec<Option<ExecutionNode>>,
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_root(&mut self) -> ExecutionId {
        let id = ExecutionId(self.slots.len());
        self.slots.push(Some(ExecutionNode::fresh(None)));
        id
    }

    /// Creates a child appended to the parent's child list.
    pub fn create_child(&mut self, parent: ExecutionId) -> ExecutionId {
        let id = ExecutionId(self.slots.len());
        self.slots.push(Some(ExecutionNode::fresh(Some(parent))));
        if let Some(p) = self.slot_mut(parent) {
            p.children.push(id);
        }
        id
    }

    pub fn get(&self, id: ExecutionId) -> Option<&ExecutionNode> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, id: ExecutionId) -> Option<&mut ExecutionNode> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    /// Detaches the node from its parent and frees the slot. The caller is
    /// responsible for having removed the children first.
    pub(crate) fn remove(&mut self, id: ExecutionId) {
        let parent = self.get(id).and_then(|n| n.parent);
        if let Some(parent) = parent
            && let Some(p) = self.slot_mut(parent)
        {
            p.children.retain(|&c| c != id);
        }
        if let Some(slot) = self.slots.get_mut(id.0) {
            debug_assert!(
                slot.as_ref().is_none_or(|n| n.children.is_empty()),
                "removing an execution with live children"
            );
            *slot = None;
        }
    }

    pub fn children(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.get(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Children that still play a control-flow role (event-scope markers are
    /// passive anchors, not tokens).
    pub fn live_children(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.children(id)
            .into_iter()
            .filter(|&c| self.get(c).is_some_and(|n| !n.is_event_scope))
            .collect()
    }

    /// The join candidate set: inactive concurrent children of `parent`
    /// parked at `activity`, in insertion order.
    pub fn inactive_concurrent_at(
        &self,
        parent: ExecutionId,
        activity: ActivityIdx,
    ) -> Vec<ExecutionId> {
        self.children(parent)
            .into_iter()
            .filter(|&c| {
                self.get(c).is_some_and(|n| {
                    !n.is_active
                        && n.is_concurrent
                        && !n.is_event_scope
                        && n.activity == Some(activity)
                })
            })
            .collect()
    }

    /// All live descendants of `id` in pre-order, excluding `id` itself.
    pub fn descendants(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        let mut stack: Vec<ExecutionId> = self.children(id).into_iter().rev().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            for child in self.children(next).into_iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Converts a token into a dormant event-scope anchor. Enforces the
    /// invariant that markers are neither active nor concurrent.
    pub(crate) fn mark_event_scope(&mut self, id: ExecutionId) {
        if let Some(n) = self.slot_mut(id) {
            n.is_active = false;
            n.is_concurrent = false;
            n.is_event_scope = true;
        }
    }

    pub(crate) fn set_active(&mut self, id: ExecutionId, active: bool) {
        if let Some(n) = self.slot_mut(id) {
            n.is_active = active;
        }
    }

    pub(crate) fn set_concurrent(&mut self, id: ExecutionId, concurrent: bool) {
        if let Some(n) = self.slot_mut(id) {
            n.is_concurrent = concurrent;
        }
    }

    pub(crate) fn set_activity(&mut self, id: ExecutionId, activity: ActivityIdx) {
        if let Some(n) = self.slot_mut(id) {
            n.activity = Some(activity);
        }
    }

    /// Scope-chain variable lookup: nearest definition wins.
    pub fn variable(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.get(current)?;
            if let Some(value) = node.variables.get(name) {
                return Some(value);
            }
            cursor = node.parent;
        }
        None
    }

    /// Writes to the nearest scope already defining `name`, falling back to
    /// the root scope.
    pub(crate) fn set_variable(&mut self, id: ExecutionId, name: &str, value: Value) {
        let mut cursor = Some(id);
        let mut root = id;
        while let Some(current) = cursor {
            let Some(node) = self.get(current) else { break };
            if node.variables.contains_key(name) {
                if let Some(n) = self.slot_mut(current) {
                    n.variables.insert(name.to_string(), value);
                }
                return;
            }
            root = current;
            cursor = node.parent;
        }
        if let Some(n) = self.slot_mut(root) {
            n.variables.insert(name.to_string(), value);
        }
    }

    pub(crate) fn set_variable_local(&mut self, id: ExecutionId, name: &str, value: Value) {
        if let Some(n) = self.slot_mut(id) {
            n.variables.insert(name.to_string(), value);
        }
    }

    /// Flattened view of all variables visible from `id`, nearer scopes
    /// overriding outer ones.
    pub fn collect_variables(&self, id: ExecutionId) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.get(current) else { break };
            chain.push(current);
            cursor = node.parent;
        }
        let mut out = HashMap::new();
        for scope in chain.into_iter().rev() {
            if let Some(node) = self.get(scope) {
                for (k, v) in &node.variables {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        out
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// All live node ids, ascending by handle.
    pub fn live_ids(&self) -> Vec<ExecutionId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| ExecutionId(i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handles_are_not_reused() {
        let mut tree = ExecutionTree::new();
        let root = tree.create_root();
        let child = tree.create_child(root);
        tree.remove(child);
        let next = tree.create_child(root);
        assert_ne!(child, next);
        assert!(tree.get(child).is_none());
        assert!(tree.get(next).is_some());
    }

    #[test]
    fn children_keep_insertion_order() {
        let mut tree = ExecutionTree::new();
        let root = tree.create_root();
        let a = tree.create_child(root);
        let b = tree.create_child(root);
        let c = tree.create_child(root);
        tree.remove(b);
        assert_eq!(tree.children(root), vec![a, c]);
    }

    #[test]
    fn event_scope_marker_invariant() {
        let mut tree = ExecutionTree::new();
        let root = tree.create_root();
        let child = tree.create_child(root);
        tree.set_concurrent(child, true);
        tree.mark_event_scope(child);
        let node = tree.get(child).unwrap();
        assert!(node.is_event_scope());
        assert!(!node.is_active());
        assert!(!node.is_concurrent());
        assert!(tree.live_children(root).is_empty());
    }

    #[test]
    fn variable_scope_chain() {
        let mut tree = ExecutionTree::new();
        let root = tree.create_root();
        let child = tree.create_child(root);
        let grandchild = tree.create_child(child);

        tree.set_variable(grandchild, "x", json!(1));
        assert_eq!(tree.get(root).unwrap().variables.get("x"), Some(&json!(1)));

        tree.set_variable_local(child, "x", json!(2));
        assert_eq!(tree.variable(grandchild, "x"), Some(&json!(2)));
        assert_eq!(tree.variable(root, "x"), Some(&json!(1)));

        // Walk-up write lands on the nearest defining scope.
        tree.set_variable(grandchild, "x", json!(3));
        assert_eq!(tree.variable(child, "x"), Some(&json!(3)));
        assert_eq!(tree.variable(root, "x"), Some(&json!(1)));

        let merged = tree.collect_variables(grandchild);
        assert_eq!(merged.get("x"), Some(&json!(3)));
    }

    #[test]
    fn join_candidate_set() {
        let mut tree = ExecutionTree::new();
        let root = tree.create_root();
        let mut parked = Vec::new();
        for _ in 0..3 {
            let c = tree.create_child(root);
            tree.set_concurrent(c, true);
            tree.set_activity(c, 7);
            tree.set_active(c, false);
            parked.push(c);
        }
        // An active sibling at the same activity does not count.
        let active = tree.create_child(root);
        tree.set_concurrent(active, true);
        tree.set_activity(active, 7);
        // Nor does a parked sibling at another activity.
        let elsewhere = tree.create_child(root);
        tree.set_concurrent(elsewhere, true);
        tree.set_activity(elsewhere, 9);
        tree.set_active(elsewhere, false);

        assert_eq!(tree.inactive_concurrent_at(root, 7), parked);
    }
}
