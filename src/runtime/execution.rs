use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::graph::{FlowIndex, NodeIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    ProcessInstance,
    SubProcess,
    /// Wraps an activity that has boundary events: one child runs the activity,
    /// one inactive child per boundary event waits for its trigger.
    BoundaryHost,
    MultiInstanceRoot,
}

/// 执行令牌 (a token of control flow inside a process instance)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Call activity execution that started this process instance.
    pub super_execution_id: Option<Uuid>,
    /// Process instance started by this call activity execution.
    pub sub_instance_id: Option<Uuid>,
    pub children: Vec<Uuid>,
    pub graph_key: String,
    pub current_node: Option<NodeIndex>,
    /// Flow taken to reach `current_node`, until the node is entered.
    pub current_flow: Option<FlowIndex>,
    pub scope: Option<ScopeKind>,
    pub is_active: bool,
    pub variables: HashMap<String, Value>,
    pub business_key: Option<String>,
    /// Open historic activity instance of the node this execution runs.
    pub activity_instance_id: Option<Uuid>,
    /// Set on compensation handler executions: the execution that threw the compensation.
    pub compensation_of: Option<Uuid>,
    /// Set on a throwing execution: handlers still to run, in order.
    pub pending_compensation: Vec<NodeIndex>,
    pub start_time: DateTime<Utc>,
}

impl Execution {
    pub fn is_scope(&self, kind: ScopeKind) -> bool {
        self.scope == Some(kind)
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Process instance roots and sub-process scopes own the tokens moving through them.
    pub fn is_flow_scope(&self) -> bool {
        matches!(self.scope, Some(ScopeKind::ProcessInstance | ScopeKind::SubProcess))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTree {
    executions: HashMap<Uuid, Execution>,
}

impl ExecutionTree {
    pub fn get(&self, id: Uuid) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Execution> {
        self.executions.get_mut(&id)
    }

    pub fn require(&self, id: Uuid) -> Result<&Execution> {
        self.executions.get(&id).ok_or(EngineError::ExecutionNotFound(id))
    }

    pub fn require_mut(&mut self, id: Uuid) -> Result<&mut Execution> {
        self.executions.get_mut(&id).ok_or(EngineError::ExecutionNotFound(id))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn process_instances(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values().filter(|e| e.is_process_instance())
    }

    pub fn create_process_instance(
        &mut self,
        graph_key: &str,
        business_key: Option<String>,
        variables: HashMap<String, Value>,
        super_execution_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.executions.insert(
            id,
            Execution {
                id,
                process_instance_id: id,
                parent_id: None,
                super_execution_id,
                sub_instance_id: None,
                children: Vec::new(),
                graph_key: graph_key.to_string(),
                current_node: None,
                current_flow: None,
                scope: Some(ScopeKind::ProcessInstance),
                is_active: false,
                variables,
                business_key,
                activity_instance_id: None,
                compensation_of: None,
                pending_compensation: Vec::new(),
                start_time: now,
            },
        );
        id
    }

    /// New active, non-scope child positioned where the parent is.
    pub fn create_child(&mut self, parent_id: Uuid, now: DateTime<Utc>) -> Result<Uuid> {
        let parent = self.require_mut(parent_id)?;
        let id = Uuid::new_v4();
        parent.children.push(id);
        let child = Execution {
            id,
            process_instance_id: parent.process_instance_id,
            parent_id: Some(parent_id),
            super_execution_id: None,
            sub_instance_id: None,
            children: Vec::new(),
            graph_key: parent.graph_key.clone(),
            current_node: parent.current_node,
            current_flow: None,
            scope: None,
            is_active: true,
            variables: HashMap::new(),
            business_key: parent.business_key.clone(),
            activity_instance_id: None,
            compensation_of: None,
            pending_compensation: Vec::new(),
            start_time: now,
        };
        self.executions.insert(id, child);
        Ok(id)
    }

    pub fn children(&self, id: Uuid) -> Vec<Uuid> {
        self.executions
            .get(&id)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    /// The execution and all its descendants, children before parents.
    pub fn subtree(&self, id: Uuid) -> Vec<Uuid> {
        let mut ordered = Vec::new();
        self.collect_post_order(id, &mut ordered);
        ordered
    }

    fn collect_post_order(&self, id: Uuid, out: &mut Vec<Uuid>) {
        if let Some(execution) = self.executions.get(&id) {
            for &child in &execution.children {
                self.collect_post_order(child, out);
            }
            out.push(id);
        }
    }

    /// Depth-first, in creation order.
    pub fn instance_executions(&self, process_instance_id: Uuid) -> Vec<&Execution> {
        let mut ordered = Vec::new();
        let mut stack = vec![process_instance_id];
        while let Some(id) = stack.pop() {
            if let Some(execution) = self.executions.get(&id) {
                ordered.push(execution);
                stack.extend(execution.children.iter().rev().copied());
            }
        }
        ordered
    }

    /// Removes a single execution and unlinks it from its parent.
    pub fn remove(&mut self, id: Uuid) -> Option<Execution> {
        let removed = self.executions.remove(&id)?;
        if let Some(parent) = removed.parent_id.and_then(|p| self.executions.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        Some(removed)
    }

    /// Nearest ancestor that is a process instance or sub-process scope.
    pub fn enclosing_scope(&self, id: Uuid) -> Result<Uuid> {
        let mut current = self.require(id)?.parent_id;
        while let Some(candidate) = current {
            let execution = self.require(candidate)?;
            if execution.is_flow_scope() {
                return Ok(candidate);
            }
            current = execution.parent_id;
        }
        Err(EngineError::illegal(format!("execution {} has no enclosing scope", id)))
    }

    pub fn get_variable(&self, id: Uuid, name: &str) -> Option<Value> {
        let mut current = Some(id);
        while let Some(candidate) = current {
            let execution = self.executions.get(&candidate)?;
            if let Some(value) = execution.variables.get(name) {
                return Some(value.clone());
            }
            current = execution.parent_id;
        }
        None
    }

    /// Variables visible from an execution; deeper definitions shadow outer ones.
    pub fn visible_variables(&self, id: Uuid) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(candidate) = current {
            match self.executions.get(&candidate) {
                Some(execution) => {
                    chain.push(execution);
                    current = execution.parent_id;
                }
                None => break,
            }
        }

        let mut merged = HashMap::new();
        for execution in chain.into_iter().rev() {
            for (key, value) in &execution.variables {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Stores on the nearest execution already holding `name`, otherwise on the
    /// process instance. Returns the execution written to.
    pub fn set_variable(&mut self, id: Uuid, name: &str, value: Value) -> Result<Uuid> {
        let mut current = Some(id);
        let mut root = id;
        while let Some(candidate) = current {
            let execution = self.require(candidate)?;
            if execution.variables.contains_key(name) {
                root = candidate;
                break;
            }
            root = candidate;
            current = execution.parent_id;
        }
        self.require_mut(root)?.variables.insert(name.to_string(), value);
        Ok(root)
    }

    pub fn set_variable_local(&mut self, id: Uuid, name: &str, value: Value) -> Result<()> {
        self.require_mut(id)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn remove_variable_local(&mut self, id: Uuid, name: &str) -> Option<Value> {
        self.executions.get_mut(&id)?.variables.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> (ExecutionTree, Uuid, Uuid, Uuid) {
        let mut tree = ExecutionTree::default();
        let now = Utc::now();
        let root = tree.create_process_instance("p:1", None, HashMap::from([("a".to_string(), json!(1))]), None, now);
        let scope = tree.create_child(root, now).unwrap();
        tree.require_mut(scope).unwrap().scope = Some(ScopeKind::SubProcess);
        let leaf = tree.create_child(scope, now).unwrap();
        (tree, root, scope, leaf)
    }

    #[test]
    fn set_variable_targets_defining_ancestor_or_root() {
        let (mut tree, root, scope, leaf) = tree();
        tree.set_variable_local(scope, "local", json!("x")).unwrap();

        assert_eq!(tree.set_variable(leaf, "local", json!("y")).unwrap(), scope);
        assert_eq!(tree.set_variable(leaf, "fresh", json!(true)).unwrap(), root);
        assert_eq!(tree.get_variable(leaf, "local"), Some(json!("y")));
        assert_eq!(tree.get_variable(root, "local"), None);
    }

    #[test]
    fn local_variables_shadow_outer_ones() {
        let (mut tree, _root, scope, leaf) = tree();
        tree.set_variable_local(scope, "a", json!(2)).unwrap();
        let visible = tree.visible_variables(leaf);
        assert_eq!(visible.get("a"), Some(&json!(2)));
    }

    #[test]
    fn enclosing_scope_skips_plain_tokens() {
        let (tree, root, scope, leaf) = tree();
        assert_eq!(tree.enclosing_scope(leaf).unwrap(), scope);
        assert_eq!(tree.enclosing_scope(scope).unwrap(), root);
        assert!(tree.enclosing_scope(root).is_err());
    }

    #[test]
    fn subtree_lists_children_first() {
        let (mut tree, root, scope, leaf) = tree();
        assert_eq!(tree.subtree(root), vec![leaf, scope, root]);
        tree.remove(leaf);
        assert!(tree.children(scope).is_empty());
    }
}
