use anyhow::{Result, anyhow};
use std::collections::VecDeque;

use crate::dsl::{Branch, Flow, Node, NodeType, ProcessDefinition};

/// Rewrites DSL shorthand into plain BPMN nodes before compilation.
pub struct Expander;

impl Default for Expander {
    fn default() -> Self {
        Self::new()
    }
}

impl Expander {
    pub fn new() -> Self {
        Self
    }

    pub fn expand(&self, definition: ProcessDefinition) -> Result<ProcessDefinition> {
        let (nodes, flows) = self.expand_scope(definition.nodes, definition.flows)?;
        Ok(ProcessDefinition {
            nodes,
            flows,
            ..definition
        })
    }

    /// Expands one scope; sub-processes are expanded with their own flows.
    fn expand_scope(&self, nodes: Vec<Node>, flows: Vec<Flow>) -> Result<(Vec<Node>, Vec<Flow>)> {
        let mut new_nodes = Vec::new();
        let mut new_flows = flows;
        // 分支内的节点可能还是 parallel 块，所以用队列逐个处理
        let mut pending: VecDeque<Node> = nodes.into();

        while let Some(node) = pending.pop_front() {
            match node.kind {
                NodeType::Parallel { branches } => {
                    if node.asynchronous || node.multi_instance.is_some() {
                        return Err(anyhow!(
                            "Parallel block {} cannot be asynchronous or multi-instance",
                            node.id
                        ));
                    }
                    let branch_nodes = self.expand_parallel(&node.id, branches, &mut new_nodes, &mut new_flows)?;
                    pending.extend(branch_nodes);
                }
                NodeType::SubProcess {
                    triggered_by_event,
                    nodes,
                    flows,
                } => {
                    let (nodes, flows) = self.expand_scope(nodes, flows)?;
                    new_nodes.push(Node {
                        kind: NodeType::SubProcess {
                            triggered_by_event,
                            nodes,
                            flows,
                        },
                        ..node
                    });
                }
                kind => new_nodes.push(Node { kind, ..node }),
            }
        }

        Ok((new_nodes, new_flows))
    }

    /// Replaces a parallel block by `{id}_fork` and `{id}_join` gateways. Branch
    /// nodes are chained in order; the returned nodes still need expansion.
    fn expand_parallel(
        &self,
        parallel_id: &str,
        branches: Vec<Branch>,
        new_nodes: &mut Vec<Node>,
        new_flows: &mut Vec<Flow>,
    ) -> Result<Vec<Node>> {
        if branches.is_empty() {
            return Err(anyhow!("Parallel block {} has no branches", parallel_id));
        }
        let fork_id = format!("{}_fork", parallel_id);
        let join_id = format!("{}_join", parallel_id);

        // 1. 外部连线：指向 parallel 的改为指向 fork，从 parallel 出发的改为从 join 出发
        for flow in new_flows.iter_mut() {
            if flow.target == parallel_id {
                flow.target = fork_id.clone();
            }
            if flow.source == parallel_id {
                flow.source = join_id.clone();
            }
        }

        new_nodes.push(Node::new(&fork_id, NodeType::ParallelGateway));
        new_nodes.push(Node::new(&join_id, NodeType::ParallelGateway));

        let mut branch_nodes = Vec::new();
        for branch in branches {
            let (Some(head), Some(tail)) = (branch.nodes.first(), branch.nodes.last()) else {
                // 空分支直接连接 fork -> join
                new_flows.push(Flow::new(&fork_id, &join_id));
                continue;
            };

            // 2. 分支内部按顺序线性连接
            new_flows.push(Flow::new(&fork_id, &head.id));
            for pair in branch.nodes.windows(2) {
                new_flows.push(Flow::new(&pair[0].id, &pair[1].id));
            }
            new_flows.push(Flow::new(&tail.id, &join_id));
            branch_nodes.extend(branch.nodes);
        }

        Ok(branch_nodes)
    }
}
