use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use uuid::Uuid;

use crate::error::Result;
use crate::runtime::context::CommandContext;
use crate::runtime::graph::{NodeIndex, ProcessGraph};

/// 运行时节点接口
///
/// One behavior instance exists per node of a deployed graph. `execute` runs when
/// a token enters the node; `trigger` when an event, a job or an API call resumes
/// an execution waiting in it.
#[async_trait]
pub trait ActivityBehavior: Send + Sync + Debug {
    async fn execute(&self, ctx: &mut CommandContext, execution: Uuid) -> Result<()>;

    fn trigger(&self, ctx: &mut CommandContext, execution: Uuid, payload: HashMap<String, Value>) -> Result<()> {
        ctx.set_variables(execution, payload)?;
        ctx.leave(execution);
        Ok(())
    }
}

/// 节点工厂/定义接口
pub trait BehaviorDefinition: Send + Sync {
    /// Matches [`FlowNodeKind::name`](crate::runtime::graph::FlowNodeKind::name).
    fn kind(&self) -> &str;
    fn prepare(&self, graph: &ProcessGraph, node: NodeIndex) -> anyhow::Result<Box<dyn ActivityBehavior>>;
}
