use anyhow::{anyhow, Context as AnyhowContext, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::actions::ServiceHandler;
use crate::runtime::graph::{FlowNodeKind, ProcessGraph};
use crate::runtime::node::{ActivityBehavior, BehaviorDefinition};

pub type PreparedBehaviors = Arc<Vec<Box<dyn ActivityBehavior>>>;

/// A versioned graph with its behaviors, not yet visible to the engine.
pub struct Deployment {
    pub graph: Arc<ProcessGraph>,
    behaviors: PreparedBehaviors,
}

/// Deployed graphs and the behavior instances prepared for them.
#[derive(Default)]
pub struct Repository {
    // Deployment key (`key:version`) -> graph
    graphs: DashMap<String, Arc<ProcessGraph>>,
    // Process key -> latest deployed version
    latest: DashMap<String, u32>,
    // Deployment key -> one behavior per node
    behaviors: DashMap<String, PreparedBehaviors>,
    // Node kind -> factory
    definitions: DashMap<String, Arc<dyn BehaviorDefinition>>,
    handlers: DashMap<String, Arc<dyn ServiceHandler>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_definition(&self, definition: Arc<dyn BehaviorDefinition>) {
        self.definitions.insert(definition.kind().to_string(), definition);
    }

    pub fn register_handler(&self, handler: Arc<dyn ServiceHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(name).map(|h| h.clone())
    }

    /// Assigns the next version and prepares behaviors. Nothing is registered
    /// until the deployment is published.
    pub fn prepare(&self, mut graph: ProcessGraph) -> Result<Deployment> {
        graph.version = self.latest.get(&graph.key).map(|v| *v).unwrap_or(0) + 1;

        let mut behaviors = Vec::with_capacity(graph.nodes.len());
        for (index, node) in graph.nodes.iter().enumerate() {
            if let FlowNodeKind::ServiceTask { handler, params, .. } = &node.kind {
                let service = self
                    .handler(handler)
                    .ok_or_else(|| anyhow!("Service handler not found: {} (node {})", handler, node.id))?;
                let params = serde_json::to_value(params)?;
                service
                    .validate(&params)
                    .with_context(|| format!("Invalid parameters for node {}", node.id))?;
            }

            let kind = node.kind.name();
            let definition = self
                .definitions
                .get(kind)
                .map(|d| d.clone())
                .ok_or_else(|| anyhow!("Behavior definition not found: {}", kind))?;
            behaviors.push(
                definition
                    .prepare(&graph, index)
                    .with_context(|| format!("Failed to prepare node {}", node.id))?,
            );
        }

        Ok(Deployment {
            graph: Arc::new(graph),
            behaviors: Arc::new(behaviors),
        })
    }

    /// Makes a prepared deployment the latest version of its key.
    pub fn publish(&self, deployment: Deployment) -> Arc<ProcessGraph> {
        let Deployment { graph, behaviors } = deployment;
        let deployment_key = graph.deployment_key();
        self.behaviors.insert(deployment_key.clone(), behaviors);
        self.graphs.insert(deployment_key.clone(), graph.clone());
        self.latest.insert(graph.key.clone(), graph.version);

        info!(deployment = %deployment_key, nodes = graph.nodes.len(), "Process deployed");
        graph
    }

    pub fn graph(&self, deployment_key: &str) -> Option<Arc<ProcessGraph>> {
        self.graphs.get(deployment_key).map(|g| g.clone())
    }

    pub fn latest(&self, key: &str) -> Option<Arc<ProcessGraph>> {
        let version = *self.latest.get(key)?;
        self.graph(&format!("{}:{}", key, version))
    }

    pub fn latest_graphs(&self) -> Vec<Arc<ProcessGraph>> {
        let mut keys: Vec<String> = self.latest.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys.iter().filter_map(|key| self.latest(key)).collect()
    }

    pub fn behaviors(&self, deployment_key: &str) -> Option<PreparedBehaviors> {
        self.behaviors.get(deployment_key).map(|b| b.clone())
    }
}

