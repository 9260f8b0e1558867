use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Node, Workflow};
use crate::browser::Page;
use crate::error::{CrawlError, CrawlResult};

/// Everything a handler needs to know about the frontier task it is
/// running against.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: String,
    pub phase_id: String,
    pub url: String,
    pub depth: u32,
}

/// A URL discovered by a handler, routed into the named phase's frontier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUrl {
    pub url: String,
    pub phase_id: String,
}

/// Outcome of one node invocation against a page.
#[derive(Debug, Default)]
pub struct ActionResult {
    pub items: Vec<serde_json::Value>,
    pub discovered: Vec<DiscoveredUrl>,
    pub warnings: Vec<String>,
}

impl ActionResult {
    pub fn merge(&mut self, other: ActionResult) {
        self.items.extend(other.items);
        self.discovered.extend(other.discovered);
        self.warnings.extend(other.warnings);
    }
}

/// Handler contract for one node type.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Schema check for the node's params; failures here reject the
    /// workflow before execution starts.
    fn validate(&self, node: &Node) -> CrawlResult<()>;

    async fn run(
        &self,
        page: &mut dyn Page,
        node: &Node,
        task: &TaskContext,
    ) -> CrawlResult<ActionResult>;
}

/// Maps a node-type name to its handler and parameter schema. Pure lookup
/// table; holds no execution state.
#[derive(Default)]
pub struct NodeRegistry {
    handlers: HashMap<&'static str, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in node types.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::nodes::NavigateHandler));
        registry.register(Arc::new(crate::nodes::ClickHandler));
        registry.register(Arc::new(crate::nodes::ExtractHandler));
        registry.register(Arc::new(crate::nodes::PaginateHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn resolve(&self, kind: &str) -> CrawlResult<Arc<dyn NodeHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| CrawlError::UnknownNodeType { node_type: kind.to_string() })
    }

    pub fn validate_node(&self, node: &Node) -> CrawlResult<()> {
        let handler = self.resolve(node.params.kind())?;
        handler.validate(node)
    }

    /// Full up-front validation: structure plus per-node schema. An entire
    /// class of mid-crawl runtime failures becomes rejection here.
    pub fn validate_workflow(&self, workflow: &Workflow) -> CrawlResult<()> {
        workflow
            .check_structure()
            .map_err(|e| CrawlError::WorkflowValidation { message: e.to_string() })?;

        for phase in &workflow.phases {
            for node in &phase.nodes {
                self.validate_node(node)?;
            }
        }
        Ok(())
    }
}
