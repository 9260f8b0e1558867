use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub mod registry;

pub use registry::NodeRegistry;

/// A multi-phase extraction workflow. Phases execute in declared order;
/// within a phase, nodes execute in declared order per page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    /// Seed URLs routed into the first phase's frontier.
    pub start_urls: Vec<String>,
    pub phases: Vec<Phase>,
}

/// An ordered stage of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub name: String,
    pub nodes: Vec<Node>,
}

/// A single typed operation applied to a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// A failing optional node degrades the task to a warning instead of
    /// routing through recovery.
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(flatten)]
    pub params: NodeParams,
}

fn default_required() -> bool {
    true
}

/// Typed per-node-type parameters, validated once at workflow load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeParams {
    #[serde(rename = "navigate")]
    Navigate {
        /// Explicit target; defaults to the frontier task's URL.
        url: Option<String>,
        wait_ms: Option<u64>,
    },
    #[serde(rename = "click")]
    Click {
        selector: String,
        wait_ms: Option<u64>,
    },
    #[serde(rename = "extract")]
    Extract {
        /// Repeating container selector; absent means extract once per page.
        item_selector: Option<String>,
        fields: Vec<FieldSpec>,
        /// Link-discovery spec; matched hrefs are enqueued into the named
        /// phase's frontier.
        discover: Option<LinkDiscovery>,
    },
    #[serde(rename = "paginate")]
    Paginate {
        next_selector: String,
        max_pages: Option<usize>,
    },
}

impl NodeParams {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Extract { .. } => "extract",
            Self::Paginate { .. } => "paginate",
        }
    }
}

/// Field extraction specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub selector: String,
    #[serde(default)]
    pub extract: ExtractMethod,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum ExtractMethod {
    #[default]
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "html")]
    Html,
    #[serde(rename = "attr")]
    Attribute { attribute: String },
    #[serde(rename = "href")]
    Href,
    #[serde(rename = "src")]
    Src,
}

/// Discovered-link routing: anchors matching `selector` feed the frontier
/// of `target_phase`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDiscovery {
    pub selector: String,
    pub target_phase: String,
}

impl Workflow {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let workflow: Workflow = serde_yaml::from_str(yaml)?;
        Ok(workflow)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let workflow: Workflow = serde_json::from_str(json)?;
        Ok(workflow)
    }

    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Structural invariants independent of the registry: node IDs unique
    /// across the workflow, phase IDs unique, discovery targets resolvable.
    pub fn check_structure(&self) -> Result<(), WorkflowError> {
        let mut phase_ids = HashSet::new();
        for phase in &self.phases {
            if !phase_ids.insert(phase.id.as_str()) {
                return Err(WorkflowError::DuplicatePhaseId(phase.id.clone()));
            }
        }

        let mut node_ids = HashSet::new();
        for phase in &self.phases {
            for node in &phase.nodes {
                if !node_ids.insert(node.id.as_str()) {
                    return Err(WorkflowError::DuplicateNodeId(node.id.clone()));
                }
                if let NodeParams::Extract { discover: Some(d), .. } = &node.params {
                    if !phase_ids.contains(d.target_phase.as_str()) {
                        return Err(WorkflowError::UnknownTargetPhase {
                            node_id: node.id.clone(),
                            phase_id: d.target_phase.clone(),
                        });
                    }
                }
            }
        }

        if self.phases.is_empty() {
            return Err(WorkflowError::NoPhases);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("duplicate phase id: {0}")]
    DuplicatePhaseId(String),

    #[error("node '{node_id}' discovers into unknown phase '{phase_id}'")]
    UnknownTargetPhase { node_id: String, phase_id: String },

    #[error("workflow has no phases")]
    NoPhases,
}
