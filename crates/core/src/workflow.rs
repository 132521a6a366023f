//! Workflow document model and patching.
//!
//! A workflow is the job graph posted to ComfyUI's `/prompt` endpoint: a
//! JSON object keyed by node id. Nodes are typed only as far as the
//! patcher needs (`inputs`, `class_type`); every other key is carried
//! through serialization untouched.

use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Input key holding the uploaded image reference on a `LoadImage` node.
pub const INPUT_IMAGE: &str = "image";
/// Input key holding a sampler seed.
pub const INPUT_SEED: &str = "seed";

/// Node that receives the uploaded image when nothing else is configured.
pub const DEFAULT_IMAGE_NODE_ID: &str = "94";

/// Lower bound (inclusive) for generated seeds.
pub const MIN_SEED: u64 = 1;
/// Upper bound (inclusive) for generated seeds.
pub const MAX_SEED: u64 = 1_000_000_000_000_000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One node of a workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Open input payload. Absent on some utility nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_type: Option<String>,

    /// Everything else (`_meta`, custom keys).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeDefinition {
    /// Look up a single input value.
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.as_ref().and_then(|inputs| inputs.get(key))
    }

    /// Whether this node carries a `seed` input.
    pub fn has_seed(&self) -> bool {
        self.input(INPUT_SEED).is_some()
    }
}

/// A workflow graph keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowDocument {
    nodes: BTreeMap<String, NodeDefinition>,
}

/// Summary of what [`WorkflowDocument::patch`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchReport {
    /// `false` when the image node was missing from the document.
    pub image_bound: bool,
    /// The seed written to every seeded node.
    pub seed: u64,
    /// Number of nodes whose seed was overwritten.
    pub seeds_updated: usize,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl WorkflowDocument {
    /// Parse a workflow from its JSON text.
    pub fn parse(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidWorkflow(e.to_string()))
    }

    /// Read and parse a workflow file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let doc = Self::parse(&json)?;
        tracing::info!(path = %path.display(), nodes = doc.len(), "Loaded workflow");
        Ok(doc)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(node_id)
    }

    /// Iterate nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeDefinition)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }
}

// ---------------------------------------------------------------------------
// Patching
// ---------------------------------------------------------------------------

impl WorkflowDocument {
    /// Point `node_id`'s `inputs.image` at an uploaded file reference.
    ///
    /// A missing node is not an error: a warning is logged, the document
    /// is left as-is and `false` is returned.
    pub fn bind_image(&mut self, node_id: &str, reference: &str) -> bool {
        let Some(node) = self.nodes.get_mut(node_id) else {
            tracing::warn!(
                node_id,
                "Image node not found in workflow, input image was not bound"
            );
            return false;
        };

        node.inputs
            .get_or_insert_with(Map::new)
            .insert(INPUT_IMAGE.to_string(), Value::String(reference.to_string()));

        tracing::info!(node_id, reference, "Bound input image");
        true
    }

    /// Overwrite every `inputs.seed` in the document with `seed`.
    ///
    /// Returns the number of nodes changed. A node is selected purely by
    /// the presence of the key, whatever its class.
    pub fn randomize_seeds(&mut self, seed: u64) -> usize {
        let mut count = 0;
        for inputs in self.nodes.values_mut().filter_map(|n| n.inputs.as_mut()) {
            if let Some(value) = inputs.get_mut(INPUT_SEED) {
                *value = Value::from(seed);
                count += 1;
            }
        }
        count
    }

    /// Bind the uploaded image and apply one shared seed.
    pub fn patch(&mut self, image_node_id: &str, reference: &str, seed: u64) -> PatchReport {
        let image_bound = self.bind_image(image_node_id, reference);
        let seeds_updated = self.randomize_seeds(seed);

        tracing::info!(seed, count = seeds_updated, "Randomized workflow seeds");

        PatchReport {
            image_bound,
            seed,
            seeds_updated,
        }
    }
}

/// Draw a seed in `MIN_SEED..=MAX_SEED`.
pub fn generate_seed<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    rng.random_range(MIN_SEED..=MAX_SEED)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
