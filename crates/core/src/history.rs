//! Typed view of ComfyUI `/history/{prompt_id}` responses.
//!
//! The history endpoint returns `{}` while a prompt is still queued or
//! running and `{"<prompt_id>": {"outputs": {...}, "status": {...}}}` once
//! it has finished. Only the output file descriptors are typed; the rest of
//! the record is left as raw JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Default `type` for an output file (ComfyUI's output directory).
pub const OUTPUT_TYPE_OUTPUT: &str = "output";

/// The finished record for one prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Output descriptors keyed by node id.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,

    #[serde(default)]
    pub status: Option<Value>,
}

/// Files declared by one output node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    /// Animated outputs (video combine nodes report these as `gifs`).
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
}

/// A file the server can serve back through `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_type")]
    pub kind: String,
}

fn default_output_type() -> String {
    OUTPUT_TYPE_OUTPUT.to_string()
}

/// Extract the entry for `prompt_id` from a raw history response.
///
/// `Ok(None)` means the prompt has not finished yet.
pub fn find_entry(history: &Value, prompt_id: &str) -> Result<Option<HistoryEntry>, CoreError> {
    let Some(raw) = history.get(prompt_id) else {
        return Ok(None);
    };

    HistoryEntry::deserialize(raw)
        .map(Some)
        .map_err(|e| CoreError::MalformedHistory(format!("prompt {prompt_id}: {e}")))
}

impl HistoryEntry {
    pub fn has_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }

    /// Every declared file, paired with its node id.
    ///
    /// Per node, `images` come before `gifs`.
    pub fn output_files(&self) -> Vec<(&str, &OutputFile)> {
        self.outputs
            .iter()
            .flat_map(|(node_id, output)| {
                output
                    .images
                    .iter()
                    .chain(output.gifs.iter())
                    .map(move |file| (node_id.as_str(), file))
            })
            .collect()
    }
}
