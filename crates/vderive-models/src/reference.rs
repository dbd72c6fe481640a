//! Opaque reference tokens threaded through the dispatcher.
//!
//! Each job output carries a token naming the dedup key (and, for frames,
//! the frame index) so the completion handler can route the produced file
//! without any shared state.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DedupKey, DerivationType, FileId, FormatId};

const PREFIX: &str = "vderive:";

/// Routing data for one job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CompletionReference {
    pub kind: DerivationType,
    pub source_file_id: FileId,
    #[serde(default)]
    pub format_id: Option<FormatId>,
    /// Frame index, for frame-extraction outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl CompletionReference {
    pub fn for_key(key: &DedupKey) -> Self {
        Self {
            kind: key.kind,
            source_file_id: key.source_file_id.clone(),
            format_id: key.format_id.clone(),
            index: None,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.kind, self.source_file_id.clone(), self.format_id.clone())
    }

    /// Encode as a `vderive:{json}` token.
    pub fn encode(&self) -> String {
        // A struct of strings and integers always serializes.
        let body = serde_json::to_string(self).unwrap_or_default();
        format!("{}{}", PREFIX, body)
    }

    /// Decode a token, returning `None` for foreign or malformed tokens.
    pub fn decode(token: &str) -> Option<Self> {
        let body = token.strip_prefix(PREFIX)?;
        serde_json::from_str(body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_decodes_back() {
        let reference = CompletionReference::for_key(&DedupKey::new(
            DerivationType::FrameExtraction,
            FileId::from("src"),
            Some(FormatId::from("fmt")),
        ))
        .with_index(4);

        let token = reference.encode();
        assert!(token.starts_with("vderive:{"));
        assert_eq!(CompletionReference::decode(&token), Some(reference));
    }

    #[test]
    fn test_foreign_tokens_are_ignored() {
        assert_eq!(CompletionReference::decode("videoPlugin:{}"), None);
        assert_eq!(CompletionReference::decode("vderive:not json"), None);
        assert_eq!(CompletionReference::decode(""), None);
    }
}
