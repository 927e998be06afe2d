use serde::{Deserialize, Serialize};

const STORAGE_BUCKET_SCHEME: &str = "gs://";
const STORAGE_PUBLIC_PREFIX: &str = "https://storage.googleapis.com/";
const DEFAULT_SOURCE_TITLE: &str = "Source";

/// Search-grounding metadata as attached to a complete model response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default, alias = "web_search_queries")]
    pub web_search_queries: Vec<String>,
    #[serde(default, alias = "grounding_chunks")]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingChunk {
    #[serde(default)]
    pub web: Option<GroundingContext>,
    #[serde(default, alias = "retrieved_context")]
    pub retrieved_context: Option<GroundingContext>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroundingContext {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroundingResult {
    pub sources: Vec<GroundingSource>,
    pub search_queries: Vec<String>,
}

impl GroundingResult {
    pub fn from_metadata(metadata: Option<&GroundingMetadata>) -> Self {
        let Some(metadata) = metadata else {
            return Self::default();
        };

        let sources = metadata
            .grounding_chunks
            .iter()
            .filter_map(|chunk| chunk.web.as_ref().or(chunk.retrieved_context.as_ref()))
            .map(|context| GroundingSource {
                title: context
                    .title
                    .as_deref()
                    .filter(|title| !title.is_empty())
                    .unwrap_or(DEFAULT_SOURCE_TITLE)
                    .to_string(),
                uri: public_storage_uri(context.uri.as_deref().unwrap_or_default()),
            })
            .collect();

        Self {
            sources,
            search_queries: metadata.web_search_queries.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.search_queries.is_empty()
    }
}

/// Rewrites a storage-bucket URI to its public HTTPS form; other URIs pass
/// through untouched.
pub fn public_storage_uri(uri: &str) -> String {
    match uri.strip_prefix(STORAGE_BUCKET_SCHEME) {
        Some(rest) => format!("{STORAGE_PUBLIC_PREFIX}{rest}"),
        None => uri.to_string(),
    }
}
