use std::fmt;

use anyhow::Result;
use pixelstream_contracts::grounding::GroundingMetadata;
use pixelstream_contracts::request::{AspectRatio, ImageSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    /// Anything that is not `user` was said by the model.
    pub fn from_raw(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("user") {
            Self::User
        } else {
            Self::Model
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentUnit {
    Text(String),
    Inline { mime_type: String, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub units: Vec<ContentUnit>,
}

/// Request content: either a single untagged turn or a role-tagged
/// conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelContents {
    Flat(Vec<ContentUnit>),
    Turns(Vec<Turn>),
}

impl ModelContents {
    pub fn units(&self) -> Box<dyn Iterator<Item = &ContentUnit> + '_> {
        match self {
            Self::Flat(units) => Box::new(units.iter()),
            Self::Turns(turns) => Box::new(turns.iter().flat_map(|turn| turn.units.iter())),
        }
    }

    /// Concatenated text of every unit, in order.
    pub fn text(&self) -> String {
        self.units()
            .filter_map(|unit| match unit {
                ContentUnit::Text(text) => Some(text.as_str()),
                ContentUnit::Inline { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationConfig {
    pub modalities: Vec<Modality>,
    pub aspect_ratio: Option<AspectRatio>,
    pub image_size: ImageSize,
    pub search_grounding: bool,
}

/// A response part, classified once when it is read off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    ThoughtText(String),
    ThoughtImage(Vec<u8>),
    FinalText(String),
    FinalImage(Vec<u8>),
}

impl ResponsePart {
    /// Non-empty text takes precedence over inline bytes; a part with neither
    /// carries nothing.
    pub fn classify(thought: bool, text: Option<String>, image: Option<Vec<u8>>) -> Option<Self> {
        match (text.filter(|value| !value.is_empty()), image) {
            (Some(text), _) if thought => Some(Self::ThoughtText(text)),
            (Some(text), _) => Some(Self::FinalText(text)),
            (None, Some(bytes)) if thought => Some(Self::ThoughtImage(bytes)),
            (None, Some(bytes)) => Some(Self::FinalImage(bytes)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Other(String),
}

impl FinishReason {
    pub fn from_raw(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized == "STOP" {
            Self::Stop
        } else {
            Self::Other(normalized)
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("STOP"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// One streamed chunk, or the whole response in one-shot mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub parts: Vec<ResponsePart>,
    pub finish_reason: Option<FinishReason>,
    pub grounding: Option<GroundingMetadata>,
}

pub type ChunkStream<'a> = Box<dyn Iterator<Item = Result<ModelResponse>> + 'a>;

/// Transport shim over the external generation call. Implementations never
/// classify output beyond [`ResponsePart`] and never retry.
pub trait ModelClient: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_streaming<'a>(
        &'a self,
        contents: &ModelContents,
        config: &InvocationConfig,
    ) -> Result<ChunkStream<'a>>;

    fn invoke_oneshot(
        &self,
        contents: &ModelContents,
        config: &InvocationConfig,
    ) -> Result<ModelResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_text_over_bytes() {
        assert_eq!(
            ResponsePart::classify(true, Some("hmm".to_string()), Some(vec![1])),
            Some(ResponsePart::ThoughtText("hmm".to_string()))
        );
        assert_eq!(
            ResponsePart::classify(false, Some(String::new()), Some(vec![1, 2])),
            Some(ResponsePart::FinalImage(vec![1, 2]))
        );
        assert_eq!(
            ResponsePart::classify(true, None, Some(vec![3])),
            Some(ResponsePart::ThoughtImage(vec![3]))
        );
        assert_eq!(ResponsePart::classify(false, Some(String::new()), None), None);
    }

    #[test]
    fn roles_other_than_user_become_model() {
        assert_eq!(Role::from_raw("user"), Role::User);
        assert_eq!(Role::from_raw("assistant"), Role::Model);
        assert_eq!(Role::from_raw(""), Role::Model);
    }

    #[test]
    fn finish_reason_parsing() {
        assert_eq!(FinishReason::from_raw("stop"), FinishReason::Stop);
        assert_eq!(
            FinishReason::from_raw("SAFETY"),
            FinishReason::Other("SAFETY".to_string())
        );
        assert_eq!(FinishReason::from_raw("IMAGE_SAFETY").to_string(), "IMAGE_SAFETY");
    }

    #[test]
    fn contents_text_joins_turns() {
        let contents = ModelContents::Turns(vec![
            Turn {
                role: Role::User,
                units: vec![ContentUnit::Text("a".to_string())],
            },
            Turn {
                role: Role::Model,
                units: vec![
                    ContentUnit::Inline {
                        mime_type: "image/png".to_string(),
                        data: vec![0],
                    },
                    ContentUnit::Text("b".to_string()),
                ],
            },
        ]);
        assert_eq!(contents.text(), "a\nb");
        assert_eq!(contents.units().count(), 3);
    }
}
