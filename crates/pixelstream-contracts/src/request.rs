use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversations::Message;

pub const VALID_ASPECT_RATIOS: [&str; 10] = [
    "1:1", "3:2", "2:3", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
];
pub const VALID_IMAGE_SIZES: [&str; 3] = ["1K", "2K", "4K"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a prompt or at least one attachment is required")]
    EmptyRequest,
    #[error("a prompt is required in {0} mode")]
    MissingPrompt(GenerationMode),
    #[error("edit mode requires at least one image attachment")]
    MissingEditSource,
    #[error("unknown generation mode '{0}'")]
    UnknownMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    Standard,
    Search,
    Edit,
}

impl GenerationMode {
    pub const ALL: [GenerationMode; 3] = [Self::Standard, Self::Search, Self::Edit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Search => "search",
            Self::Edit => "edit",
        }
    }

    /// Search grounding metadata only exists on a complete response.
    pub fn is_oneshot(&self) -> bool {
        matches!(self, Self::Search)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownMode(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    #[default]
    General,
    Translate,
    Style,
}

impl EditKind {
    /// Unknown edit subtypes fall back to a plain instruction.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("translate") => Self::Translate,
            Some("style") => Self::Style,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Translate => "translate",
            Self::Style => "style",
        }
    }

    pub fn instruction(&self, prompt: &str) -> String {
        match self {
            Self::General => prompt.to_string(),
            Self::Translate => format!(
                "Translate or convert the text in the image into the following language, \
                 keeping every other element of the image unchanged: {prompt}"
            ),
            Self::Style => format!(
                "Restyle the image as follows while keeping its main content unchanged: {prompt}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AspectRatio(&'static str);

impl AspectRatio {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        VALID_ASPECT_RATIOS
            .iter()
            .find(|candidate| **candidate == trimmed)
            .copied()
            .map(Self)
    }

    pub fn normalize(raw: Option<&str>) -> Self {
        raw.and_then(Self::parse).unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self(VALID_ASPECT_RATIOS[0])
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageSize {
    #[default]
    OneK,
    TwoK,
    FourK,
}

impl ImageSize {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1K" => Some(Self::OneK),
            "2K" => Some(Self::TwoK),
            "4K" => Some(Self::FourK),
            _ => None,
        }
    }

    pub fn normalize(raw: Option<&str>) -> Self {
        raw.and_then(Self::parse).unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneK => "1K",
            Self::TwoK => "2K",
            Self::FourK => "4K",
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub mime_type: String,
}

/// Inbound generation request as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, alias = "files")]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub image_size: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub edit_type: Option<String>,
    #[serde(default = "default_include_text")]
    pub include_text: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub mode: GenerationMode,
    pub prompt: String,
    pub attachments: Vec<AttachmentRef>,
    /// `None` only in edit mode when no valid ratio was given, so the source
    /// proportions are kept.
    pub aspect_ratio: Option<AspectRatio>,
    pub image_size: ImageSize,
    pub history: Vec<Message>,
    pub edit_kind: EditKind,
    pub include_text: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            attachments: Vec::new(),
            aspect_ratio: None,
            image_size: None,
            mode: default_mode(),
            history: Vec::new(),
            edit_type: None,
            include_text: default_include_text(),
        }
    }

    pub fn normalize(self) -> Result<NormalizedRequest, ValidationError> {
        let mode = self.mode.parse::<GenerationMode>()?;
        let has_prompt = !self.prompt.trim().is_empty();
        match mode {
            GenerationMode::Standard => {
                if !has_prompt && self.attachments.is_empty() {
                    return Err(ValidationError::EmptyRequest);
                }
            }
            GenerationMode::Search => {
                if !has_prompt {
                    return Err(ValidationError::MissingPrompt(mode));
                }
            }
            GenerationMode::Edit => {
                if self.attachments.is_empty() {
                    return Err(ValidationError::MissingEditSource);
                }
                if !has_prompt {
                    return Err(ValidationError::MissingPrompt(mode));
                }
            }
        }

        let aspect_ratio = match mode {
            GenerationMode::Edit => self.aspect_ratio.as_deref().and_then(AspectRatio::parse),
            _ => Some(AspectRatio::normalize(self.aspect_ratio.as_deref())),
        };

        Ok(NormalizedRequest {
            mode,
            prompt: self.prompt,
            attachments: self.attachments,
            aspect_ratio,
            image_size: ImageSize::normalize(self.image_size.as_deref()),
            history: self.history,
            edit_kind: EditKind::from_raw(self.edit_type.as_deref()),
            include_text: self.include_text,
        })
    }
}

/// Choices a client may offer for a generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOptions {
    pub aspect_ratios: Vec<&'static str>,
    pub image_sizes: Vec<&'static str>,
    pub modes: Vec<&'static str>,
}

impl GenerationOptions {
    pub fn catalog() -> Self {
        Self {
            aspect_ratios: VALID_ASPECT_RATIOS.to_vec(),
            image_sizes: VALID_IMAGE_SIZES.to_vec(),
            modes: GenerationMode::ALL.iter().map(GenerationMode::as_str).collect(),
        }
    }
}

fn default_mode() -> String {
    GenerationMode::Standard.as_str().to_string()
}

fn default_include_text() -> bool {
    true
}
