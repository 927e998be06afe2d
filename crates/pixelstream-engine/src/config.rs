use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_MODEL: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VERTEX_LOCATION: &str = "global";
const DEFAULT_REQUEST_TIMEOUT_S: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeminiCredentials {
    ApiKey(String),
    Vertex {
        project: String,
        location: String,
        access_token: String,
    },
}

impl GeminiCredentials {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api-key",
            Self::Vertex { .. } => "vertex",
        }
    }
}

/// Process-wide settings, built once at startup and handed to the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub model: String,
    pub api_base: String,
    pub credentials: Option<GeminiCredentials>,
    pub request_timeout: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            credentials: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_S),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::new(
            non_empty_env("PIXELSTREAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
        );
        if let Some(model) = non_empty_env("PIXELSTREAM_MODEL") {
            config.model = model;
        }
        if let Some(api_base) = non_empty_env("GEMINI_API_BASE") {
            config.api_base = api_base.trim_end_matches('/').to_string();
        }
        if let Some(timeout_s) = non_empty_env("PIXELSTREAM_REQUEST_TIMEOUT")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
        {
            config.request_timeout = Duration::from_secs(timeout_s);
        }
        config.credentials = credentials_from_env();
        config
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn generated_dir(&self) -> PathBuf {
        self.data_dir.join("generated")
    }

    pub fn conversations_path(&self) -> PathBuf {
        self.data_dir.join("conversations.json")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.data_dir.clone(), self.uploads_dir(), self.generated_dir()] {
            create_dir(&dir)?;
        }
        Ok(())
    }
}

/// An API key wins over Vertex settings when both are present.
fn credentials_from_env() -> Option<GeminiCredentials> {
    if let Some(key) = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")) {
        return Some(GeminiCredentials::ApiKey(key));
    }
    let project = non_empty_env("GOOGLE_CLOUD_PROJECT").or_else(|| non_empty_env("PROJECT_ID"))?;
    let access_token = non_empty_env("GOOGLE_CLOUD_ACCESS_TOKEN")?;
    Some(GeminiCredentials::Vertex {
        project,
        location: non_empty_env("GOOGLE_CLOUD_LOCATION")
            .unwrap_or_else(|| DEFAULT_VERTEX_LOCATION.to_string()),
        access_token,
    })
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
