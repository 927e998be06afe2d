use std::io::{BufRead, BufReader, Lines};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pixelstream_contracts::grounding::GroundingMetadata;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::{EngineConfig, GeminiCredentials};
use crate::model::{
    ChunkStream, ContentUnit, FinishReason, InvocationConfig, ModelClient, ModelContents,
    ModelResponse, ResponsePart, Turn,
};

const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiClient {
    model: String,
    api_base: String,
    credentials: GeminiCredentials,
    http: HttpClient,
}

impl GeminiClient {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let Some(credentials) = config.credentials.clone() else {
            bail!(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set \
                 (or GOOGLE_CLOUD_PROJECT with GOOGLE_CLOUD_ACCESS_TOKEN for Vertex AI)"
            );
        };
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build Gemini HTTP client")?;
        tracing::info!(
            "Gemini client ready (model: {}, transport: {})",
            config.model,
            credentials.label()
        );
        Ok(Self {
            model: config.model.clone(),
            api_base: config.api_base.clone(),
            credentials,
            http,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        let trimmed = self.model.trim();
        match &self.credentials {
            GeminiCredentials::ApiKey(_) => {
                let model_path = if trimmed.starts_with("models/") {
                    trimmed.to_string()
                } else {
                    format!("models/{trimmed}")
                };
                format!("{}/{}:{}", self.api_base, model_path, method)
            }
            GeminiCredentials::Vertex {
                project, location, ..
            } => {
                let host = if location == "global" {
                    "https://aiplatform.googleapis.com".to_string()
                } else {
                    format!("https://{location}-aiplatform.googleapis.com")
                };
                format!(
                    "{host}/v1/projects/{project}/locations/{location}/publishers/google/models/{trimmed}:{method}"
                )
            }
        }
    }

    fn request(&self, method: &str, payload: &Value, streaming: bool) -> RequestBuilder {
        let mut request = self.http.post(self.endpoint(method)).json(payload);
        if streaming {
            request = request.query(&[("alt", "sse")]);
        }
        match &self.credentials {
            GeminiCredentials::ApiKey(key) => request.header(API_KEY_HEADER, key.as_str()),
            GeminiCredentials::Vertex { access_token, .. } => request.bearer_auth(access_token),
        }
    }

    fn post(&self, method: &str, payload: &Value, streaming: bool) -> Result<HttpResponse> {
        let endpoint = self.endpoint(method);
        tracing::debug!("POST {endpoint}");
        let response = self
            .request(method, payload, streaming)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        ensure_success(response)
    }
}

impl ModelClient for GeminiClient {
    fn name(&self) -> &str {
        &self.model
    }

    fn invoke_streaming<'a>(
        &'a self,
        contents: &ModelContents,
        config: &InvocationConfig,
    ) -> Result<ChunkStream<'a>> {
        let payload = build_payload(contents, config);
        let response = self.post("streamGenerateContent", &payload, true)?;
        Ok(Box::new(SseChunks::new(BufReader::new(response))))
    }

    fn invoke_oneshot(
        &self,
        contents: &ModelContents,
        config: &InvocationConfig,
    ) -> Result<ModelResponse> {
        let payload = build_payload(contents, config);
        let response = self.post("generateContent", &payload, false)?;
        let body = response
            .text()
            .map_err(reqwest::Error::without_url)
            .context("Gemini response body read failed")?;
        parse_response(&body)
    }
}

pub(crate) fn build_payload(contents: &ModelContents, config: &InvocationConfig) -> Value {
    let contents = match contents {
        ModelContents::Flat(units) => vec![json!({
            "role": "user",
            "parts": units.iter().map(part_value).collect::<Vec<_>>(),
        })],
        ModelContents::Turns(turns) => turns.iter().map(turn_value).collect(),
    };

    let mut image_config = Map::new();
    if let Some(aspect_ratio) = config.aspect_ratio {
        image_config.insert(
            "aspectRatio".to_string(),
            Value::String(aspect_ratio.as_str().to_string()),
        );
    }
    image_config.insert(
        "imageSize".to_string(),
        Value::String(config.image_size.as_str().to_string()),
    );

    let mut payload = Map::new();
    payload.insert("contents".to_string(), Value::Array(contents));
    payload.insert(
        "generationConfig".to_string(),
        json!({
            "responseModalities": config
                .modalities
                .iter()
                .map(|modality| modality.as_str())
                .collect::<Vec<_>>(),
            "imageConfig": Value::Object(image_config),
        }),
    );
    if config.search_grounding {
        payload.insert("tools".to_string(), json!([{ "googleSearch": {} }]));
    }
    Value::Object(payload)
}

fn turn_value(turn: &Turn) -> Value {
    json!({
        "role": turn.role.as_str(),
        "parts": turn.units.iter().map(part_value).collect::<Vec<_>>(),
    })
}

fn part_value(unit: &ContentUnit) -> Value {
    match unit {
        ContentUnit::Text(text) => json!({ "text": text }),
        ContentUnit::Inline { mime_type, data } => json!({
            "inlineData": {
                "mimeType": mime_type,
                "data": BASE64.encode(data),
            }
        }),
    }
}

fn ensure_success(response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    bail!(
        "Gemini request failed ({}): {}",
        status.as_u16(),
        truncate_body(&body, 512)
    );
}

fn truncate_body(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default, alias = "finish_reason")]
    finish_reason: Option<String>,
    #[serde(default, alias = "grounding_metadata")]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "inline_data")]
    inline_data: Option<WireInlineData>,
    #[serde(default)]
    thought: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct WireInlineData {
    #[serde(default)]
    data: String,
}

impl WireResponse {
    /// Only the first candidate is read.
    fn into_model_response(self) -> Result<ModelResponse> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Ok(ModelResponse::default());
        };

        let mut parts = Vec::new();
        for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
            let image = match part.inline_data.filter(|inline| !inline.data.is_empty()) {
                Some(inline) => Some(
                    BASE64
                        .decode(inline.data.as_bytes())
                        .context("Gemini image base64 decode failed")?,
                ),
                None => None,
            };
            if let Some(classified) =
                ResponsePart::classify(part.thought.unwrap_or(false), part.text, image)
            {
                parts.push(classified);
            }
        }

        Ok(ModelResponse {
            parts,
            finish_reason: candidate
                .finish_reason
                .as_deref()
                .map(FinishReason::from_raw),
            grounding: candidate.grounding_metadata,
        })
    }
}

fn parse_response(raw: &str) -> Result<ModelResponse> {
    let wire: WireResponse =
        serde_json::from_str(raw).context("Gemini returned invalid JSON payload")?;
    wire.into_model_response()
}

/// Lazily reads `data:` frames off a server-sent-event body, one model
/// response chunk per frame.
pub(crate) struct SseChunks<R: BufRead> {
    lines: Lines<R>,
    done: bool,
}

impl<R: BufRead> SseChunks<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            done: false,
        }
    }

    fn next_frame(&mut self) -> Result<Option<String>> {
        let mut data = String::new();
        loop {
            let Some(line) = self.lines.next() else {
                self.done = true;
                return Ok((!data.is_empty()).then_some(data));
            };
            let line = line.context("Gemini stream read failed")?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                if data.is_empty() {
                    continue;
                }
                return Ok(Some(data));
            }
            if let Some(payload) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(payload.trim_start());
            }
        }
    }
}

impl<R: BufRead> Iterator for SseChunks<R> {
    type Item = Result<ModelResponse>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.next_frame() {
                Ok(Some(frame)) if frame.trim() == "[DONE]" => continue,
                Ok(Some(frame)) => return Some(parse_response(&frame)),
                Ok(None) => return None,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}
