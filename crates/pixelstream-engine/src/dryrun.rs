use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use pixelstream_contracts::grounding::{GroundingChunk, GroundingContext, GroundingMetadata};
use sha2::{Digest, Sha256};

use crate::model::{
    ChunkStream, FinishReason, InvocationConfig, Modality, ModelClient, ModelContents,
    ModelResponse, ResponsePart,
};

pub const DRYRUN_MODEL: &str = "dryrun";
const LONG_SIDE: u32 = 256;
const THOUGHT_SIDE: u32 = 32;

/// Offline client: answers with a solid-colour image derived from the prompt.
#[derive(Debug, Default, Clone)]
pub struct DryrunClient;

impl DryrunClient {
    pub fn new() -> Self {
        Self
    }

    fn chunks(&self, contents: &ModelContents, config: &InvocationConfig) -> Result<Vec<ModelResponse>> {
        let prompt = contents.text();
        let (r, g, b) = color_from_prompt(&prompt);
        let (width, height) = dims_for(config);

        let mut chunks = vec![ModelResponse {
            parts: vec![
                ResponsePart::ThoughtText(format!("Planning a {width}x{height} composition. ")),
                ResponsePart::ThoughtImage(encode_png(
                    THOUGHT_SIDE,
                    THOUGHT_SIDE,
                    [r / 2, g / 2, b / 2],
                )?),
            ],
            ..ModelResponse::default()
        }];
        if config.modalities.contains(&Modality::Text) {
            chunks.push(ModelResponse {
                parts: vec![ResponsePart::FinalText(format!(
                    "Dry run render for: {}",
                    prompt.lines().last().unwrap_or_default()
                ))],
                ..ModelResponse::default()
            });
        }
        chunks.push(ModelResponse {
            parts: vec![ResponsePart::FinalImage(encode_png(width, height, [r, g, b])?)],
            finish_reason: Some(FinishReason::Stop),
            grounding: None,
        });
        Ok(chunks)
    }
}

impl ModelClient for DryrunClient {
    fn name(&self) -> &str {
        DRYRUN_MODEL
    }

    fn invoke_streaming<'a>(
        &'a self,
        contents: &ModelContents,
        config: &InvocationConfig,
    ) -> Result<ChunkStream<'a>> {
        let chunks = self.chunks(contents, config)?;
        Ok(Box::new(chunks.into_iter().map(Ok)))
    }

    fn invoke_oneshot(
        &self,
        contents: &ModelContents,
        config: &InvocationConfig,
    ) -> Result<ModelResponse> {
        let mut merged = ModelResponse {
            finish_reason: Some(FinishReason::Stop),
            ..ModelResponse::default()
        };
        for chunk in self.chunks(contents, config)? {
            merged.parts.extend(chunk.parts);
        }
        if config.search_grounding {
            merged.grounding = Some(GroundingMetadata {
                web_search_queries: vec![contents.text()],
                grounding_chunks: vec![GroundingChunk {
                    web: Some(GroundingContext {
                        title: Some("Dry run".to_string()),
                        uri: Some("https://example.com/dryrun".to_string()),
                    }),
                    retrieved_context: None,
                }],
            });
        }
        Ok(merged)
    }
}

fn dims_for(config: &InvocationConfig) -> (u32, u32) {
    let Some((w, h)) = config
        .aspect_ratio
        .and_then(|ratio| ratio.as_str().split_once(':'))
        .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)))
        .filter(|(w, h)| *w > 0 && *h > 0)
    else {
        return (LONG_SIDE, LONG_SIDE);
    };
    if w >= h {
        (LONG_SIDE, (LONG_SIDE * h / w).max(1))
    } else {
        ((LONG_SIDE * w / h).max(1), LONG_SIDE)
    }
}

fn encode_png(width: u32, height: u32, rgb: [u8; 3]) -> Result<Vec<u8>> {
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb(rgb);
    }
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Png)
        .context("failed to encode dry run image")?;
    Ok(bytes.into_inner())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
