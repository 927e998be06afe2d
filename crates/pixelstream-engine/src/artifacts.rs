use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use pixelstream_contracts::events::ArtifactRef;
use uuid::Uuid;

pub const GENERATED_ROUTE: &str = "/generated/";
pub const THOUGHT_PREFIX: &str = "thought_";
pub const EDIT_PREFIX: &str = "edit_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub filename: String,
    pub path: String,
    /// Base64 of the bytes as received, for inline delivery.
    pub base64: String,
}

impl StoredArtifact {
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            filename: self.filename.clone(),
            path: self.path.clone(),
        }
    }
}

/// Append-only image storage. Names are fresh UUIDs, so concurrent writers
/// never collide.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn persist(&self, bytes: &[u8], prefix: &str) -> Result<StoredArtifact> {
        let decoded =
            image::load_from_memory(bytes).context("model returned undecodable image data")?;
        let filename = format!("{prefix}{}.png", Uuid::new_v4());
        let output_path = self.root.join(&filename);
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        decoded
            .save_with_format(&output_path, ImageFormat::Png)
            .with_context(|| format!("failed to save {}", output_path.display()))?;
        tracing::debug!(
            "stored artifact {} ({}x{}, {} bytes received)",
            filename,
            decoded.width(),
            decoded.height(),
            bytes.len()
        );

        Ok(StoredArtifact {
            path: format!("{GENERATED_ROUTE}{filename}"),
            filename,
            base64: BASE64.encode(bytes),
        })
    }
}

#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let mut image = image::RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = image::Rgb(rgb);
    }
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png fixture");
    out.into_inner()
}
