use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

pub const DEFAULT_ATTACHMENT_MIME: &str = "application/octet-stream";

/// Finds files previously uploaded or generated, by name.
#[derive(Debug, Clone)]
pub struct AttachmentResolver {
    uploads: PathBuf,
    generated: PathBuf,
}

impl AttachmentResolver {
    pub fn new(uploads: impl Into<PathBuf>, generated: impl Into<PathBuf>) -> Self {
        Self {
            uploads: uploads.into(),
            generated: generated.into(),
        }
    }

    /// Tries `uploads/<name>` then `generated/<name>`, then the same two with
    /// any leading path stripped (`/generated/x.png` resolves to `x.png`).
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        let roots = [&self.uploads, &self.generated];
        if is_plain_relative(name) {
            if let Some(found) = roots.iter().map(|root| root.join(name)).find(|p| p.is_file()) {
                return Some(found);
            }
        }

        let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
        if base == name || !is_plain_relative(base) {
            return None;
        }
        roots
            .iter()
            .map(|root| root.join(base))
            .find(|candidate| candidate.is_file())
    }

    /// `Ok(None)` on a miss; an error only when a located file can't be read.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.locate(name) else {
            tracing::debug!("attachment {name} not found in uploads or generated");
            return Ok(None);
        };
        let bytes =
            std::fs::read(&path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Some(bytes))
    }
}

fn is_plain_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn resolver_with_roots(root: &Path) -> anyhow::Result<AttachmentResolver> {
        fs::create_dir_all(root.join("uploads"))?;
        fs::create_dir_all(root.join("generated"))?;
        Ok(AttachmentResolver::new(
            root.join("uploads"),
            root.join("generated"),
        ))
    }

    #[test]
    fn uploads_take_precedence_over_generated() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver_with_roots(temp.path())?;
        fs::write(temp.path().join("uploads/a.png"), b"upload")?;
        fs::write(temp.path().join("generated/a.png"), b"generated")?;

        assert_eq!(
            resolver.locate("a.png"),
            Some(temp.path().join("uploads/a.png"))
        );
        assert_eq!(resolver.read("a.png")?, Some(b"upload".to_vec()));
        Ok(())
    }

    #[test]
    fn path_prefix_is_stripped_on_retry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver_with_roots(temp.path())?;
        fs::write(temp.path().join("generated/edit_1.png"), b"img")?;

        assert_eq!(
            resolver.locate("/generated/edit_1.png"),
            Some(temp.path().join("generated/edit_1.png"))
        );
        assert_eq!(
            resolver.locate("some/dir/edit_1.png"),
            Some(temp.path().join("generated/edit_1.png"))
        );
        Ok(())
    }

    #[test]
    fn misses_are_not_errors() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver_with_roots(temp.path())?;
        assert_eq!(resolver.locate("missing.png"), None);
        assert_eq!(resolver.read("/uploads/missing.png")?, None);
        assert_eq!(resolver.locate("../outside.png"), None);
        assert_eq!(resolver.locate(""), None);
        Ok(())
    }

    #[test]
    fn mime_map_covers_upload_types() {
        assert_eq!(mime_for_path(Path::new("a.JPG")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("doc.pdf")), Some("application/pdf"));
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }
}
