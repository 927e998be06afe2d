use std::path::Path;

use anyhow::Result;
use pixelstream_contracts::conversations::Message;
use pixelstream_contracts::request::{GenerationMode, NormalizedRequest};

use crate::attachments::{mime_for_path, AttachmentResolver};
use crate::model::{ContentUnit, ModelContents, Role, Turn};

const HISTORY_ATTACHMENT_MIME: &str = "image/png";

/// Builds model request content from history, prompt and attachments.
pub struct ContextAssembler<'a> {
    resolver: &'a AttachmentResolver,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(resolver: &'a AttachmentResolver) -> Self {
        Self { resolver }
    }

    pub fn assemble(&self, request: &NormalizedRequest) -> Result<ModelContents> {
        let current = self.current_units(request)?;
        if request.history.is_empty() {
            return Ok(ModelContents::Flat(current));
        }

        let mut turns = Vec::with_capacity(request.history.len() + 1);
        for message in &request.history {
            if let Some(turn) = self.history_turn(message)? {
                turns.push(turn);
            }
        }
        if !current.is_empty() {
            turns.push(Turn {
                role: Role::User,
                units: current,
            });
        }
        tracing::info!(
            "assembled {} turns ({} history messages)",
            turns.len(),
            request.history.len()
        );
        Ok(ModelContents::Turns(turns))
    }

    /// Edit requests put the source images ahead of the instruction.
    fn current_units(&self, request: &NormalizedRequest) -> Result<Vec<ContentUnit>> {
        let mut attachments = Vec::with_capacity(request.attachments.len());
        for attachment in &request.attachments {
            match self.resolver.read(&attachment.filename)? {
                Some(data) => attachments.push(ContentUnit::Inline {
                    mime_type: attachment.mime_type.clone(),
                    data,
                }),
                None => tracing::warn!(
                    "attachment {} not found, omitting it from the request",
                    attachment.filename
                ),
            }
        }

        let mut units = Vec::with_capacity(attachments.len() + 1);
        match request.mode {
            GenerationMode::Edit => {
                units.extend(attachments);
                units.push(ContentUnit::Text(request.edit_kind.instruction(&request.prompt)));
            }
            GenerationMode::Standard | GenerationMode::Search => {
                if !request.prompt.is_empty() {
                    units.push(ContentUnit::Text(request.prompt.clone()));
                }
                units.extend(attachments);
            }
        }
        Ok(units)
    }

    fn history_turn(&self, message: &Message) -> Result<Option<Turn>> {
        let mut units = Vec::new();
        if let Some(text) = message.text.as_deref().filter(|text| !text.is_empty()) {
            units.push(ContentUnit::Text(text.to_string()));
        }
        if let Some(reference) = message.attachment.as_deref().filter(|value| !value.is_empty()) {
            if let Some(data) = self.resolver.read(reference)? {
                let mime_type = mime_for_path(Path::new(reference))
                    .unwrap_or(HISTORY_ATTACHMENT_MIME)
                    .to_string();
                units.push(ContentUnit::Inline { mime_type, data });
            }
        }
        if units.is_empty() {
            return Ok(None);
        }
        Ok(Some(Turn {
            role: Role::from_raw(&message.role),
            units,
        }))
    }
}
