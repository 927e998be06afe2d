pub mod artifacts;
pub mod attachments;
pub mod config;
pub mod context;
pub mod demux;
pub mod dryrun;
pub mod gemini;
pub mod model;

use anyhow::Result;
use pixelstream_contracts::events::{EventSink, StreamEvent};
use pixelstream_contracts::request::{
    GenerationMode, GenerationRequest, NormalizedRequest, ValidationError,
};

pub use artifacts::{ArtifactStore, StoredArtifact, GENERATED_ROUTE};
pub use attachments::{mime_for_path, AttachmentResolver, DEFAULT_ATTACHMENT_MIME};
pub use config::{EngineConfig, GeminiCredentials};
pub use context::ContextAssembler;
pub use demux::{DemuxOutcome, DemuxSettings, GenerationSummary, StreamDemuxer, StreamFault};
pub use dryrun::{DryrunClient, DRYRUN_MODEL};
pub use gemini::GeminiClient;
pub use model::{FinishReason, InvocationConfig, Modality, ModelClient, ModelContents};

const ERROR_MESSAGE_MAX_CHARS: usize = 512;

/// How a generation stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(GenerationSummary),
    PolicyBlocked,
    Interrupted(FinishReason),
    /// A terminal `error` event carrying this message was emitted.
    Failed(String),
    /// The consumer went away; nothing more was sent.
    Abandoned,
}

impl StreamOutcome {
    pub fn summary(&self) -> Option<&GenerationSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

pub fn build_model_client(config: &EngineConfig) -> Result<Box<dyn ModelClient>> {
    if config.model.trim().eq_ignore_ascii_case(DRYRUN_MODEL) {
        tracing::info!("using offline dry run model client");
        return Ok(Box::new(DryrunClient::new()));
    }
    Ok(Box::new(GeminiClient::from_config(config)?))
}

/// One engine per process; every `run` call gets its own demultiplexer.
pub struct GenerationEngine {
    client: Box<dyn ModelClient>,
    artifacts: ArtifactStore,
    resolver: AttachmentResolver,
}

impl GenerationEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = build_model_client(config)?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: &EngineConfig, client: Box<dyn ModelClient>) -> Result<Self> {
        config.ensure_dirs()?;
        Ok(Self {
            client,
            artifacts: ArtifactStore::new(config.generated_dir()),
            resolver: AttachmentResolver::new(config.uploads_dir(), config.generated_dir()),
        })
    }

    pub fn model_name(&self) -> &str {
        self.client.name()
    }

    /// Rejects invalid requests up front; after that every ending is reported
    /// through `sink` and summarized in the returned outcome.
    pub fn run<S: EventSink + ?Sized>(
        &self,
        request: GenerationRequest,
        sink: &mut S,
    ) -> Result<StreamOutcome, ValidationError> {
        let request = request.normalize()?;
        Ok(self.run_normalized(&request, sink))
    }

    pub fn run_normalized<S: EventSink + ?Sized>(
        &self,
        request: &NormalizedRequest,
        sink: &mut S,
    ) -> StreamOutcome {
        let settings = DemuxSettings::for_mode(request.mode);
        tracing::info!(
            "generation start (mode: {}, aspect_ratio: {}, image_size: {}, model: {})",
            request.mode,
            request
                .aspect_ratio
                .map(|ratio| ratio.as_str())
                .unwrap_or("source"),
            request.image_size,
            self.client.name()
        );
        if sink
            .emit(StreamEvent::Start {
                message: settings.start_message.to_string(),
            })
            .is_err()
        {
            tracing::info!("consumer disconnected before generation started");
            return StreamOutcome::Abandoned;
        }

        match self.drive(request, &settings, sink) {
            Ok(DemuxOutcome::Completed(summary)) => StreamOutcome::Completed(summary),
            Ok(DemuxOutcome::PolicyBlocked) => StreamOutcome::PolicyBlocked,
            Ok(DemuxOutcome::Interrupted(reason)) => StreamOutcome::Interrupted(reason),
            Err(StreamFault::Disconnected(_)) => {
                tracing::info!("consumer disconnected, abandoning generation");
                StreamOutcome::Abandoned
            }
            Err(StreamFault::Transport(err)) => {
                let message = error_chain_text(&err, ERROR_MESSAGE_MAX_CHARS);
                tracing::error!("generation failed: {message}");
                if sink.emit(StreamEvent::error(message.clone())).is_err() {
                    return StreamOutcome::Abandoned;
                }
                StreamOutcome::Failed(message)
            }
        }
    }

    fn drive<S: EventSink + ?Sized>(
        &self,
        request: &NormalizedRequest,
        settings: &DemuxSettings,
        sink: &mut S,
    ) -> Result<DemuxOutcome, StreamFault> {
        let contents = ContextAssembler::new(&self.resolver).assemble(request)?;
        let config = invocation_config(request);
        let demuxer = StreamDemuxer::new(&self.artifacts, sink, settings);
        if request.mode.is_oneshot() {
            let response = self.client.invoke_oneshot(&contents, &config)?;
            demuxer.consume_oneshot(response)
        } else {
            let chunks = self.client.invoke_streaming(&contents, &config)?;
            demuxer.consume_stream(chunks)
        }
    }
}

fn invocation_config(request: &NormalizedRequest) -> InvocationConfig {
    let modalities = if request.mode == GenerationMode::Standard && !request.include_text {
        vec![Modality::Image]
    } else {
        vec![Modality::Text, Modality::Image]
    };
    InvocationConfig {
        modalities,
        aspect_ratio: request.aspect_ratio,
        image_size: request.image_size,
        search_grounding: request.mode == GenerationMode::Search,
    }
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().is_some_and(|existing| existing == trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
