//! Turns model output into the live event stream.

use pixelstream_contracts::events::{ArtifactRef, EventSink, SinkClosed, StreamEvent};
use pixelstream_contracts::grounding::GroundingResult;
use pixelstream_contracts::request::GenerationMode;
use thiserror::Error;

use crate::artifacts::{ArtifactStore, StoredArtifact, EDIT_PREFIX, THOUGHT_PREFIX};
use crate::model::{ChunkStream, FinishReason, ModelResponse, ResponsePart};

#[derive(Debug, Error)]
pub enum StreamFault {
    #[error(transparent)]
    Disconnected(#[from] SinkClosed),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Per-mode wording and naming used while closing a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxSettings {
    pub start_message: &'static str,
    pub done_message: &'static str,
    pub policy_block_message: &'static str,
    pub final_prefix: &'static str,
    pub grounding_requested: bool,
}

impl DemuxSettings {
    pub fn for_mode(mode: GenerationMode) -> Self {
        match mode {
            GenerationMode::Standard => Self {
                start_message: "Generating...",
                done_message: "Generation complete!",
                policy_block_message:
                    "No image was generated; the request may have been blocked by the safety policy",
                final_prefix: "",
                grounding_requested: false,
            },
            GenerationMode::Search => Self {
                start_message: "Searching and generating...",
                done_message: "Search-grounded generation complete!",
                policy_block_message: "No image was generated",
                final_prefix: "",
                grounding_requested: true,
            },
            GenerationMode::Edit => Self {
                start_message: "Editing image...",
                done_message: "Edit complete!",
                policy_block_message: "Edit failed; no image was generated",
                final_prefix: EDIT_PREFIX,
                grounding_requested: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub image: StoredArtifact,
    pub full_text: String,
    pub thinking: String,
    pub thinking_images: Vec<ArtifactRef>,
    pub grounding: Option<GroundingResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DemuxOutcome {
    Completed(GenerationSummary),
    PolicyBlocked,
    Interrupted(FinishReason),
}

/// Fresh per request. Thought images are stored as they arrive; only the last
/// final image survives to the end of the stream.
pub struct StreamDemuxer<'a, S: EventSink + ?Sized> {
    artifacts: &'a ArtifactStore,
    sink: &'a mut S,
    settings: &'a DemuxSettings,
    thinking: String,
    full_text: String,
    thinking_images: Vec<ArtifactRef>,
    final_image: Option<Vec<u8>>,
}

impl<'a, S: EventSink + ?Sized> StreamDemuxer<'a, S> {
    pub fn new(artifacts: &'a ArtifactStore, sink: &'a mut S, settings: &'a DemuxSettings) -> Self {
        Self {
            artifacts,
            sink,
            settings,
            thinking: String::new(),
            full_text: String::new(),
            thinking_images: Vec::new(),
            final_image: None,
        }
    }

    pub fn consume_stream(mut self, chunks: ChunkStream<'_>) -> Result<DemuxOutcome, StreamFault> {
        for chunk in chunks {
            for part in chunk?.parts {
                self.ingest(part)?;
            }
        }
        self.close(None)
    }

    pub fn consume_oneshot(mut self, response: ModelResponse) -> Result<DemuxOutcome, StreamFault> {
        let ModelResponse {
            parts,
            finish_reason,
            grounding,
        } = response;

        match finish_reason {
            Some(FinishReason::Stop) => {}
            other => {
                let reason =
                    other.unwrap_or_else(|| FinishReason::Other("UNSPECIFIED".to_string()));
                tracing::warn!("one-shot generation stopped early: {reason}");
                self.sink.emit(StreamEvent::error(format!(
                    "Generation interrupted: {reason}"
                )))?;
                return Ok(DemuxOutcome::Interrupted(reason));
            }
        }

        for part in parts {
            self.ingest(part)?;
        }

        let grounding = match grounding {
            Some(metadata) if self.settings.grounding_requested => {
                let parsed = GroundingResult::from_metadata(Some(&metadata));
                self.sink.emit(StreamEvent::Grounding {
                    data: parsed.clone(),
                })?;
                Some(parsed)
            }
            _ => None,
        };
        self.close(grounding)
    }

    fn ingest(&mut self, part: ResponsePart) -> Result<(), StreamFault> {
        match part {
            ResponsePart::ThoughtText(text) => {
                self.thinking.push_str(&text);
                self.sink.emit(StreamEvent::Thinking { text })?;
            }
            ResponsePart::ThoughtImage(bytes) => {
                let stored = self.artifacts.persist(&bytes, THOUGHT_PREFIX)?;
                self.thinking_images.push(stored.reference());
                self.sink.emit(StreamEvent::ThinkingImage {
                    filename: stored.filename,
                    path: stored.path,
                    base64: stored.base64,
                })?;
            }
            ResponsePart::FinalText(text) => {
                self.full_text.push_str(&text);
                self.sink.emit(StreamEvent::Text { text })?;
            }
            ResponsePart::FinalImage(bytes) => {
                tracing::debug!("received final image part ({} bytes)", bytes.len());
                if self.final_image.replace(bytes).is_some() {
                    tracing::debug!("final image superseded by a later part");
                }
            }
        }
        Ok(())
    }

    fn close(mut self, grounding: Option<GroundingResult>) -> Result<DemuxOutcome, StreamFault> {
        let Some(bytes) = self.final_image.take() else {
            tracing::warn!("stream finished without a final image");
            self.sink
                .emit(StreamEvent::error(self.settings.policy_block_message))?;
            return Ok(DemuxOutcome::PolicyBlocked);
        };

        let image = self.artifacts.persist(&bytes, self.settings.final_prefix)?;
        tracing::info!("stored final image {}", image.filename);
        self.sink.emit(StreamEvent::Image {
            filename: image.filename.clone(),
            path: image.path.clone(),
            base64: image.base64.clone(),
        })?;
        self.sink.emit(StreamEvent::Done {
            message: self.settings.done_message.to_string(),
            full_text: self.full_text.clone(),
            thinking: self.thinking.clone(),
            thinking_images: self.thinking_images.clone(),
            grounding: grounding.clone(),
        })?;

        Ok(DemuxOutcome::Completed(GenerationSummary {
            image,
            full_text: self.full_text,
            thinking: self.thinking,
            thinking_images: self.thinking_images,
            grounding,
        }))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use pixelstream_contracts::grounding::{GroundingChunk, GroundingContext, GroundingMetadata};

    use super::*;
    use crate::artifacts::png_fixture;

    fn chunk(parts: Vec<ResponsePart>) -> anyhow::Result<ModelResponse> {
        Ok(ModelResponse {
            parts,
            ..ModelResponse::default()
        })
    }

    fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::kind).collect()
    }

    fn stored_files(store: &ArtifactStore) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(store.root())? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    #[test]
    fn streaming_interleaves_events_and_closes_with_done() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Standard);
        let mut events = Vec::new();

        let chunks: ChunkStream = Box::new(
            vec![
                chunk(vec![ResponsePart::ThoughtText("plan ".to_string())]),
                chunk(vec![
                    ResponsePart::ThoughtImage(png_fixture(2, 2, [1, 2, 3])),
                    ResponsePart::ThoughtText("refine".to_string()),
                ]),
                chunk(vec![ResponsePart::FinalText("Here ".to_string())]),
                chunk(vec![
                    ResponsePart::FinalText("you go".to_string()),
                    ResponsePart::FinalImage(png_fixture(3, 3, [9, 9, 9])),
                ]),
            ]
            .into_iter(),
        );
        let outcome = StreamDemuxer::new(&store, &mut events, &settings).consume_stream(chunks)?;

        assert_eq!(
            kinds(&events),
            vec!["thinking", "thinking_image", "thinking", "text", "text", "image", "done"]
        );
        let StreamEvent::Done {
            full_text,
            thinking,
            thinking_images,
            grounding,
            ..
        } = &events[6]
        else {
            panic!("expected done");
        };
        assert_eq!(full_text, "Here you go");
        assert_eq!(thinking, "plan refine");
        assert_eq!(thinking_images.len(), 1);
        assert!(thinking_images[0].filename.starts_with("thought_"));
        assert!(grounding.is_none());

        let DemuxOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.thinking, "plan refine");
        assert_eq!(stored_files(&store)?.len(), 2);
        Ok(())
    }

    #[test]
    fn only_the_last_final_image_is_persisted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Edit);
        let mut events = Vec::new();
        let last = png_fixture(5, 1, [0, 255, 0]);

        let chunks: ChunkStream = Box::new(
            vec![
                chunk(vec![ResponsePart::FinalImage(png_fixture(1, 1, [255, 0, 0]))]),
                chunk(vec![ResponsePart::FinalImage(b"garbage, never decoded".to_vec())]),
                chunk(vec![ResponsePart::FinalImage(last.clone())]),
            ]
            .into_iter(),
        );
        let outcome = StreamDemuxer::new(&store, &mut events, &settings).consume_stream(chunks)?;

        assert_eq!(kinds(&events), vec!["image", "done"]);
        let files = stored_files(&store)?;
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("edit_"));
        let saved = image::open(store.root().join(&files[0]))?;
        assert_eq!((saved.width(), saved.height()), (5, 1));

        let DemuxOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.image.filename, files[0]);
        Ok(())
    }

    #[test]
    fn no_final_image_is_a_policy_block() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Standard);
        let mut events = Vec::new();

        let chunks: ChunkStream = Box::new(
            vec![chunk(vec![ResponsePart::FinalText("I can't draw that".to_string())])]
                .into_iter(),
        );
        let outcome = StreamDemuxer::new(&store, &mut events, &settings).consume_stream(chunks)?;

        assert_eq!(outcome, DemuxOutcome::PolicyBlocked);
        assert_eq!(kinds(&events), vec!["text", "error"]);
        assert_eq!(
            events[1],
            StreamEvent::error(settings.policy_block_message)
        );
        Ok(())
    }

    #[test]
    fn chunk_failure_surfaces_as_transport_fault() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Standard);
        let mut events = Vec::new();

        let chunks: ChunkStream = Box::new(
            vec![
                chunk(vec![ResponsePart::FinalText("partial".to_string())]),
                Err(anyhow!("connection reset")),
            ]
            .into_iter(),
        );
        let result = StreamDemuxer::new(&store, &mut events, &settings).consume_stream(chunks);

        assert!(matches!(result, Err(StreamFault::Transport(_))));
        assert_eq!(kinds(&events), vec!["text"]);
        Ok(())
    }

    fn grounded_response(finish: &str) -> ModelResponse {
        ModelResponse {
            parts: vec![
                ResponsePart::ThoughtText("searching".to_string()),
                ResponsePart::FinalText("Based on results".to_string()),
                ResponsePart::FinalImage(png_fixture(2, 2, [4, 4, 4])),
            ],
            finish_reason: Some(FinishReason::from_raw(finish)),
            grounding: Some(GroundingMetadata {
                web_search_queries: vec!["weather paris".to_string()],
                grounding_chunks: vec![GroundingChunk {
                    web: Some(GroundingContext {
                        title: None,
                        uri: Some("gs://b/o".to_string()),
                    }),
                    retrieved_context: None,
                }],
            }),
        }
    }

    #[test]
    fn oneshot_emits_grounding_before_image_and_done() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Search);
        let mut events = Vec::new();

        StreamDemuxer::new(&store, &mut events, &settings)
            .consume_oneshot(grounded_response("STOP"))?;

        assert_eq!(
            kinds(&events),
            vec!["thinking", "text", "grounding", "image", "done"]
        );
        let StreamEvent::Grounding { data } = &events[2] else {
            panic!("expected grounding");
        };
        assert_eq!(data.sources[0].uri, "https://storage.googleapis.com/b/o");
        assert_eq!(data.sources[0].title, "Source");
        let StreamEvent::Done { grounding, .. } = &events[4] else {
            panic!("expected done");
        };
        assert_eq!(grounding.as_ref(), Some(data));
        Ok(())
    }

    #[test]
    fn oneshot_concatenates_thought_fragments_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Search);
        let mut events = Vec::new();
        let response = ModelResponse {
            parts: vec![
                ResponsePart::ThoughtText("looking up ".to_string()),
                ResponsePart::ThoughtImage(png_fixture(2, 2, [8, 8, 8])),
                ResponsePart::ThoughtText("the forecast".to_string()),
                ResponsePart::FinalText("Sunny.".to_string()),
                ResponsePart::FinalImage(png_fixture(3, 2, [250, 200, 0])),
            ],
            finish_reason: Some(FinishReason::Stop),
            grounding: None,
        };

        let outcome =
            StreamDemuxer::new(&store, &mut events, &settings).consume_oneshot(response)?;

        assert_eq!(
            kinds(&events),
            vec!["thinking", "thinking_image", "thinking", "text", "image", "done"]
        );
        let StreamEvent::Done {
            thinking,
            thinking_images,
            ..
        } = &events[5]
        else {
            panic!("expected done");
        };
        assert_eq!(thinking, "looking up the forecast");
        assert_eq!(thinking_images.len(), 1);
        assert!(thinking_images[0].filename.starts_with(THOUGHT_PREFIX));
        let StreamEvent::ThinkingImage { filename, .. } = &events[1] else {
            panic!("expected thinking image");
        };
        assert_eq!(&thinking_images[0].filename, filename);

        let DemuxOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.thinking, "looking up the forecast");
        assert_eq!(stored_files(&store)?.len(), 2);
        Ok(())
    }

    #[test]
    fn oneshot_without_metadata_emits_no_grounding() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Search);
        let mut events = Vec::new();
        let mut response = grounded_response("STOP");
        response.grounding = None;

        StreamDemuxer::new(&store, &mut events, &settings).consume_oneshot(response)?;
        assert_eq!(kinds(&events), vec!["thinking", "text", "image", "done"]);
        Ok(())
    }

    #[test]
    fn oneshot_abnormal_finish_skips_everything() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Search);
        let mut events = Vec::new();

        let outcome = StreamDemuxer::new(&store, &mut events, &settings)
            .consume_oneshot(grounded_response("SAFETY"))?;

        assert_eq!(
            outcome,
            DemuxOutcome::Interrupted(FinishReason::Other("SAFETY".to_string()))
        );
        assert_eq!(
            events,
            vec![StreamEvent::error("Generation interrupted: SAFETY")]
        );
        assert!(stored_files(&store)?.is_empty());
        Ok(())
    }

    struct ClosedAfter {
        remaining: usize,
        seen: Vec<StreamEvent>,
    }

    impl EventSink for ClosedAfter {
        fn emit(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
            if self.remaining == 0 {
                return Err(SinkClosed);
            }
            self.remaining -= 1;
            self.seen.push(event);
            Ok(())
        }
    }

    #[test]
    fn disconnect_abandons_but_keeps_stored_artifacts() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path());
        let settings = DemuxSettings::for_mode(GenerationMode::Standard);
        let mut sink = ClosedAfter {
            remaining: 1,
            seen: Vec::new(),
        };

        let chunks: ChunkStream = Box::new(
            vec![
                chunk(vec![ResponsePart::ThoughtImage(png_fixture(1, 1, [7, 7, 7]))]),
                chunk(vec![ResponsePart::ThoughtText("never delivered".to_string())]),
            ]
            .into_iter(),
        );
        let result = StreamDemuxer::new(&store, &mut sink, &settings).consume_stream(chunks);

        assert!(matches!(result, Err(StreamFault::Disconnected(_))));
        assert_eq!(sink.seen.len(), 1);
        assert_eq!(stored_files(&store)?.len(), 1);
        Ok(())
    }
}
