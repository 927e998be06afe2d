use std::io::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grounding::GroundingResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    pub path: String,
}

/// One unit of a generation stream.
///
/// Serialized with a `type` discriminant so each event is a self-describing
/// JSON object:
/// - `start`, then any interleaving of `thinking`, `thinking_image`, `text`
/// - `grounding` at most once, before the terminal pair
/// - exactly one terminal `done` (preceded by `image`) or `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        message: String,
    },
    Thinking {
        text: String,
    },
    ThinkingImage {
        filename: String,
        path: String,
        base64: String,
    },
    Text {
        text: String,
    },
    Image {
        filename: String,
        path: String,
        base64: String,
    },
    Grounding {
        data: GroundingResult,
    },
    Done {
        message: String,
        full_text: String,
        thinking: String,
        thinking_images: Vec<ArtifactRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grounding: Option<GroundingResult>,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Thinking { .. } => "thinking",
            Self::ThinkingImage { .. } => "thinking_image",
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Grounding { .. } => "grounding",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// `data: <json>` frame terminated by a blank line.
    pub fn to_sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event consumer disconnected")]
pub struct SinkClosed;

/// Destination of a live event stream. A failed emit means the consumer is
/// gone and the producer should stop.
pub trait EventSink {
    fn emit(&mut self, event: StreamEvent) -> Result<(), SinkClosed>;
}

impl EventSink for Vec<StreamEvent> {
    fn emit(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.push(event);
        Ok(())
    }
}

/// Writes events as server-sent-event frames, flushing after each one so the
/// consumer sees them as they are produced.
#[derive(Debug)]
pub struct SseWriter<W: Write> {
    out: W,
}

impl<W: Write> SseWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SseWriter<W> {
    /// An event that cannot be encoded ends the stream with an `error` frame
    /// in its place; the producer is told to stop.
    fn write_frame(
        &mut self,
        kind: &str,
        frame: serde_json::Result<String>,
    ) -> Result<(), SinkClosed> {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!("failed to encode {kind} event: {err}");
                let fallback = StreamEvent::error(format!("failed to encode {kind} event"));
                if let Ok(frame) = fallback.to_sse_frame() {
                    self.write_raw(&frame)?;
                }
                return Err(SinkClosed);
            }
        };
        self.write_raw(&frame)
    }

    fn write_raw(&mut self, frame: &str) -> Result<(), SinkClosed> {
        self.out
            .write_all(frame.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(|err| {
                tracing::debug!("event consumer write failed: {err}");
                SinkClosed
            })
    }
}

impl<W: Write> EventSink for SseWriter<W> {
    fn emit(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        self.write_frame(event.kind(), event.to_sse_frame())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn events_serialize_with_type_discriminant() -> anyhow::Result<()> {
        let event = StreamEvent::ThinkingImage {
            filename: "thought_a.png".to_string(),
            path: "/generated/thought_a.png".to_string(),
            base64: "AAAA".to_string(),
        };
        let value = serde_json::to_value(&event)?;
        assert_eq!(
            value,
            json!({
                "type": "thinking_image",
                "filename": "thought_a.png",
                "path": "/generated/thought_a.png",
                "base64": "AAAA",
            })
        );
        assert_eq!(event.kind(), "thinking_image");
        assert!(!event.is_terminal());
        Ok(())
    }

    #[test]
    fn done_omits_grounding_when_absent() -> anyhow::Result<()> {
        let done = StreamEvent::Done {
            message: "ok".to_string(),
            full_text: String::new(),
            thinking: String::new(),
            thinking_images: Vec::new(),
            grounding: None,
        };
        let value = serde_json::to_value(&done)?;
        assert_eq!(value["type"], json!("done"));
        assert!(value.get("grounding").is_none());
        assert!(done.is_terminal());

        let parsed: StreamEvent = serde_json::from_value(value)?;
        assert_eq!(parsed, done);
        Ok(())
    }

    #[test]
    fn sse_writer_frames_each_event() -> anyhow::Result<()> {
        let mut writer = SseWriter::new(Vec::new());
        writer.emit(StreamEvent::Start {
            message: "go".to_string(),
        })?;
        writer.emit(StreamEvent::error("boom"))?;

        let raw = String::from_utf8(writer.into_inner())?;
        let frames: Vec<&str> = raw.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(frames[0].trim_start_matches("data: "))?;
        let second: Value = serde_json::from_str(frames[1].trim_start_matches("data: "))?;
        assert_eq!(first["type"], json!("start"));
        assert_eq!(second, json!({"type": "error", "message": "boom"}));
        Ok(())
    }

    struct BrokenPipe;

    impl io::Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sse_writer_reports_disconnect() {
        let mut writer = SseWriter::new(BrokenPipe);
        let result = writer.emit(StreamEvent::Text {
            text: "hi".to_string(),
        });
        assert_eq!(result, Err(SinkClosed));
    }

    #[test]
    fn encode_failure_ends_the_stream_with_an_error_frame() -> anyhow::Result<()> {
        let mut writer = SseWriter::new(Vec::new());
        let broken = serde_json::from_str::<Value>("{").map(|value| value.to_string());
        assert_eq!(writer.write_frame("text", broken), Err(SinkClosed));

        let raw = String::from_utf8(writer.into_inner())?;
        let frame: Value = serde_json::from_str(raw.trim().trim_start_matches("data: "))?;
        assert_eq!(
            frame,
            json!({"type": "error", "message": "failed to encode text event"})
        );
        Ok(())
    }
}
