//! Streaming protocol decoding
//!
//! Turns a raw upstream byte stream into an ordered sequence of text
//! deltas. The decoder owns the line framing concerns shared by both
//! provider protocols (carry-over buffering across reads, SSE `data: `
//! prefixes, degenerate proxy byte-string wrapping, the `[DONE]` sentinel
//! and embedded error payloads); a protocol-specific [`LineParser`] turns
//! each cleaned line into deltas.

use crate::services::classifier::ClassifiedError;
use serde_json::Value;
use tracing::{debug, warn};

/// Error surfaced by stream decoding.
///
/// Retry is driven by inspecting these values in the owning adapter, never
/// by unwinding.
#[derive(Debug)]
pub enum DecodeError {
    /// Upstream reported a transient failure inside the stream body; the
    /// owning adapter should restart the whole request, not resume decoding
    RetryableStream(ClassifiedError),
    /// Non-retryable error embedded in the stream
    Upstream(ClassifiedError),
    /// The stream completed without producing any visible text
    EmptyVisibleStream,
}

/// What one parsed line contributed to the stream
pub enum LineEvent {
    /// A new text fragment to emit
    Delta(String),
    /// The protocol signalled end-of-stream
    Done,
    /// Nothing to emit (keep-alives, metadata-only chunks, parse noise)
    Ignored,
}

/// Protocol-specific parsing of one cleaned SSE payload line
pub trait LineParser {
    fn parse_line(&mut self, payload: &str) -> Result<LineEvent, DecodeError>;

    /// Called once after the last byte; protocols that require visible
    /// output check for it here
    fn finish(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// Generic SSE stream decoder with carry-over line buffering
pub struct StreamDecoder<P> {
    parser: P,
    buffer: Vec<u8>,
    finished: bool,
}

impl<P: LineParser> StreamDecoder<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            buffer: Vec::new(),
            finished: false,
        }
    }

    /// Feed one network read; returns the deltas completed by it.
    ///
    /// A line split across two reads is retained in the buffer and parsed
    /// once its terminating newline arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, DecodeError> {
        let mut deltas = Vec::new();
        if self.finished {
            return Ok(deltas);
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            if self.process_line(&line, &mut deltas)? {
                self.finished = true;
                self.buffer.clear();
                break;
            }
        }
        Ok(deltas)
    }

    /// Flush the trailing partial line and run the parser's completion
    /// check. Must be called exactly once when the byte stream ends.
    pub fn finish(&mut self) -> Result<Vec<String>, DecodeError> {
        let mut deltas = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            self.process_line(&line, &mut deltas)?;
        }
        self.parser.finish()?;
        Ok(deltas)
    }

    /// Access the protocol parser (e.g. for response metadata)
    pub fn parser(&self) -> &P {
        &self.parser
    }

    fn process_line(&mut self, raw: &str, deltas: &mut Vec<String>) -> Result<bool, DecodeError> {
        let Some(payload) = clean_line(raw) else {
            return Ok(false);
        };
        if payload == "[DONE]" {
            debug!("Received stream end marker");
            return Ok(true);
        }
        match self.parser.parse_line(payload)? {
            LineEvent::Delta(delta) => deltas.push(delta),
            LineEvent::Done => return Ok(true),
            LineEvent::Ignored => {}
        }
        Ok(false)
    }
}

/// Strip SSE framing and proxy artifacts from a raw line.
///
/// Removes the `data: ` prefix and, for degenerate proxy configurations
/// that wrap payloads as language-runtime byte-string literals, the
/// `b'...'` / `b"..."` wrapping. Returns `None` for blank lines.
fn clean_line(raw: &str) -> Option<&str> {
    let mut line = raw.trim();
    if let Some(rest) = line.strip_prefix("data: ") {
        line = rest.trim();
    }
    if line.starts_with("b'") || line.starts_with("b\"") {
        line = &line[2..];
        line = line
            .strip_suffix('\'')
            .or_else(|| line.strip_suffix('"'))
            .unwrap_or(line);
    }
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

/// Classify an `error` field embedded in a stream payload.
///
/// Some upstreams return errors as JSON chunks inside a 200 stream; a
/// retryable one becomes [`DecodeError::RetryableStream`] so the adapter
/// restarts the request.
fn check_error_field(value: &Value) -> Result<(), DecodeError> {
    let Some(error) = value.get("error") else {
        return Ok(());
    };
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    let status = error
        .get("code")
        .and_then(|c| c.as_u64())
        .map(|c| c as u16);

    let classified = ClassifiedError::new(status, message);
    if classified.is_retryable() {
        Err(DecodeError::RetryableStream(classified))
    } else {
        Err(DecodeError::Upstream(classified))
    }
}

// ====== OpenAI protocol ======

/// Line parser for the OpenAI chat-completions SSE protocol.
///
/// This protocol already sends incremental deltas, so each
/// `choices[0].delta.content` is emitted verbatim.
#[derive(Debug, Default)]
pub struct OpenAiLineParser;

impl LineParser for OpenAiLineParser {
    fn parse_line(&mut self, payload: &str) -> Result<LineEvent, DecodeError> {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping unparseable stream line: {}", e);
                return Ok(LineEvent::Ignored);
            }
        };
        check_error_field(&value)?;

        let delta = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|t| t.as_str());

        match delta {
            Some(text) if !text.is_empty() => Ok(LineEvent::Delta(text.to_string())),
            _ => Ok(LineEvent::Ignored),
        }
    }
}

// ====== Gemini protocol ======

/// Line parser for the Gemini streamGenerateContent SSE protocol.
///
/// Each emitted JSON object repeats the entire accumulated visible text so
/// far, so the parser tracks the previously seen cumulative text and emits
/// only the suffix beyond it. Thought-flagged parts are never emitted
/// unless the fallback flag is set and no visible text exists.
#[derive(Debug)]
pub struct GeminiLineParser {
    visible_seen: String,
    thought_seen: String,
    emitted_any: bool,
    thought_fallback: bool,
    used_search: bool,
}

impl GeminiLineParser {
    pub fn new(thought_fallback: bool) -> Self {
        Self {
            visible_seen: String::new(),
            thought_seen: String::new(),
            emitted_any: false,
            thought_fallback,
            used_search: false,
        }
    }

    /// Whether any chunk carried web-search grounding metadata
    pub fn used_search(&self) -> bool {
        self.used_search
    }
}

impl LineParser for GeminiLineParser {
    fn parse_line(&mut self, payload: &str) -> Result<LineEvent, DecodeError> {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(_) => {
                // Partial JSON shows up with some proxies; the retained
                // buffer usually completes it on the next read
                return Ok(LineEvent::Ignored);
            }
        };
        check_error_field(&value)?;

        let candidate = value.get("candidates").and_then(|c| c.get(0));
        if candidate_used_search(candidate) {
            self.used_search = true;
        }

        let parts = candidate
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"));
        let visible = collect_part_text(parts, false);
        let thought = collect_part_text(parts, true);

        // Visible text always wins over thought text within a chunk
        let delta = if !visible.is_empty() {
            cumulative_delta(&mut self.visible_seen, &visible)
        } else if self.thought_fallback && !thought.is_empty() && self.visible_seen.is_empty() {
            cumulative_delta(&mut self.thought_seen, &thought)
        } else {
            None
        };

        match delta {
            Some(text) => {
                self.emitted_any = true;
                Ok(LineEvent::Delta(text))
            }
            None => Ok(LineEvent::Ignored),
        }
    }

    fn finish(&mut self) -> Result<(), DecodeError> {
        if self.emitted_any {
            Ok(())
        } else {
            Err(DecodeError::EmptyVisibleStream)
        }
    }
}

/// Concatenate the text of all parts of one kind.
///
/// A part is visible iff it has non-empty text and is not flagged
/// `thought: true`.
fn collect_part_text(parts: Option<&Value>, thought: bool) -> String {
    let Some(parts) = parts.and_then(|p| p.as_array()) else {
        return String::new();
    };
    parts
        .iter()
        .filter(|p| p.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) == thought)
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Compute the new suffix of a cumulative text series.
///
/// When the new text does not extend the previously seen text (divergence),
/// the whole new text is emitted and tracking resets to it.
fn cumulative_delta(seen: &mut String, current: &str) -> Option<String> {
    let delta = if let Some(suffix) = current.strip_prefix(seen.as_str()) {
        suffix.to_string()
    } else {
        current.to_string()
    };
    *seen = current.to_string();
    if delta.is_empty() {
        None
    } else {
        Some(delta)
    }
}

/// Detect whether a Gemini candidate carries grounding/search metadata,
/// indicating that web-search grounding was actually invoked
pub fn candidate_used_search(candidate: Option<&Value>) -> bool {
    let Some(grounding) = candidate.and_then(|c| c.get("groundingMetadata")) else {
        return false;
    };
    let non_empty_array = |field: &str| {
        grounding
            .get(field)
            .and_then(|v| v.as_array())
            .map(|a| !a.is_empty())
            .unwrap_or(false)
    };
    non_empty_array("webSearchQueries")
        || non_empty_array("groundingChunks")
        || non_empty_array("groundingSupports")
        || non_empty_array("retrievalQueries")
        || grounding.get("searchEntryPoint").is_some()
}

/// Extract the displayable text of a complete (non-streaming) Gemini
/// candidate: visible parts first, thought parts only under the fallback
/// flag and only when no visible text exists
pub fn extract_candidate_text(candidate: Option<&Value>, thought_fallback: bool) -> String {
    let parts = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"));
    let visible = collect_part_text(parts, false);
    if !visible.is_empty() {
        return visible;
    }
    if thought_fallback {
        return collect_part_text(parts, true);
    }
    String::new()
}
