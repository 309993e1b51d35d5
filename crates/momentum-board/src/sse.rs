//! Line-oriented parser for the board's `text/event-stream` change feed.

use serde::Deserialize;

pub const DEFAULT_EVENT_KIND: &str = "message";
pub const DATA_CHANGED: &str = "data-changed";
pub const TASK_CREATED: &str = "task.created";
pub const TASK_UPDATED: &str = "task.updated";
pub const TASK_STATUS_CHANGED: &str = "task.status_changed";

/// One change notification from the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub kind: String,
    pub data: String,
}

#[derive(Deserialize)]
struct EpicHint {
    #[serde(default)]
    auto: bool,
}

#[derive(Deserialize)]
struct PayloadHint {
    epic: Option<EpicHint>,
}

impl FeedEvent {
    pub fn new(kind: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
        }
    }

    /// Synthetic event emitted while the stream is down and the subscriber
    /// is polling.
    pub fn polling_refresh() -> Self {
        Self::new(
            DATA_CHANGED,
            r#"{"source":"polling","message":"periodic refresh"}"#,
        )
    }

    /// True when the payload embeds `{"epic":{"auto":true}}`. Payloads that
    /// are not JSON, or carry no epic, are treated as not auto.
    pub fn epic_auto(&self) -> bool {
        serde_json::from_str::<PayloadHint>(&self.data)
            .ok()
            .and_then(|hint| hint.epic)
            .is_some_and(|epic| epic.auto)
    }

    pub fn is_board_change(&self) -> bool {
        matches!(
            self.kind.as_str(),
            TASK_CREATED | TASK_UPDATED | TASK_STATUS_CHANGED | DATA_CHANGED
        )
    }

    /// Whether an idle scheduler should re-run selection for this event.
    pub fn wakes_scheduler(&self) -> bool {
        self.is_board_change() && self.epic_auto()
    }
}

/// Incremental parser. Feed it raw body chunks with [`SseParser::feed_bytes`]
/// or lines with their terminators removed; it yields an event whenever a
/// blank line closes one that carried data.
///
/// A blank line with no pending data emits nothing and keeps any `event:`
/// type already seen, so the type applies to the next data block.
#[derive(Debug, Default)]
pub struct SseParser {
    kind: String,
    data: String,
    partial: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a body chunk into lines (`\n` or `\r\n`) and parse the complete
    /// ones. A trailing partial line waits for the next chunk.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<FeedEvent> {
        self.partial.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=end).collect();
            let line = &raw[..raw.len() - 1];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let Some(event) = self.feed_line(&String::from_utf8_lossy(line)) {
                events.push(event);
            }
        }
        events
    }

    pub fn feed_line(&mut self, line: &str) -> Option<FeedEvent> {
        if line.is_empty() {
            return self.flush();
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.trim();
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            self.kind = value.trim().to_string();
        }
        // `id:`, `retry:`, `:` comments and unknown fields are ignored.
        None
    }

    fn flush(&mut self) -> Option<FeedEvent> {
        if self.data.is_empty() {
            return None;
        }
        let mut kind = std::mem::take(&mut self.kind);
        if kind.is_empty() {
            kind = DEFAULT_EVENT_KIND.to_string();
        }
        Some(FeedEvent {
            kind,
            data: std::mem::take(&mut self.data),
        })
    }
}
