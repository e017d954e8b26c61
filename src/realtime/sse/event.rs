//! The `text/event-stream` wire format.

use std::fmt::Write as _;
use std::time::Duration;

/// One server-sent event.
///
/// ```
/// use rawserve::realtime::sse::SseEvent;
///
/// let event = SseEvent::new("line1\nline2").id("7").event("tick");
/// assert_eq!(event.to_string(), "id: 7\nevent: tick\ndata: line1\ndata: line2\n\n");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    id: Option<String>,
    event: Option<String>,
    retry: Option<Duration>,
    data: String,
}

// A field value cannot span lines.
fn single_line(value: impl Into<String>) -> String {
    let mut value = value.into();
    value.retain(|c| c != '\r' && c != '\n');
    value
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(single_line(id));
        self
    }

    #[must_use]
    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.event = Some(single_line(name));
        self
    }

    /// Asks the client to wait this long before reconnecting.
    #[must_use]
    pub fn retry(mut self, after: Duration) -> Self {
        self.retry = Some(after);
        self
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Serializes the event, blank-line terminated.
    ///
    /// CRLF and lone CR become LF, then every line of the data becomes its
    /// own `data:` line. A trailing newline yields a trailing empty `data:`
    /// line so the client rebuilds the text exactly.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(id) = &self.id {
            let _ = writeln!(out, "id: {id}");
        }
        if let Some(event) = &self.event {
            let _ = writeln!(out, "event: {event}");
        }
        if let Some(retry) = self.retry {
            let _ = writeln!(out, "retry: {}", retry.as_millis());
        }
        for line in normalize_newlines(&self.data).split('\n') {
            let _ = writeln!(out, "data: {line}");
        }
        out.push('\n');
        out
    }
}

impl std::fmt::Display for SseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A comment frame; clients ignore it. Used for keepalive.
pub fn encode_comment(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    for line in normalize_newlines(text).split('\n') {
        let _ = writeln!(out, ": {line}");
    }
    out.push('\n');
    out
}
