use tokio::sync::mpsc;

use crate::message::MessageEntry;
use crate::stream::ConnectionState;

/// Characters of a relevant chunk shown in its preview.
pub const CHUNK_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportMode {
    #[default]
    Rest,
    Streaming,
}

impl TransportMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Rest => Self::Streaming,
            Self::Streaming => Self::Rest,
        }
    }
}

/// Typed input from the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    /// `document_id` overrides the selected document for this message only.
    SendMessage {
        text: String,
        document_id: Option<String>,
    },
    SelectDocument(Option<String>),
    ToggleTransport,
    SetTransport(TransportMode),
    LoadRecommendations,
    /// Manual reconnect after the retry budget ran out.
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Output of the dispatcher, consumed by a [`Renderer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    /// Replace everything shown with these entries.
    Reset(Vec<MessageEntry>),
    Append(MessageEntry),
    /// In-place update of the most recent entry only.
    UpdateLast(MessageEntry),
    Typing(bool),
    SendEnabled(bool),
    ConnectionChanged(ConnectionState),
    TransportChanged(TransportMode),
    DocumentSelected(Option<String>),
    /// Previews of retrieval context attached to the last reply.
    RelevantChunks(Vec<String>),
    Recommendations(Vec<String>),
    RecommendationsUnavailable,
    Notice { level: NoticeLevel, text: String },
    /// Credential is gone; the UI must route the user to `redirect`.
    SessionExpired { redirect: String },
}

impl RenderEvent {
    pub fn notice(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self::Notice {
            level,
            text: text.into(),
        }
    }
}

pub trait Renderer: Send {
    fn render(&mut self, event: RenderEvent);
}

/// Forwards render events to another task.
#[derive(Clone)]
pub struct ChannelRenderer {
    events: mpsc::UnboundedSender<RenderEvent>,
}

impl ChannelRenderer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RenderEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (Self { events }, events_rx)
    }
}

impl Renderer for ChannelRenderer {
    fn render(&mut self, event: RenderEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("render receiver dropped");
        }
    }
}

pub fn preview_chunk(chunk: &str) -> String {
    let mut chars = chunk.chars();
    let preview: String = chars.by_ref().take(CHUNK_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{preview}...")
    } else {
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previews_cut_at_one_hundred_characters() {
        assert_eq!(preview_chunk("short"), "short");

        let exact = "a".repeat(CHUNK_PREVIEW_CHARS);
        assert_eq!(preview_chunk(&exact), exact);

        let long = "字".repeat(CHUNK_PREVIEW_CHARS + 5);
        let preview = preview_chunk(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), CHUNK_PREVIEW_CHARS + 3);
    }

    #[test]
    fn toggling_flips_the_mode() {
        assert_eq!(TransportMode::default().toggled(), TransportMode::Streaming);
        assert_eq!(TransportMode::Streaming.toggled(), TransportMode::Rest);
    }
}
