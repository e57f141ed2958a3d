use std::fmt;
use std::io::Write;

use chrono::{DateTime, Local, TimeZone};
use docchat_client::{
    ConnectionState, MessageEntry, NoticeLevel, RenderEvent, Renderer, Role, TransportMode,
};
use tokio::sync::mpsc;

/// Prints render events as plain text lines.
pub struct TerminalRenderer<W> {
    out: W,
    /// Bytes of the streaming entry already printed, while one is live.
    live: Option<usize>,
}

impl<W: Write + Send> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, live: None }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: impl fmt::Display) {
        self.close_live_line();
        if let Err(error) = writeln!(self.out, "{text}") {
            tracing::debug!(error = %error, "failed to write terminal output");
        }
    }

    fn write_raw(&mut self, text: &str) {
        if let Err(error) = write!(self.out, "{text}").and_then(|_| self.out.flush()) {
            tracing::debug!(error = %error, "failed to write terminal output");
        }
    }

    /// Ends a half-printed streaming line before anything else is shown.
    fn close_live_line(&mut self) {
        if self.live.take().is_some() {
            self.write_raw("\n");
        }
    }

    fn append(&mut self, entry: &MessageEntry) {
        if entry.streaming {
            self.close_live_line();
            let prefix = format!("[{}] {}: ", timestamp(entry), role_label(entry.role));
            self.write_raw(&prefix);
            self.write_raw(&entry.content);
            self.live = Some(entry.content.len());
        } else {
            self.line(format_entry(entry));
        }
    }

    fn update_last(&mut self, entry: &MessageEntry) {
        let Some(printed) = self.live else {
            tracing::debug!("update for an entry that is not being printed");
            return;
        };

        let unseen = entry.content.get(printed..).unwrap_or_default();
        self.write_raw(unseen);
        self.live = Some(entry.content.len());
        if !entry.streaming {
            self.close_live_line();
        }
    }
}

impl<W: Write + Send> Renderer for TerminalRenderer<W> {
    fn render(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::Reset(entries) => {
                self.close_live_line();
                if entries.is_empty() {
                    self.line("(no earlier messages)");
                }
                for entry in &entries {
                    self.line(format_entry(entry));
                }
            }
            RenderEvent::Append(entry) => self.append(&entry),
            RenderEvent::UpdateLast(entry) => self.update_last(&entry),
            RenderEvent::Typing(true) => self.line("assistant is typing..."),
            RenderEvent::Typing(false) | RenderEvent::SendEnabled(_) => {}
            RenderEvent::ConnectionChanged(state) => {
                let label = match state {
                    ConnectionState::Disconnected => "disconnected",
                    ConnectionState::Connecting => "connecting",
                    ConnectionState::Connected => "connected",
                };
                self.line(format!("[stream] {label}"));
            }
            RenderEvent::TransportChanged(mode) => {
                let label = match mode {
                    TransportMode::Rest => "request/response",
                    TransportMode::Streaming => "streaming",
                };
                self.line(format!("[mode] {label}"));
            }
            RenderEvent::DocumentSelected(Some(document_id)) => {
                self.line(format!("[document] chatting about {document_id}"));
            }
            RenderEvent::DocumentSelected(None) => self.line("[document] none selected"),
            RenderEvent::RelevantChunks(previews) => {
                self.line("sources:");
                for preview in previews {
                    self.line(format!("  - {preview}"));
                }
            }
            RenderEvent::Recommendations(questions) if questions.is_empty() => {
                self.line("no suggested questions yet");
            }
            RenderEvent::Recommendations(questions) => {
                self.line("try asking:");
                for question in questions {
                    self.line(format!("  * {question}"));
                }
            }
            RenderEvent::RecommendationsUnavailable => {
                self.line("suggested questions are unavailable");
            }
            RenderEvent::Notice { level, text } => {
                let tag = match level {
                    NoticeLevel::Info => "info",
                    NoticeLevel::Success => "ok",
                    NoticeLevel::Error => "error",
                };
                self.line(format!("[{tag}] {text}"));
            }
            RenderEvent::SessionExpired { redirect } => {
                tracing::debug!(redirect = %redirect, "session expired");
                self.line("session expired, sign in again with /login <user> <password>");
            }
        }
    }
}

/// Drains `events` into a terminal renderer on stdout until every sender is gone.
pub async fn print_events(mut events: mpsc::UnboundedReceiver<RenderEvent>) {
    let mut renderer = TerminalRenderer::new(std::io::stdout());
    while let Some(event) = events.recv().await {
        renderer.render(event);
    }
    renderer.close_live_line();
}

pub fn format_entry(entry: &MessageEntry) -> String {
    format!(
        "[{}] {}: {}",
        timestamp(entry),
        role_label(entry.role),
        entry.content
    )
}

fn timestamp(entry: &MessageEntry) -> String {
    format_relative_time(&entry.created_at.with_timezone(&Local), &Local::now())
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

/// "just now" under a minute, then minutes, then hours, then `MM-DD HH:MM`.
pub fn format_relative_time<Tz>(time: &DateTime<Tz>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let elapsed = now.clone().signed_duration_since(time);
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();

    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{minutes} minutes ago")
    } else if hours < 24 {
        format!("{hours} hours ago")
    } else {
        time.format("%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn printed(events: Vec<RenderEvent>) -> String {
        let mut renderer = TerminalRenderer::new(Vec::new());
        for event in events {
            renderer.render(event);
        }
        String::from_utf8(renderer.into_inner()).unwrap()
    }

    #[test]
    fn relative_times_follow_the_chat_ui_buckets() {
        let now = Utc.with_ymd_and_hms(2024, 5, 3, 12, 0, 0).unwrap();
        let at = |delta: Duration| now - delta;

        assert_eq!(format_relative_time(&at(Duration::seconds(30)), &now), "just now");
        assert_eq!(format_relative_time(&at(Duration::seconds(-5)), &now), "just now");
        assert_eq!(format_relative_time(&at(Duration::minutes(5)), &now), "5 minutes ago");
        assert_eq!(format_relative_time(&at(Duration::hours(3)), &now), "3 hours ago");
        assert_eq!(format_relative_time(&at(Duration::days(2)), &now), "05-01 12:00");
    }

    #[test]
    fn streamed_reply_prints_on_one_line() {
        let mut entry = MessageEntry::assistant_streaming();
        let mut events = vec![RenderEvent::Append(entry.clone())];
        for chunk in ["Hi", " there"] {
            entry.content.push_str(chunk);
            events.push(RenderEvent::UpdateLast(entry.clone()));
        }
        entry.streaming = false;
        events.push(RenderEvent::UpdateLast(entry));
        events.push(RenderEvent::notice(NoticeLevel::Info, "done"));

        assert_eq!(
            printed(events),
            "[just now] assistant: Hi there\n[info] done\n"
        );
    }

    #[test]
    fn interruptions_close_the_live_line_first() {
        let mut entry = MessageEntry::assistant_streaming();
        entry.content.push_str("par");
        let output = printed(vec![
            RenderEvent::Append(entry),
            RenderEvent::ConnectionChanged(ConnectionState::Disconnected),
        ]);
        assert_eq!(output, "[just now] assistant: par\n[stream] disconnected\n");
    }

    #[test]
    fn recommendations_and_sources_are_listed() {
        let output = printed(vec![
            RenderEvent::RelevantChunks(vec!["first chunk...".into()]),
            RenderEvent::Recommendations(vec!["What is it about?".into()]),
            RenderEvent::Recommendations(vec![]),
            RenderEvent::RecommendationsUnavailable,
        ]);
        assert_eq!(
            output,
            "sources:\n  - first chunk...\ntry asking:\n  * What is it about?\n\
             no suggested questions yet\nsuggested questions are unavailable\n"
        );
    }
}
