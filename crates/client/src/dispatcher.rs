//! Message dispatcher: routes sends over REST or the streaming link, folds inbound stream
//! events into the transcript, and emits render events for every visible change.
//!
//! State moves `Idle -> AwaitingResponse -> StreamingResponse -> Idle`. A transport switch or
//! a reconnect requested while a reply is streaming is held back until the reply settles.

use std::sync::Arc;

use docchat_storage::{KeyValueStore, StorageNamespace};
use tokio::sync::mpsc;

use crate::api::ChatBackend;
use crate::error::{ClientError, ClientResult, mentions_session_expiry};
use crate::events::{NoticeLevel, RenderEvent, Renderer, TransportMode, UiCommand, preview_chunk};
use crate::message::MessageEntry;
use crate::session::{Session, UserProfile};
use crate::stream::{
    ConnectionState, StreamEvent, StreamingTransport, TransportFault, TransportSignal,
};
use crate::transcript::{Transcript, TranscriptStore};

/// Where the UI sends the user once the session is gone.
pub const LOGIN_REDIRECT: &str = "login?redirect=chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchState {
    #[default]
    Idle,
    AwaitingResponse,
    StreamingResponse,
}

pub struct Dispatcher {
    session: Arc<Session>,
    backend: Arc<dyn ChatBackend>,
    streaming: StreamingTransport,
    transcripts: TranscriptStore,
    renderer: Box<dyn Renderer>,
    mode: TransportMode,
    state: DispatchState,
    /// Streaming sends whose reply has not ended yet.
    in_flight: u32,
    pending_mode: Option<TransportMode>,
    reconnect_pending: bool,
    /// User entries sent while a reply was streaming; appended once it finalizes.
    deferred: Vec<MessageEntry>,
}

impl Dispatcher {
    pub fn new(
        session: Arc<Session>,
        backend: Arc<dyn ChatBackend>,
        streaming: StreamingTransport,
        store: Arc<dyn KeyValueStore>,
        renderer: Box<dyn Renderer>,
    ) -> Self {
        let transcripts = TranscriptStore::new(store, session.namespace());
        Self {
            session,
            backend,
            streaming,
            transcripts,
            renderer,
            mode: TransportMode::Rest,
            state: DispatchState::Idle,
            in_flight: 0,
            pending_mode: None,
            reconnect_pending: false,
            deferred: Vec::new(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        self.transcripts.transcript()
    }

    pub fn selected_document(&self) -> Option<&str> {
        self.transcripts.selected_document()
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.streaming.state()
    }

    /// Startup: profile check first; on failure nothing in the transcript is touched.
    pub async fn bootstrap(&mut self) -> ClientResult<UserProfile> {
        let profile = match self.backend.profile().await {
            Ok(profile) => profile,
            Err(error) => {
                tracing::warn!(error = %error, "startup profile check failed");
                self.expire_session().await;
                return Err(error);
            }
        };

        self.session.set_user(profile.clone());
        self.transcripts
            .rescope(StorageNamespace::for_user(Some(profile.user_id.as_str())));
        self.transcripts.restore();

        let entries = self.transcripts.transcript().entries().to_vec();
        let selected = self.transcripts.selected_document().map(str::to_string);
        self.render(RenderEvent::Reset(entries));
        self.render(RenderEvent::DocumentSelected(selected));
        self.render(RenderEvent::TransportChanged(self.mode));
        self.render(RenderEvent::notice(
            NoticeLevel::Success,
            format!("welcome back, {}", profile.username),
        ));

        self.load_recommendations().await;
        Ok(profile)
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UiCommand>,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
            }
        }

        self.streaming.disconnect().await;
        tracing::debug!("dispatcher stopped");
    }

    pub async fn handle_command(&mut self, command: UiCommand) {
        match command {
            UiCommand::SendMessage { text, document_id } => {
                if let Err(error) = self.send(&text, document_id).await {
                    tracing::debug!(error = %error, "send did not complete");
                }
            }
            UiCommand::SelectDocument(document_id) => self.select_document(document_id).await,
            UiCommand::ToggleTransport => self.set_transport(self.mode.toggled()).await,
            UiCommand::SetTransport(mode) => self.set_transport(mode).await,
            UiCommand::LoadRecommendations => self.load_recommendations().await,
            UiCommand::Reconnect => self.reconnect().await,
        }
    }

    /// Appends the user entry at once, then delivers over the active transport.
    ///
    /// `document_id` overrides the selected document for this message.
    pub async fn send(&mut self, text: &str, document_id: Option<String>) -> ClientResult<()> {
        let text = text.trim();
        if text.is_empty() {
            let error = ClientError::validation("validate-message", "message must not be empty");
            self.render(RenderEvent::notice(NoticeLevel::Error, error.to_string()));
            return Err(error);
        }

        let document_id = document_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.transcripts.selected_document().map(str::to_string));

        self.record_user_entry(MessageEntry::user(text));

        if self.mode == TransportMode::Streaming
            && self.streaming.is_connected()
            && self.streaming.send(text, document_id.as_deref())
        {
            self.in_flight += 1;
            self.refresh_state();
            return Ok(());
        }

        // The link dropped before its `disconnected` signal arrived; close the reply it left.
        if self.finalize_streaming() {
            tracing::warn!("stream dropped mid-reply, finalized it before sending over REST");
            self.in_flight = 0;
        }
        self.send_rest(text, document_id.as_deref()).await
    }

    pub async fn handle_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Event(event) => self.handle_stream_event(event).await,
            TransportSignal::Fault(TransportFault::Unauthorized) => {
                self.finalize_streaming();
                self.in_flight = 0;
                self.expire_session().await;
            }
            TransportSignal::Fault(TransportFault::ReconnectExhausted { attempts }) => {
                self.render(RenderEvent::ConnectionChanged(ConnectionState::Disconnected));
                self.render(RenderEvent::notice(
                    NoticeLevel::Error,
                    format!("streaming connection lost after {attempts} reconnect attempts"),
                ));
            }
        }
    }

    pub async fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected { .. } => {
                self.render(RenderEvent::ConnectionChanged(ConnectionState::Connected));
                self.render(RenderEvent::notice(NoticeLevel::Success, "streaming connected"));
            }
            StreamEvent::Disconnected { .. } => {
                self.render(RenderEvent::ConnectionChanged(self.streaming.state()));
                if self.finalize_streaming() {
                    tracing::warn!("stream dropped mid-reply, keeping partial content");
                }
                self.in_flight = 0;
                self.settle().await;
            }
            StreamEvent::Start => {
                if self.finalize_streaming() {
                    tracing::warn!("stream start while a reply was still open, finalized it");
                }
                self.append_entry(MessageEntry::assistant_streaming());
                self.render(RenderEvent::Typing(false));
                self.refresh_state();
            }
            StreamEvent::Chunk { content } => {
                let updated = self
                    .transcripts
                    .transcript_mut()
                    .mutate_last(|entry| entry.content.push_str(&content))
                    .map(MessageEntry::clone);
                match updated {
                    Ok(entry) => self.render(RenderEvent::UpdateLast(entry)),
                    Err(rejection) => {
                        let error = ClientError::protocol_violation(
                            "apply-stream-chunk",
                            format!("chunk rejected: {rejection:?}"),
                        );
                        tracing::warn!(error = %error, "ignoring out-of-order stream frame");
                    }
                }
            }
            StreamEvent::End => {
                if !self.finalize_streaming() {
                    let error = ClientError::protocol_violation(
                        "apply-stream-end",
                        "end without a streaming entry",
                    );
                    tracing::warn!(error = %error, "ignoring out-of-order stream frame");
                }
                self.in_flight = self.in_flight.saturating_sub(1);
                self.render(RenderEvent::Typing(false));
                self.settle().await;
            }
            StreamEvent::Error { .. } => {
                let message = event.error_message().unwrap_or("stream error").to_string();
                self.finalize_streaming();
                self.in_flight = self.in_flight.saturating_sub(1);
                self.render(RenderEvent::Typing(false));

                if mentions_session_expiry(&message) {
                    self.expire_session().await;
                    return;
                }
                self.render(RenderEvent::notice(NoticeLevel::Error, message));
                self.settle().await;
            }
        }
    }

    pub async fn set_transport(&mut self, mode: TransportMode) {
        if self.state == DispatchState::StreamingResponse {
            self.pending_mode = Some(mode);
            self.render(RenderEvent::notice(
                NoticeLevel::Info,
                "transport switch queued until the current reply finishes",
            ));
            return;
        }
        self.apply_transport(mode).await;
    }

    /// Selection applies to the next send at once; in streaming mode the link is rescoped.
    pub async fn select_document(&mut self, document_id: Option<String>) {
        self.transcripts.set_selected_document(document_id);
        let selected = self.transcripts.selected_document().map(str::to_string);
        tracing::info!(document_id = ?selected, "document selected");
        self.render(RenderEvent::DocumentSelected(selected));
        self.persist();

        if self.mode == TransportMode::Streaming {
            self.reconnect().await;
        }
    }

    pub async fn reconnect(&mut self) {
        if self.mode != TransportMode::Streaming {
            self.render(RenderEvent::notice(NoticeLevel::Info, "streaming mode is off"));
            return;
        }
        if self.state == DispatchState::StreamingResponse {
            self.reconnect_pending = true;
            return;
        }
        self.connect_streaming().await;
    }

    pub async fn load_recommendations(&mut self) {
        match self.backend.recommendations().await {
            Ok(recommendations) => self.render(RenderEvent::Recommendations(recommendations)),
            Err(error) if error.is_session_expired() => self.expire_session().await,
            Err(error) => {
                tracing::warn!(error = %error, "failed to load recommendations");
                self.render(RenderEvent::RecommendationsUnavailable);
            }
        }
    }

    async fn send_rest(&mut self, text: &str, document_id: Option<&str>) -> ClientResult<()> {
        self.state = DispatchState::AwaitingResponse;
        self.render(RenderEvent::SendEnabled(false));
        self.render(RenderEvent::Typing(true));

        let backend = Arc::clone(&self.backend);
        let result = backend.send_message(text, document_id).await;

        self.render(RenderEvent::Typing(false));
        self.render(RenderEvent::SendEnabled(true));
        self.refresh_state();

        match result {
            Ok(reply) => {
                if self.append_entry(MessageEntry::assistant(reply.response)) {
                    self.persist();
                }
                if !reply.relevant_chunks.is_empty() {
                    let previews = reply
                        .relevant_chunks
                        .iter()
                        .map(|chunk| preview_chunk(chunk))
                        .collect();
                    self.render(RenderEvent::RelevantChunks(previews));
                }
                Ok(())
            }
            Err(error) => {
                self.surface_error("failed to send message", &error).await;
                Err(error)
            }
        }
    }

    async fn apply_transport(&mut self, mode: TransportMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        tracing::info!(?mode, "transport mode changed");
        self.render(RenderEvent::TransportChanged(mode));

        match mode {
            TransportMode::Streaming => self.connect_streaming().await,
            TransportMode::Rest => {
                self.reconnect_pending = false;
                self.streaming.disconnect().await;
                self.render(RenderEvent::ConnectionChanged(ConnectionState::Disconnected));
            }
        }
    }

    async fn connect_streaming(&mut self) {
        let token = self.session.token();
        let document_id = self.transcripts.selected_document().map(str::to_string);

        self.render(RenderEvent::ConnectionChanged(ConnectionState::Connecting));
        if let Err(error) = self
            .streaming
            .connect(document_id.as_deref(), token.as_deref())
            .await
        {
            tracing::warn!(error = %error, "failed to start streaming connection");
            self.render(RenderEvent::ConnectionChanged(ConnectionState::Disconnected));
            self.render(RenderEvent::notice(
                NoticeLevel::Error,
                format!("streaming connection failed: {error}"),
            ));
        }
    }

    /// Applies work held back while a reply was streaming.
    async fn settle(&mut self) {
        self.refresh_state();
        if self.state == DispatchState::StreamingResponse {
            return;
        }

        if let Some(mode) = self.pending_mode.take() {
            self.apply_transport(mode).await;
        }
        if std::mem::take(&mut self.reconnect_pending) && self.mode == TransportMode::Streaming {
            self.connect_streaming().await;
        }
    }

    fn refresh_state(&mut self) {
        self.state = if self.transcripts.transcript().streaming_entry().is_some() {
            DispatchState::StreamingResponse
        } else if self.in_flight > 0 {
            DispatchState::AwaitingResponse
        } else {
            DispatchState::Idle
        };
    }

    /// Closes the streaming entry, if any, keeping its content. Returns whether one was open.
    fn finalize_streaming(&mut self) -> bool {
        let finalized = self
            .transcripts
            .transcript_mut()
            .finalize_last()
            .map(MessageEntry::clone);
        let Ok(entry) = finalized else {
            return false;
        };

        self.render(RenderEvent::UpdateLast(entry));
        for entry in std::mem::take(&mut self.deferred) {
            self.append_entry(entry);
        }
        self.persist();
        self.refresh_state();
        true
    }

    fn record_user_entry(&mut self, entry: MessageEntry) {
        if self.transcripts.transcript().streaming_entry().is_some() {
            tracing::debug!("reply still streaming, deferring user entry");
            self.deferred.push(entry);
            return;
        }
        if self.append_entry(entry) {
            self.persist();
        }
    }

    fn append_entry(&mut self, entry: MessageEntry) -> bool {
        let appended = self
            .transcripts
            .transcript_mut()
            .append(entry)
            .map(MessageEntry::clone);
        match appended {
            Ok(entry) => {
                self.render(RenderEvent::Append(entry));
                true
            }
            Err(rejection) => {
                tracing::warn!(?rejection, "transcript refused entry");
                false
            }
        }
    }

    /// While a reply streams only the selection is written; the transcript follows on finalize.
    fn persist(&mut self) {
        let persisted = if self.transcripts.transcript().streaming_entry().is_some() {
            self.transcripts.persist_selected_document()
        } else {
            self.transcripts.persist()
        };
        if let Err(error) = persisted {
            tracing::warn!(error = %error, "failed to persist transcript");
        }
    }

    async fn surface_error(&mut self, context: &str, error: &ClientError) {
        if error.is_session_expired() {
            self.expire_session().await;
            return;
        }
        self.render(RenderEvent::notice(
            NoticeLevel::Error,
            format!("{context}: {error}"),
        ));
    }

    async fn expire_session(&mut self) {
        self.session.clear();
        self.streaming.disconnect().await;
        self.pending_mode = None;
        self.reconnect_pending = false;
        self.render(RenderEvent::SessionExpired {
            redirect: LOGIN_REDIRECT.to_string(),
        });
    }

    fn render(&mut self, event: RenderEvent) {
        self.renderer.render(event);
    }
}
