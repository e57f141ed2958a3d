mod commands;
mod error;
mod settings;
mod terminal;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use docchat_client::{
    ApiClient, ChannelRenderer, ClientConfig, ClientError, Dispatcher, NoticeLevel, RenderEvent,
    Renderer, RestTransport, Session, SessionEvent, StreamingTransport, TransportMode,
    TungsteniteConnector, UiCommand,
};
use docchat_storage::{KeyValueStore, SqliteStore};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::commands::{HELP_TEXT, InputCommand, parse_input};
use crate::error::{AppResult, ClientSnafu, OpenStorageSnafu, ReadInputSnafu};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    SignedOut,
    Quit,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "docchat stopped");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so chat output on stdout stays readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> AppResult<()> {
    let settings = SettingsStore::load();
    let current = settings.settings();

    let location = current.storage_location();
    let store: Arc<dyn KeyValueStore> = Arc::new(
        SqliteStore::open(&location.to_string_lossy())
            .await
            .context(OpenStorageSnafu {
                stage: "open-local-storage",
                path: location.clone(),
            })?,
    );
    let session = Session::restore(store.clone());

    let config = current.client_config().context(ClientSnafu {
        stage: "resolve-client-config",
    })?;
    let rest = RestTransport::new(config.clone(), session.clone()).context(ClientSnafu {
        stage: "build-rest-transport",
    })?;
    tracing::info!(base_url = %config.base_url, "docchat starting");

    let (output, events) = ChannelRenderer::new();
    let printer = tokio::spawn(terminal::print_events(events));

    let mut app = TerminalApp {
        settings,
        store,
        session,
        api: ApiClient::new(rest),
        config,
        output,
        lines: BufReader::new(tokio::io::stdin()).lines(),
    };
    let result = app.run().await;

    drop(app);
    if let Err(error) = printer.await {
        tracing::warn!(error = %error, "terminal printer ended abnormally");
    }
    result
}

struct TerminalApp {
    settings: SettingsStore,
    store: Arc<dyn KeyValueStore>,
    session: Arc<Session>,
    api: ApiClient,
    config: ClientConfig,
    output: ChannelRenderer,
    lines: Lines<BufReader<Stdin>>,
}

impl TerminalApp {
    async fn run(&mut self) -> AppResult<()> {
        self.say(NoticeLevel::Info, "type /help for commands");
        loop {
            if !self.session.is_authenticated() && self.sign_in().await? == Flow::Quit {
                return Ok(());
            }
            if self.chat().await? == Flow::Quit {
                return Ok(());
            }
        }
    }

    async fn sign_in(&mut self) -> AppResult<Flow> {
        self.say(
            NoticeLevel::Info,
            "sign in with /login <user> <password> or /register <user> <password> <password>",
        );

        while let Some(line) = self.next_line().await? {
            let command = match parse_input(&line) {
                Ok(command) => command,
                Err(error) => {
                    self.say(NoticeLevel::Error, error.to_string());
                    continue;
                }
            };
            if !command.allowed_signed_out() {
                self.say(NoticeLevel::Info, "sign in first");
                continue;
            }

            let signed_in = match command {
                InputCommand::Login { username, password } => {
                    self.api.login(&username, &password).await
                }
                InputCommand::Register {
                    username,
                    password,
                    confirmation,
                } => {
                    self.api
                        .register_and_login(&username, &password, &confirmation)
                        .await
                }
                InputCommand::Help => {
                    self.say(NoticeLevel::Info, HELP_TEXT);
                    continue;
                }
                InputCommand::Quit => return Ok(Flow::Quit),
                _ => continue,
            };

            match signed_in {
                Ok(reply) => {
                    self.say(NoticeLevel::Success, format!("signed in as {}", reply.username));
                    return Ok(Flow::Continue);
                }
                Err(error) => self.say(NoticeLevel::Error, format!("sign-in failed: {error}")),
            }
        }

        Ok(Flow::Quit)
    }

    /// One signed-in stretch: ends on quit, logout, or session expiry.
    async fn chat(&mut self) -> AppResult<Flow> {
        let (streaming, signals) =
            StreamingTransport::new(self.config.clone(), Arc::new(TungsteniteConnector));
        let mut dispatcher = Dispatcher::new(
            self.session.clone(),
            Arc::new(self.api.clone()),
            streaming,
            self.store.clone(),
            Box::new(self.output.clone()),
        );

        if let Err(error) = dispatcher.bootstrap().await {
            tracing::info!(error = %error, "startup profile check failed");
            return Ok(Flow::SignedOut);
        }
        let preferred = TransportMode::from(self.settings.settings().transport);
        if preferred == TransportMode::Streaming {
            dispatcher.set_transport(preferred).await;
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(dispatcher.run(commands_rx, signals));
        let mut session_events = self.session.subscribe();

        let flow = loop {
            tokio::select! {
                line = self.lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-chat-line" })?;
                    let Some(line) = line else {
                        break Flow::Quit;
                    };
                    if let Some(flow) = self.handle_chat_line(&line, &commands).await {
                        break flow;
                    }
                }
                changed = session_events.changed() => {
                    if changed.is_err() {
                        break Flow::SignedOut;
                    }
                    let event = *session_events.borrow_and_update();
                    if matches!(event, SessionEvent::Expired | SessionEvent::SignedOut) {
                        break Flow::SignedOut;
                    }
                }
            }
        };

        drop(commands);
        if let Err(error) = worker.await {
            tracing::warn!(error = %error, "dispatcher task ended abnormally");
        }
        Ok(flow)
    }

    async fn handle_chat_line(
        &mut self,
        line: &str,
        commands: &mpsc::UnboundedSender<UiCommand>,
    ) -> Option<Flow> {
        let command = match parse_input(line) {
            Ok(command) => command,
            Err(error) => {
                self.say(NoticeLevel::Error, error.to_string());
                return None;
            }
        };

        let forward = match command {
            InputCommand::Say(text) => UiCommand::SendMessage {
                text,
                document_id: None,
            },
            InputCommand::UseDocument(document_id) => UiCommand::SelectDocument(document_id),
            InputCommand::Streaming => {
                self.remember_transport(TransportMode::Streaming);
                UiCommand::SetTransport(TransportMode::Streaming)
            }
            InputCommand::Rest => {
                self.remember_transport(TransportMode::Rest);
                UiCommand::SetTransport(TransportMode::Rest)
            }
            InputCommand::Reconnect => UiCommand::Reconnect,
            InputCommand::Recommendations => UiCommand::LoadRecommendations,
            InputCommand::ListDocuments => {
                self.list_documents().await;
                return None;
            }
            InputCommand::Upload(path) => {
                self.upload(&path).await;
                return None;
            }
            InputCommand::Delete(document_id) => {
                self.delete(&document_id).await;
                return None;
            }
            InputCommand::Logout => {
                self.api.logout();
                self.say(NoticeLevel::Success, "signed out");
                return Some(Flow::SignedOut);
            }
            InputCommand::Login { .. } | InputCommand::Register { .. } => {
                self.say(NoticeLevel::Info, "already signed in, /logout first");
                return None;
            }
            InputCommand::Help => {
                self.say(NoticeLevel::Info, HELP_TEXT);
                return None;
            }
            InputCommand::Quit => return Some(Flow::Quit),
            InputCommand::Empty => return None,
        };

        if commands.send(forward).is_err() {
            tracing::warn!("dispatcher is gone, leaving chat");
            return Some(Flow::Quit);
        }
        None
    }

    async fn list_documents(&mut self) {
        match self.api.list_documents().await {
            Ok(documents) if documents.is_empty() => {
                self.say(NoticeLevel::Info, "no documents uploaded yet");
            }
            Ok(documents) => {
                for document in documents {
                    self.say(
                        NoticeLevel::Info,
                        format!(
                            "{}  {}  ({} chunks, uploaded {})",
                            document.document_id,
                            document.filename,
                            document.chunks_count,
                            document.upload_time.as_deref().unwrap_or("at an unknown time"),
                        ),
                    );
                }
            }
            Err(error) => self.report("failed to list documents", &error),
        }
    }

    async fn upload(&mut self, path: &Path) {
        match self.api.upload_document(path).await {
            Ok(receipt) => self.say(
                NoticeLevel::Success,
                format!(
                    "uploaded {} as {} ({} chunks), /use {} to chat about it",
                    receipt.filename,
                    receipt.document_id,
                    receipt.chunks_count,
                    receipt.document_id
                ),
            ),
            Err(error) => self.report("upload failed", &error),
        }
    }

    async fn delete(&mut self, document_id: &str) {
        match self.api.delete_document(document_id).await {
            Ok(()) => self.say(NoticeLevel::Success, format!("deleted {document_id}")),
            Err(error) => self.report("failed to delete document", &error),
        }
    }

    fn report(&mut self, context: &str, error: &ClientError) {
        self.say(NoticeLevel::Error, format!("{context}: {error}"));
        if error.is_session_expired() {
            // A textual expiry on a non-401 answer has not cleared the session yet.
            self.session.clear();
        }
    }

    fn remember_transport(&self, mode: TransportMode) {
        let mut settings = (*self.settings.settings()).clone();
        settings.transport = mode.into();
        if let Err(error) = self.settings.update(settings) {
            tracing::warn!(error = %error, "failed to save transport preference");
        }
    }

    async fn next_line(&mut self) -> AppResult<Option<String>> {
        self.lines.next_line().await.context(ReadInputSnafu {
            stage: "read-terminal-line",
        })
    }

    fn say(&mut self, level: NoticeLevel, text: impl Into<String>) {
        self.output.render(RenderEvent::notice(level, text));
    }
}
