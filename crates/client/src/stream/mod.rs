//! Persistent streaming connection: one supervised socket per transport, typed inbound
//! events, and linear-backoff reconnects driven by [`Reconnector`].

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{ClientConfig, redact};
use crate::error::{ClientResult, ErrorKind};

mod frame;
mod reconnect;
mod socket;

pub use frame::{OutgoingFrame, StreamEvent, decode_frame};
pub use reconnect::{
    CloseReason, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, LinkState, ReconnectDecision,
    ReconnectPolicy, Reconnector,
};
pub use socket::{FrameSink, SocketChannel, SocketConnector, SocketFrame, TungsteniteConnector};

#[cfg(test)]
pub(crate) use socket::testing;

/// Close code the backend uses to refuse a credential.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 1008;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Failures that end a link without another automatic attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    Unauthorized,
    ReconnectExhausted { attempts: u32 },
}

/// Everything the transport reports to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Event(StreamEvent),
    Fault(TransportFault),
}

struct LinkHandle {
    outgoing: mpsc::UnboundedSender<String>,
    token: Option<String>,
    shutdown: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

struct LinkContext {
    url: Url,
    connector: Arc<dyn SocketConnector>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    signals: mpsc::UnboundedSender<TransportSignal>,
}

impl LinkContext {
    fn emit(&self, signal: TransportSignal) {
        if self.signals.send(signal).is_err() {
            tracing::debug!("stream signal receiver dropped");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

pub struct StreamingTransport {
    config: ClientConfig,
    connector: Arc<dyn SocketConnector>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: Option<LinkHandle>,
}

impl StreamingTransport {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn SocketConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportSignal>) {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let transport = Self {
            config,
            connector,
            signals,
            state: Arc::new(state),
            link: None,
        };
        (transport, signals_rx)
    }

    /// Opens a fresh link, tearing down any existing one first. Resets the retry budget.
    pub async fn connect(
        &mut self,
        document_id: Option<&str>,
        token: Option<&str>,
    ) -> ClientResult<()> {
        self.disconnect().await;

        let url = self.config.stream_endpoint(document_id, token)?;
        tracing::info!(url = %redact(&url), "opening stream connection");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let context = LinkContext {
            url,
            connector: Arc::clone(&self.connector),
            policy: self.config.reconnect,
            state: Arc::clone(&self.state),
            signals: self.signals.clone(),
        };
        let worker = tokio::spawn(supervise(context, outgoing_rx, shutdown_rx));

        self.link = Some(LinkHandle {
            outgoing,
            token: token.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string),
            shutdown,
            worker,
        });
        Ok(())
    }

    /// Closes the link and cancels any pending reconnect timer.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.shutdown.send(());
            if let Err(error) = link.worker.await {
                tracing::warn!(error = %error, "stream supervisor ended abnormally");
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Queues one message frame. Returns `false`, with a diagnostic, when not connected.
    pub fn send(&self, content: &str, document_id: Option<&str>) -> bool {
        let Some(link) = self.link.as_ref().filter(|_| self.is_connected()) else {
            tracing::warn!("stream is not connected, message not delivered");
            return false;
        };

        let frame = OutgoingFrame::message(
            content,
            document_id.map(str::to_string),
            link.token.clone(),
        );
        match frame.encode() {
            Ok(text) => link.outgoing.send(text).is_ok(),
            Err(error) => {
                tracing::warn!(error = %error, "failed to encode outgoing frame");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

async fn supervise(
    link: LinkContext,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut reconnector = Reconnector::new(link.policy);

    loop {
        reconnector.begin_connect();
        link.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            _ = &mut shutdown => break,
            opened = link.connector.open(link.url.clone()) => opened,
        };

        let reason = match opened {
            Ok(channel) => {
                reconnector.opened();
                link.set_state(ConnectionState::Connected);
                tracing::info!("stream connection established");
                link.emit(TransportSignal::Event(StreamEvent::Connected { message: None }));

                let reason = pump(&link, channel, &mut outgoing, &mut shutdown).await;

                link.set_state(ConnectionState::Disconnected);
                link.emit(TransportSignal::Event(StreamEvent::Disconnected {
                    message: None,
                }));
                reason
            }
            Err(error) if error.kind() == ErrorKind::Unauthorized => {
                tracing::warn!(error = %error, "stream handshake refused the credential");
                CloseReason::Unauthorized
            }
            Err(error) => {
                tracing::warn!(error = %error, "stream connection attempt failed");
                CloseReason::ConnectFailed(error.to_string())
            }
        };

        match reconnector.closed(reason) {
            ReconnectDecision::Stop => break,
            ReconnectDecision::Unauthorized => {
                tracing::warn!("stream closed as unauthorized, not reconnecting");
                link.emit(TransportSignal::Fault(TransportFault::Unauthorized));
                break;
            }
            ReconnectDecision::Exhausted { attempts } => {
                tracing::warn!(attempts, "stream reconnect attempts exhausted");
                link.emit(TransportSignal::Fault(TransportFault::ReconnectExhausted {
                    attempts,
                }));
                break;
            }
            ReconnectDecision::Retry { attempt, delay } => {
                link.set_state(ConnectionState::Disconnected);
                tracing::info!(
                    attempt,
                    max_attempts = link.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling stream reconnect"
                );
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    link.set_state(ConnectionState::Disconnected);
}

/// Moves frames both ways until the link closes. Returns why it closed.
async fn pump(
    link: &LinkContext,
    channel: SocketChannel,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut oneshot::Receiver<()>,
) -> CloseReason {
    let SocketChannel {
        mut sink,
        mut frames,
    } = channel;

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                if let Err(error) = sink.close().await {
                    tracing::debug!(error = %error, "stream close handshake failed");
                }
                return CloseReason::Requested;
            }
            queued = outgoing.recv() => {
                let Some(text) = queued else {
                    let _ = sink.close().await;
                    return CloseReason::Requested;
                };
                if let Err(error) = sink.send(text).await {
                    tracing::warn!(error = %error, "failed to write stream frame");
                    return CloseReason::ConnectFailed(error.to_string());
                }
            }
            frame = frames.next() => match frame {
                Some(SocketFrame::Text(raw)) => match decode_frame(&raw) {
                    Ok(event) => link.emit(TransportSignal::Event(event)),
                    Err(error) => {
                        tracing::warn!(error = %error, "dropping malformed stream frame");
                    }
                },
                Some(SocketFrame::Closed { code, reason }) => {
                    tracing::info!(code = ?code, reason = %reason, "stream connection closed");
                    return CloseReason::from_close(code, reason);
                }
                None => return CloseReason::from_close(None, "connection dropped"),
            }
        }
    }
}
