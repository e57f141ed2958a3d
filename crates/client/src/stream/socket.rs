use std::pin::Pin;

use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::config::redact;
use crate::error::{ClientError, ClientResult, SocketConnectSnafu, SocketRejectedSnafu};

/// One inbound item from an open socket, already stripped of ping/pong/binary noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;

/// Write half and read half of one open connection.
pub struct SocketChannel {
    pub sink: FrameSink,
    pub frames: BoxStream<'static, SocketFrame>,
}

impl SocketChannel {
    pub fn new(sink: FrameSink, frames: BoxStream<'static, SocketFrame>) -> Self {
        Self { sink, frames }
    }
}

/// Opens streaming connections. Swapped for an in-memory peer in tests.
pub trait SocketConnector: Send + Sync {
    fn open(&self, url: Url) -> BoxFuture<'static, ClientResult<SocketChannel>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl SocketConnector for TungsteniteConnector {
    fn open(&self, url: Url) -> BoxFuture<'static, ClientResult<SocketChannel>> {
        Box::pin(async move {
            let (stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok(opened) => opened,
                Err(WsError::Http(response)) => {
                    return SocketRejectedSnafu {
                        stage: "open-stream-handshake",
                        url: redact(&url),
                        status: response.status().as_u16(),
                    }
                    .fail();
                }
                Err(error) => {
                    return SocketConnectSnafu {
                        stage: "open-stream-connection",
                        url: redact(&url),
                        message: error.to_string(),
                    }
                    .fail();
                }
            };

            let (write, read) = stream.split();
            let sink = write
                .sink_map_err(|error| ClientError::SocketSend {
                    stage: "write-stream-frame",
                    message: error.to_string(),
                })
                .with(|text: String| future::ready(Ok::<_, ClientError>(Message::Text(text))));

            let frames = read.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(SocketFrame::Text(text)),
                    Ok(Message::Close(frame)) => Some(match frame {
                        Some(frame) => SocketFrame::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => SocketFrame::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    }),
                    Ok(_) => None,
                    Err(error) => Some(SocketFrame::Closed {
                        code: None,
                        reason: error.to_string(),
                    }),
                })
            });

            Ok(SocketChannel::new(Box::pin(sink), frames.boxed()))
        })
    }
}
