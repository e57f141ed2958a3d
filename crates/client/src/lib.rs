#![deny(unsafe_code)]

//! Client core for a document-grounded chat service.
//!
//! The crate holds everything below the presentation layer: the authenticated session, the
//! request/response and streaming transports, the persisted transcript, and the dispatcher that
//! turns typed UI commands into render events.

pub mod api;
/// Backend addresses and transport tuning.
pub mod config;
pub mod dispatcher;
pub mod error;
/// Commands in, render events out.
pub mod events;
pub mod message;
pub mod rest;
pub mod session;
/// Persistent streaming link with bounded reconnects.
pub mod stream;
pub mod transcript;

pub use api::{ApiClient, ChatBackend, ChatReply, DocumentSummary, LoginReply, UploadReceipt};
pub use config::ClientConfig;
pub use dispatcher::{DispatchState, Dispatcher, LOGIN_REDIRECT};
pub use error::{ClientError, ClientResult, ErrorKind};
pub use events::{ChannelRenderer, NoticeLevel, RenderEvent, Renderer, TransportMode, UiCommand};
pub use message::{MessageEntry, Role};
pub use rest::RestTransport;
pub use session::{Credential, Session, SessionEvent, UserProfile};
pub use stream::{
    ConnectionState, StreamEvent, StreamingTransport, TransportFault, TransportSignal,
    TungsteniteConnector,
};
pub use transcript::{Transcript, TranscriptRejection, TranscriptStore};
