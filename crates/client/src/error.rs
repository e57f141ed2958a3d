use std::path::PathBuf;

use snafu::Snafu;

/// Server messages that mean the credential is no longer accepted.
///
/// The backend reports expiry in prose, so classification is textual.
pub const SESSION_EXPIRY_MARKERS: &[&str] = &[
    "unauthorized",
    "not logged in",
    "session expired",
    "未授权",
    "未登录",
    "登录已过期",
];

/// Coarse classification used to pick a propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The backend could not be reached.
    NetworkFailure,
    /// The backend answered with a non-2xx status.
    ServerError,
    /// The credential was rejected; the session is gone.
    Unauthorized,
    /// A frame or payload did not follow the wire contract.
    ProtocolViolation,
    /// Input was rejected locally before any network call.
    ValidationError,
    /// Client-local persistence failed.
    Storage,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Network {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("streaming connection to {url} failed on `{stage}`: {message}"))]
    SocketConnect {
        stage: &'static str,
        url: String,
        message: String,
    },
    #[snafu(display("streaming handshake to {url} was rejected with status {status}"))]
    SocketRejected {
        stage: &'static str,
        url: String,
        status: u16,
    },
    #[snafu(display("failed to write streaming frame on `{stage}`: {message}"))]
    SocketSend {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("{message}"))]
    Server {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("{message}"))]
    Unauthorized {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("malformed response payload on `{stage}`: {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("protocol violation on `{stage}`: {details}"))]
    ProtocolViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("{message}"))]
    Validation {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("invalid address '{raw}' on `{stage}`: {source}"))]
    InvalidUrl {
        stage: &'static str,
        raw: String,
        source: url::ParseError,
    },
    #[snafu(display("address '{raw}' uses unsupported scheme '{scheme}'"))]
    UnsupportedScheme {
        stage: &'static str,
        raw: String,
        scheme: String,
    },
    #[snafu(display("failed to read upload file {path:?}: {source}"))]
    ReadUpload {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("local storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: docchat_storage::StorageError,
    },
    #[snafu(display("failed to encode payload on `{stage}`: {source}"))]
    EncodePayload {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. }
            | Self::BuildHttpClient { .. }
            | Self::SocketConnect { .. }
            | Self::SocketSend { .. } => ErrorKind::NetworkFailure,
            Self::SocketRejected { status, .. } if matches!(status, 401 | 403) => {
                ErrorKind::Unauthorized
            }
            Self::SocketRejected { .. } => ErrorKind::NetworkFailure,
            Self::Server { .. } => ErrorKind::ServerError,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::DecodeResponse { .. } | Self::ProtocolViolation { .. } => {
                ErrorKind::ProtocolViolation
            }
            Self::Validation { .. }
            | Self::InvalidUrl { .. }
            | Self::UnsupportedScheme { .. }
            | Self::ReadUpload { .. } => ErrorKind::ValidationError,
            Self::Storage { .. } | Self::EncodePayload { .. } => ErrorKind::Storage,
        }
    }

    /// True when this failure should end the session and send the user back to login.
    pub fn is_session_expired(&self) -> bool {
        self.kind() == ErrorKind::Unauthorized || mentions_session_expiry(&self.to_string())
    }

    pub fn validation(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            stage,
            message: message.into(),
        }
    }

    pub fn protocol_violation(stage: &'static str, details: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            stage,
            details: details.into(),
        }
    }
}

/// Textual expiry check shared by transport errors and streaming `error` frames.
pub fn mentions_session_expiry(message: &str) -> bool {
    let lowered = message.to_lowercase();
    SESSION_EXPIRY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_prose_about_expiry_counts_as_expired() {
        let error = ClientError::Server {
            stage: "test",
            status: 403,
            message: "登录已过期，请重新登录".to_string(),
        };
        assert_eq!(error.kind(), ErrorKind::ServerError);
        assert!(error.is_session_expired());

        let error = ClientError::Server {
            stage: "test",
            status: 500,
            message: "Session Expired".to_string(),
        };
        assert!(error.is_session_expired());
    }

    #[test]
    fn ordinary_failures_do_not_expire_the_session() {
        let error = ClientError::Server {
            stage: "test",
            status: 400,
            message: "document not found".to_string(),
        };
        assert!(!error.is_session_expired());
        assert!(!ClientError::validation("test", "message must not be empty").is_session_expired());
    }

    #[test]
    fn rejected_handshakes_are_classified_by_status() {
        let rejected = |status| ClientError::SocketRejected {
            stage: "test",
            url: "ws://localhost/ws/chat".to_string(),
            status,
        };
        assert_eq!(rejected(403).kind(), ErrorKind::Unauthorized);
        assert_eq!(rejected(401).kind(), ErrorKind::Unauthorized);
        assert_eq!(rejected(502).kind(), ErrorKind::NetworkFailure);
    }

    #[test]
    fn out_of_order_frames_are_protocol_violations() {
        let error = ClientError::protocol_violation("apply-stream-end", "end without a reply");
        assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
        assert!(!error.is_session_expired());
        assert_eq!(
            error.to_string(),
            "protocol violation on `apply-stream-end`: end without a reply"
        );
    }
}
