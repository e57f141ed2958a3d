use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ClientResult, DecodeResponseSnafu, EncodePayloadSnafu};

/// Frame written to the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutgoingFrame {
    Message {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl OutgoingFrame {
    pub fn message(
        content: impl Into<String>,
        document_id: Option<String>,
        token: Option<String>,
    ) -> Self {
        Self::Message {
            content: content.into(),
            document_id,
            token,
        }
    }

    pub fn encode(&self) -> ClientResult<String> {
        serde_json::to_string(self).context(EncodePayloadSnafu {
            stage: "encode-outgoing-frame",
        })
    }
}

/// Typed inbound event decoded from one text frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
    Disconnected {
        #[serde(default)]
        message: Option<String>,
    },
    Start,
    Chunk {
        #[serde(default)]
        content: String,
    },
    End,
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
}

impl StreamEvent {
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message, content } => message.as_deref().or(content.as_deref()),
            _ => None,
        }
    }
}

pub fn decode_frame(raw: &str) -> ClientResult<StreamEvent> {
    serde_json::from_str(raw).context(DecodeResponseSnafu {
        stage: "decode-stream-frame",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_frames_omit_absent_fields() {
        let bare = OutgoingFrame::message("hello", None, None).encode().unwrap();
        assert_eq!(bare, r#"{"type":"message","content":"hello"}"#);

        let scoped = OutgoingFrame::message("hi", Some("doc-7".into()), Some("tok".into()))
            .encode()
            .unwrap();
        assert_eq!(
            scoped,
            r#"{"type":"message","content":"hi","document_id":"doc-7","token":"tok"}"#
        );
    }

    #[test]
    fn inbound_frames_decode_by_type_tag() {
        assert_eq!(decode_frame(r#"{"type":"start"}"#).unwrap(), StreamEvent::Start);
        assert_eq!(
            decode_frame(r#"{"type":"chunk","content":"Hi"}"#).unwrap(),
            StreamEvent::Chunk {
                content: "Hi".into()
            }
        );
        assert_eq!(
            decode_frame(r#"{"type":"connected","message":"welcome"}"#).unwrap(),
            StreamEvent::Connected {
                message: Some("welcome".into())
            }
        );

        let error = decode_frame(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(error.error_message(), Some("boom"));
    }

    #[test]
    fn malformed_frames_are_errors_not_panics() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"type":"teleport"}"#).is_err());
        assert!(decode_frame(r#"{"content":"no tag"}"#).is_err());
    }
}
