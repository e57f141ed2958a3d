use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{ClientError, ClientResult, ValidationSnafu};
use crate::rest::RestTransport;
use crate::session::{Session, UserProfile};

pub const DOCUMENTS_PATH: &str = "/api/documents/";
pub const UPLOAD_PATH: &str = "/api/documents/upload";
pub const CHAT_MESSAGE_PATH: &str = "/api/chat/message";
pub const RECOMMENDATIONS_PATH: &str = "/api/chat/recommendations";
pub const REGISTER_PATH: &str = "/api/auth/register";
pub const LOGIN_PATH: &str = "/api/auth/login";
pub const PROFILE_PATH: &str = "/api/auth/me";

/// Only plain-text documents are indexed by the backend.
pub const UPLOAD_EXTENSION: &str = "txt";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub filename: String,
    #[serde(default)]
    pub upload_time: Option<String>,
    #[serde(default)]
    pub chunks_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadReceipt {
    pub document_id: String,
    pub filename: String,
    #[serde(default)]
    pub chunks_count: u64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest<'a> {
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatReply {
    pub response: String,
    #[serde(default)]
    pub relevant_chunks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginReply {
    pub token: String,
    pub username: String,
}

#[derive(Serialize)]
struct AccountRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct DocumentList {
    #[serde(default)]
    documents: Vec<DocumentSummary>,
}

#[derive(Deserialize)]
struct RecommendationList {
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Deserialize)]
struct ProfileReply {
    user: UserProfile,
}

#[derive(Deserialize)]
struct Acknowledgement {}

/// Calls the dispatcher's request/response path depends on.
pub trait ChatBackend: Send + Sync {
    fn send_message<'a>(
        &'a self,
        message: &'a str,
        document_id: Option<&'a str>,
    ) -> BoxFuture<'a, ClientResult<ChatReply>>;

    fn recommendations(&self) -> BoxFuture<'_, ClientResult<Vec<String>>>;

    /// Resolves the current user. Any failure ends the session.
    fn profile(&self) -> BoxFuture<'_, ClientResult<UserProfile>>;
}

/// Typed backend surface over [`RestTransport`].
#[derive(Clone)]
pub struct ApiClient {
    rest: RestTransport,
}

impl ApiClient {
    pub fn new(rest: RestTransport) -> Self {
        Self { rest }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.rest.session()
    }

    pub fn transport(&self) -> &RestTransport {
        &self.rest
    }

    pub async fn list_documents(&self) -> ClientResult<Vec<DocumentSummary>> {
        let list: DocumentList = self.rest.get(DOCUMENTS_PATH).await?;
        Ok(list.documents)
    }

    pub async fn upload_document(&self, file: &Path) -> ClientResult<UploadReceipt> {
        let is_text = file
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case(UPLOAD_EXTENSION));
        ensure!(
            is_text,
            ValidationSnafu {
                stage: "validate-upload-extension",
                message: format!("only .{UPLOAD_EXTENSION} files are supported"),
            }
        );

        let receipt: UploadReceipt = self.rest.upload_file(UPLOAD_PATH, file).await?;
        tracing::info!(
            document_id = %receipt.document_id,
            chunks = receipt.chunks_count,
            "document uploaded"
        );
        Ok(receipt)
    }

    pub async fn delete_document(&self, document_id: &str) -> ClientResult<()> {
        let document_id = document_id.trim();
        ensure!(
            !document_id.is_empty(),
            ValidationSnafu {
                stage: "validate-document-id",
                message: "document id must not be empty",
            }
        );
        let _: Acknowledgement = self
            .rest
            .delete(&format!("{DOCUMENTS_PATH}{document_id}"))
            .await?;
        Ok(())
    }

    pub async fn send_message(
        &self,
        message: &str,
        document_id: Option<&str>,
    ) -> ClientResult<ChatReply> {
        let request = ChatRequest {
            message,
            document_id: document_id.filter(|id| !id.is_empty()),
        };
        self.rest.post(CHAT_MESSAGE_PATH, &request).await
    }

    pub async fn recommendations(&self) -> ClientResult<Vec<String>> {
        let list: RecommendationList = self.rest.get(RECOMMENDATIONS_PATH).await?;
        Ok(list.recommendations)
    }

    pub async fn register(&self, username: &str, password: &str) -> ClientResult<()> {
        let (username, password) = validate_account(username, password)?;
        let _: serde_json::Value = self
            .rest
            .post(REGISTER_PATH, &AccountRequest { username, password })
            .await?;
        tracing::info!(username, "account registered");
        Ok(())
    }

    /// Logs in and stores the issued credential in the session.
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<LoginReply> {
        let (username, password) = validate_account(username, password)?;
        let reply: LoginReply = self
            .rest
            .post(LOGIN_PATH, &AccountRequest { username, password })
            .await?;
        self.session().establish(&reply.token, &reply.username)?;
        Ok(reply)
    }

    /// Registers after checking the confirmation locally, then logs straight in.
    pub async fn register_and_login(
        &self,
        username: &str,
        password: &str,
        confirmation: &str,
    ) -> ClientResult<LoginReply> {
        validate_account(username, password)?;
        ensure!(
            password == confirmation,
            ValidationSnafu {
                stage: "validate-password-confirmation",
                message: "passwords do not match",
            }
        );
        self.register(username, password).await?;
        self.login(username, password).await
    }

    pub async fn profile(&self) -> ClientResult<UserProfile> {
        match self.rest.get::<ProfileReply>(PROFILE_PATH).await {
            Ok(reply) => {
                self.session().set_user(reply.user.clone());
                Ok(reply.user)
            }
            Err(error) => {
                tracing::warn!(error = %error, "profile check failed, clearing session");
                self.session().clear();
                Err(error)
            }
        }
    }

    pub fn logout(&self) {
        self.session().logout();
    }
}

impl ChatBackend for ApiClient {
    fn send_message<'a>(
        &'a self,
        message: &'a str,
        document_id: Option<&'a str>,
    ) -> BoxFuture<'a, ClientResult<ChatReply>> {
        Box::pin(ApiClient::send_message(self, message, document_id))
    }

    fn recommendations(&self) -> BoxFuture<'_, ClientResult<Vec<String>>> {
        Box::pin(ApiClient::recommendations(self))
    }

    fn profile(&self) -> BoxFuture<'_, ClientResult<UserProfile>> {
        Box::pin(ApiClient::profile(self))
    }
}

fn validate_account<'a>(
    username: &'a str,
    password: &'a str,
) -> ClientResult<(&'a str, &'a str)> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(ClientError::validation(
            "validate-account",
            "username and password are required",
        ));
    }
    Ok((username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_omits_absent_document() {
        let bare = serde_json::to_string(&ChatRequest {
            message: "hello",
            document_id: None,
        })
        .unwrap();
        assert_eq!(bare, r#"{"message":"hello"}"#);

        let scoped = serde_json::to_string(&ChatRequest {
            message: "hello",
            document_id: Some("doc-1"),
        })
        .unwrap();
        assert_eq!(scoped, r#"{"message":"hello","document_id":"doc-1"}"#);
    }

    #[test]
    fn document_listing_tolerates_missing_optional_fields() {
        let list: DocumentList = serde_json::from_str(
            r#"{"documents":[{"document_id":"d1","filename":"notes.txt"}]}"#,
        )
        .unwrap();
        assert_eq!(list.documents[0].chunks_count, 0);
        assert_eq!(list.documents[0].upload_time, None);
    }

    #[test]
    fn account_validation_trims_username_only() {
        assert_eq!(validate_account("  ada ", " pw ").unwrap(), ("ada", " pw "));
        assert!(validate_account("   ", "pw").is_err());
        assert!(validate_account("ada", "").is_err());
    }
}
