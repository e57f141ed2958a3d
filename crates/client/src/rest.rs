use std::path::Path;
use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::ResultExt;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{
    BuildHttpClientSnafu, ClientResult, DecodeResponseSnafu, NetworkSnafu, ReadUploadSnafu,
    ServerSnafu, UnauthorizedSnafu,
};
use crate::session::Session;

/// Message used when a failed response carries no readable JSON body.
pub const REQUEST_FAILED_MESSAGE: &str = "request failed";
pub const UPLOAD_FAILED_MESSAGE: &str = "upload failed";
const UPLOAD_FIELD_NAME: &str = "file";

/// One-shot authenticated calls against the backend.
///
/// A `401` clears the shared [`Session`] before the error is returned, so every caller
/// observes expiry the same way.
#[derive(Clone)]
pub struct RestTransport {
    http: reqwest::Client,
    config: ClientConfig,
    session: Arc<Session>,
}

impl RestTransport {
    pub fn new(config: ClientConfig, session: Arc<Session>) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "build-http-client",
            })?;
        Ok(Self {
            http,
            config,
            session,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let url = self.config.endpoint(path)?;
        let request = self.http.get(url.clone());
        self.execute(request, &url, REQUEST_FAILED_MESSAGE, "rest-get")
            .await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.config.endpoint(path)?;
        let request = self.http.post(url.clone()).json(body);
        self.execute(request, &url, REQUEST_FAILED_MESSAGE, "rest-post")
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let url = self.config.endpoint(path)?;
        let request = self.http.delete(url.clone());
        self.execute(request, &url, REQUEST_FAILED_MESSAGE, "rest-delete")
            .await
    }

    /// Sends `file` as the multipart `file` field.
    pub async fn upload_file<T: DeserializeOwned>(
        &self,
        path: &str,
        file: &Path,
    ) -> ClientResult<T> {
        let url = self.config.endpoint(path)?;
        let bytes = tokio::fs::read(file).await.context(ReadUploadSnafu {
            stage: "read-upload-file",
            path: file.to_path_buf(),
        })?;
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.txt".to_string());

        tracing::debug!(file_name = %file_name, bytes = bytes.len(), "uploading file");
        let form = Form::new().part(UPLOAD_FIELD_NAME, Part::bytes(bytes).file_name(file_name));
        let request = self.http.post(url.clone()).multipart(form);
        self.execute(request, &url, UPLOAD_FAILED_MESSAGE, "rest-upload")
            .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &Url,
        fallback: &str,
        stage: &'static str,
    ) -> ClientResult<T> {
        let request = match self.session.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.context(NetworkSnafu {
            stage,
            url: url.to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.context(NetworkSnafu {
            stage: "read-response-body",
            url: url.to_string(),
        })?;

        if !status.is_success() {
            let message = failure_message(status.as_u16(), &body, fallback);
            tracing::warn!(
                url = %url,
                status = status.as_u16(),
                message = %message,
                "request failed"
            );

            if status == StatusCode::UNAUTHORIZED {
                self.session.clear();
                return UnauthorizedSnafu { stage, message }.fail();
            }
            return ServerSnafu {
                stage,
                status: status.as_u16(),
                message,
            }
            .fail();
        }

        serde_json::from_str(&body).context(DecodeResponseSnafu { stage })
    }
}

/// Server-supplied message of a failed response: `detail`, then `message`, then `HTTP <status>`.
/// A body that is not JSON yields `fallback`.
pub fn failure_message(status: u16, body: &str, fallback: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return fallback.to_string();
    };

    let detail = value.get("detail").or_else(|| value.get("message"));
    match detail {
        Some(Value::String(message)) if !message.trim().is_empty() => message.clone(),
        Some(Value::String(_)) | Some(Value::Null) | None => format!("HTTP {status}"),
        Some(other) => other.to_string(),
    }
}
