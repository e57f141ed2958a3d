use std::time::Duration;

use snafu::{ResultExt, ensure};
use url::Url;

use crate::error::{ClientResult, InvalidUrlSnafu, UnsupportedSchemeSnafu};
use crate::stream::ReconnectPolicy;

/// Base address used when neither an override nor a hosting origin is available.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
/// Environment variable standing in for the hosting page's origin.
pub const ORIGIN_ENV: &str = "DOCCHAT_ORIGIN";
/// Environment variable overriding the streaming base address.
pub const STREAM_BASE_ENV: &str = "DOCCHAT_WS_BASE";
/// Path of the streaming chat endpoint.
pub const STREAM_CHAT_PATH: &str = "/ws/chat";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: Url,
    pub stream_base_url: Url,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Resolves addresses from explicit overrides, then the environment, then defaults.
    pub fn resolve(
        base_override: Option<&str>,
        stream_override: Option<&str>,
    ) -> ClientResult<Self> {
        let origin = std::env::var(ORIGIN_ENV).ok();
        let stream_env = std::env::var(STREAM_BASE_ENV).ok();
        Self::resolve_with(
            base_override,
            origin.as_deref(),
            stream_override.or(stream_env.as_deref()),
        )
    }

    /// Pure form of [`ClientConfig::resolve`] with the environment passed in.
    pub fn resolve_with(
        base_override: Option<&str>,
        origin: Option<&str>,
        stream_override: Option<&str>,
    ) -> ClientResult<Self> {
        let raw_base = resolve_base_address(base_override, origin);
        let base_url = parse_address(raw_base, &["http", "https"], "resolve-base-url")?;

        let stream_base_url = match non_blank(stream_override) {
            Some(raw) => parse_address(raw, &["ws", "wss"], "resolve-stream-url")?,
            None => upgrade_scheme(&base_url)?,
        };

        Ok(Self {
            base_url,
            stream_base_url,
            reconnect: ReconnectPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Joins an API path onto the base address, keeping any path prefix of the base.
    pub fn endpoint(&self, path: &str) -> ClientResult<Url> {
        join_path(&self.base_url, path)
    }

    /// Builds the streaming chat address with optional `document_id` and `token` parameters.
    pub fn stream_endpoint(
        &self,
        document_id: Option<&str>,
        token: Option<&str>,
    ) -> ClientResult<Url> {
        let mut url = join_path(&self.stream_base_url, STREAM_CHAT_PATH)?;
        let document_id = non_blank(document_id);
        let token = non_blank(token);

        if document_id.is_some() || token.is_some() {
            let mut pairs = url.query_pairs_mut();
            if let Some(document_id) = document_id {
                pairs.append_pair("document_id", document_id);
            }
            if let Some(token) = token {
                pairs.append_pair("token", token);
            }
        }

        Ok(url)
    }
}

/// Upgrades `http` to `ws` and `https` to `wss`.
pub fn upgrade_scheme(base: &Url) -> ClientResult<Url> {
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(base.clone()),
        other => {
            return UnsupportedSchemeSnafu {
                stage: "upgrade-scheme",
                raw: base.to_string(),
                scheme: other.to_string(),
            }
            .fail();
        }
    };

    let mut upgraded = base.clone();
    if upgraded.set_scheme(scheme).is_err() {
        return UnsupportedSchemeSnafu {
            stage: "upgrade-scheme-set",
            raw: base.to_string(),
            scheme: scheme.to_string(),
        }
        .fail();
    }
    Ok(upgraded)
}

/// Drops the query string so credentials never reach the logs.
pub fn redact(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.to_string()
}

fn resolve_base_address<'a>(base_override: Option<&'a str>, origin: Option<&'a str>) -> &'a str {
    non_blank(base_override)
        .or_else(|| non_blank(origin).filter(|origin| origin.starts_with("http")))
        .unwrap_or(DEFAULT_BASE_URL)
}

fn parse_address(raw: &str, schemes: &[&str], stage: &'static str) -> ClientResult<Url> {
    let url = Url::parse(raw.trim()).context(InvalidUrlSnafu {
        stage,
        raw: raw.to_string(),
    })?;
    ensure!(
        schemes.contains(&url.scheme()),
        UnsupportedSchemeSnafu {
            stage,
            raw: raw.to_string(),
            scheme: url.scheme().to_string(),
        }
    );
    Ok(url)
}

fn join_path(base: &Url, path: &str) -> ClientResult<Url> {
    let raw = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&raw).context(InvalidUrlSnafu {
        stage: "join-endpoint-path",
        raw,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
