use std::fmt;

/// Key holding the bearer credential of the signed-in user.
pub const AUTH_TOKEN_KEY: &str = "auth_token";
/// Key holding the display name returned by the login endpoint.
pub const AUTH_USERNAME_KEY: &str = "auth_username";

const GUEST_NAMESPACE: &str = "guest";
const CHAT_KEY_PREFIX: &str = "chat";

/// Scope for per-user chat keys. Unauthenticated clients share the guest namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum StorageNamespace {
    #[default]
    Guest,
    User(String),
}

impl StorageNamespace {
    /// Builds a namespace from an optional user id; blank ids fall back to guest.
    pub fn for_user(user_id: Option<&str>) -> Self {
        match user_id.map(str::trim) {
            Some(user_id) if !user_id.is_empty() => Self::User(user_id.to_string()),
            _ => Self::Guest,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest)
    }

    pub fn prefix(&self) -> String {
        format!("{CHAT_KEY_PREFIX}_{self}")
    }

    /// Key of the serialized transcript.
    pub fn messages_key(&self) -> String {
        format!("{}_messages", self.prefix())
    }

    /// Key of the selected document id; an empty value means no selection.
    pub fn document_id_key(&self) -> String {
        format!("{}_document_id", self.prefix())
    }
}

impl fmt::Display for StorageNamespace {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest => formatter.write_str(GUEST_NAMESPACE),
            Self::User(user_id) => formatter.write_str(user_id),
        }
    }
}
