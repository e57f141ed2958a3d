use std::sync::Arc;

use arc_swap::ArcSwapOption;
use docchat_storage::{AUTH_TOKEN_KEY, AUTH_USERNAME_KEY, KeyValueStore, StorageNamespace};
use serde::Deserialize;
use snafu::ResultExt;
use tokio::sync::watch;

use crate::error::{ClientResult, StorageSnafu};

/// Bearer credential issued by login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub username: String,
}

/// Identity resolved by the profile check.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionEvent {
    #[default]
    Anonymous,
    SignedIn,
    SignedOut,
    /// The backend rejected the credential; the user must log in again.
    Expired,
}

/// Credential and identity shared by both transports and the dispatcher.
pub struct Session {
    store: Arc<dyn KeyValueStore>,
    credential: ArcSwapOption<Credential>,
    user: ArcSwapOption<UserProfile>,
    events: watch::Sender<SessionEvent>,
}

impl Session {
    /// Rebuilds the session from the persisted credential keys.
    pub fn restore(store: Arc<dyn KeyValueStore>) -> Arc<Self> {
        let credential = match read_credential(store.as_ref()) {
            Ok(credential) => credential,
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    "failed to read stored credential, starting anonymous"
                );
                None
            }
        };
        let initial = if credential.is_some() {
            SessionEvent::SignedIn
        } else {
            SessionEvent::Anonymous
        };
        let (events, _) = watch::channel(initial);

        Arc::new(Self {
            store,
            credential: ArcSwapOption::from_pointee(credential),
            user: ArcSwapOption::empty(),
            events,
        })
    }

    pub fn token(&self) -> Option<String> {
        self.credential
            .load()
            .as_ref()
            .map(|credential| credential.token.clone())
    }

    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.credential.load_full()
    }

    pub fn user(&self) -> Option<Arc<UserProfile>> {
        self.user.load_full()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential.load().is_some()
    }

    pub fn establish(&self, token: &str, username: &str) -> ClientResult<()> {
        self.store.set(AUTH_TOKEN_KEY, token).context(StorageSnafu {
            stage: "persist-auth-token",
        })?;
        if !username.is_empty() {
            self.store
                .set(AUTH_USERNAME_KEY, username)
                .context(StorageSnafu {
                    stage: "persist-auth-username",
                })?;
        }

        self.credential.store(Some(Arc::new(Credential {
            token: token.to_string(),
            username: username.to_string(),
        })));
        self.user.store(None);
        self.events.send_replace(SessionEvent::SignedIn);
        tracing::info!(username, "session established");
        Ok(())
    }

    pub fn set_user(&self, user: UserProfile) {
        self.user.store(Some(Arc::new(user)));
    }

    /// Drops the credential after the backend refused it.
    pub fn clear(&self) {
        if self.wipe() {
            tracing::warn!("session expired, credential cleared");
        }
        self.events.send_replace(SessionEvent::Expired);
    }

    pub fn logout(&self) {
        self.wipe();
        self.events.send_replace(SessionEvent::SignedOut);
        tracing::info!("signed out");
    }

    /// Storage scope for transcripts: the resolved user, else the guest scope.
    pub fn namespace(&self) -> StorageNamespace {
        let user = self.user.load();
        StorageNamespace::for_user(user.as_ref().map(|user| user.user_id.as_str()))
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn last_event(&self) -> SessionEvent {
        *self.events.borrow()
    }

    fn wipe(&self) -> bool {
        let had_credential = self.credential.swap(None).is_some();
        self.user.store(None);
        for key in [AUTH_TOKEN_KEY, AUTH_USERNAME_KEY] {
            if let Err(error) = self.store.remove(key) {
                tracing::warn!(error = %error, key, "failed to remove stored credential");
            }
        }
        had_credential
    }
}

fn read_credential(store: &dyn KeyValueStore) -> ClientResult<Option<Credential>> {
    let token = store.get(AUTH_TOKEN_KEY).context(StorageSnafu {
        stage: "read-auth-token",
    })?;
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return Ok(None);
    };
    let username = store
        .get(AUTH_USERNAME_KEY)
        .context(StorageSnafu {
            stage: "read-auth-username",
        })?
        .unwrap_or_default();

    Ok(Some(Credential { token, username }))
}

#[cfg(test)]
mod tests {
    use docchat_storage::MemoryStore;

    use super::*;

    #[test]
    fn restore_reads_the_persisted_credential() {
        let store = Arc::new(MemoryStore::with_entries([
            (AUTH_TOKEN_KEY, "tok-1"),
            (AUTH_USERNAME_KEY, "ada"),
        ]));
        let session = Session::restore(store);

        assert!(session.is_authenticated());
        assert_eq!(session.token().as_deref(), Some("tok-1"));
        assert_eq!(session.credential().unwrap().username, "ada");
        assert_eq!(session.last_event(), SessionEvent::SignedIn);
    }

    #[test]
    fn establish_persists_and_clear_wipes() {
        let store = Arc::new(MemoryStore::new());
        let session = Session::restore(store.clone());
        assert!(!session.is_authenticated());

        session.establish("tok-2", "grace").unwrap();
        assert_eq!(store.get(AUTH_TOKEN_KEY).unwrap().as_deref(), Some("tok-2"));
        assert_eq!(store.get(AUTH_USERNAME_KEY).unwrap().as_deref(), Some("grace"));

        let mut events = session.subscribe();
        session.clear();
        assert!(!session.is_authenticated());
        assert_eq!(store.get(AUTH_TOKEN_KEY).unwrap(), None);
        assert!(events.has_changed().unwrap());
        assert_eq!(*events.borrow_and_update(), SessionEvent::Expired);
    }

    #[test]
    fn namespace_follows_the_resolved_user() {
        let session = Session::restore(Arc::new(MemoryStore::new()));
        assert_eq!(session.namespace(), StorageNamespace::Guest);

        session.set_user(UserProfile {
            user_id: "u-42".into(),
            username: "ada".into(),
        });
        assert_eq!(session.namespace(), StorageNamespace::User("u-42".into()));

        session.logout();
        assert_eq!(session.namespace(), StorageNamespace::Guest);
        assert_eq!(session.last_event(), SessionEvent::SignedOut);
    }
}
