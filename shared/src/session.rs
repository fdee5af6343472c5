//! Signed-in user and bearer token.
//!
//! Only storage and attachment of the token live here; how the shell obtains
//! it is its own business. There is no refresh or expiry handling.

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, TypedKvStore};
use crate::model::UserId;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, instrument, warn};

const SESSION_KEY: &str = "current";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("user id cannot be empty")]
    EmptyUserId,

    #[error("bearer token cannot be empty")]
    EmptyToken,

    #[error("session storage error: {0}")]
    Storage(#[from] KvError),
}

/// `SecretString` keeps the token out of `Debug` output.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    token: SecretString,
}

impl Session {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Result<Self, SessionError> {
        if user_id.as_str().trim().is_empty() {
            return Err(SessionError::EmptyUserId);
        }
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SessionError::EmptyToken);
        }
        Ok(Self {
            user_id,
            token: SecretString::new(token),
        })
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    user_id: UserId,
    token: String,
}

/// Shared view of the current session, read on every submission.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    current: Arc<RwLock<Option<Session>>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(session: Session) -> Self {
        let credentials = Self::new();
        credentials.replace(Some(session));
        credentials
    }

    pub fn current(&self) -> Option<Session> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.current().map(|s| s.user_id)
    }

    /// Value for the `Authorization` header, if signed in.
    pub fn authorization(&self) -> Option<String> {
        self.current()
            .map(|s| format!("Bearer {}", s.token.expose_secret()))
    }

    fn replace(&self, session: Option<Session>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = session;
    }
}

pub struct SessionStore<S> {
    store: TypedKvStore<StoredSession, S>,
    credentials: Credentials,
}

impl<S: KeyValueStore> SessionStore<S> {
    pub fn new(store: Arc<S>, credentials: Credentials) -> Self {
        Self {
            store: TypedKvStore::new(store, KeyNamespace::Session),
            credentials,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    #[instrument(skip(self, token), fields(user_id = %user_id))]
    pub async fn sign_in(
        &self,
        user_id: UserId,
        token: impl Into<String>,
    ) -> Result<Session, SessionError> {
        let session = Session::new(user_id, token)?;
        let stored = StoredSession {
            user_id: session.user_id.clone(),
            token: session.token.expose_secret().clone(),
        };
        self.store.set(SESSION_KEY, &stored).await?;
        self.credentials.replace(Some(session.clone()));
        info!("session stored");
        Ok(session)
    }

    /// Loads a persisted session into the shared credentials.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<Option<Session>, SessionError> {
        let stored = match self.store.get(SESSION_KEY).await {
            Ok(stored) => stored,
            Err(KvError::Serialization { message, .. }) => {
                warn!(%message, "discarding unreadable session");
                self.store.delete(SESSION_KEY).await?;
                None
            }
            Err(e) => return Err(e.into()),
        };

        let session = match stored {
            Some(stored) => Some(Session::new(stored.user_id, stored.token)?),
            None => None,
        };
        self.credentials.replace(session.clone());
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        self.store.delete(SESSION_KEY).await?;
        self.credentials.replace(None);
        info!("session cleared");
        Ok(())
    }
}
