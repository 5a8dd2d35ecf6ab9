//! Credential store: the one owner of session state.
//!
//! Session state is split in two structs. [`PersistedSession`] is the record
//! written to durable storage; [`RuntimeSession`] is the in-memory state,
//! rebuilt from the persisted record at startup. The refresh credential is
//! never part of the durable record and lives in a separate restricted area.

use codelingo_core::{StorageError, User, UserUpdate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, watch};

use crate::storage::{
    MemoryStorage, SessionStorage, REFRESH_CREDENTIAL_KEY, SESSION_RECORD_KEY,
};

const EVENT_CAPACITY: usize = 32;

/// Where a session's credentials are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    /// Process memory only; gone on restart.
    #[default]
    Ephemeral,
    /// Written to the durable record and the restricted area.
    Durable,
}

/// The durable session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub user: Option<User>,
    pub access_credential: Option<String>,
    pub authenticated: bool,
}

/// In-memory session state.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RuntimeSession {
    pub user: Option<User>,
    pub access_credential: Option<String>,
    pub refresh_credential: Option<String>,
    pub persistence: Persistence,
    pub loading: bool,
    pub last_error: Option<String>,
}

impl RuntimeSession {
    /// Authenticated iff an access credential is held.
    pub fn is_authenticated(&self) -> bool {
        self.access_credential.is_some()
    }

    pub fn from_persisted(persisted: PersistedSession, refresh_credential: Option<String>) -> Self {
        if persisted.authenticated != persisted.access_credential.is_some() {
            tracing::warn!(
                stored_flag = persisted.authenticated,
                "persisted authenticated flag disagrees with stored credential; using credential"
            );
        }
        Self {
            user: persisted.user,
            access_credential: persisted.access_credential,
            refresh_credential,
            persistence: Persistence::Durable,
            loading: false,
            last_error: None,
        }
    }

    pub fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            user: self.user.clone(),
            access_credential: self.access_credential.clone(),
            authenticated: self.is_authenticated(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            authenticated: self.is_authenticated(),
            user: self.user.clone(),
        }
    }
}

impl fmt::Debug for RuntimeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeSession")
            .field("user", &self.user.as_ref().map(|u| &u.email))
            .field("access_credential", &self.access_credential.as_ref().map(|_| "<redacted>"))
            .field("refresh_credential", &self.refresh_credential.as_ref().map(|_| "<redacted>"))
            .field("persistence", &self.persistence)
            .field("loading", &self.loading)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// What UI consumers observe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub user: Option<User>,
}

/// Session transitions, broadcast to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { email: String },
    Refreshed,
    SignedOut,
    /// The session could not be recovered; consumers should route to login.
    AuthRequired { reason: String },
}

/// Credential store.
///
/// Mutations are last-write-wins. In-memory state is always updated, even
/// when writing the durable record fails; the storage error is returned.
///
/// Every sign-in and sign-out starts a new generation. Work that began under
/// one generation (a refresh, a forced sign-out) only applies if the
/// generation is unchanged when it lands.
pub struct CredentialStore {
    state: RwLock<RuntimeSession>,
    /// Only changed while holding the `state` write lock.
    generation: AtomicU64,
    durable: Arc<dyn SessionStorage>,
    restricted: Arc<dyn SessionStorage>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl CredentialStore {
    /// Empty session over the given storage areas.
    pub fn new(durable: Arc<dyn SessionStorage>, restricted: Arc<dyn SessionStorage>) -> Self {
        Self::with_state(RuntimeSession::default(), durable, restricted)
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    /// Rebuild the session from storage at process start.
    ///
    /// A corrupt durable record is discarded (and removed) rather than
    /// blocking startup.
    pub fn restore(
        durable: Arc<dyn SessionStorage>,
        restricted: Arc<dyn SessionStorage>,
    ) -> Result<Self, StorageError> {
        let record = durable.load(SESSION_RECORD_KEY)?;
        let persisted = match record {
            Some(raw) => match serde_json::from_str::<PersistedSession>(&raw) {
                Ok(persisted) => Some(persisted),
                Err(err) => {
                    tracing::warn!(error = %err, "discarding corrupt session record");
                    durable.remove(SESSION_RECORD_KEY)?;
                    None
                }
            },
            None => None,
        };

        let state = match persisted {
            Some(persisted) => {
                let refresh = restricted.load(REFRESH_CREDENTIAL_KEY)?;
                RuntimeSession::from_persisted(persisted, refresh)
            }
            None => RuntimeSession::default(),
        };
        tracing::debug!(authenticated = state.is_authenticated(), "session restored");
        Ok(Self::with_state(state, durable, restricted))
    }

    fn with_state(
        state: RuntimeSession,
        durable: Arc<dyn SessionStorage>,
        restricted: Arc<dyn SessionStorage>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(state),
            generation: AtomicU64::new(0),
            durable,
            restricted,
            snapshot_tx,
            events_tx,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RuntimeSession> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RuntimeSession> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the session.
    pub fn set_session(
        &self,
        user: User,
        access_credential: String,
        refresh_credential: Option<String>,
        persistence: Persistence,
    ) -> Result<(), StorageError> {
        let email = user.email.clone();
        let next = {
            let mut state = self.write_state();
            *state = RuntimeSession {
                user: Some(user),
                access_credential: Some(access_credential),
                refresh_credential,
                persistence,
                loading: false,
                last_error: None,
            };
            self.generation.fetch_add(1, Ordering::AcqRel);
            state.clone()
        };
        self.publish(&next);
        self.emit(SessionEvent::SignedIn { email });
        self.persist(&next)
    }

    /// Current session generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The refresh credential together with the generation it belongs to.
    pub fn refresh_grant(&self) -> (u64, Option<String>) {
        let state = self.read_state();
        (self.generation(), state.refresh_credential.clone())
    }

    /// Swap in refreshed credentials, keeping the user and persistence mode.
    /// A `None` refresh credential keeps the current one.
    ///
    /// Returns `Ok(false)` and changes nothing when the session is no longer
    /// the one of `generation` (signed out or replaced meanwhile).
    pub fn rotate_credentials(
        &self,
        generation: u64,
        access_credential: String,
        refresh_credential: Option<String>,
        user: Option<User>,
    ) -> Result<bool, StorageError> {
        let next = {
            let mut state = self.write_state();
            if self.generation() != generation || !state.is_authenticated() {
                return Ok(false);
            }
            state.access_credential = Some(access_credential);
            if let Some(refresh) = refresh_credential {
                state.refresh_credential = Some(refresh);
            }
            if let Some(user) = user {
                state.user = Some(user);
            }
            state.clone()
        };
        self.publish(&next);
        self.emit(SessionEvent::Refreshed);
        self.persist(&next)?;
        Ok(true)
    }

    /// Drop all credential state, in memory and in storage.
    pub fn clear_session(&self) -> Result<(), StorageError> {
        let mut state = self.write_state();
        self.reset(&mut state)
    }

    /// Like [`clear_session`](Self::clear_session), but only if the session
    /// is still the one of `generation`. Returns whether it cleared.
    pub fn clear_session_if(&self, generation: u64) -> Result<bool, StorageError> {
        let mut state = self.write_state();
        if self.generation() != generation {
            return Ok(false);
        }
        self.reset(&mut state)?;
        Ok(true)
    }

    /// Called with the state write lock held.
    fn reset(&self, state: &mut RuntimeSession) -> Result<(), StorageError> {
        let was_authenticated = state.is_authenticated();
        *state = RuntimeSession::default();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.publish(&RuntimeSession::default());
        if was_authenticated {
            self.emit(SessionEvent::SignedOut);
        }
        let durable = self.durable.remove(SESSION_RECORD_KEY);
        let restricted = self.restricted.remove(REFRESH_CREDENTIAL_KEY);
        durable.and(restricted)
    }

    /// Merge a partial user update; no-op when signed out.
    pub fn update_user(&self, update: &UserUpdate) -> Result<bool, StorageError> {
        let next = {
            let mut state = self.write_state();
            match state.user.as_mut() {
                Some(user) => user.apply(update),
                None => return Ok(false),
            }
            state.clone()
        };
        self.publish(&next);
        self.persist(&next)?;
        Ok(true)
    }

    /// Replace the signed-in user with a server copy; no-op when signed out.
    pub fn replace_user(&self, user: User) -> Result<bool, StorageError> {
        let next = {
            let mut state = self.write_state();
            if !state.is_authenticated() {
                return Ok(false);
            }
            state.user = Some(user);
            state.clone()
        };
        self.publish(&next);
        self.persist(&next)?;
        Ok(true)
    }

    pub fn access_credential(&self) -> Option<String> {
        self.read_state().access_credential.clone()
    }

    pub fn refresh_credential(&self) -> Option<String> {
        self.read_state().refresh_credential.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.read_state().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_state().is_authenticated()
    }

    pub fn persistence(&self) -> Persistence {
        self.read_state().persistence
    }

    pub fn set_loading(&self, loading: bool) {
        self.write_state().loading = loading;
    }

    pub fn loading(&self) -> bool {
        self.read_state().loading
    }

    pub fn set_error(&self, error: Option<String>) {
        self.write_state().last_error = error;
    }

    pub fn last_error(&self) -> Option<String> {
        self.read_state().last_error.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.read_state().snapshot()
    }

    /// Observe `authenticated` / `user` changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Listen for session transitions. Dropping the receiver unsubscribes.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No listeners is fine.
        let _ = self.events_tx.send(event);
    }

    fn publish(&self, state: &RuntimeSession) {
        let snapshot = state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn persist(&self, state: &RuntimeSession) -> Result<(), StorageError> {
        match state.persistence {
            Persistence::Durable => {
                let record = serde_json::to_string(&state.to_persisted()).map_err(|e| {
                    StorageError::Corrupt {
                        key: SESSION_RECORD_KEY.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                self.durable.save(SESSION_RECORD_KEY, &record)?;
                match &state.refresh_credential {
                    Some(refresh) => self.restricted.save(REFRESH_CREDENTIAL_KEY, refresh),
                    None => self.restricted.remove(REFRESH_CREDENTIAL_KEY),
                }
            }
            Persistence::Ephemeral => {
                // A previous durable session must not resurface on restart.
                let durable = self.durable.remove(SESSION_RECORD_KEY);
                let restricted = self.restricted.remove(REFRESH_CREDENTIAL_KEY);
                durable.and(restricted)
            }
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("state", &*self.read_state())
            .finish()
    }
}
