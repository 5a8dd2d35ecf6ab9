//! Client facade.
//!
//! [`CodelingoClient`] wires the credential store, dispatcher, refresh
//! coordinator and cache together. Build one per process and pass it by
//! reference; every clone of its parts shares the same state.

use codelingo_core::endpoints::auth as auth_endpoints;
use codelingo_core::validation::{validate_login, validate_registration};
use codelingo_core::{
    AuthResponse, CodelingoError, CodelingoResult, HttpTransport, LoginCredentials,
    RegisterCredentials, RequestError, User, UserUpdate,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::auth_api::AuthApi;
use crate::cache::{CacheConfig, CacheRead, ResultCache};
use crate::config::ClientConfig;
use crate::dispatcher::{ApiRequest, RequestDispatcher};
use crate::error::ClientError;
use crate::http::ReqwestTransport;
use crate::query::{auth_keys, QueryClient};
use crate::refresh::RefreshCoordinator;
use crate::retry::RetryPolicy;
use crate::session::{CredentialStore, Persistence, SessionEvent, SessionSnapshot};
use crate::storage::FileStorage;

/// Subdirectory of the storage dir holding the refresh credential.
const RESTRICTED_DIR: &str = "secure";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `{api_url}/{api_version}`
    pub api_base: String,
    pub cache: CacheConfig,
    pub query_retry: RetryPolicy,
    pub mutation_retry: RetryPolicy,
}

impl ClientOptions {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            cache: CacheConfig::default(),
            query_retry: RetryPolicy::queries(),
            mutation_retry: RetryPolicy::mutations(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            api_base: config.api_base(),
            cache: config.cache_config(),
            query_retry: config.query_retry(),
            mutation_retry: config.mutation_retry(),
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_retries(mut self, query_retry: RetryPolicy, mutation_retry: RetryPolicy) -> Self {
        self.query_retry = query_retry;
        self.mutation_retry = mutation_retry;
        self
    }
}

pub struct CodelingoClient {
    store: Arc<CredentialStore>,
    queries: QueryClient,
    auth: AuthApi,
}

impl CodelingoClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
        options: ClientOptions,
    ) -> Self {
        let refresher = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            &options.api_base,
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(
            transport,
            store.clone(),
            refresher,
            &options.api_base,
        ));
        let cache = ResultCache::new(options.cache, options.query_retry);
        let queries = QueryClient::new(dispatcher, cache, options.mutation_retry);
        let auth = AuthApi::new(queries.clone());
        Self {
            store,
            queries,
            auth,
        }
    }

    /// Real transport, session restored from `storage_dir`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
        let durable = Arc::new(FileStorage::new(&config.storage_dir));
        let restricted = Arc::new(FileStorage::restricted(
            config.storage_dir.join(RESTRICTED_DIR),
        ));
        let store = Arc::new(CredentialStore::restore(durable, restricted)?);
        Ok(Self::new(
            transport,
            store,
            ClientOptions::from_config(config),
        ))
    }

    /// Sign in. `remember_me` selects durable persistence.
    ///
    /// Wrong credentials surface as a 401 `ClientRequest` error and leave
    /// the session signed out.
    pub async fn login(&self, credentials: LoginCredentials) -> CodelingoResult<User> {
        validate_login(&credentials).map_err(CodelingoError::InvalidInput)?;
        let persistence = if credentials.remember_me {
            Persistence::Durable
        } else {
            Persistence::Ephemeral
        };

        self.begin_attempt();
        match self.auth.login(&credentials).await {
            Ok(response) => Ok(self.establish(response, persistence)),
            Err(err) => Err(self.fail_attempt(err)),
        }
    }

    pub async fn register(&self, credentials: RegisterCredentials) -> CodelingoResult<User> {
        validate_registration(&credentials).map_err(CodelingoError::InvalidInput)?;

        self.begin_attempt();
        match self.auth.register(&credentials).await {
            Ok(response) => Ok(self.establish(response, Persistence::Durable)),
            Err(err) => Err(self.fail_attempt(err)),
        }
    }

    fn begin_attempt(&self) {
        self.store.set_loading(true);
        self.store.set_error(None);
    }

    fn fail_attempt(&self, err: RequestError) -> CodelingoError {
        tracing::info!(error = %err, "authentication attempt failed");
        self.store.set_loading(false);
        self.store.set_error(Some(err.to_string()));
        err.into()
    }

    fn establish(&self, response: AuthResponse, persistence: Persistence) -> User {
        let user = response.user.clone();
        if let Err(err) = self.store.set_session(
            response.user,
            response.token,
            response.refresh_token,
            persistence,
        ) {
            // Signed in for this process; only the durable copy is missing.
            tracing::warn!(error = %err, "could not persist session");
            self.store.set_error(Some(err.to_string()));
        }
        self.seed_user(&user, false);
        tracing::info!(user_id = %user.id, ?persistence, "signed in");
        user
    }

    fn seed_user(&self, user: &User, with_profile: bool) {
        match serde_json::to_value(user) {
            Ok(value) => {
                if with_profile {
                    self.queries.cache().set(&auth_keys::profile(), value.clone());
                }
                self.queries.cache().set(&auth_keys::user(), value);
            }
            Err(err) => tracing::warn!(error = %err, "could not cache user"),
        }
    }

    /// Sign out. Local state is cleared even when the server call fails.
    pub async fn logout(&self) -> CodelingoResult<()> {
        if self.store.is_authenticated() {
            if let Err(err) = self.auth.logout().await {
                tracing::warn!(error = %err, "server logout failed; clearing locally");
            }
        }
        let cleared = self.store.clear_session();
        self.queries.cache().clear();
        tracing::info!("signed out");
        cleared.map_err(Into::into)
    }

    /// Force a credential refresh.
    pub async fn refresh(&self) -> CodelingoResult<()> {
        self.queries
            .dispatcher()
            .refresher()
            .refresh()
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    /// The signed-in user's profile, cached under `auth/profile`.
    pub async fn profile(&self) -> CodelingoResult<CacheRead<User>> {
        if !self.store.is_authenticated() {
            return Err(RequestError::SessionExpired.into());
        }
        let read = self
            .queries
            .query(&auth_keys::profile(), ApiRequest::get(auth_endpoints::PROFILE))
            .await?;
        Ok(read)
    }

    pub async fn update_profile(&self, update: UserUpdate) -> CodelingoResult<User> {
        let user = self.auth.update_profile(&update).await?;
        self.store.replace_user(user.clone())?;
        self.seed_user(&user, true);
        Ok(user)
    }

    pub fn session(&self) -> SessionSnapshot {
        self.store.snapshot()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.store.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.store.events()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn queries(&self) -> &QueryClient {
        &self.queries
    }

    pub fn auth(&self) -> &AuthApi {
        &self.auth
    }
}
