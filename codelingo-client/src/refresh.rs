//! Silent re-authentication with the refresh credential.
//!
//! At most one refresh runs at a time for the whole client. Callers that
//! hit an expired credential while a refresh is running wait for it and
//! share its outcome. Flights are keyed by session generation, so a caller
//! of a newer session never joins a refresh started for an older one.

use codelingo_core::endpoints::auth as auth_endpoints;
use codelingo_core::{
    HttpRequest, HttpTransport, Method, RefreshRequest, RefreshResponse, RequestError,
};
use futures_util::future::FutureExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::session::CredentialStore;
use crate::singleflight::SingleFlight;

/// Credentials produced by a successful refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_credential: String,
    pub refresh_credential: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_credential", &"<redacted>")
            .field(
                "refresh_credential",
                &self.refresh_credential.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

type RefreshOutcome = Result<Credentials, RequestError>;

pub struct RefreshCoordinator {
    transport: Arc<dyn HttpTransport>,
    store: Arc<CredentialStore>,
    refresh_url: String,
    flight: SingleFlight<u64, RefreshOutcome>,
    attempts: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
        api_base: &str,
    ) -> Self {
        Self {
            transport,
            store,
            refresh_url: format!("{}{}", api_base.trim_end_matches('/'), auth_endpoints::REFRESH),
            flight: SingleFlight::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Obtain a new access credential, joining a running refresh if any.
    ///
    /// The store is only written on success.
    pub async fn refresh(&self) -> RefreshOutcome {
        let generation = self.store.generation();
        self.flight
            .run(generation, || {
                let transport = self.transport.clone();
                let store = self.store.clone();
                let url = self.refresh_url.clone();
                self.attempts.fetch_add(1, Ordering::Relaxed);
                perform_refresh(transport, store, url, generation).boxed()
            })
            .await
    }

    /// Number of refresh flights started (joined callers are not counted).
    pub fn refresh_count(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Whether a refresh is running for the current session.
    pub fn is_refreshing(&self) -> bool {
        self.flight.is_in_flight(&self.store.generation())
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("refresh_url", &self.refresh_url)
            .field("attempts", &self.refresh_count())
            .finish()
    }
}

async fn perform_refresh(
    transport: Arc<dyn HttpTransport>,
    store: Arc<CredentialStore>,
    url: String,
    generation: u64,
) -> RefreshOutcome {
    let (current, refresh_credential) = store.refresh_grant();
    if current != generation {
        return Err(RequestError::SessionExpired);
    }
    let refresh_credential = match refresh_credential {
        Some(credential) => credential,
        None => {
            tracing::debug!("no refresh credential held");
            return Err(RequestError::RefreshUnavailable);
        }
    };

    let body = serde_json::to_value(RefreshRequest {
        refresh_token: refresh_credential,
    })
    .map_err(|e| RequestError::InvalidRequest {
        reason: e.to_string(),
    })?;
    let request = HttpRequest::new(Method::Post, url)
        .header("content-type", "application/json")
        .with_body(body);

    let response = transport.execute(request).await.inspect_err(|err| {
        tracing::warn!(error = %err, "refresh request failed");
    })?;
    if !response.is_success() {
        let err = RequestError::from_status(response.status, response.error_message());
        tracing::warn!(status = response.status, "refresh rejected");
        return Err(err);
    }

    let payload: RefreshResponse = serde_json::from_value(response.json_body()?).map_err(|e| {
        RequestError::InvalidResponse {
            reason: format!("refresh payload: {}", e),
        }
    })?;

    match store.rotate_credentials(
        generation,
        payload.token.clone(),
        payload.refresh_token.clone(),
        payload.user,
    ) {
        Ok(true) => tracing::info!("session refreshed"),
        Ok(false) => {
            tracing::info!("session changed during refresh; discarding credentials");
            return Err(RequestError::SessionExpired);
        }
        Err(err) => {
            // The in-memory session already holds the new credentials.
            tracing::warn!(error = %err, "could not persist refreshed credentials");
        }
    }

    Ok(Credentials {
        access_credential: payload.token,
        refresh_credential: payload.refresh_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Persistence;
    use codelingo_core::HttpResponse;
    use codelingo_test_utils::{fixtures, MockTransport};
    use serde_json::json;
    use std::time::Duration;

    fn signed_in_store(refresh: Option<&str>) -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::in_memory());
        store
            .set_session(
                fixtures::mock_user(),
                "access-1".to_string(),
                refresh.map(str::to_string),
                Persistence::Ephemeral,
            )
            .unwrap();
        store
    }

    fn refresh_ok() -> MockTransport {
        MockTransport::new(|_req| {
            Ok(HttpResponse::json(
                200,
                &json!({"token": "access-2", "refreshToken": "refresh-2"}),
            ))
        })
    }

    #[tokio::test]
    async fn test_refresh_without_credential_is_unavailable() {
        let transport = Arc::new(refresh_ok());
        let store = signed_in_store(None);
        let coordinator =
            RefreshCoordinator::new(transport.clone(), store.clone(), "http://api.test/v1");

        assert_eq!(
            coordinator.refresh().await,
            Err(RequestError::RefreshUnavailable)
        );
        assert!(transport.calls().is_empty());
        assert_eq!(store.access_credential().as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_refresh_rotates_store() {
        let transport = Arc::new(refresh_ok());
        let store = signed_in_store(Some("refresh-1"));
        let coordinator =
            RefreshCoordinator::new(transport.clone(), store.clone(), "http://api.test/v1");

        let credentials = coordinator.refresh().await.unwrap();
        assert_eq!(credentials.access_credential, "access-2");
        assert_eq!(store.access_credential().as_deref(), Some("access-2"));
        assert_eq!(store.refresh_credential().as_deref(), Some("refresh-2"));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "http://api.test/v1/auth/refresh");
        assert_eq!(
            calls[0].body,
            Some(json!({"refreshToken": "refresh-1"}))
        );
    }

    #[tokio::test]
    async fn test_rejected_refresh_leaves_store_untouched() {
        let transport = Arc::new(MockTransport::new(|_req| {
            Ok(HttpResponse::json(401, &json!({"message": "expired"})))
        }));
        let store = signed_in_store(Some("refresh-1"));
        let coordinator = RefreshCoordinator::new(transport, store.clone(), "http://api.test/v1");

        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(store.access_credential().as_deref(), Some("access-1"));
        assert_eq!(store.refresh_credential().as_deref(), Some("refresh-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_flight() {
        let transport = Arc::new(refresh_ok().with_latency(Duration::from_millis(100)));
        let store = signed_in_store(Some("refresh-1"));
        let coordinator =
            RefreshCoordinator::new(transport.clone(), store, "http://api.test/v1");

        let results =
            futures_util::future::join_all((0..8).map(|_| coordinator.refresh())).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(coordinator.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_refresh_stays_signed_out() {
        let transport = Arc::new(refresh_ok().with_latency(Duration::from_millis(100)));
        let store = signed_in_store(Some("refresh-1"));
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            "http://api.test/v1",
        ));

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear_session().unwrap();

        let outcome = running.await.unwrap();
        assert_eq!(outcome, Err(RequestError::SessionExpired));
        assert_eq!(transport.calls().len(), 1);
        assert!(!store.is_authenticated());
        assert!(store.access_credential().is_none());
        assert!(store.refresh_credential().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_does_not_overwrite_newer_sign_in() {
        let transport = Arc::new(refresh_ok().with_latency(Duration::from_millis(100)));
        let store = signed_in_store(Some("refresh-1"));
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport,
            store.clone(),
            "http://api.test/v1",
        ));

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .set_session(
                fixtures::mock_user(),
                "fresh-login".to_string(),
                Some("refresh-9".to_string()),
                Persistence::Ephemeral,
            )
            .unwrap();

        assert_eq!(running.await.unwrap(), Err(RequestError::SessionExpired));
        assert_eq!(store.access_credential().as_deref(), Some("fresh-login"));
        assert_eq!(store.refresh_credential().as_deref(), Some("refresh-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_does_not_join_old_refresh() {
        let transport = Arc::new(refresh_ok().with_latency(Duration::from_millis(100)));
        let store = signed_in_store(Some("refresh-1"));
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            "http://api.test/v1",
        ));

        let old = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear_session().unwrap();
        store
            .set_session(
                fixtures::mock_user(),
                "second".to_string(),
                Some("refresh-b".to_string()),
                Persistence::Ephemeral,
            )
            .unwrap();
        assert!(!coordinator.is_refreshing());

        let credentials = coordinator.refresh().await.unwrap();
        assert_eq!(credentials.access_credential, "access-2");
        assert_eq!(old.await.unwrap(), Err(RequestError::SessionExpired));
        assert_eq!(coordinator.refresh_count(), 2);
        assert_eq!(store.access_credential().as_deref(), Some("access-2"));

        let calls = transport.calls_to("/auth/refresh");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].body, Some(json!({"refreshToken": "refresh-b"})));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let credentials = Credentials {
            access_credential: "secret-access".to_string(),
            refresh_credential: Some("secret-refresh".to_string()),
        };
        let rendered = format!("{:?}", credentials);
        assert!(!rendered.contains("secret"));
    }
}
