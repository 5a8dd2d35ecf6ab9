//! Request dispatcher.
//!
//! Every API call goes through [`RequestDispatcher`]. It resolves the URL,
//! attaches the current access credential and maps the response status
//! into [`RequestError`]. A 401 on an authenticated call triggers at most
//! one refresh-and-retry for that call.

use codelingo_core::endpoints::with_query;
use codelingo_core::{HttpRequest, HttpResponse, HttpTransport, Method, RequestError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::refresh::RefreshCoordinator;
use crate::session::{CredentialStore, SessionEvent};

const UNAUTHORIZED: u16 = 401;

/// A logical API request, relative to the configured API base.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Send without a credential and never enter the refresh path.
    pub skip_auth: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            skip_auth: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Serialize `body` as the JSON payload.
    pub fn json<B: Serialize + ?Sized>(self, body: &B) -> Result<Self, RequestError> {
        let value = serde_json::to_value(body).map_err(|e| RequestError::InvalidRequest {
            reason: format!("{} {}: {}", self.method, self.path, e),
        })?;
        Ok(self.body(value))
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    /// Path plus encoded query string.
    pub fn target(&self) -> String {
        let params: Vec<(&str, Option<&str>)> = self
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), Some(v.as_str())))
            .collect();
        with_query(&self.path, &params)
    }
}

pub struct RequestDispatcher {
    transport: Arc<dyn HttpTransport>,
    store: Arc<CredentialStore>,
    refresher: Arc<RefreshCoordinator>,
    api_base: String,
}

impl RequestDispatcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
        refresher: Arc<RefreshCoordinator>,
        api_base: &str,
    ) -> Self {
        Self {
            transport,
            store,
            refresher,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.refresher
    }

    /// Send and decode the JSON response into `T`.
    pub async fn send<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, RequestError> {
        let value = self.send_value(request).await?;
        decode(value, request)
    }

    /// Send and return the raw JSON response (`null` for an empty body).
    pub async fn send_value(&self, request: &ApiRequest) -> Result<Value, RequestError> {
        let request_id = Uuid::now_v7();
        let span = tracing::debug_span!(
            "api_request",
            method = %request.method,
            path = %request.path,
            request_id = %request_id,
        );
        self.dispatch(request, request_id).instrument(span).await
    }

    async fn dispatch(&self, request: &ApiRequest, request_id: Uuid) -> Result<Value, RequestError> {
        let url = self.resolve_url(request);
        let generation = self.store.generation();
        let sent = if request.skip_auth {
            None
        } else {
            self.store.access_credential()
        };

        let response = self
            .execute(request, &url, request_id, sent.as_deref())
            .await?;
        if response.status != UNAUTHORIZED || request.skip_auth {
            return into_result(response);
        }

        let credential = match self.store.access_credential() {
            Some(current) if sent.as_ref() != Some(&current) => {
                tracing::debug!("credential rotated while in flight; retrying without refresh");
                current
            }
            _ => match self.refresher.refresh().await {
                Ok(credentials) => credentials.access_credential,
                Err(err) => return Err(self.auth_failed(err, generation)),
            },
        };

        let response = self
            .execute(request, &url, request_id, Some(&credential))
            .await?;
        if response.status == UNAUTHORIZED {
            return Err(self.auth_failed(RequestError::SessionExpired, generation));
        }
        into_result(response)
    }

    async fn execute(
        &self,
        request: &ApiRequest,
        url: &str,
        request_id: Uuid,
        credential: Option<&str>,
    ) -> Result<HttpResponse, RequestError> {
        let mut http = HttpRequest::new(request.method, url)
            .header("content-type", "application/json")
            .header("x-request-id", request_id.to_string());
        if let Some(credential) = credential {
            http = http.header("authorization", format!("Bearer {}", credential));
        }
        if let Some(body) = &request.body {
            http = http.with_body(body.clone());
        }

        tracing::debug!(authenticated = credential.is_some(), "sending request");
        let result = self.transport.execute(http).await;
        match &result {
            Ok(response) => tracing::debug!(status = response.status, "response received"),
            Err(err) => tracing::debug!(error = %err, "no response"),
        }
        result
    }

    /// The session cannot be recovered: drop it and tell listeners.
    ///
    /// A session that was signed out or replaced since the call started is
    /// left alone.
    fn auth_failed(&self, cause: RequestError, generation: u64) -> RequestError {
        match self.store.clear_session_if(generation) {
            Ok(true) => {
                tracing::info!(cause = %cause, "authentication lost; session cleared");
                self.store.emit(SessionEvent::AuthRequired {
                    reason: cause.to_string(),
                });
            }
            Ok(false) => tracing::debug!(cause = %cause, "session changed during request"),
            Err(err) => {
                tracing::warn!(error = %err, "failed to remove persisted session");
                self.store.emit(SessionEvent::AuthRequired {
                    reason: cause.to_string(),
                });
            }
        }
        match cause {
            RequestError::RefreshUnavailable => RequestError::RefreshUnavailable,
            _ => RequestError::SessionExpired,
        }
    }

    fn resolve_url(&self, request: &ApiRequest) -> String {
        let target = request.target();
        if target.starts_with("http://") || target.starts_with("https://") {
            target
        } else if target.starts_with('/') {
            format!("{}{}", self.api_base, target)
        } else {
            format!("{}/{}", self.api_base, target)
        }
    }
}

fn into_result(response: HttpResponse) -> Result<Value, RequestError> {
    if response.is_success() {
        response.json_body()
    } else {
        Err(RequestError::from_status(
            response.status,
            response.error_message(),
        ))
    }
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value, request: &ApiRequest) -> Result<T, RequestError> {
    serde_json::from_value(value).map_err(|e| RequestError::InvalidResponse {
        reason: format!("{} {}: {}", request.method, request.path, e),
    })
}
