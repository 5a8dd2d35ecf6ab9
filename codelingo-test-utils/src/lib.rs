//! CodeLingo Test Utilities
//!
//! Shared test infrastructure for the client workspace:
//! - A scripted [`MockTransport`] that records every request
//! - [`MockApi`], a small stateful stand-in for the auth endpoints
//! - Fixtures matching the development mock data
//! - Proptest generators

pub use codelingo_core::{
    AuthResponse, HttpRequest, HttpResponse, HttpTransport, Method, RequestError, User,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, RequestError> + Send + Sync;

/// Transport double driven by a handler closure.
///
/// Requests are recorded before the optional latency elapses, so a test can
/// count calls that are still "on the wire".
pub struct MockTransport {
    handler: Arc<Handler>,
    latency: Option<Duration>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, RequestError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Delay every response by `latency` (tokio time, so paused clocks work).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HttpRequest>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.lock().clone()
    }

    /// Requests whose URL path ends with `suffix`.
    pub fn calls_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.lock()
            .iter()
            .filter(|req| req.path().ends_with(suffix))
            .cloned()
            .collect()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RequestError> {
        self.lock().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        (self.handler)(&request)
    }
}

// ============================================================================
// MOCK API
// ============================================================================

struct ApiState {
    access: String,
    refresh: String,
    issued: u32,
    reject_refresh: bool,
}

/// Stateful stand-in for the CodeLingo auth endpoints.
///
/// Accepts `test@example.com` / `password123`. Protected routes require the
/// most recently issued access credential; anything else answers 401.
pub struct MockApi {
    state: Mutex<ApiState>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ApiState {
                access: fixtures::ACCESS_TOKEN.to_string(),
                refresh: fixtures::REFRESH_TOKEN.to_string(),
                issued: 0,
                reject_refresh: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ApiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A transport answering from this API.
    pub fn transport(self: &Arc<Self>) -> MockTransport {
        let api = self.clone();
        MockTransport::new(move |req| Ok(api.handle(req)))
    }

    /// Invalidate the current access credential server-side.
    pub fn expire_access(&self) {
        let mut state = self.lock();
        state.access = format!("expired-{}", state.issued);
    }

    /// Make every subsequent refresh fail with 401.
    pub fn reject_refresh(&self) {
        self.lock().reject_refresh = true;
    }

    pub fn current_access(&self) -> String {
        self.lock().access.clone()
    }

    pub fn handle(&self, req: &HttpRequest) -> HttpResponse {
        let path = req.path();
        if path.ends_with("/auth/login") {
            return self.login(req);
        }
        if path.ends_with("/auth/register") {
            let body = req.body.clone().unwrap_or(Value::Null);
            let mut user = fixtures::mock_user();
            if let Some(name) = body.get("name").and_then(Value::as_str) {
                user.name = name.to_string();
            }
            if let Some(email) = body.get("email").and_then(Value::as_str) {
                user.email = email.to_string();
            }
            return HttpResponse::json(201, &self.auth_payload(user));
        }
        if path.ends_with("/auth/refresh") {
            return self.refresh(req);
        }
        if path.ends_with("/health") {
            return HttpResponse::json(200, &json!({"status": "ok"}));
        }

        if !self.authorized(req) {
            return HttpResponse::json(401, &json!({"message": "Unauthorized"}));
        }
        if path.ends_with("/auth/logout") {
            return HttpResponse::json(200, &json!({"message": "Logged out"}));
        }
        if path.ends_with("/auth/profile") || path.ends_with("/users/profile") {
            let mut user = fixtures::user_json();
            if let (Method::Put, Some(Value::Object(update))) = (req.method, &req.body) {
                if let Value::Object(fields) = &mut user {
                    for (key, value) in update {
                        fields.insert(key.clone(), value.clone());
                    }
                }
            }
            return HttpResponse::json(200, &user);
        }
        HttpResponse::json(200, &json!({ "path": path }))
    }

    fn authorized(&self, req: &HttpRequest) -> bool {
        let state = self.lock();
        req.bearer() == Some(state.access.as_str())
    }

    fn login(&self, req: &HttpRequest) -> HttpResponse {
        let body = req.body.clone().unwrap_or(Value::Null);
        let email = body.get("email").and_then(Value::as_str);
        let password = body.get("password").and_then(Value::as_str);
        if email == Some(fixtures::EMAIL) && password == Some(fixtures::PASSWORD) {
            HttpResponse::json(200, &self.auth_payload(fixtures::mock_user()))
        } else {
            HttpResponse::json(401, &json!({"message": "Invalid credentials"}))
        }
    }

    fn auth_payload(&self, user: User) -> Value {
        let state = self.lock();
        json!({
            "user": user,
            "token": state.access,
            "refreshToken": state.refresh,
        })
    }

    fn refresh(&self, req: &HttpRequest) -> HttpResponse {
        let presented = req
            .body
            .as_ref()
            .and_then(|body| body.get("refreshToken"))
            .and_then(Value::as_str);
        let mut state = self.lock();
        if state.reject_refresh || presented != Some(state.refresh.as_str()) {
            return HttpResponse::json(401, &json!({"message": "Invalid refresh token"}));
        }
        state.issued += 1;
        state.access = format!("{}-{}", fixtures::ACCESS_TOKEN, state.issued);
        state.refresh = format!("{}-{}", fixtures::REFRESH_TOKEN, state.issued);
        HttpResponse::json(
            200,
            &json!({"token": state.access, "refreshToken": state.refresh}),
        )
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use chrono::{TimeZone, Utc};

    pub const EMAIL: &str = "test@example.com";
    pub const PASSWORD: &str = "password123";
    pub const ACCESS_TOKEN: &str = "mock-jwt-token";
    pub const REFRESH_TOKEN: &str = "mock-refresh-token";

    /// The development mock user.
    pub fn mock_user() -> User {
        let epoch = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        User {
            id: "1".to_string(),
            email: EMAIL.to_string(),
            name: "Test User".to_string(),
            role: "student".to_string(),
            avatar: None,
            email_verified: true,
            created_at: epoch,
            updated_at: epoch,
        }
    }

    pub fn user_json() -> Value {
        json!({
            "id": "1",
            "email": EMAIL,
            "name": "Test User",
            "role": "student",
            "emailVerified": true,
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z",
        })
    }

    pub fn auth_response() -> AuthResponse {
        AuthResponse {
            user: mock_user(),
            token: ACCESS_TOKEN.to_string(),
            refresh_token: Some(REFRESH_TOKEN.to_string()),
        }
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use proptest::prelude::*;

    /// Emails accepted by the client-side validator.
    pub fn arb_email() -> impl Strategy<Value = String> {
        ("[a-z][a-z0-9._]{0,11}", "[a-z]{1,10}", "[a-z]{2,4}")
            .prop_map(|(local, domain, tld)| format!("{}@{}.{}", local, domain, tld))
    }

    /// Passwords satisfying every strength rule.
    pub fn arb_strong_password() -> impl Strategy<Value = String> {
        ("[a-z]{3,6}", "[A-Z]{2,4}", "[0-9]{2,4}", "[@$!%*?&]{0,2}")
            .prop_map(|(lower, upper, digits, special)| {
                format!("{}{}{}{}", upper, lower, digits, special)
            })
    }

    /// Opaque credential strings.
    pub fn arb_credential() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_-]{8,48}"
    }

    /// Query key segments.
    pub fn arb_key_segments() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z0-9-]{1,12}", 1..5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_calls() {
        let transport = MockTransport::new(|_| Ok(HttpResponse::empty(204)));
        transport
            .execute(HttpRequest::new(Method::Get, "http://api.test/v1/courses?page=1"))
            .await
            .unwrap();
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(transport.calls_to("/courses").len(), 1);
        transport.reset();
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_mock_api_login() {
        let api = MockApi::new();
        let ok = api.handle(
            &HttpRequest::new(Method::Post, "http://api.test/v1/auth/login")
                .with_body(json!({"email": fixtures::EMAIL, "password": fixtures::PASSWORD})),
        );
        assert_eq!(ok.status, 200);
        let payload: AuthResponse = serde_json::from_slice(&ok.body).unwrap();
        assert_eq!(payload, fixtures::auth_response());

        let denied = api.handle(
            &HttpRequest::new(Method::Post, "http://api.test/v1/auth/login")
                .with_body(json!({"email": fixtures::EMAIL, "password": "wrong"})),
        );
        assert_eq!(denied.status, 401);
        assert_eq!(denied.error_message(), "Invalid credentials");
    }

    #[test]
    fn test_mock_api_refresh_rotates_access() {
        let api = MockApi::new();
        api.expire_access();
        let stale = HttpRequest::new(Method::Get, "http://api.test/v1/auth/profile")
            .header("authorization", format!("Bearer {}", fixtures::ACCESS_TOKEN));
        assert_eq!(api.handle(&stale).status, 401);

        let refreshed = api.handle(
            &HttpRequest::new(Method::Post, "http://api.test/v1/auth/refresh")
                .with_body(json!({"refreshToken": fixtures::REFRESH_TOKEN})),
        );
        assert_eq!(refreshed.status, 200);
        let fresh = HttpRequest::new(Method::Get, "http://api.test/v1/auth/profile")
            .header("authorization", format!("Bearer {}", api.current_access()));
        assert_eq!(api.handle(&fresh).status, 200);
    }

    #[test]
    fn test_user_json_matches_fixture() {
        let user: User = serde_json::from_value(fixtures::user_json()).unwrap();
        assert_eq!(user, fixtures::mock_user());
    }
}
