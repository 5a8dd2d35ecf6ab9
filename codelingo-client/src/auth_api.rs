//! Auth endpoint calls.
//!
//! Thin typed wrappers; session bookkeeping lives in [`crate::CodelingoClient`].

use codelingo_core::endpoints::{auth, users};
use codelingo_core::{
    AuthResponse, ChangePasswordRequest, ForgotPasswordRequest, LoginCredentials,
    MessageResponse, RegisterCredentials, RequestError, ResetPasswordRequest, User, UserUpdate,
};
use std::sync::Arc;

use crate::dispatcher::{ApiRequest, RequestDispatcher};
use crate::query::QueryClient;

#[derive(Clone)]
pub struct AuthApi {
    queries: QueryClient,
}

impl AuthApi {
    pub fn new(queries: QueryClient) -> Self {
        Self { queries }
    }

    fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        self.queries.dispatcher()
    }

    pub async fn login(&self, credentials: &LoginCredentials) -> Result<AuthResponse, RequestError> {
        let request = ApiRequest::post(auth::LOGIN).json(credentials)?.skip_auth();
        self.queries.mutate(request).await
    }

    pub async fn register(
        &self,
        credentials: &RegisterCredentials,
    ) -> Result<AuthResponse, RequestError> {
        let request = ApiRequest::post(auth::REGISTER).json(credentials)?.skip_auth();
        self.queries.mutate(request).await
    }

    /// Server-side sign-out. Not retried.
    pub async fn logout(&self) -> Result<(), RequestError> {
        self.dispatcher()
            .send_value(&ApiRequest::post(auth::LOGOUT))
            .await
            .map(|_| ())
    }

    pub async fn profile(&self) -> Result<User, RequestError> {
        self.dispatcher().send(&ApiRequest::get(auth::PROFILE)).await
    }

    pub async fn update_profile(&self, update: &UserUpdate) -> Result<User, RequestError> {
        let request = ApiRequest::put(users::PROFILE).json(update)?;
        self.queries.mutate(request).await
    }

    pub async fn forgot_password(&self, email: &str) -> Result<MessageResponse, RequestError> {
        let request = ApiRequest::post(auth::FORGOT_PASSWORD)
            .json(&ForgotPasswordRequest {
                email: email.to_string(),
            })?
            .skip_auth();
        self.queries.mutate(request).await
    }

    pub async fn reset_password(
        &self,
        reset: &ResetPasswordRequest,
    ) -> Result<MessageResponse, RequestError> {
        let request = ApiRequest::post(auth::RESET_PASSWORD).json(reset)?.skip_auth();
        self.queries.mutate(request).await
    }

    pub async fn change_password(
        &self,
        change: &ChangePasswordRequest,
    ) -> Result<MessageResponse, RequestError> {
        let request = ApiRequest::put(users::CHANGE_PASSWORD).json(change)?;
        self.queries.mutate(request).await
    }

    pub async fn verify_email(&self, token: &str) -> Result<MessageResponse, RequestError> {
        let request = ApiRequest::post(auth::VERIFY_EMAIL).query("token", token);
        self.queries.mutate(request).await
    }

    pub async fn resend_verification(&self) -> Result<MessageResponse, RequestError> {
        self.queries.mutate(ApiRequest::post(auth::VERIFY_EMAIL)).await
    }
}
