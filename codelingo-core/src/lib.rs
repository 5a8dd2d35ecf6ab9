//! CodeLingo Core - shared types for the client session layer
//!
//! Data types, the error taxonomy, the HTTP transport seam and the REST
//! endpoint catalog. No I/O lives here; the client crate owns all behavior
//! that touches the network or disk.

pub mod auth;
pub mod endpoints;
pub mod error;
pub mod transport;
pub mod validation;

pub use auth::{
    AuthResponse, ChangePasswordRequest, ForgotPasswordRequest, LoginCredentials,
    MessageResponse, RefreshRequest, RefreshResponse, RegisterCredentials, ResetPasswordRequest,
    User, UserUpdate,
};
pub use error::{
    ClientErrorKind, CodelingoError, CodelingoResult, RequestError, StorageError,
    ValidationError,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method};
