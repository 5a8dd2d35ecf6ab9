//! CodeLingo client session and request layer.
//!
//! - [`session`]: the credential store and its storage areas
//! - [`dispatcher`]: authenticated HTTP calls with one refresh-and-retry
//! - [`refresh`]: singleflight silent re-authentication
//! - [`cache`]: stale-while-revalidate results keyed by [`QueryKey`]
//! - [`client`]: the facade wiring them together

pub mod auth_api;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod query;
pub mod refresh;
pub mod retry;
pub mod session;
pub mod singleflight;
pub mod storage;
pub mod telemetry;

pub use auth_api::AuthApi;
pub use cache::{CacheConfig, CacheRead, CacheStats, Freshness, QueryKey, ResultCache};
pub use client::{ClientOptions, CodelingoClient};
pub use config::{ClientConfig, ConfigError};
pub use dispatcher::{ApiRequest, RequestDispatcher};
pub use error::ClientError;
pub use http::ReqwestTransport;
pub use query::{auth_keys, course_keys, progress_keys, QueryClient};
pub use refresh::{Credentials, RefreshCoordinator};
pub use retry::RetryPolicy;
pub use session::{
    CredentialStore, PersistedSession, Persistence, RuntimeSession, SessionEvent,
    SessionSnapshot,
};
pub use singleflight::SingleFlight;
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
