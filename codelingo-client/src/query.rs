//! Typed query / mutate interface over the dispatcher and the cache.

use codelingo_core::RequestError;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::cache::{CacheRead, QueryKey, ResultCache};
use crate::dispatcher::{decode, ApiRequest, RequestDispatcher};
use crate::retry::RetryPolicy;

/// Keys for session-scoped reads.
pub mod auth_keys {
    use crate::cache::QueryKey;

    pub fn all() -> QueryKey {
        QueryKey::new(["auth"])
    }

    pub fn user() -> QueryKey {
        all().child("user")
    }

    pub fn profile() -> QueryKey {
        all().child("profile")
    }
}

pub mod course_keys {
    use crate::cache::QueryKey;

    pub fn all() -> QueryKey {
        QueryKey::new(["courses"])
    }

    /// A course listing; `filters` is the encoded query string (may be empty).
    pub fn list(filters: &str) -> QueryKey {
        all().child("list").child(filters)
    }

    pub fn detail(course_id: &str) -> QueryKey {
        all().child("detail").child(course_id)
    }
}

pub mod progress_keys {
    use crate::cache::QueryKey;

    pub fn all() -> QueryKey {
        QueryKey::new(["progress"])
    }

    pub fn overview() -> QueryKey {
        all().child("overview")
    }

    pub fn course(course_id: &str) -> QueryKey {
        all().child("course").child(course_id)
    }
}

#[derive(Clone)]
pub struct QueryClient {
    dispatcher: Arc<RequestDispatcher>,
    cache: ResultCache,
    mutation_retry: RetryPolicy,
}

impl QueryClient {
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        cache: ResultCache,
        mutation_retry: RetryPolicy,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            mutation_retry,
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    /// Cached read of `request` under `key`.
    pub async fn query<T: DeserializeOwned>(
        &self,
        key: &QueryKey,
        request: ApiRequest,
    ) -> Result<CacheRead<T>, RequestError> {
        self.query_value(key, request).await?.decode()
    }

    pub async fn query_value(
        &self,
        key: &QueryKey,
        request: ApiRequest,
    ) -> Result<CacheRead<serde_json::Value>, RequestError> {
        if !request.method.is_read() {
            return Err(RequestError::InvalidRequest {
                reason: format!("{} {} cannot be cached", request.method, request.path),
            });
        }
        let dispatcher = self.dispatcher.clone();
        let request = Arc::new(request);
        self.cache
            .get(key, move || {
                let dispatcher = dispatcher.clone();
                let request = request.clone();
                async move { dispatcher.send_value(&request).await }
            })
            .await
    }

    /// Uncached write with the mutation retry policy.
    pub async fn mutate<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, RequestError> {
        let label = format!("{} {}", request.method, request.path);
        let dispatcher = &self.dispatcher;
        let pending = &request;
        let value = self
            .mutation_retry
            .run(&label, move || dispatcher.send_value(pending))
            .await?;
        decode(value, &request)
    }

    /// Write, then invalidate every key under each of `prefixes`.
    pub async fn mutate_and_invalidate<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        prefixes: &[QueryKey],
    ) -> Result<T, RequestError> {
        let out = self.mutate(request).await?;
        for prefix in prefixes {
            self.cache.invalidate_prefix(prefix);
        }
        Ok(out)
    }

    pub fn invalidate(&self, key: &QueryKey) {
        self.cache.invalidate(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_helpers_nest_under_roots() {
        assert_eq!(auth_keys::user().to_string(), "auth/user");
        assert_eq!(auth_keys::profile().to_string(), "auth/profile");
        assert!(course_keys::detail("42").starts_with(&course_keys::all()));
        assert!(course_keys::list("?page=1").starts_with(&course_keys::all()));
        assert_eq!(progress_keys::course("7").to_string(), "progress/course/7");
        assert!(!progress_keys::overview().starts_with(&auth_keys::all()));
    }
}
