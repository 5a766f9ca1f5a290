//! # Authentication
//!
//! Two credentials are needed to search the case source: a service-to-service token
//! identifying the poller, and a bearer token for the poller's system user.
//!
//! [`CachedTokenProvider`] keeps the user token for `token_cache_ttl_seconds`, measured by
//! the injected [`Clock`], and asks the [`IdentityClient`] again once it has aged out.
//! Service tokens are leased on every call.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{PipelineStage, PollerResult};

pub use http::HttpIdentityClient;

/// Credentials handed to the case source
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn service_token(&self) -> PollerResult<String>;

    async fn user_token(&self) -> PollerResult<String>;
}

/// Raw calls against the identity services, without caching
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn lease_service_token(&self) -> PollerResult<String>;

    /// Full `Authorization` header value, `Bearer ...`
    async fn request_user_token(&self) -> PollerResult<String>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    fetched_at: DateTime<Utc>,
}

pub struct CachedTokenProvider {
    identity: Arc<dyn IdentityClient>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for CachedTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTokenProvider")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CachedTokenProvider {
    pub fn new(identity: Arc<dyn IdentityClient>, clock: Arc<dyn Clock>, ttl: chrono::Duration) -> Self {
        Self {
            identity,
            clock,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Drop the cached user token so the next call fetches a fresh one
    pub async fn evict(&self) {
        self.cached.lock().await.take();
    }
}

#[async_trait]
impl TokenProvider for CachedTokenProvider {
    async fn service_token(&self) -> PollerResult<String> {
        self.identity
            .lease_service_token()
            .await
            .map_err(|e| e.in_stage(PipelineStage::Auth))
    }

    async fn user_token(&self) -> PollerResult<String> {
        // Held across the fetch so concurrent callers share one request.
        let mut cached = self.cached.lock().await;
        let now = self.clock.now();

        if let Some(token) = cached.as_ref() {
            if now < token.fetched_at + self.ttl {
                debug!("🔑 AUTH: Using cached user token");
                return Ok(token.value.clone());
            }
            info!(fetched_at = %token.fetched_at, "🔑 AUTH: Cached user token expired");
        }

        let value = self
            .identity
            .request_user_token()
            .await
            .map_err(|e| e.in_stage(PipelineStage::Auth))?;
        info!("🔑 AUTH: Fetched new user token");

        *cached = Some(CachedToken {
            value: value.clone(),
            fetched_at: now,
        });
        Ok(value)
    }
}

/// Fixed tokens, for dry runs and tests
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    service: String,
    user: String,
}

impl StaticTokenProvider {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn service_token(&self) -> PollerResult<String> {
        Ok(self.service.clone())
    }

    async fn user_token(&self) -> PollerResult<String> {
        Ok(self.user.clone())
    }
}
