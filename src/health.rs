//! # Dependency Health
//!
//! Liveness of everything a poll cycle depends on: the database that holds the run
//! window and the queues, the identity services, and the case store. HTTP services are
//! probed at `{base_url}/health/liveness` and count as up on a 200 whose body reports
//! `UP`.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::PollerConfig;
use crate::database::DatabaseConnection;
use crate::error::{PollerError, PollerResult};

pub const LIVENESS_PATH: &str = "/health/liveness";

/// Upper bound on a single liveness request
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of checking one dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentHealth {
    pub component: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
}

impl ComponentHealth {
    fn up(component: &str, started: Instant) -> Self {
        Self {
            component: component.to_string(),
            healthy: true,
            response_time_ms: elapsed_ms(started),
            error_message: None,
        }
    }

    fn down(component: &str, started: Instant, error: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            healthy: false,
            response_time_ms: elapsed_ms(started),
            error_message: Some(error.into()),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn component(&self) -> &str;

    async fn check(&self) -> ComponentHealth;
}

/// `SELECT 1` against the poller database
pub struct DatabaseHealthCheck {
    database: DatabaseConnection,
}

impl DatabaseHealthCheck {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }
}

#[async_trait]
impl HealthCheck for DatabaseHealthCheck {
    fn component(&self) -> &str {
        "database"
    }

    async fn check(&self) -> ComponentHealth {
        let started = Instant::now();
        match self.database.health_check().await {
            Ok(true) => ComponentHealth::up(self.component(), started),
            Ok(false) => ComponentHealth::down(self.component(), started, "unexpected health query result"),
            Err(e) => ComponentHealth::down(self.component(), started, e.to_string()),
        }
    }
}

/// `GET {base_url}/health/liveness` on an HTTP dependency
pub struct LivenessCheck {
    component: String,
    url: String,
    client: Client,
}

impl LivenessCheck {
    pub fn new(component: impl Into<String>, base_url: &str, client: Client) -> Self {
        Self {
            component: component.into(),
            url: format!("{}{}", base_url.trim_end_matches('/'), LIVENESS_PATH),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthCheck for LivenessCheck {
    fn component(&self) -> &str {
        &self.component
    }

    async fn check(&self) -> ComponentHealth {
        let started = Instant::now();
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => return ComponentHealth::down(&self.component, started, e.to_string()),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::OK && body.contains("UP") {
            ComponentHealth::up(&self.component, started)
        } else {
            ComponentHealth::down(
                &self.component,
                started,
                format!("status_code: {}, response: {}", status.as_u16(), body),
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.components.iter().all(|c| c.healthy)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &ComponentHealth> {
        self.components.iter().filter(|c| !c.healthy)
    }

    /// One line per component, `name: UP (12ms)` or `name: DOWN (12ms) reason`
    pub fn summary(&self) -> String {
        self.components
            .iter()
            .map(|c| match &c.error_message {
                None => format!("{}: UP ({}ms)", c.component, c.response_time_ms),
                Some(error) => format!("{}: DOWN ({}ms) {}", c.component, c.response_time_ms, error),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs every registered check concurrently
#[derive(Default)]
pub struct HealthChecker {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthChecker {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self { checks }
    }

    /// Database, service-to-service auth, user identity and the case store.
    ///
    /// The case store is left out in dry-run mode, where it is never called.
    pub fn from_config(config: &PollerConfig) -> PollerResult<Self> {
        let database = DatabaseConnection::connect_lazy(&config.database)
            .map_err(|e| PollerError::startup("Database pool", e))?;
        let client = Client::builder()
            .timeout(LIVENESS_TIMEOUT)
            .connect_timeout(LIVENESS_TIMEOUT)
            .build()
            .map_err(|e| PollerError::configuration(format!("Failed to build health HTTP client: {e}")))?;

        let mut checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(DatabaseHealthCheck::new(database)),
            Arc::new(LivenessCheck::new("service_auth", &config.auth.service_auth_url, client.clone())),
            Arc::new(LivenessCheck::new("idam", &config.auth.idam_url, client.clone())),
        ];
        if !config.case_source.dry_run {
            checks.push(Arc::new(LivenessCheck::new("case_store", &config.case_source.base_url, client)));
        }
        Ok(Self::new(checks))
    }

    pub async fn run(&self) -> HealthReport {
        let components = join_all(self.checks.iter().map(|check| check.check())).await;
        let report = HealthReport { components };

        for component in report.unhealthy() {
            warn!(
                component = %component.component,
                error = ?component.error_message,
                "🏥 HEALTH: Dependency is down"
            );
        }
        info!(
            healthy = report.is_healthy(),
            components = report.components.len(),
            "🏥 HEALTH: Dependency check complete"
        );
        report
    }
}
