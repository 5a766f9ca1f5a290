//! Identity services over HTTP: the service-to-service lease and the OAuth2
//! authorization-code exchange for the poller's system user.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use super::IdentityClient;
use crate::config::AuthConfig;
use crate::error::{PipelineStage, PollerError, PollerResult};

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    code: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone)]
pub struct HttpIdentityClient {
    client: Client,
    config: AuthConfig,
}

impl HttpIdentityClient {
    pub fn new(config: AuthConfig, timeout: std::time::Duration) -> PollerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PollerError::configuration(format!("Failed to build identity HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn basic_credentials(&self) -> String {
        let pair = format!("{}:{}", self.config.user_email, self.config.user_password);
        format!("Basic {}", STANDARD.encode(pair))
    }

    async fn authorize(&self) -> PollerResult<String> {
        let url = format!("{}/oauth2/authorize", self.config.idam_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, self.basic_credentials())
            .form(&[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| auth_error("authorize", e))?;

        let response = check_status("authorize", response).await?;
        let body: AuthorizeResponse = response
            .json()
            .await
            .map_err(|e| auth_error("authorize", e))?;
        Ok(body.code)
    }

    async fn exchange(&self, code: &str) -> PollerResult<String> {
        let url = format!("{}/oauth2/token", self.config.idam_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .form(&[
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| auth_error("token", e))?;

        let response = check_status("token", response).await?;
        let body: TokenResponse = response.json().await.map_err(|e| auth_error("token", e))?;
        Ok(body.access_token)
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn lease_service_token(&self) -> PollerResult<String> {
        let url = format!("{}/lease", self.config.service_auth_url.trim_end_matches('/'));
        debug!(url = %url, "🔑 AUTH: Leasing service token");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "microservice": self.config.microservice_name }))
            .send()
            .await
            .map_err(|e| auth_error("lease", e))?;

        let response = check_status("lease", response).await?;
        let token = response.text().await.map_err(|e| auth_error("lease", e))?;
        Ok(token.trim().to_string())
    }

    async fn request_user_token(&self) -> PollerResult<String> {
        debug!(client_id = %self.config.client_id, "🔑 AUTH: Requesting user token");
        let code = self.authorize().await?;
        let access_token = self.exchange(&code).await?;
        Ok(format!("Bearer {access_token}"))
    }
}

fn auth_error(step: &str, err: reqwest::Error) -> PollerError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    error!(step = step, error = %err, "🔑 AUTH: Identity {kind}");
    PollerError::pipeline(PipelineStage::Auth, format!("{step} {kind}: {err}"))
}

async fn check_status(step: &str, response: reqwest::Response) -> PollerResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!(step = step, status = %status, "🔑 AUTH: Identity rejected request");
    Err(PollerError::pipeline(
        PipelineStage::Auth,
        describe_rejection(step, status, &body),
    ))
}

fn describe_rejection(step: &str, status: StatusCode, body: &str) -> String {
    if body.is_empty() {
        format!("{step} returned {status}")
    } else {
        format!("{step} returned {status}: {body}")
    }
}
