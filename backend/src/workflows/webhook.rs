// Webhook delivery for the `webhook` action

use kontor_shared::RunContext;
use reqwest::{header::LOCATION, redirect::Policy, Method};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use super::ssrf::{SsrfError, SsrfGuard};
use crate::config::WebhookConfig;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("webhook target rejected: {0}")]
    Blocked(#[from] SsrfError),
    #[error("unsupported webhook method '{0}'")]
    UnsupportedMethod(String),
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status_code: u16,
    pub success: bool,
    pub redirected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookClient {
    guard: SsrfGuard,
    timeout: Duration,
}

fn parse_method(raw: Option<&str>) -> Result<Method, WebhookError> {
    match raw.map(|m| m.trim().to_ascii_uppercase()).as_deref() {
        None | Some("") | Some("POST") => Ok(Method::POST),
        Some("GET") => Ok(Method::GET),
        Some("PUT") => Ok(Method::PUT),
        Some("PATCH") => Ok(Method::PATCH),
        Some("DELETE") => Ok(Method::DELETE),
        Some(other) => Err(WebhookError::UnsupportedMethod(other.to_string())),
    }
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            guard: SsrfGuard::new(config.allowed_hosts.clone()),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Sends the run context to `url`. Redirects are reported, never followed.
    pub async fn deliver(
        &self,
        url: &str,
        method: Option<&str>,
        context: &RunContext,
    ) -> Result<WebhookResponse, WebhookError> {
        let method = parse_method(method)?;
        let target = self.guard.check(url).await?;

        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(self.timeout);
        if let Some((host, addr)) = &target.pinned {
            builder = builder.resolve(host, *addr);
        }
        let client = builder.build()?;

        let mut request = client.request(method.clone(), target.url.clone());
        if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            request = request.json(context);
        }

        let response = request.send().await?;
        let status = response.status();
        info!("Webhook {} {} returned {}", method, target.url, status.as_u16());

        if status.is_client_error() || status.is_server_error() {
            return Err(WebhookError::Status(status.as_u16()));
        }

        let location = if status.is_redirection() {
            response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        } else {
            None
        };

        Ok(WebhookResponse {
            status_code: status.as_u16(),
            success: status.is_success(),
            redirected: status.is_redirection(),
            location,
        })
    }
}
