// Workflow Actions - Side effects performed by action nodes

use kontor_shared::RunContext;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::webhook::{WebhookClient, WebhookError};
use crate::services::email::{EmailError, EmailSender};
use crate::services::tenant_settings::{SettingsError, TenantSettingsProvider};

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("action config is missing '{0}'")]
    MissingConfig(&'static str),
    #[error("no email address could be resolved for recipient '{0}'")]
    RecipientUnresolved(String),
    #[error("tenant settings unavailable: {0}")]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Email(#[from] EmailError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

pub type ActionResult = Result<Value, ActionError>;

/// Parsed action node configuration, keyed by `actionType`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
    SendEmail {
        template_id: Option<String>,
        to: Option<String>,
    },
    Webhook {
        url: Option<String>,
        method: Option<String>,
    },
    UpdateRecord,
    Unknown(String),
}

fn non_empty(config: &Value, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ActionRequest {
    pub fn from_config(config: &Value) -> Self {
        match config.get("actionType").and_then(Value::as_str).unwrap_or_default() {
            "send_email" => ActionRequest::SendEmail {
                template_id: non_empty(config, "templateId"),
                to: non_empty(config, "to"),
            },
            "webhook" => ActionRequest::Webhook {
                url: non_empty(config, "webhookUrl"),
                method: non_empty(config, "webhookMethod"),
            },
            "update_record" => ActionRequest::UpdateRecord,
            other => ActionRequest::Unknown(other.to_string()),
        }
    }

    pub fn action_type(&self) -> &str {
        match self {
            ActionRequest::SendEmail { .. } => "send_email",
            ActionRequest::Webhook { .. } => "webhook",
            ActionRequest::UpdateRecord => "update_record",
            ActionRequest::Unknown(name) => name.as_str(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ActionRequest::Unknown(_))
    }

    /// Static checks run at activation time.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ActionRequest::SendEmail { template_id: None, .. } => {
                Err(ActionError::MissingConfig("templateId").to_string())
            }
            ActionRequest::SendEmail { to: None, .. } => Err(ActionError::MissingConfig("to").to_string()),
            ActionRequest::Webhook { url: None, .. } => {
                Err(ActionError::MissingConfig("webhookUrl").to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Built-in action handlers.
#[derive(Clone)]
pub struct ActionRegistry {
    email: Arc<dyn EmailSender>,
    settings: Arc<dyn TenantSettingsProvider>,
    webhooks: WebhookClient,
}

impl ActionRegistry {
    pub fn new(
        email: Arc<dyn EmailSender>,
        settings: Arc<dyn TenantSettingsProvider>,
        webhooks: WebhookClient,
    ) -> Self {
        Self {
            email,
            settings,
            webhooks,
        }
    }

    pub async fn execute(&self, request: &ActionRequest, context: &RunContext, tenant_id: Uuid) -> ActionResult {
        match request {
            ActionRequest::SendEmail { template_id, to } => {
                let template_id = template_id.as_deref().ok_or(ActionError::MissingConfig("templateId"))?;
                let to = to.as_deref().ok_or(ActionError::MissingConfig("to"))?;
                self.send_email(template_id, to, context, tenant_id).await
            }
            ActionRequest::Webhook { url, method } => {
                let url = url.as_deref().ok_or(ActionError::MissingConfig("webhookUrl"))?;
                let response = self.webhooks.deliver(url, method.as_deref(), context).await?;
                Ok(json!({
                    "url": url,
                    "statusCode": response.status_code,
                    "success": response.success,
                    "redirected": response.redirected,
                    "location": response.location,
                }))
            }
            ActionRequest::UpdateRecord => Ok(json!({ "updated": false })),
            ActionRequest::Unknown(action_type) => {
                warn!("Skipping unknown action type '{}'", action_type);
                Ok(json!({
                    "skipped": true,
                    "reason": format!("unknown action type '{}'", action_type),
                }))
            }
        }
    }

    async fn resolve_recipient(&self, to: &str, context: &RunContext, tenant_id: Uuid) -> Result<String, ActionError> {
        let resolved = match to {
            "customer" => context
                .lookup("customer.email")
                .and_then(Value::as_str)
                .map(str::to_string),
            "admin" => self.settings.settings(tenant_id).await?.admin_email,
            literal => Some(literal.to_string()),
        };

        resolved
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .ok_or_else(|| ActionError::RecipientUnresolved(to.to_string()))
    }

    async fn send_email(&self, template_id: &str, to: &str, context: &RunContext, tenant_id: Uuid) -> ActionResult {
        let recipient = self.resolve_recipient(to, context, tenant_id).await?;
        let receipt = self
            .email
            .send_template_email(tenant_id, template_id, &recipient, context)
            .await?;

        info!("Automation email '{}' sent to {}", template_id, recipient);

        Ok(json!({
            "sent": true,
            "to": recipient,
            "templateId": template_id,
            "messageId": receipt.message_id,
        }))
    }
}
