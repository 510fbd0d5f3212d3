use crate::config::SmtpConfig;
use async_trait::async_trait;
use kontor_shared::RunContext;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EmailError {
    #[error("email template '{0}' not found")]
    TemplateNotFound(String),
    #[error("SMTP is not configured")]
    NotConfigured,
    #[error("invalid email address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build email: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("template pattern error: {0}")]
    Pattern(#[from] regex::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmailReceipt {
    pub message_id: String,
}

/// Rendering and delivery of templated emails for automation actions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_template_email(
        &self,
        tenant_id: Uuid,
        template_id: &str,
        recipient: &str,
        context: &RunContext,
    ) -> Result<EmailReceipt, EmailError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmailTemplate {
    pub id: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

#[derive(Clone)]
pub struct EmailService {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from_email: String,
    from_name: String,
    db_pool: PgPool,
    placeholder: Regex,
}

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}";

fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Replaces `{{dotted.path}}` placeholders with values from the run context.
/// Unresolved placeholders are left untouched.
pub fn render_template(placeholder: &Regex, template: &str, context: &RunContext, escape_html: bool) -> String {
    placeholder
        .replace_all(template, |caps: &Captures| {
            let rendered = match context.lookup(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => return caps[0].to_string(),
                Some(other) => other.to_string(),
            };
            if escape_html {
                html_escape(&rendered)
            } else {
                rendered
            }
        })
        .into_owned()
}

impl EmailService {
    pub fn new(smtp_config: &SmtpConfig, db_pool: PgPool) -> Result<Self, EmailError> {
        let transport = if smtp_config.is_configured() {
            let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

            Some(
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host)?
                    .port(smtp_config.port)
                    .credentials(creds)
                    .pool_config(PoolConfig::new().max_size(10))
                    .timeout(Some(Duration::from_secs(10)))
                    .build(),
            )
        } else {
            None
        };

        Ok(EmailService {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
            db_pool,
            placeholder: Regex::new(PLACEHOLDER_PATTERN)?,
        })
    }

    async fn load_template(&self, tenant_id: Uuid, template_id: &str) -> Result<EmailTemplate, EmailError> {
        // tenant override first, then the global template
        sqlx::query_as::<_, EmailTemplate>(
            r#"
            SELECT id, subject, html_body, text_body
            FROM email_templates
            WHERE id = $1 AND (tenant_id = $2 OR tenant_id IS NULL)
            ORDER BY tenant_id NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(template_id)
        .bind(tenant_id)
        .fetch_optional(&self.db_pool)
        .await?
        .ok_or_else(|| EmailError::TemplateNotFound(template_id.to_string()))
    }

    fn message_id(&self) -> String {
        let domain = self
            .from_email
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost");
        format!("<{}@{}>", Uuid::new_v4(), domain)
    }

    pub async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        html_body: &str,
        text_body: Option<&str>,
    ) -> Result<String, EmailError> {
        let transport = self.transport.as_ref().ok_or(EmailError::NotConfigured)?;

        let from = format!("{} <{}>", self.from_name, self.from_email).parse::<Mailbox>()?;
        let to = to_email.parse::<Mailbox>()?;
        let message_id = self.message_id();

        let builder = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .message_id(Some(message_id.clone()));

        let message = match text_body {
            Some(text) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )?,
            None => builder.header(ContentType::TEXT_HTML).body(html_body.to_string())?,
        };

        match transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", to_email);
                Ok(message_id)
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to_email, e);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl EmailSender for EmailService {
    async fn send_template_email(
        &self,
        tenant_id: Uuid,
        template_id: &str,
        recipient: &str,
        context: &RunContext,
    ) -> Result<EmailReceipt, EmailError> {
        if self.transport.is_none() {
            return Err(EmailError::NotConfigured);
        }

        let template = self.load_template(tenant_id, template_id).await?;
        let subject = render_template(&self.placeholder, &template.subject, context, false);
        let html = render_template(&self.placeholder, &template.html_body, context, true);
        let text = template
            .text_body
            .as_deref()
            .map(|t| render_template(&self.placeholder, t, context, false));

        let message_id = self.send_email(recipient, &subject, &html, text.as_deref()).await?;
        Ok(EmailReceipt { message_id })
    }
}
