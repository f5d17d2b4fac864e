//! Transactional e-mail delivery

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::config::BrevoConfig;

pub const SIGN_IN_CODE_SUBJECT: &str = "Sign in Code";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmailError {
    #[error("Failed to reach email provider: {0}")]
    Transport(String),

    #[error("Email provider rejected the message: {0}")]
    Rejected(String),

    #[error("Invalid email configuration: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Message carrying a sign-in code and the link that submits it
pub fn sign_in_code_message(email: &str, code: &str, link: &str) -> EmailMessage {
    let html_body = format!(
        r#"<!DOCTYPE html>
<html>
  <body style="font-family: sans-serif; color: #111827;">
    <p>Use the following code to sign in:</p>
    <p style="font-size: 32px; font-weight: bold; letter-spacing: 8px;">{code}</p>
    <p>Or <a href="{link}">click here to sign in directly</a>.</p>
    <p style="color: #6b7280;">This code expires in 5 minutes. If you didn't request it, you can ignore this email.</p>
  </body>
</html>"#
    );

    EmailMessage {
        recipients: vec![email.to_string()],
        subject: SIGN_IN_CODE_SUBJECT.to_string(),
        html_body,
    }
}

#[derive(Serialize)]
struct BrevoContact<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BrevoRequest<'a> {
    sender: BrevoContact<'a>,
    to: Vec<BrevoContact<'a>>,
    subject: &'a str,
    html_content: &'a str,
}

/// Sends through the Brevo transactional API
#[derive(Clone)]
pub struct BrevoEmailSender {
    http: reqwest::Client,
    config: BrevoConfig,
}

impl BrevoEmailSender {
    pub fn new(config: BrevoConfig) -> Result<Self, EmailError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmailError::Configuration(e.to_string()))?;

        Ok(Self { http, config })
    }

    fn request<'a>(&'a self, message: &'a EmailMessage) -> BrevoRequest<'a> {
        BrevoRequest {
            sender: BrevoContact {
                email: &self.config.sender_email,
                name: Some(self.config.sender_name.as_str()),
            },
            to: message
                .recipients
                .iter()
                .map(|email| BrevoContact {
                    email: email.as_str(),
                    name: None,
                })
                .collect(),
            subject: &message.subject,
            html_content: &message.html_body,
        }
    }
}

#[async_trait]
impl EmailSender for BrevoEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        info!(
            "Sending email \"{}\" to {} recipient(s)",
            message.subject,
            message.recipients.len()
        );

        let response = self
            .http
            .post(format!(
                "{}/smtp/email",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("api-key", &self.config.api_key)
            .json(&self.request(message))
            .send()
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Brevo rejected email with status {}: {}", status, body);
            return Err(EmailError::Rejected(format!("{}: {}", status, body)));
        }

        Ok(())
    }
}
