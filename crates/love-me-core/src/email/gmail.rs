//! Gmail mailbox provider.
//!
//! Implements [`EmailProvider`] against the Gmail REST API. The raw wire
//! format is out of scope beyond what polling needs (§2): this module only
//! knows enough of `users.messages.list`/`users.messages.get` to produce
//! [`EmailSummary`]/[`Email`] records, and refreshes its own access token
//! from a long-lived OAuth refresh token before each call.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::EmailError;
use crate::model::{Attachment, Email};

use super::poller::{EmailProvider, EmailSummary};

const GMAIL_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail-backed [`EmailProvider`]. Holds a cached access token behind a
/// mutex, refreshed lazily whenever the cached token has expired.
pub struct GmailProvider {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_url: String,
    api_base: String,
    access_token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl GmailProvider {
    /// Build a provider from OAuth credentials against the production API.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            token_url: GMAIL_TOKEN_URL.to_string(),
            api_base: GMAIL_API_BASE.to_string(),
            access_token: Mutex::new(None),
        }
    }

    /// Build a provider against custom token/API URLs, for tests.
    pub fn with_urls(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        token_url: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            token_url: token_url.into(),
            api_base: api_base.into(),
            access_token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, EmailError> {
        let mut cached = self.access_token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &self.refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await
            .map_err(|e| EmailError::Provider(format!("token refresh request failed: {e}")))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Provider(format!("token refresh failed: {body}")));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| EmailError::Provider(format!("invalid token response: {e}")))?;

        let token = CachedToken {
            value: parsed.access_token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in.saturating_sub(30)),
        };
        *cached = Some(token);
        Ok(parsed.access_token)
    }
}

#[async_trait::async_trait]
impl EmailProvider for GmailProvider {
    async fn fetch_page(&self, after: DateTime<Utc>, limit: usize) -> Result<Vec<EmailSummary>, EmailError> {
        let token = self.access_token().await?;
        let query = format!("after:{}", after.timestamp());

        let response = self
            .client
            .get(format!("{}/messages", self.api_base))
            .bearer_auth(&token)
            .query(&[("q", query.as_str()), ("maxResults", &limit.to_string())])
            .send()
            .await
            .map_err(|e| EmailError::Provider(format!("list messages failed: {e}")))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Provider(format!("list messages error: {body}")));
        }

        let list: MessageListResponse = response
            .json()
            .await
            .map_err(|e| EmailError::Provider(format!("invalid list response: {e}")))?;

        // `messages.list` only returns id/threadId; each message's actual
        // received time needs its own metadata fetch, or the watermark
        // would never advance past `after` (every summary would carry the
        // same cutoff).
        let mut summaries = Vec::with_capacity(list.messages.len());
        for message_ref in list.messages {
            let meta_response = self
                .client
                .get(format!("{}/messages/{}", self.api_base, message_ref.id))
                .bearer_auth(&token)
                .query(&[("format", "metadata")])
                .send()
                .await
                .map_err(|e| EmailError::Provider(format!("get message metadata failed: {e}")))?;

            if !meta_response.status().is_success() {
                let body = meta_response.text().await.unwrap_or_default();
                return Err(EmailError::Provider(format!("get message metadata error: {body}")));
            }

            let raw: GmailMessage = meta_response
                .json()
                .await
                .map_err(|e| EmailError::Provider(format!("invalid message metadata response: {e}")))?;

            summaries.push(EmailSummary {
                id: raw.id,
                received_at: parse_internal_date(raw.internal_date.as_deref()),
            });
        }

        Ok(summaries)
    }

    async fn fetch_full(&self, id: &str) -> Result<Email, EmailError> {
        let token = self.access_token().await?;

        let response = self
            .client
            .get(format!("{}/messages/{id}", self.api_base))
            .bearer_auth(&token)
            .query(&[("format", "full")])
            .send()
            .await
            .map_err(|e| EmailError::Provider(format!("get message failed: {e}")))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Provider(format!("get message error: {body}")));
        }

        let raw: GmailMessage = response
            .json()
            .await
            .map_err(|e| EmailError::Provider(format!("invalid message response: {e}")))?;

        Ok(to_email(raw))
    }
}

/// Parses Gmail's `internalDate` (epoch milliseconds as a string), falling
/// back to now if absent or malformed.
fn parse_internal_date(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

fn to_email(raw: GmailMessage) -> Email {
    let headers = &raw.payload.headers;
    let header = |name: &str| -> String {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let received_at = parse_internal_date(raw.internal_date.as_deref());

    let body = extract_body(&raw.payload);
    let attachments = extract_attachments(&raw.payload);

    Email {
        id: raw.id,
        thread_id: raw.thread_id,
        from: header("From"),
        to: split_addresses(&header("To")),
        cc: split_addresses(&header("Cc")),
        subject: header("Subject"),
        body,
        attachments,
        received_at,
        labels: raw.label_ids,
    }
}

fn split_addresses(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn extract_body(part: &GmailPart) -> String {
    if part.mime_type == "text/plain" {
        if let Some(data) = &part.body.data {
            return decode_base64url(data);
        }
    }
    for child in &part.parts {
        let nested = extract_body(child);
        if !nested.is_empty() {
            return nested;
        }
    }
    String::new()
}

fn extract_attachments(part: &GmailPart) -> Vec<Attachment> {
    let mut out = Vec::new();
    collect_attachments(part, &mut out);
    out
}

fn collect_attachments(part: &GmailPart, out: &mut Vec<Attachment>) {
    if let Some(attachment_id) = &part.body.attachment_id {
        if !part.filename.is_empty() {
            out.push(Attachment {
                id: attachment_id.clone(),
                filename: part.filename.clone(),
                mime_type: part.mime_type.clone(),
                size: part.body.size.unwrap_or(0),
            });
        }
    }
    for child in &part.parts {
        collect_attachments(child, out);
    }
}

fn decode_base64url(data: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "internalDate", default)]
    internal_date: Option<String>,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    payload: GmailPart,
}

#[derive(Deserialize, Default)]
struct GmailPart {
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: GmailBody,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Deserialize, Default)]
struct GmailBody {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "attachmentId", default)]
    attachment_id: Option<String>,
}

#[derive(Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}
