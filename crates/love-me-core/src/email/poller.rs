//! Polls the upstream mailbox on a timer, de-duplicates via a persisted
//! watermark, and hands new messages off to a publish/handler pair (C7,
//! §4.7).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::EmailError;
use crate::events::{Event, EventBus};
use crate::model::{Email, PollingWatermark};
use crate::storage::EmailStateStore;

const PAGE_CAP: usize = 20;
const INITIAL_BACKOFF_SECS: u64 = 1;

/// A single mailbox entry, cheap enough to list a page of without fetching
/// full bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailSummary {
    /// The provider's message id.
    pub id: String,
    /// When the provider recorded this message as received.
    pub received_at: DateTime<Utc>,
}

/// The upstream mailbox surface the Poller drives. Vendor wire details
/// (OAuth, HTTP, pagination tokens) live behind this trait.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Summaries of messages received strictly after `after`, newest page
    /// capped at `limit` entries. Order is not guaranteed by the provider;
    /// the Poller sorts before processing.
    async fn fetch_page(
        &self,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EmailSummary>, EmailError>;

    /// Fetch the full message for a summary returned by `fetch_page`.
    async fn fetch_full(&self, id: &str) -> Result<Email, EmailError>;
}

/// Notified once per newly processed email, after the Poller has already
/// published the `email_received` event. The Email → Conversation Bridge
/// is the production implementation.
#[async_trait]
pub trait EmailHandler: Send + Sync {
    /// Handle one newly fetched email.
    async fn handle_new_email(&self, email: &Email);
}

/// Periodic mailbox poller with watermark de-duplication and exponential
/// backoff on provider errors.
pub struct EmailPoller {
    provider: Arc<dyn EmailProvider>,
    state: Arc<EmailStateStore>,
    events: Arc<EventBus>,
    handler: Arc<dyn EmailHandler>,
    interval_secs: u64,
    backoff_ceiling_secs: u64,
    backoff_secs: Mutex<u64>,
    running: Mutex<Option<CancellationToken>>,
}

impl EmailPoller {
    /// Build a poller. `interval_secs` and `backoff_ceiling_secs` are
    /// assumed already validated by `Config` (bounded `[10, 900]`).
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        state: Arc<EmailStateStore>,
        events: Arc<EventBus>,
        handler: Arc<dyn EmailHandler>,
        interval_secs: u64,
        backoff_ceiling_secs: u64,
    ) -> Self {
        Self {
            provider,
            state,
            events,
            handler,
            interval_secs,
            backoff_ceiling_secs,
            backoff_secs: Mutex::new(0),
            running: Mutex::new(None),
        }
    }

    /// Start the polling loop in the background. A no-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        drop(running);

        let this = self.clone();
        tokio::spawn(async move { this.run_loop(cancel).await });
    }

    /// Cancel the polling loop. A no-op if not running. The watermark is
    /// already persisted after every cycle, so there's nothing extra to
    /// flush here.
    pub async fn stop(&self) {
        if let Some(cancel) = self.running.lock().await.take() {
            cancel.cancel();
        }
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        loop {
            let delay = self.current_delay().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("email poller stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.run_cycle().await {
                Ok(processed) => tracing::info!(processed, "email poll complete"),
                Err(error) => tracing::warn!(%error, "email poll failed, backing off"),
            }
        }
    }

    async fn current_delay(&self) -> std::time::Duration {
        let backoff = *self.backoff_secs.lock().await;
        std::time::Duration::from_secs(self.interval_secs + backoff)
    }

    async fn bump_backoff(&self) {
        let mut backoff = self.backoff_secs.lock().await;
        *backoff = if *backoff == 0 {
            INITIAL_BACKOFF_SECS
        } else {
            (*backoff * 2).min(self.backoff_ceiling_secs)
        };
    }

    async fn reset_backoff(&self) {
        *self.backoff_secs.lock().await = 0;
    }

    async fn run_cycle(&self) -> Result<usize, EmailError> {
        let result = self.tick().await;
        match &result {
            Ok(_) => self.reset_backoff().await,
            Err(_) => self.bump_backoff().await,
        }
        result
    }

    /// Perform one extra poll outside the regular cadence, returning the
    /// number of newly processed messages.
    pub async fn poll_now(&self) -> Result<usize, EmailError> {
        self.run_cycle().await
    }

    async fn tick(&self) -> Result<usize, EmailError> {
        let watermark = self.state.load_watermark().await?;
        let after = watermark
            .last_seen_at
            .unwrap_or_else(|| Utc::now() - ChronoDuration::hours(1));

        let mut page = self.provider.fetch_page(after, PAGE_CAP).await?;
        page.sort_by_key(|summary| summary.received_at);

        let mut processed: u64 = 0;
        for summary in &page {
            if watermark.last_seen_id.as_deref() == Some(summary.id.as_str()) {
                continue;
            }
            match self.provider.fetch_full(&summary.id).await {
                Ok(full) => {
                    self.process_new_email(&full).await;
                    processed += 1;
                }
                Err(e) => {
                    // One bad message can't wedge the poller: log and keep
                    // going so the watermark still advances past the page.
                    tracing::warn!(message_id = %summary.id, error = %e, "failed to fetch message body, skipping");
                }
            }
        }

        if let Some(newest) = page.last() {
            self.state
                .save_watermark(&PollingWatermark {
                    last_seen_id: Some(newest.id.clone()),
                    last_seen_at: Some(newest.received_at),
                    total_processed: watermark.total_processed + processed,
                })
                .await?;
        }

        Ok(processed as usize)
    }

    async fn process_new_email(&self, email: &Email) {
        self.events
            .publish(Event {
                source: "email".to_string(),
                event_type: "email_received".to_string(),
                payload: json!({
                    "messageId": email.id,
                    "threadId": email.thread_id,
                    "from": email.from,
                    "subject": email.subject,
                }),
            })
            .await;
        self.handler.handle_new_email(email).await;
    }
}
