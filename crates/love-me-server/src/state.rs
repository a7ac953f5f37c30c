//! Shared application state for the love-me gateway.

use std::collections::HashSet;
use std::sync::Arc;

use love_me_core::config::Config;
use love_me_core::email::{EmailBridge, EmailPoller, EmailProvider};
use love_me_core::events::EventBus;
use love_me_core::llm::{LlmProvider, TurnCoordinator};
use love_me_core::storage::{ConversationStore, EmailStateStore, WorkflowStore};
use love_me_core::tools::ToolRouter;
use love_me_core::workflow::{Executor, NotificationSink, Scheduler};
use tokio::sync::{broadcast, Mutex, RwLock};

/// Shared state handed to every WebSocket connection.
pub struct AppState {
    pub config: RwLock<Config>,
    pub conversations: Arc<ConversationStore>,
    pub workflows: Arc<WorkflowStore>,
    pub email_state: Arc<EmailStateStore>,
    pub tools: Arc<ToolRouter>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<Scheduler>,
    pub events: Arc<EventBus>,
    pub coordinator: Option<Arc<TurnCoordinator>>,
    /// Direct handle to the same provider wrapped by `coordinator`, used by
    /// `build_workflow` to issue a one-off completion outside a turn.
    pub llm_provider: Option<Arc<dyn LlmProvider>>,
    /// Preference-gated sink shared by the Scheduler and the Email Bridge.
    pub notifications: Arc<dyn NotificationSink>,
    /// The mailbox poller, replaced wholesale when the client re-authorizes
    /// (a new refresh token means a new [`EmailProvider`]).
    pub email_poller: RwLock<Option<Arc<EmailPoller>>>,
    /// Kept so `email_auth`/`email_polling_update` can rebuild the poller
    /// against a fresh provider without re-deriving the bridge.
    pub email_bridge: Arc<EmailBridge>,
    /// Broadcast fan-out to every connected client; sized by
    /// `gateway.max_broadcast_queue_depth`.
    pub broadcast_tx: broadcast::Sender<String>,
    /// Guards against two concurrent turns on the same conversation (§4.10).
    pub active_turns: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn broadcast_depth(config: &Config) -> usize {
        config.gateway.max_broadcast_queue_depth
    }
}

/// Constructs a mailbox poller bound to `provider`, ready to `.start()`.
pub fn build_email_poller(
    provider: Arc<dyn EmailProvider>,
    email_state: Arc<EmailStateStore>,
    events: Arc<love_me_core::events::EventBus>,
    handler: Arc<EmailBridge>,
    interval_secs: u64,
    backoff_ceiling_secs: u64,
) -> Arc<EmailPoller> {
    Arc::new(EmailPoller::new(
        provider,
        email_state,
        events,
        handler,
        interval_secs,
        backoff_ceiling_secs,
    ))
}
