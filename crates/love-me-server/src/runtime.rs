//! Daemon bootstrap: wires every component (§2) from a loaded [`Config`]
//! and serves the gateway until the listener is dropped. Shared by the
//! `love-me-server` binary and the `love-me` CLI's `run` subcommand.

use std::sync::Arc;

use anyhow::Result;
use love_me_core::config::Config;
use love_me_core::email::{EmailBridge, EmailProvider, GmailProvider};
use love_me_core::events::EventBus;
use love_me_core::llm::{AnthropicProvider, LlmProvider, TurnCoordinator};
use love_me_core::storage::{ConversationStore, EmailStateStore, WorkflowStore};
use love_me_core::tools::subprocess::SubprocessToolProvider;
use love_me_core::tools::ToolRouter;
use love_me_core::workflow::{Executor, NotificationSink, Scheduler};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::email_tool::EmailToolProvider;
use crate::notify::GatewayNotificationSink;
use crate::state::{build_email_poller, AppState};

const DEFAULT_BASE_PROMPT: &str = "You are a personal automation assistant. \
You can read and write workflows, inspect their executions, and reason about \
incoming email. Be concise and say when you are unsure.";

/// Wire every component from `config` and serve the gateway until the
/// process is terminated. Blocks for the lifetime of the daemon.
pub async fn run(config: Config) -> Result<()> {
    tracing::info!(home = %config.home_dir.display(), "starting love-me daemon");
    std::fs::create_dir_all(&config.home_dir)?;

    let conversations = Arc::new(ConversationStore::new(&config.home_dir));
    let workflows = Arc::new(WorkflowStore::new(&config.home_dir));
    let email_state = Arc::new(EmailStateStore::new(&config.home_dir));
    let events = Arc::new(EventBus::new());

    let tools = Arc::new(ToolRouter::new());
    tools
        .register_provider(Arc::new(EmailToolProvider::new(email_state.clone())))
        .await?;
    for provider_config in &config.tool_providers {
        match SubprocessToolProvider::spawn(
            provider_config.name.clone(),
            &provider_config.command,
            &provider_config.args,
        )
        .await
        {
            Ok(provider) => {
                if let Err(e) = tools.register_provider(Arc::new(provider)).await {
                    tracing::warn!(provider = %provider_config.name, error = %e, "failed to register tool provider");
                }
            }
            Err(e) => {
                tracing::warn!(provider = %provider_config.name, error = %e, "failed to spawn tool provider");
            }
        }
    }

    let executor = Arc::new(Executor::new(
        tools.clone(),
        workflows.clone(),
        config.executor.step_timeout_secs,
    ));

    let (broadcast_tx, _) = broadcast::channel(config.gateway.max_broadcast_queue_depth);
    let notifications: Arc<dyn NotificationSink> =
        Arc::new(GatewayNotificationSink::new(broadcast_tx.clone()));

    let ticker = Arc::new(love_me_core::cron::CronTicker::new());
    let scheduler = Arc::new(Scheduler::new(
        ticker,
        events.clone(),
        executor.clone(),
        workflows.clone(),
        notifications.clone(),
    ));
    for summary in workflows.list().await? {
        if let Err(e) = scheduler.rebind(&summary.id).await {
            tracing::warn!(workflow_id = %summary.id, error = %e, "failed to bind workflow trigger at startup");
        }
    }

    let llm_provider: Option<Arc<dyn LlmProvider>> = match &config.llm.api_key {
        Some(api_key) if !api_key.is_empty() => {
            let model = if config.llm.model.is_empty() {
                "claude-sonnet-4-5".to_string()
            } else {
                config.llm.model.clone()
            };
            Some(Arc::new(AnthropicProvider::new(api_key.clone(), model)))
        }
        _ => {
            tracing::info!("no LLM API key configured — user_message and build_workflow are disabled");
            None
        }
    };

    let coordinator = match &llm_provider {
        Some(provider) => {
            let base_prompt = match &config.llm.base_prompt_path {
                Some(path) => std::fs::read_to_string(path).unwrap_or_else(|e| {
                    tracing::warn!(path, error = %e, "failed to read base prompt file, using default");
                    DEFAULT_BASE_PROMPT.to_string()
                }),
                None => DEFAULT_BASE_PROMPT.to_string(),
            };
            Some(Arc::new(TurnCoordinator::new(
                conversations.clone(),
                tools.clone(),
                provider.clone(),
                base_prompt,
                Vec::new(),
            )))
        }
        None => None,
    };

    let email_bridge = Arc::new(EmailBridge::new(
        conversations.clone(),
        email_state.clone(),
        workflows.clone(),
        executor.clone(),
        notifications.clone(),
    ));

    let email_poller = match &config.email.refresh_token {
        Some(refresh_token) if !refresh_token.is_empty() => {
            let provider: Arc<dyn EmailProvider> = Arc::new(GmailProvider::new(
                config.email.client_id.clone().unwrap_or_default(),
                config.email.client_secret.clone().unwrap_or_default(),
                refresh_token.clone(),
            ));
            let poller = build_email_poller(
                provider,
                email_state.clone(),
                events.clone(),
                email_bridge.clone(),
                config.email.poll_interval_secs,
                config.email.backoff_ceiling_secs,
            );
            poller.start().await;
            Some(poller)
        }
        _ => {
            tracing::info!("no email refresh token configured — mailbox polling is disabled");
            None
        }
    };

    let gateway_host = config.gateway.host.clone();
    let gateway_port = config.gateway.port;

    let state = Arc::new(AppState {
        config: RwLock::new(config),
        conversations,
        workflows,
        email_state,
        tools,
        executor,
        scheduler: scheduler.clone(),
        events,
        coordinator,
        llm_provider,
        notifications,
        email_poller: RwLock::new(email_poller),
        email_bridge,
        broadcast_tx,
        active_turns: Mutex::new(Default::default()),
    });

    let cancel = CancellationToken::new();
    tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run_cron_loop(cancel).await }
    });

    let router = crate::build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{gateway_host}:{gateway_port}")).await?;
    tracing::info!("listening on ws://{gateway_host}:{gateway_port}/ws");
    axum::serve(listener, router).await?;

    cancel.cancel();
    Ok(())
}
