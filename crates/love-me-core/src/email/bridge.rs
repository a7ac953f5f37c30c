//! Maps incoming mail into conversations and dispatches matching trigger
//! rules to workflows (C8, §4.8).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EmailError;
use crate::llm::truncate_body_with_marker;
use crate::model::{Email, MessageRole, MetaValue, Metadata, StoredMessage};
use crate::storage::{ConversationStore, EmailStateStore, WorkflowStore};
use crate::workflow::{preference_routing_callbacks, Executor, NotificationSink};

use super::poller::EmailHandler;

const MAX_BODY_CHARS: usize = 4000;

/// Bridges the Email Poller's output into the Conversation Store and the
/// Workflow Executor.
pub struct EmailBridge {
    conversations: Arc<ConversationStore>,
    email_state: Arc<EmailStateStore>,
    workflows: Arc<WorkflowStore>,
    executor: Arc<Executor>,
    notifications: Arc<dyn NotificationSink>,
}

impl EmailBridge {
    /// Build a bridge over the given stores and executor.
    pub fn new(
        conversations: Arc<ConversationStore>,
        email_state: Arc<EmailStateStore>,
        workflows: Arc<WorkflowStore>,
        executor: Arc<Executor>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            conversations,
            email_state,
            workflows,
            executor,
            notifications,
        }
    }

    async fn ingest(&self, email: &Email) -> Result<(), EmailError> {
        let conversation_id = self.resolve_conversation(email).await?;
        self.conversations
            .add_message(&conversation_id, format_message(email))
            .await?;
        self.dispatch_matching_rules(email).await?;
        Ok(())
    }

    /// Look up `threadId → conversationId`; reuse the mapped conversation if
    /// it still exists, otherwise start a fresh one titled with the
    /// subject and persist the new mapping.
    async fn resolve_conversation(&self, email: &Email) -> Result<String, EmailError> {
        if let Some(existing) = self
            .email_state
            .conversation_for_thread(&email.thread_id)
            .await?
        {
            if self.conversations.load(&existing).await?.is_some() {
                return Ok(existing);
            }
        }

        let conversation = self
            .conversations
            .create(Some(email.subject.clone()))
            .await?;
        self.email_state
            .bind_thread(&email.thread_id, &conversation.id)
            .await?;
        Ok(conversation.id)
    }

    async fn dispatch_matching_rules(&self, email: &Email) -> Result<(), EmailError> {
        for rule in self.email_state.list_triggers().await? {
            if !rule.enabled || !rule.conditions.matches(email) {
                continue;
            }
            let Some(workflow) = self.workflows.get(&rule.workflow_id).await? else {
                tracing::warn!(
                    workflow_id = %rule.workflow_id,
                    rule_id = %rule.id,
                    "email trigger rule references a missing workflow"
                );
                continue;
            };
            if !workflow.enabled {
                continue;
            }

            let trigger_info = format!(
                "email trigger rule '{}' matched message '{}' from '{}'",
                rule.id, email.id, email.from
            );
            let callbacks =
                preference_routing_callbacks(workflow.notify, self.notifications.clone());
            self.executor.execute(&workflow, trigger_info, callbacks).await;
        }
        Ok(())
    }
}

#[async_trait]
impl EmailHandler for EmailBridge {
    async fn handle_new_email(&self, email: &Email) {
        if let Err(error) = self.ingest(email).await {
            tracing::warn!(%error, message_id = %email.id, "failed to bridge email into a conversation");
        }
    }
}

fn format_message(email: &Email) -> StoredMessage {
    let mut text = String::new();
    text.push_str(&format!("From: {}\n", email.from));
    text.push_str(&format!("To: {}\n", email.to.join(", ")));
    if !email.cc.is_empty() {
        text.push_str(&format!("Cc: {}\n", email.cc.join(", ")));
    }
    text.push_str(&format!("Subject: {}\n", email.subject));
    text.push_str(&format!("Received: {}\n", email.received_at.to_rfc3339()));
    if !email.labels.is_empty() {
        text.push_str(&format!("Labels: {}\n", email.labels.join(", ")));
    }
    if !email.attachments.is_empty() {
        text.push_str("Attachments:\n");
        for attachment in &email.attachments {
            text.push_str(&format!(
                "  - {} ({}, {} bytes)\n",
                attachment.filename, attachment.mime_type, attachment.size
            ));
        }
    }
    text.push('\n');
    text.push_str(&truncate_body_with_marker(&email.body, MAX_BODY_CHARS));

    let mut metadata = Metadata::new();
    metadata.insert("sourceType".to_string(), MetaValue::String("email".to_string()));
    metadata.insert(
        "emailThreadId".to_string(),
        MetaValue::String(email.thread_id.clone()),
    );
    metadata.insert(
        "emailMessageId".to_string(),
        MetaValue::String(email.id.clone()),
    );
    metadata.insert(
        "fromAddress".to_string(),
        MetaValue::String(email.from.clone()),
    );

    StoredMessage {
        role: MessageRole::User,
        content: text,
        timestamp: email.received_at,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EmailTriggerRule, ErrorPolicy, NotificationPreferences, Step, Trigger, TriggerConditions, WorkflowExecution};
    use crate::tools::{ToolDescriptor, ToolInvocationResult, ToolProvider, ToolRouter};
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap;

    struct EchoTool;

    #[async_trait]
    impl ToolProvider for EchoTool {
        fn name(&self) -> &str {
            "builtin"
        }
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, crate::error::ToolError> {
            Ok(vec![ToolDescriptor {
                name: "echo".to_string(),
                description: String::new(),
                parameter_schema: serde_json::json!({}),
                provider_name: "builtin".to_string(),
            }])
        }
        async fn invoke(
            &self,
            _tool: &str,
            args: Value,
        ) -> Result<ToolInvocationResult, crate::error::ToolError> {
            Ok(ToolInvocationResult::ok(args.to_string()))
        }
    }

    struct NoopSink;
    impl NotificationSink for NoopSink {
        fn notify_start(&self, _execution: &WorkflowExecution) {}
        fn notify_complete(&self, _execution: &WorkflowExecution) {}
        fn notify_error(&self, _execution: &WorkflowExecution) {}
        fn notify_step_complete(&self, _execution: &WorkflowExecution, _step: &crate::model::StepResult) {}
    }

    fn email(thread_id: &str, from: &str, subject: &str) -> Email {
        Email {
            id: "m1".to_string(),
            thread_id: thread_id.to_string(),
            from: from.to_string(),
            to: vec!["me@example.com".to_string()],
            cc: vec![],
            subject: subject.to_string(),
            body: "hello there".to_string(),
            attachments: vec![],
            received_at: Utc::now(),
            labels: vec![],
        }
    }

    async fn setup() -> (EmailBridge, Arc<ConversationStore>, Arc<EmailStateStore>, Arc<WorkflowStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let conversations = Arc::new(ConversationStore::new(dir.path()));
        let email_state = Arc::new(EmailStateStore::new(dir.path()));
        let workflows = Arc::new(WorkflowStore::new(dir.path()));
        let tools = Arc::new(ToolRouter::new());
        tools.register_provider(Arc::new(EchoTool)).await.unwrap();
        let executor = Arc::new(Executor::new(tools, workflows.clone(), 300));
        let bridge = EmailBridge::new(
            conversations.clone(),
            email_state.clone(),
            workflows.clone(),
            executor,
            Arc::new(NoopSink),
        );
        (bridge, conversations, email_state, workflows, dir)
    }

    #[tokio::test]
    async fn first_email_on_a_thread_creates_a_new_conversation() {
        let (bridge, conversations, email_state, _workflows, _dir) = setup().await;
        let email = email("t1", "boss@example.com", "Quarterly report");
        bridge.handle_new_email(&email).await;

        let bound = email_state.conversation_for_thread("t1").await.unwrap().unwrap();
        let conversation = conversations.load(&bound).await.unwrap().unwrap();
        assert_eq!(conversation.title, "Quarterly report");
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].role, MessageRole::User);
        assert!(conversation.messages[0].content.contains("From: boss@example.com"));
    }

    #[tokio::test]
    async fn second_email_on_same_thread_appends_to_existing_conversation() {
        let (bridge, conversations, _email_state, _workflows, _dir) = setup().await;
        let mut first = email("t1", "boss@example.com", "Quarterly report");
        first.id = "m1".to_string();
        bridge.handle_new_email(&first).await;

        let mut second = email("t1", "boss@example.com", "Re: Quarterly report");
        second.id = "m2".to_string();
        bridge.handle_new_email(&second).await;

        let all = conversations.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message_count, 2);
    }

    #[tokio::test]
    async fn matching_trigger_rule_executes_target_workflow() {
        let (bridge, _conversations, email_state, workflows, _dir) = setup().await;
        let wf = crate::model::Workflow {
            id: "wf1".to_string(),
            name: "notify".to_string(),
            description: String::new(),
            enabled: true,
            trigger: Trigger::Cron {
                expression: "* * * * *".to_string(),
            },
            steps: vec![Step {
                id: "s1".to_string(),
                name: "s1".to_string(),
                tool_name: "echo".to_string(),
                provider_name: "builtin".to_string(),
                input: HashMap::new(),
                depends_on: vec![],
                error_policy: ErrorPolicy::Stop,
            }],
            notify: NotificationPreferences::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        workflows.create(wf).await.unwrap();
        email_state
            .upsert_trigger(EmailTriggerRule {
                id: "r1".to_string(),
                workflow_id: "wf1".to_string(),
                enabled: true,
                conditions: TriggerConditions {
                    from_contains: Some("boss@".to_string()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let email = email("t1", "boss@example.com", "hi");
        bridge.handle_new_email(&email).await;

        let executions = workflows.list_executions("wf1").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert!(executions[0].trigger_info.contains("r1"));
    }

    #[tokio::test]
    async fn non_matching_rule_does_not_execute_workflow() {
        let (bridge, _conversations, email_state, workflows, _dir) = setup().await;
        let wf = crate::model::Workflow {
            id: "wf1".to_string(),
            name: "notify".to_string(),
            description: String::new(),
            enabled: true,
            trigger: Trigger::Cron {
                expression: "* * * * *".to_string(),
            },
            steps: vec![Step {
                id: "s1".to_string(),
                name: "s1".to_string(),
                tool_name: "echo".to_string(),
                provider_name: "builtin".to_string(),
                input: HashMap::new(),
                depends_on: vec![],
                error_policy: ErrorPolicy::Stop,
            }],
            notify: NotificationPreferences::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        workflows.create(wf).await.unwrap();
        email_state
            .upsert_trigger(EmailTriggerRule {
                id: "r1".to_string(),
                workflow_id: "wf1".to_string(),
                enabled: true,
                conditions: TriggerConditions {
                    from_contains: Some("nobody@".to_string()),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let email = email("t1", "boss@example.com", "hi");
        bridge.handle_new_email(&email).await;

        assert!(workflows.list_executions("wf1").await.unwrap().is_empty());
    }

    #[test]
    fn format_message_truncates_long_bodies() {
        let mut e = email("t1", "a@example.com", "s");
        e.body = "x".repeat(5000);
        let message = format_message(&e);
        assert!(message.content.contains("[... body truncated at 4000 characters ...]"));
        assert!(message.content.len() < 5000);
    }
}
