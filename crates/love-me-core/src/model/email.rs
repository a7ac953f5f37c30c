//! Email, trigger-rule, and polling-watermark records (§3 of the specification).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single attachment descriptor on an `Email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Provider-assigned attachment id.
    pub id: String,
    /// Original filename.
    pub filename: String,
    /// MIME type as reported by the provider.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
}

/// A single fetched message from the upstream mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// The provider's message id.
    pub id: String,
    /// The provider's thread id (groups related messages).
    pub thread_id: String,
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// CC'd addresses.
    #[serde(default)]
    pub cc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Attachment descriptors.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// When the provider recorded this message as received.
    pub received_at: DateTime<Utc>,
    /// Provider labels applied to this message.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// AND-combined predicates an `EmailTriggerRule` checks against an `Email`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerConditions {
    /// Case-insensitive substring match against `from`.
    #[serde(default)]
    pub from_contains: Option<String>,
    /// Case-insensitive substring match against `subject`.
    #[serde(default)]
    pub subject_contains: Option<String>,
    /// Case-insensitive substring match against `body`.
    #[serde(default)]
    pub body_contains: Option<String>,
    /// Require at least one attachment.
    #[serde(default)]
    pub require_attachment: bool,
    /// Exact (case-sensitive) match against one of the email's labels.
    #[serde(default)]
    pub label: Option<String>,
}

impl TriggerConditions {
    /// `true` if every present predicate matches `email`. Absent predicates
    /// match everything, so a rule with no conditions matches every email.
    pub fn matches(&self, email: &Email) -> bool {
        if let Some(needle) = &self.from_contains {
            if !email.from.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(needle) = &self.subject_contains {
            if !email
                .subject
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(needle) = &self.body_contains {
            if !email.body.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if self.require_attachment && email.attachments.is_empty() {
            return false;
        }
        if let Some(label) = &self.label {
            if !email.labels.iter().any(|l| l == label) {
                return false;
            }
        }
        true
    }
}

/// A persisted rule binding an email predicate to a target workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTriggerRule {
    /// Unique identifier.
    pub id: String,
    /// The workflow to run when this rule matches.
    pub workflow_id: String,
    /// Whether the bridge evaluates this rule at all.
    pub enabled: bool,
    /// The AND-combined predicates.
    pub conditions: TriggerConditions,
}

/// The poller's persisted position in the provider's message stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingWatermark {
    /// The newest message id the poller has processed, if any.
    pub last_seen_id: Option<String>,
    /// The receive instant of `last_seen_id`, if any.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Running total of processed messages since the watermark was created.
    pub total_processed: u64,
}

impl Default for PollingWatermark {
    fn default() -> Self {
        Self {
            last_seen_id: None,
            last_seen_at: None,
            total_processed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> Email {
        Email {
            id: "m1".to_string(),
            thread_id: "t1".to_string(),
            from: "Boss@Example.com".to_string(),
            to: vec!["me@example.com".to_string()],
            cc: vec![],
            subject: "Quarterly report".to_string(),
            body: "see attached".to_string(),
            attachments: vec![Attachment {
                id: "a1".to_string(),
                filename: "q.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                size: 100,
            }],
            received_at: Utc::now(),
            labels: vec!["INBOX".to_string()],
        }
    }

    #[test]
    fn empty_conditions_match_everything() {
        assert!(TriggerConditions::default().matches(&email()));
    }

    #[test]
    fn from_contains_is_case_insensitive() {
        let cond = TriggerConditions {
            from_contains: Some("boss@".to_string()),
            ..Default::default()
        };
        assert!(cond.matches(&email()));
    }

    #[test]
    fn require_attachment_rejects_when_absent() {
        let mut e = email();
        e.attachments.clear();
        let cond = TriggerConditions {
            require_attachment: true,
            ..Default::default()
        };
        assert!(!cond.matches(&e));
    }

    #[test]
    fn conditions_combine_by_and() {
        let cond = TriggerConditions {
            from_contains: Some("boss@".to_string()),
            subject_contains: Some("invoice".to_string()),
            ..Default::default()
        };
        assert!(!cond.matches(&email()));
    }

    #[test]
    fn label_match_is_exact_and_case_sensitive() {
        let cond = TriggerConditions {
            label: Some("inbox".to_string()),
            ..Default::default()
        };
        assert!(!cond.matches(&email()));
        let cond = TriggerConditions {
            label: Some("INBOX".to_string()),
            ..Default::default()
        };
        assert!(cond.matches(&email()));
    }
}
