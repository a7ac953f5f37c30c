//! The email pipeline: mailbox polling (C7) and the bridge into
//! conversations and trigger-rule dispatch (C8).

pub mod bridge;
pub mod gmail;
pub mod poller;

pub use bridge::EmailBridge;
pub use gmail::GmailProvider;
pub use poller::{EmailHandler, EmailPoller, EmailProvider, EmailSummary};
