//! The workflow engine: DAG executor, cron/event trigger binding, and
//! variable substitution (§4.4–4.6).

pub mod executor;
pub mod jsonpath;
pub mod scheduler;

pub use executor::{Executor, ExecutorCallbacks};
pub use scheduler::{preference_routing_callbacks, NotificationSink, Scheduler};
