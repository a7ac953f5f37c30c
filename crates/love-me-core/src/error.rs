//! Error types for the love-me core library.
//!
//! Each module has its own error enum to provide clear error boundaries.
//! The library uses `thiserror` for structured, typed errors; no exception
//! ever escapes a component boundary uncaught.

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required configuration field is absent.
    #[error("missing required config field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration field has an unacceptable value.
    #[error("invalid value for config field '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// The configuration file does not exist at the specified path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was searched.
        path: String,
    },

    /// TOML deserialization failed.
    #[error("failed to parse config file: {source}")]
    ParseError {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },

    /// Writing the config file back to disk failed.
    #[error("failed to write config file: {source}")]
    WriteError {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the file-backed entity stores (workflows, executions,
/// conversations, email state).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failed while reading or writing an entity file.
    #[error("storage I/O error at {path}: {source}")]
    Io {
        /// The path that was being read or written.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An on-disk file could not be decoded as the expected JSON shape.
    #[error("failed to decode {path}: {source}")]
    Decode {
        /// The path that failed to decode.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// `create` was called with an id that already exists.
    #[error("entity already exists: {id}")]
    AlreadyExists {
        /// The duplicate id.
        id: String,
    },

    /// `get`/`update`/`delete` was called with an id that has no entity.
    #[error("entity not found: {id}")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// A workflow failed its acyclic-graph or dependency-reference invariant.
    #[error("invalid workflow definition: {message}")]
    InvalidDefinition {
        /// Description of which invariant failed.
        message: String,
    },
}

/// Errors from the workflow executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The workflow store rejected a read or write made during execution.
    #[error("storage error during execution: {0}")]
    Storage(#[from] StorageError),

    /// A tool invocation exceeded its per-step timeout.
    #[error("step '{step_id}' timed out after {seconds}s")]
    Timeout {
        /// The step that timed out.
        step_id: String,
        /// The configured timeout.
        seconds: u64,
    },

    /// The execution was cancelled before it reached a terminal state.
    #[error("execution {execution_id} was cancelled")]
    Cancelled {
        /// The cancelled execution's id.
        execution_id: String,
    },
}

/// Errors surfaced by the tool router and its providers.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// No provider has registered a tool with this name.
    #[error("unknown tool: {name}")]
    UnknownTool {
        /// The requested tool name.
        name: String,
    },

    /// The subprocess backing an external provider could not be started
    /// or crashed mid-invocation.
    #[error("tool provider '{provider}' failed: {message}")]
    ProviderFailure {
        /// The provider's registered name.
        provider: String,
        /// A human-readable description of the failure.
        message: String,
    },

    /// The tool's arguments or response could not be parsed as JSON.
    #[error("malformed tool payload: {0}")]
    MalformedPayload(String),
}

/// Errors from interacting with an LLM vendor's streaming API.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP request to the LLM endpoint failed.
    #[error("LLM HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// LLM API returned an error response.
    #[error("LLM API error (status {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// The stream emitted an `error` event.
    #[error("LLM stream error: {0}")]
    Stream(String),

    /// No LLM provider configured.
    #[error("no LLM provider configured")]
    NotConfigured,
}

/// Errors from the email poller and its upstream mailbox provider.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// The mailbox provider returned an error (network, auth, quota).
    #[error("mail provider error: {0}")]
    Provider(String),

    /// No mail account has been linked.
    #[error("email provider not configured")]
    NotConfigured,

    /// The persisted watermark or thread map could not be read/written.
    #[error("email state storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Validation errors surfaced to a gateway client as an `error` envelope.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A required envelope field was absent.
    #[error("missing required field: {field}")]
    MissingField {
        /// The absent field's name.
        field: String,
    },

    /// The envelope's `type` did not match any known message kind.
    #[error("unknown message type: {message_type}")]
    UnknownType {
        /// The unrecognized type string.
        message_type: String,
    },

    /// A field was present but held a value the handler could not use.
    #[error("invalid data: {message}")]
    InvalidData {
        /// Description of the problem.
        message: String,
    },

    /// A cron expression did not match the grammar in the spec.
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron {
        /// The rejected expression.
        expression: String,
        /// Description of why it was rejected.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_missing_field_message() {
        let err = ConfigError::MissingField {
            field: "email.client_id".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "missing required config field: email.client_id"
        );
    }

    #[test]
    fn storage_error_already_exists_message() {
        let err = StorageError::AlreadyExists {
            id: "wf_123".to_string(),
        };
        assert_eq!(err.to_string(), "entity already exists: wf_123");
    }

    #[test]
    fn storage_error_not_found_message() {
        let err = StorageError::NotFound {
            id: "wf_missing".to_string(),
        };
        assert_eq!(err.to_string(), "entity not found: wf_missing");
    }

    #[test]
    fn executor_error_timeout_message() {
        let err = ExecutorError::Timeout {
            step_id: "fetch".to_string(),
            seconds: 300,
        };
        assert_eq!(err.to_string(), "step 'fetch' timed out after 300s");
    }

    #[test]
    fn tool_error_unknown_tool_message() {
        let err = ToolError::UnknownTool {
            name: "clock".to_string(),
        };
        assert_eq!(err.to_string(), "unknown tool: clock");
    }

    #[test]
    fn validation_error_invalid_cron_message() {
        let err = ValidationError::InvalidCron {
            expression: "*/5 * * *".to_string(),
            message: "expected 5 fields, found 4".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid cron expression '*/5 * * *': expected 5 fields, found 4"
        );
    }
}
