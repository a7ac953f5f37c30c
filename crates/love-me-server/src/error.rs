//! Gateway error taxonomy (§7): validation vs storage vs upstream failures,
//! each mapped to a short code surfaced in an `error` envelope.

use love_me_core::error::{EmailError, ExecutorError, StorageError, ToolError, ValidationError};

/// One failure observed while dispatching a client envelope. Never panics
/// the daemon; always surfaced as an `error` envelope to the caller.
#[derive(Debug)]
pub enum GatewayError {
    Validation(ValidationError),
    Storage(StorageError),
    Executor(ExecutorError),
    Tool(ToolError),
    Email(EmailError),
    /// A field the dispatcher itself required was missing or malformed.
    BadEnvelope(String),
}

impl GatewayError {
    /// Short machine-readable code per §7's taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => match e {
                ValidationError::MissingField { .. } => "MISSING_FIELD",
                ValidationError::UnknownType { .. } => "UNKNOWN_TYPE",
                ValidationError::InvalidData { .. } => "INVALID_DATA",
                ValidationError::InvalidCron { .. } => "INVALID_DATA",
            },
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Executor(_) => "EXECUTOR_ERROR",
            Self::Tool(_) => "TOOL_ERROR",
            Self::Email(_) => "EMAIL_ERROR",
            Self::BadEnvelope(_) => "INVALID_DATA",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Storage(e) => e.to_string(),
            Self::Executor(e) => e.to_string(),
            Self::Tool(e) => e.to_string(),
            Self::Email(e) => e.to_string(),
            Self::BadEnvelope(msg) => msg.clone(),
        }
    }
}

impl From<ValidationError> for GatewayError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<StorageError> for GatewayError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ExecutorError> for GatewayError {
    fn from(e: ExecutorError) -> Self {
        Self::Executor(e)
    }
}

impl From<ToolError> for GatewayError {
    fn from(e: ToolError) -> Self {
        Self::Tool(e)
    }
}

impl From<EmailError> for GatewayError {
    fn from(e: EmailError) -> Self {
        Self::Email(e)
    }
}
