/// Errors raised while talking to the upstream run endpoints.
///
/// Transport errors are the only errors (besides upstream terminal run
/// failures) that halt a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or the connection failed.
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },
    /// Upstream answered with a non-success HTTP status.
    #[error("{endpoint} returned status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    /// Reading the response body failed mid-stream.
    #[error("stream read failed: {0}")]
    Read(String),
    /// Upstream answered with a body this client cannot interpret.
    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },
}

impl TransportError {
    pub fn request(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn status(endpoint: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            endpoint: endpoint.into(),
            status,
            body: body.into(),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::Read(message.into())
    }

    pub fn invalid_response(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// Failure of a local tool handler. Submitted upstream as the tool output
/// rather than dropped, so the run can react.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// No handler is registered for the requested function name.
    #[error("unsupported function: {0}")]
    UnsupportedFunction(String),
    /// The raw arguments could not be parsed or failed validation.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The handler ran but could not produce an output.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    /// Stable tag sent upstream alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFunction(_) => "UnsupportedFunction",
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::ExecutionFailed(_) => "ExecutionFailed",
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::UnsupportedFunction(msg)
            | Self::InvalidArguments(msg)
            | Self::ExecutionFailed(msg) => msg,
        }
    }
}

/// Errors from a [`MessagePersistenceGateway`](crate::persistence::MessagePersistenceGateway).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    #[error("persistence request failed: {0}")]
    Request(String),
    #[error("persistence backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid persistence response: {0}")]
    InvalidResponse(String),
}

impl PersistError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(String),
    #[error("invalid configuration for {key}: {message}")]
    Invalid { key: String, message: String },
    #[error("failed to build http client: {0}")]
    Client(String),
}

/// Errors returned synchronously by the public [`StreamSession`](crate::session::StreamSession) API.
///
/// Everything that happens after a run has started is reported through the
/// observable [`RunSession`](crate::state::RunSession) instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("run already active")]
    AlreadyActive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_kind_and_message_are_split() {
        let err = ToolError::UnsupportedFunction("OrderPizza".into());
        assert_eq!(err.kind(), "UnsupportedFunction");
        assert_eq!(err.message(), "OrderPizza");
        assert_eq!(err.to_string(), "unsupported function: OrderPizza");
    }

    #[test]
    fn persist_error_retry_classification() {
        assert!(PersistError::Request("connection reset".into()).is_retryable());
        assert!(
            PersistError::Status {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            PersistError::Status {
                status: 429,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !PersistError::Status {
                status: 400,
                body: "bad role".into()
            }
            .is_retryable()
        );
        assert!(!PersistError::InvalidResponse("no id".into()).is_retryable());
    }

    #[test]
    fn session_error_already_active_message() {
        assert_eq!(SessionError::AlreadyActive.to_string(), "run already active");
    }

    #[test]
    fn transport_status_display_includes_endpoint() {
        let err = TransportError::status("/run/stream", 502, "bad gateway");
        assert_eq!(err.to_string(), "/run/stream returned status 502: bad gateway");
    }
}
