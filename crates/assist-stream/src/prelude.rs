//! Common imports for wiring a session.
pub use crate::{
    ClientConfig, HttpMessageStore, HttpRunApi, InMemoryMessageStore, MessagePersistenceGateway,
    RetryPolicy, Role, RunApi, RunSession, RunStatus, SessionError, SessionOptions, StreamSession,
    ToolError, ToolHandler, ToolRegistry,
};
