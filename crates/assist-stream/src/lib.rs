//! Streaming orchestration for long-running assistant runs.
//!
//! A run is consumed as a server-sent-event stream. Bytes are framed by
//! [`sse::SseDecoder`], normalized into [`StreamEvent`]s, and folded into a
//! [`RunSession`] by the pure [`reducer`]. [`StreamSession`] owns the
//! connection, executes the reducer's intents (persisting finished messages,
//! dispatching tool calls to local [`ToolHandler`]s) and exposes cancellation.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use assist_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let api = Arc::new(HttpRunApi::from_env()?);
//! let store = Arc::new(InMemoryMessageStore::new());
//! let session = StreamSession::builder(api, store).build();
//!
//! let mut updates = session.subscribe();
//! tokio::spawn(async move {
//!     while updates.changed().await.is_ok() {
//!         println!("{}", updates.borrow_and_update().accumulated_text);
//!     }
//! });
//!
//! let finished = session.start("thread_123", "asst_456").await?;
//! println!("run ended as {}", finished.status);
//! # Ok(())
//! # }
//! ```

/// Upstream run endpoints and a scripted stand-in.
pub mod api;
/// Client and session configuration.
pub mod config;
pub mod errors;
/// Normalized run events.
pub mod event;
pub mod observability;
/// Message store boundary.
pub mod persistence;
pub mod policy;
pub mod prelude;
pub mod reducer;
pub mod session;
/// Server-sent-event framing.
pub mod sse;
/// Observable run state.
pub mod state;
/// Tool registry and dispatcher.
pub mod tools;

pub use api::{
    ByteStream, HttpRunApi, RecordedSubmission, RunApi, ScriptedRunApi, ScriptedStream,
    ScriptedSubmit, SubmitResponse, ToolOutput,
};
pub use config::{ClientConfig, SessionOptions};
pub use errors::{ConfigError, PersistError, SessionError, ToolError, TransportError};
pub use event::{StreamEvent, ToolCallDescriptor};
pub use observability::init_observability;
pub use persistence::{
    HttpMessageStore, InMemoryMessageStore, MessagePersistenceGateway, PersistedMessage,
};
pub use policy::RetryPolicy;
pub use reducer::{Intent, Reduction};
pub use session::{StreamSession, StreamSessionBuilder};
pub use state::{Role, RunSession, RunStatus};
pub use tools::{ToolCallDispatcher, ToolHandler, ToolOutcome, ToolRegistry};
