pub mod config;
pub mod connection;
pub mod oauth;
pub mod process;
pub mod telemetry;

pub use config::{
    ClientKind, HttpMethod, OAuthConfig, Provenance, RestartPolicy, ServerConfig, TransportConfig,
};
pub use connection::{
    ConnectionEvent, ConnectionState, ConnectionStatus, PromptTemplate, ResourceDefinition,
    ToolDefinition,
};
pub use oauth::{AuthorizationRequest, CallbackParams, OAuthToken};
pub use process::{Lifecycle, ProcessState};
pub use telemetry::{
    CapturedError, LogCategory, LogEntry, LogFilter, LogLevel, Metric, ServerStats,
};
