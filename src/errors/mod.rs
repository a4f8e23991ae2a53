use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of tool execution failures.
///
/// Every error surfaced by the registry, engine, or streaming layer carries
/// one of these kinds plus a stable machine-readable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Execution,
    Timeout,
    Cancellation,
    RateLimit,
    Concurrency,
    Dependency,
    Internal,
    Provider,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Cancellation => "cancellation",
            Self::RateLimit => "rate_limit",
            Self::Concurrency => "concurrency",
            Self::Dependency => "dependency",
            Self::Internal => "internal",
            Self::Provider => "provider",
        };
        write!(f, "{}", s)
    }
}

/// Stable error codes carried by [`ToolError`].
///
/// Single-L "canceled" spelling is used everywhere.
pub mod codes {
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
    pub const TOOL_CONFLICT: &str = "TOOL_CONFLICT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CONCURRENCY_LIMIT: &str = "CONCURRENCY_LIMIT";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELED: &str = "CANCELED";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const DEPENDENCY_ERROR: &str = "DEPENDENCY_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const STREAMING_UNSUPPORTED: &str = "STREAMING_UNSUPPORTED";
}

/// Structured error for the tool subsystem.
///
/// Use the kind-specific constructors at module boundaries; internal leaf
/// functions can continue using `anyhow::Result` and attach the original
/// failure via [`ToolError::with_cause`].
#[derive(Debug)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub tool_id: Option<String>,
    pub details: Option<HashMap<String, Value>>,
    pub cause: Option<anyhow::Error>,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl ToolError {
    pub fn new(
        kind: ErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            tool_id: None,
            details: None,
            cause: None,
            timestamp: Utc::now(),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, codes::VALIDATION_FAILED, message)
    }

    pub fn not_found(tool_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, codes::TOOL_NOT_FOUND, "tool not found")
            .with_tool_id(tool_id)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, codes::EXECUTION_ERROR, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, codes::TIMEOUT, message)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Cancellation, codes::CANCELED, "execution canceled")
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, codes::RATE_LIMITED, message)
    }

    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Concurrency, codes::CONCURRENCY_LIMIT, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, codes::DEPENDENCY_ERROR, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, codes::INTERNAL_ERROR, message)
    }

    /// Attach the owning tool's id.
    pub fn with_tool_id(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    /// Attach the underlying failure for `source()` chains.
    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Attach structured context. The details map is allocated on first use.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Mark the error retryable with a suggested delay.
    pub fn with_retry(mut self, after: Duration) -> Self {
        self.retryable = true;
        self.retry_after = Some(after);
        self
    }

    /// Two errors are equivalent when their kind and code match.
    pub fn matches(&self, other: &ToolError) -> bool {
        self.kind == other.kind && self.code == other.code
    }

    /// Whether this error is the "tool not found" condition. Accepts any
    /// validation-kind error whose message mentions the missing tool.
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::Validation
            && (self.code == codes::TOOL_NOT_FOUND || self.message.contains("not found"))
    }

    /// Whether the failing operation is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.retryable || matches!(self.kind, ErrorKind::RateLimit | ErrorKind::Timeout)
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::with_capacity(4);
        if !self.code.is_empty() {
            parts.push(format!("[{}]", self.code));
        }
        if let Some(id) = &self.tool_id {
            parts.push(format!("tool \"{}\"", id));
        }
        if !self.message.is_empty() {
            parts.push(self.message.clone());
        }
        if let Some(cause) = &self.cause {
            parts.push(format!("caused by: {}", cause));
        }
        write!(f, "{}", parts.join(": "))
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| &**c as &(dyn std::error::Error + 'static))
    }
}

/// Aggregates validation failures into a single [`ToolError`].
///
/// General messages come first, then `field: message` pairs in insertion
/// order. Per-field messages are also carried as a `field_errors` detail.
#[derive(Debug, Default)]
pub struct ValidationErrorBuilder {
    general: Vec<String>,
    fields: Vec<(String, String)>,
}

impl ValidationErrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) -> &mut Self {
        self.general.push(message.into());
        self
    }

    pub fn add_field_error(
        &mut self,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> &mut Self {
        self.fields.push((field.into(), message.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.fields.is_empty()
    }

    /// Collapse the accumulated failures. Returns `None` when nothing was
    /// recorded.
    pub fn build(&self, tool_id: impl Into<String>) -> Option<ToolError> {
        if self.is_empty() {
            return None;
        }
        let mut segments = self.general.clone();
        segments.extend(self.fields.iter().map(|(f, m)| format!("{}: {}", f, m)));

        let mut err = ToolError::validation(segments.join("; ")).with_tool_id(tool_id);
        if !self.fields.is_empty() {
            let map: serde_json::Map<String, Value> = self
                .fields
                .iter()
                .map(|(f, m)| (f.clone(), Value::String(m.clone())))
                .collect();
            err = err.with_detail("field_errors", Value::Object(map));
        }
        Some(err)
    }
}

type Transformer = Box<dyn Fn(&mut ToolError) + Send + Sync>;
type Listener = Box<dyn Fn(&ToolError) + Send + Sync>;
/// Returns `None` when the error was recovered, or a (possibly replaced)
/// error to keep propagating.
type RecoveryStrategy = Box<dyn Fn(&ToolError) -> Option<ToolError> + Send + Sync>;

/// Central error funnel: normalizes foreign errors into [`ToolError`],
/// applies transformers in order, and notifies listeners.
#[derive(Default)]
pub struct ErrorHandler {
    transformers: Vec<Transformer>,
    listeners: Vec<Listener>,
    strategies: HashMap<ErrorKind, RecoveryStrategy>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transformer(
        &mut self,
        f: impl Fn(&mut ToolError) + Send + Sync + 'static,
    ) -> &mut Self {
        self.transformers.push(Box::new(f));
        self
    }

    pub fn add_listener(
        &mut self,
        f: impl Fn(&ToolError) + Send + Sync + 'static,
    ) -> &mut Self {
        self.listeners.push(Box::new(f));
        self
    }

    pub fn set_recovery_strategy(
        &mut self,
        kind: ErrorKind,
        f: impl Fn(&ToolError) -> Option<ToolError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.strategies.insert(kind, Box::new(f));
        self
    }

    /// Normalize `err` into a [`ToolError`], run transformers, notify
    /// listeners, and return the final error.
    pub fn handle(&self, err: Option<anyhow::Error>, tool_id: &str) -> ToolError {
        let mut tool_err = match err {
            None => ToolError::internal("unknown error"),
            Some(e) => Self::wrap(e),
        };
        if tool_err.tool_id.is_none() && !tool_id.is_empty() {
            tool_err = tool_err.with_tool_id(tool_id);
        }
        for t in &self.transformers {
            t(&mut tool_err);
        }
        for l in &self.listeners {
            l(&tool_err);
        }
        tool_err
    }

    /// Apply the registered strategy for the error's kind. Returns `None`
    /// when the error was recovered; errors of kinds without a strategy are
    /// returned unchanged.
    pub fn recover(&self, err: ToolError) -> Option<ToolError> {
        match self.strategies.get(&err.kind) {
            Some(strategy) => strategy(&err),
            None => Some(err),
        }
    }

    fn wrap(err: anyhow::Error) -> ToolError {
        let err = match err.downcast::<ToolError>() {
            Ok(tool_err) => return tool_err,
            Err(other) => other,
        };
        if err.is::<tokio::time::error::Elapsed>() {
            return ToolError::timeout("execution deadline exceeded").with_cause(err);
        }
        let text = err.to_string();
        if text.contains("canceled") || text.contains("cancelled") {
            return ToolError::canceled().with_cause(err);
        }
        ToolError::execution(text).with_cause(err)
    }
}
