use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{ToolError, ValidationErrorBuilder};
use crate::schema::{PropertySchema, ToolSchema, VALID_TYPES};
use crate::streaming::StreamChunk;

mod read_only;

pub use read_only::ReadOnlyTool;

/// Cancellation-capable deadline scope handed to every executor invocation.
///
/// Scopes form a tree: the engine derives a child scope per execution, so
/// cancelling a parent (or `ExecutionEngine::cancel_all`) propagates down.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecutionScope {
    /// A root scope with no deadline.
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child scope that expires after `timeout`.
    pub fn child(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            token: parent.child_token(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for ExecutionScope {
    fn default() -> Self {
        Self::root()
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Outcome of a single tool execution, stamped by the engine with wall-clock
/// timestamp and elapsed duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(rename = "duration_ms", default, with = "duration_millis")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: String::new(),
            metadata: HashMap::new(),
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: error.into(),
            metadata: HashMap::new(),
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Runtime behavior of a tool.
///
/// `Ok(None)` means the executor finished with nothing to report; the engine
/// turns it into a bare success result. Implementations that can stream
/// override [`ToolExecutor::streaming`] to expose the capability.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        params: Value,
        scope: &ExecutionScope,
    ) -> anyhow::Result<Option<ExecutionResult>>;

    /// Runtime capability probe for streaming support.
    fn streaming(&self) -> Option<&dyn StreamingExecutor> {
        None
    }

    /// Symbolic type name used when serializing the owning tool.
    fn type_label(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Streaming extension of [`ToolExecutor`].
#[async_trait]
pub trait StreamingExecutor: Send + Sync {
    async fn execute_stream(
        &self,
        params: Value,
        scope: &ExecutionScope,
    ) -> anyhow::Result<mpsc::Receiver<StreamChunk>>;
}

/// Example invocation carried in tool metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExample {
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Descriptive metadata attached to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Tool ids this tool depends on; resolved through the registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<ToolExample>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

impl ToolMetadata {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Capability flags intrinsic to a tool, queried by the engine and filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCapabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(rename = "async", default)]
    pub asynchronous: bool,
    #[serde(default)]
    pub cancellable: bool,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub cacheable: bool,
    /// Calls per interval hint for rate limiters. Zero means unlimited.
    #[serde(default)]
    pub rate_limit: u32,
    /// Per-tool execution timeout. Overrides the engine default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// A named, versioned callable with a declared parameter schema.
///
/// Cloning deep-copies all declarative state; the executor is a shared
/// handle.
#[derive(Clone)]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub schema: ToolSchema,
    pub executor: Arc<dyn ToolExecutor>,
    pub metadata: Option<ToolMetadata>,
    pub capabilities: Option<ToolCapabilities>,
}

impl Tool {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
        schema: ToolSchema,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            version: version.into(),
            schema,
            executor,
            metadata: None,
            capabilities: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ToolMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_capabilities(mut self, capabilities: ToolCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Dependency ids declared in metadata, empty when absent.
    pub fn dependencies(&self) -> &[String] {
        self.metadata
            .as_ref()
            .map(|m| m.dependencies.as_slice())
            .unwrap_or_default()
    }

    /// Check the structural invariants of the tool definition.
    pub fn validate(&self) -> Result<(), ToolError> {
        let mut builder = ValidationErrorBuilder::new();

        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("description", &self.description),
            ("version", &self.version),
        ] {
            if value.is_empty() {
                builder.add_field_error(field, "must not be empty");
            }
        }

        if self.schema.schema_type != "object" {
            builder.add_field_error("schema.type", "root schema must be an object");
        }
        for name in &self.schema.required {
            if !self.schema.properties.contains_key(name) {
                builder.add_field_error(
                    "schema.required",
                    format!("required property \"{}\" is not declared", name),
                );
            }
        }
        for (name, prop) in &self.schema.properties {
            validate_property_schema(&mut builder, name, prop);
        }

        match builder.build(&self.id) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn validate_property_schema(
    builder: &mut ValidationErrorBuilder,
    path: &str,
    prop: &PropertySchema,
) {
    if !VALID_TYPES.contains(&prop.prop_type.as_str()) {
        builder.add_field_error(
            format!("schema.properties.{}", path),
            format!("invalid type \"{}\"", prop.prop_type),
        );
    }
    if let Some(pattern) = &prop.pattern
        && regex::Regex::new(pattern).is_err()
    {
        builder.add_field_error(
            format!("schema.properties.{}", path),
            format!("pattern \"{}\" does not compile", pattern),
        );
    }
    if let Some(items) = &prop.items {
        validate_property_schema(builder, &format!("{}.items", path), items);
    }
    if let Some(props) = &prop.properties {
        if let Some(required) = &prop.required {
            for name in required {
                if !props.contains_key(name) {
                    builder.add_field_error(
                        format!("schema.properties.{}", path),
                        format!("required property \"{}\" is not declared", name),
                    );
                }
            }
        }
        for (name, nested) in props {
            validate_property_schema(builder, &format!("{}.{}", path, name), nested);
        }
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("executor", &self.executor.type_label())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Tool {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.version == other.version
            && self.schema == other.schema
            && self.metadata == other.metadata
            && self.capabilities == other.capabilities
    }
}

impl Serialize for Tool {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Tool", 8)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("description", &self.description)?;
        state.serialize_field("version", &self.version)?;
        state.serialize_field("schema", &self.schema)?;
        // The executor is not serializable; emit its symbolic type name.
        state.serialize_field("executor", self.executor.type_label())?;
        state.serialize_field("metadata", &self.metadata)?;
        state.serialize_field("capabilities", &self.capabilities)?;
        state.end()
    }
}
