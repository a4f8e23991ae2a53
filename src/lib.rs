#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating hundreds of pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts in metrics and bounds arithmetic (counts, durations, sizes)
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
// Module structure — our modules use the foo::ToolFoo pattern by design
#![allow(clippy::module_name_repetitions)]

//! Tool execution core for agent runtimes: a concurrent registry of
//! schema-validated tools, a bounded execution engine with streaming, and
//! the resilience primitives (typed errors, circuit breaker) around them.

pub mod breaker;
pub mod engine;
pub mod errors;
pub mod registry;
pub mod schema;
pub mod streaming;
pub mod tool;
pub mod version;

pub use breaker::{CircuitBreaker, CircuitState};
pub use engine::{
    EngineConfig, EngineMetrics, ExecutionEngine, ExecutionHook, RateLimiter,
    ResultCacheConfig, ToolMetrics,
};
pub use errors::{ErrorHandler, ErrorKind, ToolError, ValidationErrorBuilder};
pub use registry::{ToolDefinition, ToolFilter, ToolRegistry, ToolValidator};
pub use schema::{PropertySchema, SchemaViolation, ToolSchema};
pub use streaming::{
    ChunkType, StreamAccumulator, StreamChunk, StreamError, StreamingContext,
    StreamingParameterParser, StreamingResultBuilder, StreamingToolHelper,
};
pub use tool::{
    ExecutionResult, ExecutionScope, ReadOnlyTool, StreamingExecutor, Tool,
    ToolCapabilities, ToolExecutor, ToolMetadata,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
