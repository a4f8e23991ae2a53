use std::sync::Arc;

use super::{Tool, ToolCapabilities, ToolExecutor, ToolMetadata};
use crate::schema::ToolSchema;

/// Non-owning view of a registered tool.
///
/// The view shares the stored tool, so no copy is made on lookup. Callers
/// that need a mutable or registry-independent copy use
/// [`ReadOnlyTool::to_owned_tool`].
#[derive(Debug, Clone)]
pub struct ReadOnlyTool {
    inner: Arc<Tool>,
}

impl ReadOnlyTool {
    pub(crate) fn new(inner: Arc<Tool>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn schema(&self) -> &ToolSchema {
        &self.inner.schema
    }

    pub fn metadata(&self) -> Option<&ToolMetadata> {
        self.inner.metadata.as_ref()
    }

    pub fn capabilities(&self) -> Option<&ToolCapabilities> {
        self.inner.capabilities.as_ref()
    }

    pub fn executor(&self) -> Arc<dyn ToolExecutor> {
        Arc::clone(&self.inner.executor)
    }

    /// Escape hatch: produce an owned deep copy of the underlying tool.
    pub fn to_owned_tool(&self) -> Tool {
        (*self.inner).clone()
    }
}
