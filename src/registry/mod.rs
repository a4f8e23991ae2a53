use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::errors::{ToolError, codes};
use crate::tool::{ReadOnlyTool, Tool, ToolCapabilities};
use crate::version;

/// Host-supplied check applied on register and revalidation.
pub type ToolValidator = Arc<dyn Fn(&Tool) -> anyhow::Result<()> + Send + Sync>;

/// Query predicate for [`ToolRegistry::list`]. All populated criteria must
/// match (AND semantics). An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    /// Exact name, or a contains-match when the string carries a `*`.
    pub name: Option<String>,
    pub tags: Vec<String>,
    /// Case-insensitive containment over name + description.
    pub keywords: Vec<String>,
    /// Each flag set here requires the tool's matching flag.
    pub capabilities: Option<ToolCapabilities>,
    /// Version constraint string, e.g. `^1.2.0`.
    pub version: Option<String>,
}

impl ToolFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, tool: &Tool) -> bool {
        if let Some(name) = &self.name {
            if name.contains('*') {
                let needle = name.replace('*', "");
                if !tool.name.contains(&needle) {
                    return false;
                }
            } else if &tool.name != name {
                return false;
            }
        }

        if !self.tags.is_empty() {
            let Some(metadata) = &tool.metadata else {
                return false;
            };
            if !self.tags.iter().all(|t| metadata.has_tag(t)) {
                return false;
            }
        }

        if !self.keywords.is_empty() {
            let haystack =
                format!("{} {}", tool.name, tool.description).to_lowercase();
            if !self
                .keywords
                .iter()
                .all(|k| haystack.contains(&k.to_lowercase()))
            {
                return false;
            }
        }

        if let Some(wanted) = &self.capabilities {
            let Some(caps) = &tool.capabilities else {
                return false;
            };
            let flags = [
                (wanted.streaming, caps.streaming),
                (wanted.asynchronous, caps.asynchronous),
                (wanted.cancellable, caps.cancellable),
                (wanted.retryable, caps.retryable),
                (wanted.cacheable, caps.cacheable),
            ];
            if flags.iter().any(|(required, actual)| *required && !actual) {
                return false;
            }
        }

        if let Some(constraint) = &self.version
            && !constraint.is_empty()
        {
            // Malformed versions or constraints simply fail the filter.
            if !version::matches(&tool.version, constraint).unwrap_or(false) {
                return false;
            }
        }
        true
    }
}

/// Provider-facing export of a registered tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Default)]
struct RegistryInner {
    tools: HashMap<String, Arc<Tool>>,
    name_index: HashMap<String, String>,
    tag_index: HashMap<String, HashSet<String>>,
    validators: Vec<ToolValidator>,
}

/// Process-local tool catalog with secondary indexes.
///
/// One reader-writer lock guards the table, the name index, and the tag
/// index; list snapshots are internally consistent. Lookups return either
/// deep copies (safe to mutate) or cheap read-only views.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a custom validator applied by [`ToolRegistry::register`] and
    /// [`ToolRegistry::validate_all`].
    pub fn add_validator(&self, validator: ToolValidator) {
        self.write().validators.push(validator);
    }

    /// Validate and store a tool. A rejected register leaves the registry
    /// untouched.
    pub fn register(&self, tool: Tool) -> Result<(), ToolError> {
        tool.validate()?;

        let mut inner = self.write();
        for validator in &inner.validators {
            validator(&tool).map_err(|e| {
                ToolError::validation(format!("custom validation failed: {}", e))
                    .with_tool_id(&tool.id)
                    .with_cause(e)
            })?;
        }

        if inner.tools.contains_key(&tool.id) {
            return Err(ToolError::new(
                crate::errors::ErrorKind::Validation,
                codes::TOOL_CONFLICT,
                format!("a tool with id \"{}\" is already registered", tool.id),
            )
            .with_tool_id(&tool.id));
        }
        if let Some(existing) = inner.name_index.get(&tool.name)
            && existing != &tool.id
        {
            return Err(ToolError::new(
                crate::errors::ErrorKind::Validation,
                codes::TOOL_CONFLICT,
                format!("a tool named \"{}\" is already registered", tool.name),
            )
            .with_tool_id(&tool.id));
        }

        let id = tool.id.clone();
        inner.name_index.insert(tool.name.clone(), id.clone());
        if let Some(metadata) = &tool.metadata {
            for tag in &metadata.tags {
                inner
                    .tag_index
                    .entry(tag.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }
        debug!(tool = %id, "registered tool");
        inner.tools.insert(id, Arc::new(tool));
        Ok(())
    }

    /// Remove a tool and all of its index entries.
    pub fn unregister(&self, id: &str) -> Result<(), ToolError> {
        let mut inner = self.write();
        let Some(tool) = inner.tools.remove(id) else {
            return Err(ToolError::not_found(id));
        };
        inner.name_index.remove(&tool.name);
        for ids in inner.tag_index.values_mut() {
            ids.remove(id);
        }
        inner.tag_index.retain(|_, ids| !ids.is_empty());
        debug!(tool = %id, "unregistered tool");
        Ok(())
    }

    /// Deep copy of a tool by id.
    pub fn get(&self, id: &str) -> Option<Tool> {
        self.read().tools.get(id).map(|t| (**t).clone())
    }

    /// Deep copy of a tool by name.
    pub fn get_by_name(&self, name: &str) -> Option<Tool> {
        let inner = self.read();
        let id = inner.name_index.get(name)?;
        inner.tools.get(id).map(|t| (**t).clone())
    }

    /// Non-owning view of a tool by id. The view remains usable across
    /// registry mutations; call [`ReadOnlyTool::to_owned_tool`] for a
    /// mutable copy.
    pub fn get_read_only(&self, id: &str) -> Option<ReadOnlyTool> {
        self.read()
            .tools
            .get(id)
            .map(|t| ReadOnlyTool::new(Arc::clone(t)))
    }

    /// Non-owning view of a tool by name.
    pub fn get_by_name_read_only(&self, name: &str) -> Option<ReadOnlyTool> {
        let inner = self.read();
        let id = inner.name_index.get(name)?;
        inner.tools.get(id).map(|t| ReadOnlyTool::new(Arc::clone(t)))
    }

    /// Deep copies of all tools matching `filter`. `None` matches all.
    pub fn list(&self, filter: Option<&ToolFilter>) -> Vec<Tool> {
        let inner = self.read();
        Self::matching(&inner, filter)
            .into_iter()
            .map(|t| (**t).clone())
            .collect()
    }

    /// Views of all tools matching `filter`.
    pub fn list_read_only(&self, filter: Option<&ToolFilter>) -> Vec<ReadOnlyTool> {
        let inner = self.read();
        Self::matching(&inner, filter)
            .into_iter()
            .map(|t| ReadOnlyTool::new(Arc::clone(t)))
            .collect()
    }

    /// Candidate selection for the list queries. Tag filters narrow the
    /// candidate set through the tag index before the full predicate runs.
    fn matching<'a>(
        inner: &'a RegistryInner,
        filter: Option<&ToolFilter>,
    ) -> Vec<&'a Arc<Tool>> {
        let Some(filter) = filter else {
            return inner.tools.values().collect();
        };
        if let Some(first) = filter.tags.first() {
            let Some(mut ids) = inner.tag_index.get(first).cloned() else {
                return Vec::new();
            };
            for tag in &filter.tags[1..] {
                let Some(tagged) = inner.tag_index.get(tag) else {
                    return Vec::new();
                };
                ids.retain(|id| tagged.contains(id));
            }
            return ids
                .iter()
                .filter_map(|id| inner.tools.get(id))
                .filter(|t| filter.matches(t))
                .collect();
        }
        inner.tools.values().filter(|t| filter.matches(t)).collect()
    }

    pub fn list_all(&self) -> Vec<Tool> {
        self.list(None)
    }

    pub fn count(&self) -> usize {
        self.read().tools.len()
    }

    /// Drop every tool and index entry. Custom validators are kept.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.tools.clear();
        inner.name_index.clear();
        inner.tag_index.clear();
    }

    /// Revalidate every stored tool against the structural invariants and
    /// the custom validators. The first failure is returned.
    pub fn validate_all(&self) -> Result<(), ToolError> {
        let inner = self.read();
        for tool in inner.tools.values() {
            tool.validate()?;
            for validator in &inner.validators {
                validator(tool).map_err(|e| {
                    ToolError::validation(format!("custom validation failed: {}", e))
                        .with_tool_id(&tool.id)
                        .with_cause(e)
                })?;
            }
        }
        Ok(())
    }

    /// Resolve a tool's declared dependencies into deep copies.
    pub fn get_dependencies(&self, id: &str) -> Result<Vec<Tool>, ToolError> {
        let inner = self.read();
        let Some(tool) = inner.tools.get(id) else {
            return Err(ToolError::not_found(id));
        };
        let mut resolved = Vec::with_capacity(tool.dependencies().len());
        for dep in tool.dependencies() {
            let Some(dep_tool) = inner.tools.get(dep) else {
                return Err(ToolError::dependency(format!(
                    "dependency \"{}\" is not registered",
                    dep
                ))
                .with_tool_id(id));
            };
            resolved.push((**dep_tool).clone());
        }
        Ok(resolved)
    }

    /// Whether registering (or replacing) `candidate` would introduce a
    /// dependency cycle. The candidate shadows any stored tool with the
    /// same id during the walk; missing dependencies terminate their branch.
    pub fn has_circular_dependency(&self, candidate: &Tool) -> bool {
        let inner = self.read();
        let mut path = HashSet::new();
        let mut visited = HashSet::new();
        Self::walk(&candidate.id, candidate, &inner.tools, &mut path, &mut visited)
    }

    fn walk<'a>(
        id: &'a str,
        candidate: &'a Tool,
        tools: &'a HashMap<String, Arc<Tool>>,
        path: &mut HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> bool {
        if path.contains(id) {
            return true;
        }
        if visited.contains(id) {
            return false;
        }
        path.insert(id);
        visited.insert(id);

        let deps = if id == candidate.id {
            candidate.dependencies()
        } else {
            tools.get(id).map(|t| t.dependencies()).unwrap_or_default()
        };
        for dep in deps {
            if Self::walk(dep, candidate, tools, path, visited) {
                return true;
            }
        }
        path.remove(id);
        false
    }

    /// Deep copies of every stored tool, keyed by id.
    pub fn export_tools(&self) -> HashMap<String, Tool> {
        self.read()
            .tools
            .iter()
            .map(|(id, t)| (id.clone(), (**t).clone()))
            .collect()
    }

    /// Bulk-register tools. Failures are collected per key instead of
    /// aborting the whole import; an empty map means every tool landed.
    pub fn import_tools(&self, tools: HashMap<String, Tool>) -> HashMap<String, ToolError> {
        let mut failures = HashMap::new();
        for (key, tool) in tools {
            if let Err(e) = self.register(tool) {
                failures.insert(key, e);
            }
        }
        failures
    }

    /// Name-sorted definitions for host/provider export.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .read()
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: serde_json::to_value(&t.schema).unwrap_or(Value::Null),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("registry lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("registry lock poisoned")
    }
}
