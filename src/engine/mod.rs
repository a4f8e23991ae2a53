use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{ErrorKind, ToolError, codes};
use crate::registry::ToolRegistry;
use crate::schema;
use crate::streaming::{ChunkType, DEFAULT_CHANNEL_CAPACITY, StreamChunk};
use crate::tool::{ExecutionResult, ExecutionScope, ReadOnlyTool};

pub const DEFAULT_MAX_CONCURRENT: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Recheck interval of the counted admission gate.
const ADMISSION_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Optional LRU result cache for tools declaring the `cacheable` capability.
#[derive(Debug, Clone, Copy)]
pub struct ResultCacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    pub result_cache: Option<ResultCacheConfig>,
    /// Bound of the recent-execution history ring.
    pub history_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: DEFAULT_TIMEOUT,
            result_cache: None,
            history_size: 128,
        }
    }
}

/// Admission collaborator. The engine only calls [`RateLimiter::wait`];
/// `allow` is the non-blocking variant for hosts.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn allow(&self, tool_id: &str) -> bool;
    async fn wait(&self, tool_id: &str, parent: &CancellationToken) -> Result<(), ToolError>;
}

/// Cross-cutting interceptor around executions.
///
/// A failing `before_execute` aborts the call before the executor runs;
/// `after_execute` failures are logged and swallowed. Hooks run in
/// registration order.
#[async_trait]
pub trait ExecutionHook: Send + Sync {
    async fn before_execute(&self, _tool_id: &str, _params: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_execute(
        &self,
        _tool_id: &str,
        _params: &Value,
        _result: &ExecutionResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-tool aggregate, kept alongside the engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolMetrics {
    pub executions: u64,
    pub successes: u64,
    pub errors: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub total_executions: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_duration: Duration,
    pub per_tool: HashMap<String, ToolMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failed,
    TimedOut,
    Canceled,
}

/// One entry of the bounded execution history.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub tool_id: String,
    pub status: ExecutionStatus,
    pub duration: Duration,
    pub from_cache: bool,
}

#[derive(Default)]
struct MetricsState {
    aggregate: EngineMetrics,
    history: VecDeque<ExecutionRecord>,
}

#[derive(Default)]
struct TrackingState {
    active: usize,
    executions: HashMap<String, CancellationToken>,
}

/// RAII release of an admission slot (and the execution-id tracking entry,
/// once registered). Runs on every exit path.
struct SlotGuard {
    tracking: Arc<Mutex<TrackingState>>,
    exec_id: Option<String>,
}

impl SlotGuard {
    fn track(&mut self, exec_id: String, token: CancellationToken) {
        let mut tracking = self.tracking.lock().expect("engine tracking lock poisoned");
        tracking.executions.insert(exec_id.clone(), token);
        self.exec_id = Some(exec_id);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut tracking = self.tracking.lock().expect("engine tracking lock poisoned");
        tracking.active -= 1;
        if let Some(exec_id) = &self.exec_id {
            tracking.executions.remove(exec_id);
        }
    }
}

struct CachedResult {
    result: ExecutionResult,
    cached_at: Instant,
}

enum ExecOutcome {
    Finished(anyhow::Result<Option<ExecutionResult>>),
    TimedOut,
    Canceled,
    Panicked(String),
}

/// Produce a canonical JSON string with object keys sorted recursively,
/// so cache keys are stable regardless of key insertion order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            serde_json::to_string(&sorted).unwrap_or_default()
        }
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// Concurrency-bounded dispatcher around the registry.
///
/// Every execution passes the same pipeline: resolution, rate gate,
/// counted concurrency gate, schema validation, before-hooks, then the
/// executor under a derived cancellable deadline scope with panic
/// isolation. Results are stamped, metered, and post-hooked; cleanup runs
/// on every exit path.
pub struct ExecutionEngine {
    registry: Arc<ToolRegistry>,
    config: EngineConfig,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    hooks: Vec<Arc<dyn ExecutionHook>>,
    tracking: Arc<Mutex<TrackingState>>,
    metrics: Arc<Mutex<MetricsState>>,
    cache: Option<Mutex<LruCache<String, CachedResult>>>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<ToolRegistry>, config: EngineConfig) -> Self {
        let cache = config.result_cache.map(|c| {
            Mutex::new(LruCache::new(
                NonZeroUsize::new(c.max_entries.max(1)).expect("cache size is nonzero"),
            ))
        });
        Self {
            registry,
            config,
            rate_limiter: None,
            hooks: Vec::new(),
            tracking: Arc::new(Mutex::new(TrackingState::default())),
            metrics: Arc::new(Mutex::new(MetricsState::default())),
            cache,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Append a hook; hooks run in registration order.
    pub fn add_hook(&mut self, hook: Arc<dyn ExecutionHook>) {
        self.hooks.push(hook);
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Number of executions currently holding an admission slot.
    pub fn active_count(&self) -> usize {
        self.tracking
            .lock()
            .expect("engine tracking lock poisoned")
            .active
    }

    /// Execute a tool under a fresh root scope.
    pub async fn execute(
        &self,
        tool_id: &str,
        params: Value,
    ) -> Result<ExecutionResult, ToolError> {
        self.execute_scoped(&CancellationToken::new(), tool_id, params)
            .await
    }

    /// Execute a tool under the caller's cancellation scope.
    pub async fn execute_scoped(
        &self,
        parent: &CancellationToken,
        tool_id: &str,
        params: Value,
    ) -> Result<ExecutionResult, ToolError> {
        let tool = self
            .registry
            .get_read_only(tool_id)
            .ok_or_else(|| ToolError::not_found(tool_id))?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.wait(tool_id, parent).await?;
        }

        let mut slot = self.acquire_slot(parent, tool_id).await?;

        schema::validate(tool.schema(), &params)
            .map_err(|v| ToolError::validation(v.to_string()).with_tool_id(tool_id))?;

        if let Some(hit) = self.cache_lookup(&tool, &params) {
            debug!(tool = %tool_id, "result cache hit");
            self.record(tool_id, ExecutionStatus::Success, hit.duration, true, true);
            return Ok(hit);
        }

        for hook in &self.hooks {
            hook.before_execute(tool_id, &params).await.map_err(|e| {
                ToolError::execution("before-execute hook failed")
                    .with_tool_id(tool_id)
                    .with_cause(e)
            })?;
        }

        let timeout = self.effective_timeout(&tool);
        let scope = ExecutionScope::child(parent, timeout);
        slot.track(execution_id(tool_id), scope.token().clone());

        let started = Instant::now();
        let outcome = run_executor(&tool, params.clone(), &scope, timeout).await;
        let (mut result, status) = translate_outcome(tool_id, outcome, timeout);
        result.duration = started.elapsed();
        result.timestamp = Utc::now();

        self.record(tool_id, status, result.duration, result.success, false);
        self.cache_store(&tool, &params, &result);

        for hook in &self.hooks {
            if let Err(e) = hook.after_execute(tool_id, &params, &result).await {
                warn!(tool = %tool_id, error = %e, "after-execute hook failed");
            }
        }
        Ok(result)
    }

    /// Execute a streaming tool; chunks are relayed in production order and
    /// the caller-facing channel closes when the stream ends.
    pub async fn execute_stream(
        &self,
        tool_id: &str,
        params: Value,
    ) -> Result<mpsc::Receiver<StreamChunk>, ToolError> {
        self.execute_stream_scoped(&CancellationToken::new(), tool_id, params)
            .await
    }

    pub async fn execute_stream_scoped(
        &self,
        parent: &CancellationToken,
        tool_id: &str,
        params: Value,
    ) -> Result<mpsc::Receiver<StreamChunk>, ToolError> {
        let tool = self
            .registry
            .get_read_only(tool_id)
            .ok_or_else(|| ToolError::not_found(tool_id))?;

        // Capability probe happens before any admission effects.
        let executor = tool.executor();
        if executor.streaming().is_none() {
            return Err(ToolError::new(
                ErrorKind::Validation,
                codes::STREAMING_UNSUPPORTED,
                "tool does not support streaming",
            )
            .with_tool_id(tool_id));
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.wait(tool_id, parent).await?;
        }

        let mut slot = self.acquire_slot(parent, tool_id).await?;

        schema::validate(tool.schema(), &params)
            .map_err(|v| ToolError::validation(v.to_string()).with_tool_id(tool_id))?;

        for hook in &self.hooks {
            hook.before_execute(tool_id, &params).await.map_err(|e| {
                ToolError::execution("before-execute hook failed")
                    .with_tool_id(tool_id)
                    .with_cause(e)
            })?;
        }

        let timeout = self.effective_timeout(&tool);
        let scope = ExecutionScope::child(parent, timeout);
        slot.track(execution_id(tool_id), scope.token().clone());

        let started = Instant::now();
        let streaming = executor
            .streaming()
            .expect("streaming capability probed above");
        let mut upstream = match streaming.execute_stream(params, &scope).await {
            Ok(rx) => rx,
            Err(e) => {
                // Failed setup: cancel the derived scope; the slot guard
                // releases tracking on return.
                scope.cancel();
                return Err(ToolError::execution("streaming execution failed")
                    .with_tool_id(tool_id)
                    .with_cause(e));
            }
        };

        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let token = scope.token().clone();
        let metrics = Arc::clone(&self.metrics);
        let history_size = self.config.history_size;
        let relay_tool_id = tool_id.to_string();
        tokio::spawn(async move {
            // The slot is held for the lifetime of the relay.
            let _slot = slot;
            let mut has_error = false;
            let status = loop {
                tokio::select! {
                    maybe = upstream.recv() => match maybe {
                        Some(chunk) => {
                            if chunk.chunk_type == ChunkType::Error {
                                has_error = true;
                            }
                            if tx.send(chunk).await.is_err() {
                                // Consumer went away; stop relaying.
                                break ExecutionStatus::Canceled;
                            }
                        }
                        None => {
                            break if has_error {
                                ExecutionStatus::Failed
                            } else {
                                ExecutionStatus::Success
                            };
                        }
                    },
                    () = token.cancelled() => {
                        // Exit promptly without draining the upstream.
                        break ExecutionStatus::Canceled;
                    }
                }
            };
            record_metrics(
                &metrics,
                history_size,
                &relay_tool_id,
                status,
                started.elapsed(),
                status == ExecutionStatus::Success,
                false,
            );
            debug!(tool = %relay_tool_id, ?status, "stream relay finished");
        });
        Ok(rx)
    }

    /// Cancel every in-flight execution's scope. A no-op when nothing is
    /// active; safe to race with slot release.
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = {
            let tracking = self.tracking.lock().expect("engine tracking lock poisoned");
            tracking.executions.values().cloned().collect()
        };
        let count = tokens.len();
        for token in tokens {
            token.cancel();
        }
        if count > 0 {
            debug!(count, "cancelled tracked executions");
        }
    }

    /// Snapshot copy of the aggregate and per-tool metrics.
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics
            .lock()
            .expect("engine metrics lock poisoned")
            .aggregate
            .clone()
    }

    /// Most recent executions, newest first, bounded by the history ring.
    pub fn recent(&self, n: usize) -> Vec<ExecutionRecord> {
        self.metrics
            .lock()
            .expect("engine metrics lock poisoned")
            .history
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    fn effective_timeout(&self, tool: &ReadOnlyTool) -> Duration {
        tool.capabilities()
            .and_then(|c| c.timeout)
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.default_timeout)
    }

    async fn acquire_slot(
        &self,
        parent: &CancellationToken,
        tool_id: &str,
    ) -> Result<SlotGuard, ToolError> {
        loop {
            {
                let mut tracking =
                    self.tracking.lock().expect("engine tracking lock poisoned");
                if tracking.active < self.config.max_concurrent {
                    tracking.active += 1;
                    return Ok(SlotGuard {
                        tracking: Arc::clone(&self.tracking),
                        exec_id: None,
                    });
                }
            }
            // Counted gate, not a fair queue: re-check at a bounded
            // interval, abort when the caller cancels.
            tokio::select! {
                () = tokio::time::sleep(ADMISSION_RETRY_INTERVAL) => {}
                () = parent.cancelled() => {
                    return Err(ToolError::concurrency(
                        "canceled while waiting for an execution slot",
                    )
                    .with_tool_id(tool_id));
                }
            }
        }
    }

    fn record(
        &self,
        tool_id: &str,
        status: ExecutionStatus,
        duration: Duration,
        success: bool,
        from_cache: bool,
    ) {
        record_metrics(
            &self.metrics,
            self.config.history_size,
            tool_id,
            status,
            duration,
            success,
            from_cache,
        );
    }

    fn cache_lookup(&self, tool: &ReadOnlyTool, params: &Value) -> Option<ExecutionResult> {
        let cache = self.cache.as_ref()?;
        if !tool.capabilities().is_some_and(|c| c.cacheable) {
            return None;
        }
        let ttl = self.config.result_cache?.ttl;
        let key = format!("{}:{}", tool.id(), canonical_json(params));
        let mut cache = cache.lock().expect("engine cache lock poisoned");
        if let Some(cached) = cache.get(&key) {
            if cached.cached_at.elapsed() < ttl {
                return Some(cached.result.clone());
            }
            cache.pop(&key);
        }
        None
    }

    fn cache_store(&self, tool: &ReadOnlyTool, params: &Value, result: &ExecutionResult) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        // Only successful results of cacheable tools are stored.
        if !result.success || !tool.capabilities().is_some_and(|c| c.cacheable) {
            return;
        }
        let key = format!("{}:{}", tool.id(), canonical_json(params));
        cache.lock().expect("engine cache lock poisoned").put(
            key,
            CachedResult {
                result: result.clone(),
                cached_at: Instant::now(),
            },
        );
    }
}

fn execution_id(tool_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}", tool_id, nanos)
}

async fn run_executor(
    tool: &ReadOnlyTool,
    params: Value,
    scope: &ExecutionScope,
    timeout: Duration,
) -> ExecOutcome {
    let executor = tool.executor();
    let scope = scope.clone();
    // The spawn boundary isolates executor panics from the engine.
    let handle = tokio::task::spawn(async move {
        tokio::select! {
            biased;
            () = scope.cancelled() => ExecOutcome::Canceled,
            res = tokio::time::timeout(timeout, executor.execute(params, &scope)) => {
                match res {
                    Ok(inner) => ExecOutcome::Finished(inner),
                    Err(_) => {
                        scope.cancel();
                        ExecOutcome::TimedOut
                    }
                }
            }
        }
    });

    match handle.await {
        Ok(outcome) => outcome,
        Err(join_err) if join_err.is_panic() => {
            error!(tool = %tool.id(), "executor panicked: {:?}", join_err);
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            ExecOutcome::Panicked(message)
        }
        Err(_) => ExecOutcome::Canceled,
    }
}

fn translate_outcome(
    tool_id: &str,
    outcome: ExecOutcome,
    timeout: Duration,
) -> (ExecutionResult, ExecutionStatus) {
    match outcome {
        ExecOutcome::Finished(Ok(Some(result))) => {
            let status = if result.success {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            };
            (result, status)
        }
        ExecOutcome::Finished(Ok(None)) => {
            (ExecutionResult::ok(Value::Null), ExecutionStatus::Success)
        }
        ExecOutcome::Finished(Err(e)) => {
            debug!(tool = %tool_id, error = %e, "executor returned an error");
            (ExecutionResult::failure(e.to_string()), ExecutionStatus::Failed)
        }
        ExecOutcome::TimedOut => (
            ExecutionResult::failure(format!(
                "execution deadline exceeded after {:?}",
                timeout
            )),
            ExecutionStatus::TimedOut,
        ),
        ExecOutcome::Canceled => (
            ExecutionResult::failure("execution canceled"),
            ExecutionStatus::Canceled,
        ),
        ExecOutcome::Panicked(message) => (
            ExecutionResult::failure(format!("tool crashed unexpectedly: {}", message)),
            ExecutionStatus::Failed,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn record_metrics(
    metrics: &Arc<Mutex<MetricsState>>,
    history_size: usize,
    tool_id: &str,
    status: ExecutionStatus,
    duration: Duration,
    success: bool,
    from_cache: bool,
) {
    let mut state = metrics.lock().expect("engine metrics lock poisoned");

    state.aggregate.total_executions += 1;
    if success {
        state.aggregate.success_count += 1;
    } else {
        state.aggregate.error_count += 1;
    }
    state.aggregate.total_duration += duration;

    let per_tool = state
        .aggregate
        .per_tool
        .entry(tool_id.to_string())
        .or_default();
    per_tool.executions += 1;
    if success {
        per_tool.successes += 1;
    } else {
        per_tool.errors += 1;
    }
    per_tool.total_duration += duration;
    per_tool.average_duration = per_tool.total_duration / per_tool.executions as u32;

    state.history.push_back(ExecutionRecord {
        tool_id: tool_id.to_string(),
        status,
        duration,
        from_cache,
    });
    while state.history.len() > history_size {
        state.history.pop_front();
    }
}
