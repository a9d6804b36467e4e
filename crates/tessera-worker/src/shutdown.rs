//! Bounded, isolated shutdown tasks.
//!
//! Every registered task runs in its own tokio task under its own timeout.
//! A task that fails or hangs is recorded in the [`ShutdownReport`] and
//! never stops the others. Tasks run in parallel unless one declares that
//! it must start after another.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Per-task timeout when none is given.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed error returned by a shutdown callback.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

pub type ShutdownFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

type Callback = Box<dyn FnOnce() -> ShutdownFuture + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Shutdown task '{0}' is already registered")]
    DuplicateTaskName(String),
    #[error("Shutdown already executed, task '{0}' would never run")]
    AlreadyExecuted(String),
}

/// A named unit of cleanup work.
pub struct ShutdownTask {
    name: String,
    callback: Callback,
    timeout: Duration,
    description: String,
    tags: Vec<String>,
    after: Vec<String>,
}

impl ShutdownTask {
    pub fn new<F, Fut>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(move || Box::pin(callback()) as ShutdownFuture),
            timeout: DEFAULT_TASK_TIMEOUT,
            description: String::new(),
            tags: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Start only once `name` has finished, whatever its outcome.
    pub fn after(mut self, name: impl Into<String>) -> Self {
        self.after.push(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ShutdownTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownTask")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("tags", &self.tags)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub outcome: TaskOutcome,
    pub elapsed: Duration,
}

/// Per-task results in registration order.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub tasks: Vec<TaskReport>,
    pub elapsed: Duration,
    /// The overall budget ran out before every task finished.
    pub budget_exhausted: bool,
}

impl ShutdownReport {
    pub fn outcome(&self, name: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.name == name).map(|t| &t.outcome)
    }

    /// Every task succeeded.
    pub fn is_clean(&self) -> bool {
        self.tasks.iter().all(|t| t.outcome == TaskOutcome::Succeeded)
    }

    pub fn count(&self, matches: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.tasks.iter().filter(|t| matches(&t.outcome)).count()
    }
}

#[derive(Default)]
pub struct ShutdownHandler {
    tasks: Mutex<Vec<ShutdownTask>>,
    executed: AtomicBool,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: ShutdownTask) -> Result<(), ShutdownError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.executed.load(Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyExecuted(task.name));
        }
        if tasks.iter().any(|t| t.name == task.name) {
            return Err(ShutdownError::DuplicateTaskName(task.name));
        }
        tracing::debug!(task = %task.name, timeout_ms = task.timeout.as_millis() as u64, "Shutdown task registered");
        tasks.push(task);
        Ok(())
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Run every registered task within `total_budget` and report.
    ///
    /// Only the first call runs anything; later calls return an empty report
    /// and later registrations are refused.
    pub async fn execute_shutdown(&self, total_budget: Duration) -> ShutdownReport {
        let mut tasks: Vec<ShutdownTask> = {
            let mut pending = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if self.executed.swap(true, Ordering::SeqCst) {
                tracing::warn!("Shutdown already executed");
                return ShutdownReport::default();
            }
            std::mem::take(&mut *pending)
        };
        resolve_ordering(&mut tasks);

        let started = Instant::now();
        let deadline = started + total_budget;
        tracing::info!(
            tasks = tasks.len(),
            budget_ms = total_budget.as_millis() as u64,
            "Executing shutdown"
        );

        let mut senders: HashMap<String, watch::Sender<bool>> = HashMap::new();
        let mut receivers: HashMap<String, watch::Receiver<bool>> = HashMap::new();
        for task in &tasks {
            let (tx, rx) = watch::channel(false);
            senders.insert(task.name.clone(), tx);
            receivers.insert(task.name.clone(), rx);
        }

        let mut running = Vec::with_capacity(tasks.len());
        for task in tasks {
            let waits: Vec<watch::Receiver<bool>> = task
                .after
                .iter()
                .filter_map(|dep| receivers.get(dep).cloned())
                .collect();
            let Some(done_tx) = senders.remove(&task.name) else {
                continue;
            };
            let ShutdownTask {
                name,
                callback,
                timeout,
                description,
                tags,
                ..
            } = task;

            let handle = tokio::spawn(async move {
                for mut rx in waits {
                    // A dropped sender means the dependency is gone; go ahead.
                    let _ = rx.wait_for(|finished| *finished).await;
                }
                let task_started = Instant::now();
                let inner = tokio::spawn(callback());
                let outcome = match tokio::time::timeout(timeout, inner).await {
                    Ok(Ok(Ok(()))) => TaskOutcome::Succeeded,
                    Ok(Ok(Err(e))) => TaskOutcome::Failed(e.to_string()),
                    Ok(Err(join)) => TaskOutcome::Failed(panic_message(join)),
                    // The callback keeps running detached; it cannot be
                    // interrupted safely from here.
                    Err(_) => TaskOutcome::TimedOut,
                };
                done_tx.send_replace(true);
                (outcome, task_started.elapsed())
            });
            running.push((name, description, tags, timeout, handle));
        }

        let mut report = ShutdownReport::default();
        for (name, description, tags, timeout, mut handle) in running {
            let (outcome, elapsed) = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => (TaskOutcome::Failed(panic_message(join)), Duration::ZERO),
                Err(_) => {
                    handle.abort();
                    report.budget_exhausted = true;
                    (TaskOutcome::TimedOut, started.elapsed())
                }
            };

            match &outcome {
                TaskOutcome::Succeeded => {
                    tracing::debug!(task = %name, elapsed_ms = elapsed.as_millis() as u64, "Shutdown task completed");
                }
                TaskOutcome::TimedOut => {
                    tracing::warn!(
                        event = "TASK_TIMEOUT",
                        task = %name,
                        tags = ?tags,
                        timeout_ms = timeout.as_millis() as u64,
                        "Shutdown task timed out, abandoning it"
                    );
                }
                TaskOutcome::Failed(error) => {
                    tracing::error!(task = %name, tags = ?tags, error = %error, "Shutdown task failed");
                }
            }

            report.tasks.push(TaskReport {
                name,
                description,
                tags,
                outcome,
                elapsed,
            });
        }
        report.elapsed = started.elapsed();

        tracing::info!(
            succeeded = report.count(|o| *o == TaskOutcome::Succeeded),
            timed_out = report.count(|o| *o == TaskOutcome::TimedOut),
            failed = report.count(|o| matches!(o, TaskOutcome::Failed(_))),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );
        report
    }
}

/// Drop unknown dependencies and the ordering hints of tasks on a cycle.
fn resolve_ordering(tasks: &mut [ShutdownTask]) {
    let names: HashSet<String> = tasks.iter().map(|t| t.name.clone()).collect();
    for task in tasks.iter_mut() {
        let name = task.name.clone();
        task.after.retain(|dep| {
            let known = names.contains(dep) && *dep != name;
            if !known {
                tracing::warn!(task = %name, dependency = %dep, "Ignoring unknown shutdown dependency");
            }
            known
        });
    }

    let edges: HashMap<String, Vec<String>> = tasks
        .iter()
        .map(|t| (t.name.clone(), t.after.clone()))
        .collect();
    for task in tasks.iter_mut() {
        if reaches(&edges, &task.after, &task.name) {
            tracing::warn!(task = %task.name, after = ?task.after, "Shutdown dependency cycle, running unordered");
            task.after.clear();
        }
    }
}

/// Whether `target` is reachable by following dependencies from `start`.
fn reaches(edges: &HashMap<String, Vec<String>>, start: &[String], target: &str) -> bool {
    let mut stack: Vec<&str> = start.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if seen.insert(node) {
            if let Some(next) = edges.get(node) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
    }
    false
}

fn panic_message(join: tokio::task::JoinError) -> String {
    if join.is_cancelled() {
        return "task cancelled".to_string();
    }
    let payload = join.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map(|msg| format!("panicked: {msg}"))
        .unwrap_or_else(|| "panicked".to_string())
}
