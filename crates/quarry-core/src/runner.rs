//! In-process task runner with bounded parallelism.
//!
//! Tasks are typed by a string tag and dispatched to the handler registered
//! for that tag. [`TaskRunner::schedule`] never blocks: it records the task
//! as pending and spawns a worker that
//!
//! 1. waits until [`TaskRunner::run`] has been called,
//! 2. acquires one of `parallelism` slots,
//! 3. looks up the handler (the task fails if none is registered),
//! 4. runs the handler with a [`TaskEvents`] sender for progress updates,
//! 5. records the terminal status.
//!
//! A panicking handler is recorded as failed with the panic message. The
//! runner never retries. Finished tasks are purged `cleanup_delay` after
//! they finish; pending and running tasks are never purged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{panic_message, Error};
use crate::models::{new_id, now};

/// Capacity of a task's event channel.
const EVENT_BUFFER: usize = 32;

/// A unit of work: type tag, owner and JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub owner_id: String,
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new<P: Serialize>(task_type: &str, owner_id: &str, payload: &P) -> Result<Self> {
        Ok(Self {
            id: new_id(),
            task_type: task_type.to_string(),
            owner_id: owner_id.to_string(),
            payload: serde_json::to_value(payload).context("serializing task payload")?,
        })
    }

    /// Decodes the payload into its typed shape.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("decoding {} payload for task {}", self.task_type, self.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Observable state of a task. Readers always receive a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub task_type: String,
    pub owner_id: String,
    pub status: TaskStatus,
    /// In `[0, 1]`.
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Update sent by a running handler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress(f64),
    Message(String),
}

/// Sender half handed to a handler. Sends after the handler returned are
/// silently dropped.
#[derive(Debug, Clone)]
pub struct TaskEvents {
    tx: mpsc::Sender<TaskEvent>,
}

impl TaskEvents {
    pub async fn progress(&self, progress: f64) {
        let _ = self.tx.send(TaskEvent::Progress(progress)).await;
    }

    pub async fn message(&self, message: impl Into<String>) {
        let _ = self.tx.send(TaskEvent::Message(message.into())).await;
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task, events: TaskEvents) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub parallelism: usize,
    /// How long finished tasks stay visible.
    pub cleanup_delay: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            cleanup_delay: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

struct Inner {
    config: RunnerConfig,
    states: RwLock<HashMap<String, TaskState>>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    slots: Arc<Semaphore>,
    ready: watch::Sender<bool>,
    running: AtomicBool,
    changed: Notify,
}

/// Cheap to clone; clones share the same task table.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

impl TaskRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let parallelism = config.parallelism.max(1);
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config: RunnerConfig {
                    parallelism,
                    ..config
                },
                states: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(parallelism)),
                ready,
                running: AtomicBool::new(false),
                changed: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Registers `handler` for `task_type`, replacing any previous one.
    pub async fn register(&self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.inner
            .handlers
            .write()
            .await
            .insert(task_type.to_string(), handler);
    }

    /// Records `task` as pending and spawns its worker. Must be called from
    /// within a Tokio runtime.
    pub async fn schedule(&self, task: Task) -> Result<String> {
        let id = task.id.clone();
        {
            let mut states = self.inner.states.write().await;
            if states.contains_key(&id) {
                bail!("task {} is already scheduled", id);
            }
            states.insert(
                id.clone(),
                TaskState {
                    id: id.clone(),
                    task_type: task.task_type.clone(),
                    owner_id: task.owner_id.clone(),
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    message: String::new(),
                    error: None,
                    scheduled_at: now(),
                    started_at: None,
                    finished_at: None,
                },
            );
        }
        debug!(task = %id, task_type = %task.task_type, "task scheduled");
        tokio::spawn(work(self.inner.clone(), task));
        Ok(id)
    }

    /// Opens the gate for workers and purges finished tasks until `cancel`
    /// fires. May be called once per runner.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning.into());
        }
        self.inner.ready.send_replace(true);
        info!(
            parallelism = self.inner.config.parallelism,
            "task runner started"
        );

        let mut ticker = tokio::time::interval(self.inner.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.inner.cleanup().await,
            }
        }
        info!("task runner stopped");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<TaskState> {
        self.inner
            .states
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound.into())
    }

    /// All known tasks ordered by `(scheduled_at, id)`.
    pub async fn list(&self) -> Vec<TaskState> {
        let mut states: Vec<TaskState> = self.inner.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then_with(|| a.id.cmp(&b.id)));
        states
    }

    /// Resolves once the task reaches a terminal status.
    pub async fn wait(&self, id: &str) -> Result<TaskState> {
        loop {
            let changed = self.inner.changed.notified();
            let state = self.get(id).await?;
            if state.status.is_terminal() {
                return Ok(state);
            }
            changed.await;
        }
    }
}

impl Inner {
    async fn update<F: FnOnce(&mut TaskState)>(&self, id: &str, f: F) {
        if let Some(state) = self.states.write().await.get_mut(id) {
            f(state);
        }
        self.changed.notify_waiters();
    }

    async fn apply(&self, id: &str, event: TaskEvent) {
        match event {
            TaskEvent::Progress(p) if p.is_nan() => {}
            TaskEvent::Progress(p) => self.update(id, |s| s.progress = p.clamp(0.0, 1.0)).await,
            TaskEvent::Message(m) => self.update(id, |s| s.message = m).await,
        }
    }

    async fn finish(&self, id: &str, outcome: std::result::Result<(), String>) {
        match &outcome {
            Ok(()) => info!(task = %id, "task succeeded"),
            Err(e) => warn!(task = %id, error = %e, "task failed"),
        }
        self.update(id, |s| {
            s.finished_at = Some(now());
            match outcome {
                Ok(()) => {
                    s.status = TaskStatus::Succeeded;
                    s.progress = 1.0;
                }
                Err(e) => {
                    s.status = TaskStatus::Failed;
                    s.error = Some(e);
                }
            }
        })
        .await;
    }

    async fn cleanup(&self) {
        let cutoff = now();
        let delay = self.config.cleanup_delay;
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, s| match s.finished_at {
            Some(finished) => !matches!((cutoff - finished).to_std(), Ok(age) if age > delay),
            None => true,
        });
        let purged = before - states.len();
        if purged > 0 {
            debug!(purged, "purged finished tasks");
        }
    }
}

async fn work(inner: Arc<Inner>, task: Task) {
    let id = task.id.clone();

    let mut ready = inner.ready.subscribe();
    let opened = ready.wait_for(|r| *r).await.is_ok();
    if !opened {
        return;
    }
    let Ok(_permit) = inner.slots.clone().acquire_owned().await else {
        return;
    };

    let handler = inner.handlers.read().await.get(&task.task_type).cloned();
    let Some(handler) = handler else {
        let msg = format!("no handler registered for task type '{}'", task.task_type);
        inner.finish(&id, Err(msg)).await;
        return;
    };

    inner
        .update(&id, |s| {
            s.status = TaskStatus::Running;
            s.started_at = Some(now());
        })
        .await;
    debug!(task = %id, task_type = %task.task_type, "task running");

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let events = TaskEvents { tx };
    let mut handle = tokio::spawn(async move { handler.handle(task, events).await });

    let joined = loop {
        tokio::select! {
            Some(event) = rx.recv() => inner.apply(&id, event).await,
            joined = &mut handle => break joined,
        }
    };
    rx.close();
    while let Ok(event) = rx.try_recv() {
        inner.apply(&id, event).await;
    }

    let outcome = match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            Err(Error::Panic(panic_message(payload.as_ref())).to_string())
        }
        Err(e) => Err(e.to_string()),
    };
    inner.finish(&id, outcome).await;
}
