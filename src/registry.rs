//! Task registry: task name → handler, built once at startup.
//!
//! Registration is explicit. Build the registry, then share it behind an
//! `Arc` with every worker; nothing mutates it afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::{Outcome, TaskContext};
use crate::error::{Error, Result};
use crate::model::TaskPayload;

/// A unit of executable work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, payload: TaskPayload, ctx: TaskContext) -> Outcome;
}

/// Adapter so plain async closures can be registered.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskPayload, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn run(&self, payload: TaskPayload, ctx: TaskContext) -> Outcome {
        (self.0)(payload, ctx).await
    }
}

/// Per-task overrides of worker defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub max_retries: Option<u32>,
    pub soft_time_limit: Option<Duration>,
    pub hard_time_limit: Option<Duration>,
}

impl TaskOptions {
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn soft_time_limit(mut self, limit: Duration) -> Self {
        self.soft_time_limit = Some(limit);
        self
    }

    pub fn hard_time_limit(mut self, limit: Duration) -> Self {
        self.hard_time_limit = Some(limit);
        self
    }
}

#[derive(Clone)]
pub struct RegisteredTask {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub options: TaskOptions,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering a name twice is a startup error.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H, options: TaskOptions) -> Result<()>
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(Error::Config(format!("task `{name}` registered twice")));
        }
        self.tasks.insert(
            name.clone(),
            RegisteredTask {
                name,
                handler: Arc::new(handler),
                options,
            },
        );
        Ok(())
    }

    /// Register an async closure with default options.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(TaskPayload, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register(name, FnHandler(f), TaskOptions::default())
    }

    /// Register an async closure with explicit options.
    pub fn register_fn_with<F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: TaskOptions,
        f: F,
    ) -> Result<()>
    where
        F: Fn(TaskPayload, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.register(name, FnHandler(f), options)
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredTask> {
        self.tasks
            .get(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
