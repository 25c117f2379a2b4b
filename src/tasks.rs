//! Minimal dependency-ordered task runner.
//!
//! Tasks are declared with the names of the tasks they depend on; a dependency
//! must be declared first, so declaration order is already a valid execution
//! order. A task whose dependency did not succeed is skipped.

use anyhow::Result;
use futures::future::{FutureExt, LocalBoxFuture};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskGraphError {
    #[error("task {0:?} is declared twice")]
    Duplicate(String),

    #[error("task {task:?} depends on undeclared task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed(String),
    Skipped { blocked_by: String },
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub duration: Duration,
}

struct Task<'a> {
    name: String,
    deps: Vec<String>,
    run: Box<dyn FnOnce() -> LocalBoxFuture<'a, Result<()>> + 'a>,
}

#[derive(Default)]
pub struct TaskGraph<'a> {
    tasks: Vec<Task<'a>>,
}

impl<'a> TaskGraph<'a> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Declare a task. Every entry of `deps` must already be declared.
    pub fn task<F, Fut>(mut self, name: &str, deps: &[&str], run: F) -> Result<Self, TaskGraphError>
    where
        F: FnOnce() -> Fut + 'a,
        Fut: Future<Output = Result<()>> + 'a,
    {
        if self.tasks.iter().any(|t| t.name == name) {
            return Err(TaskGraphError::Duplicate(name.to_string()));
        }
        for dep in deps {
            if !self.tasks.iter().any(|t| t.name == *dep) {
                return Err(TaskGraphError::UnknownDependency {
                    task: name.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }

        self.tasks.push(Task {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            run: Box::new(move || run().boxed_local()),
        });
        Ok(self)
    }

    /// Run every task in declaration order, one at a time
    pub async fn run(self) -> Vec<TaskOutcome> {
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(self.tasks.len());

        for task in self.tasks {
            let blocked_by = task.deps.iter().find(|dep| {
                outcomes
                    .iter()
                    .any(|o| &o.name == *dep && o.status != TaskStatus::Succeeded)
            });

            if let Some(dep) = blocked_by {
                warn!(target: "stargaze::tasks", task = %task.name, blocked_by = %dep, "task skipped");
                outcomes.push(TaskOutcome {
                    name: task.name,
                    status: TaskStatus::Skipped {
                        blocked_by: dep.clone(),
                    },
                    duration: Duration::ZERO,
                });
                continue;
            }

            info!(target: "stargaze::tasks", task = %task.name, "task started");
            let started = Instant::now();
            let status = match (task.run)().await {
                Ok(()) => TaskStatus::Succeeded,
                Err(e) => {
                    error!(target: "stargaze::tasks", task = %task.name, error = %format!("{:#}", e), "task failed");
                    TaskStatus::Failed(format!("{:#}", e))
                }
            };
            outcomes.push(TaskOutcome {
                name: task.name,
                status,
                duration: started.elapsed(),
            });
        }

        outcomes
    }
}
